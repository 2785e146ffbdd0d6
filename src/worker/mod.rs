//! Worker units: the isolated execution contexts the pool dispatches to.
//!
//! A unit runs one task at a time. The pool never talks to a unit directly;
//! it owns a [`WorkerHandle`] for sending work and receives everything the
//! unit says back as [`WorkerEvent`]s on a channel shared by all units.
//!
//! # Architecture
//!
//! ```text
//!                  ┌───────────────────────┐
//!                  │      Coordinator      │
//!                  │ (slots, queue, timer) │
//!                  └───┬───────────────▲───┘
//!          dispatch()  │               │  WorkerEvent::{Reply, Exited}
//!               ┌──────┼───────────────┼──────┐
//!         ┌─────▼─────┐│         ┌─────┴─────┐│
//!         │ Worker 0  ││  ...    │ Worker N  ││
//!         │ (process  ││         │ (process  ││
//!         │ or thread)││         │ or thread)││
//!         └───────────┘│         └───────────┘│
//! ```
//!
//! Two unit kinds ship with the crate:
//!
//! - [`ProcessLauncher`]: re-executes the binary as `imgpool worker` and
//!   speaks newline-delimited JSON over stdin/stdout. Crashes are classified
//!   from the wait status.
//! - [`ThreadLauncher`]: an in-process thread per slot, for embedding and tests.

mod ipc;
mod proc;
pub mod protocol;
mod signals;
mod spawn;
mod thread;
pub mod worker_main;

use crate::error::Result;
use crate::pool::TaskId;
use serde_json::Value;
use tokio::sync::mpsc;

pub use proc::Proc;
pub use protocol::{WorkRequest, WorkResponse};
pub use signals::{TerminationReason, WorkerFailure, analyze_wait_status};
pub use spawn::{DEFAULT_MAX_MEMORY_MIB, ProcessConfig, ProcessLauncher};
pub use thread::ThreadLauncher;
pub use worker_main::run_worker_main;

/// A task descriptor as handed to a unit.
#[derive(Debug, Clone)]
pub struct TaskMessage {
    pub task_id: TaskId,
    pub operation: String,
    pub payload: Value,
}

/// Something a unit reported back to the coordinator.
#[derive(Debug)]
pub enum WorkerEvent {
    /// The unit finished a task, successfully or not.
    Reply {
        slot: usize,
        generation: u64,
        task_id: TaskId,
        outcome: std::result::Result<Value, String>,
    },
    /// The unit's execution context is gone.
    Exited {
        slot: usize,
        generation: u64,
        reason: TerminationReason,
    },
}

/// Per-unit reporter handed to a [`Launcher`].
///
/// Carries the slot id and launch generation so units never need to know
/// about either; the coordinator uses the generation to drop events from a
/// unit that has already been replaced.
#[derive(Debug, Clone)]
pub struct WorkerEvents {
    slot: usize,
    generation: u64,
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl WorkerEvents {
    pub(crate) fn new(slot: usize, generation: u64, tx: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self {
            slot,
            generation,
            tx,
        }
    }

    /// Slot this unit was launched into.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Report a finished task. Returns `false` once the coordinator is gone.
    pub fn reply(&self, task_id: TaskId, outcome: std::result::Result<Value, String>) -> bool {
        self.tx
            .send(WorkerEvent::Reply {
                slot: self.slot,
                generation: self.generation,
                task_id,
                outcome,
            })
            .is_ok()
    }

    /// Report that the unit has stopped.
    pub fn exited(&self, reason: TerminationReason) {
        let _ = self.tx.send(WorkerEvent::Exited {
            slot: self.slot,
            generation: self.generation,
            reason,
        });
    }
}

/// Coordinator-side ownership of one running unit.
pub trait WorkerHandle: Send {
    /// Hand a task to the unit. Must not block on the task itself.
    fn dispatch(&mut self, task: TaskMessage) -> Result<()>;

    /// Stop the unit without waiting for it. Idempotent.
    fn terminate(&mut self);

    /// Short label for logs, e.g. `pid 4242`.
    fn describe(&self) -> String;
}

/// Creates units. Called at pool start and whenever a slot needs a replacement.
pub trait Launcher: Send + Sync {
    fn launch(&self, slot: usize, events: WorkerEvents) -> Result<Box<dyn WorkerHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_worker_events_tag_slot_and_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = WorkerEvents::new(3, 7, tx);
        assert_eq!(events.slot(), 3);

        assert!(events.reply(11, Ok(json!({"ok": true}))));
        events.exited(TerminationReason::Exited(0));

        match rx.try_recv().unwrap() {
            WorkerEvent::Reply {
                slot,
                generation,
                task_id,
                outcome,
            } => {
                assert_eq!((slot, generation, task_id), (3, 7, 11));
                assert_eq!(outcome.unwrap(), json!({"ok": true}));
            }
            other => panic!("Expected Reply, got {:?}", other),
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            WorkerEvent::Exited {
                slot: 3,
                generation: 7,
                reason: TerminationReason::Exited(0)
            }
        ));
    }

    #[test]
    fn test_reply_reports_closed_coordinator() {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = WorkerEvents::new(0, 1, tx);
        drop(rx);
        assert!(!events.reply(1, Err("late".into())));
    }
}
