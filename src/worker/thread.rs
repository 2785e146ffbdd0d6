//! In-process worker units: one OS thread per slot.
//!
//! Tasks reach the thread over a crossbeam channel. Dropping the sender is the
//! stop signal; a thread that is mid-task finishes that task first and its
//! late reply is discarded by the coordinator as stale.

use super::signals::TerminationReason;
use super::{Launcher, TaskMessage, WorkerEvents, WorkerHandle};
use crate::error::{PoolError, Result};
use crate::transform::TransformRegistry;
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace};

type RegistryFactory = dyn Fn() -> TransformRegistry + Send + Sync;

/// Launches a thread per slot, each with its own [`TransformRegistry`].
#[derive(Clone)]
pub struct ThreadLauncher {
    factory: Arc<RegistryFactory>,
}

impl ThreadLauncher {
    /// Each unit calls `factory` once, on its own thread, to build its registry.
    pub fn new(factory: impl Fn() -> TransformRegistry + Send + Sync + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
        }
    }

    /// Units running the built-in image operations.
    pub fn builtin() -> Self {
        Self::new(TransformRegistry::builtin)
    }
}

impl std::fmt::Debug for ThreadLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadLauncher").finish_non_exhaustive()
    }
}

impl Launcher for ThreadLauncher {
    fn launch(&self, slot: usize, events: WorkerEvents) -> Result<Box<dyn WorkerHandle>> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let factory = Arc::clone(&self.factory);
        let name = format!("imgpool-worker-{}", slot);

        thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_unit(rx, factory, events))
            .map_err(|e| PoolError::Worker(format!("Failed to spawn {}: {}", name, e)))?;

        Ok(Box::new(ThreadHandle {
            name,
            sender: Some(tx),
        }))
    }
}

/// Coordinator side of a thread unit.
struct ThreadHandle {
    name: String,
    sender: Option<Sender<TaskMessage>>,
}

impl WorkerHandle for ThreadHandle {
    fn dispatch(&mut self, task: TaskMessage) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| PoolError::Worker(format!("{} is stopping", self.name)))?;
        sender
            .send(task)
            .map_err(|_| PoolError::Worker(format!("{} has exited", self.name)))
    }

    fn terminate(&mut self) {
        self.sender = None;
    }

    fn describe(&self) -> String {
        format!("thread {}", self.name)
    }
}

/// Reports the unit's exit however the thread ends, including by unwinding.
struct ExitGuard {
    events: WorkerEvents,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let reason = if thread::panicking() {
            TerminationReason::Panicked
        } else {
            TerminationReason::Exited(0)
        };
        self.events.exited(reason);
    }
}

fn run_unit(rx: Receiver<TaskMessage>, factory: Arc<RegistryFactory>, events: WorkerEvents) {
    let guard = ExitGuard { events };
    let registry = factory();
    debug!(slot = guard.events.slot(), "Thread worker ready");

    for task in rx {
        trace!(
            slot = guard.events.slot(),
            task_id = task.task_id,
            operation = %task.operation,
            "Running task"
        );
        let outcome = registry.run(&task.operation, task.payload);
        if !guard.events.reply(task.task_id, outcome) {
            break;
        }
    }
}
