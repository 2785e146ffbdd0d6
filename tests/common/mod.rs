//! Scripted worker units for pool scenario tests.

use crossbeam_channel::{Receiver, Sender};
use imgpool::{Launcher, PoolError, TaskMessage, TerminationReason, WorkerEvents, WorkerHandle};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Counters shared by every unit a [`ScriptedLauncher`] starts.
#[derive(Debug, Default)]
pub struct Counters {
    pub launches: AtomicUsize,
    pub stopped: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    /// `payload["n"]` of every task in the order units picked them up.
    pub started: Mutex<Vec<u64>>,
}

impl Counters {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> Vec<u64> {
        self.started.lock().unwrap().clone()
    }
}

/// Thread units that understand a handful of scripted operations:
///
/// - `echo`: reply with the payload
/// - `sleep`: sleep `payload["ms"]` milliseconds, then reply with the payload
/// - `fail`: reply with an error
/// - `crash`: stop without replying, as a killed process would
#[derive(Debug, Clone, Default)]
pub struct ScriptedLauncher {
    pub counters: Arc<Counters>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Launcher for ScriptedLauncher {
    fn launch(&self, slot: usize, events: WorkerEvents) -> imgpool::Result<Box<dyn WorkerHandle>> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let counters = Arc::clone(&self.counters);
        counters.launches.fetch_add(1, Ordering::SeqCst);
        thread::Builder::new()
            .name(format!("scripted-{}", slot))
            .spawn(move || run_unit(rx, events, counters))?;
        Ok(Box::new(ScriptedHandle { sender: Some(tx) }))
    }
}

struct ScriptedHandle {
    sender: Option<Sender<TaskMessage>>,
}

impl WorkerHandle for ScriptedHandle {
    fn dispatch(&mut self, task: TaskMessage) -> imgpool::Result<()> {
        self.sender
            .as_ref()
            .and_then(|sender| sender.send(task).ok())
            .ok_or_else(|| PoolError::Worker("scripted unit is gone".into()))
    }

    fn terminate(&mut self) {
        self.sender = None;
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

fn run_unit(rx: Receiver<TaskMessage>, events: WorkerEvents, counters: Arc<Counters>) {
    for task in rx {
        let now = counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_active.fetch_max(now, Ordering::SeqCst);
        if let Some(n) = task.payload.get("n").and_then(Value::as_u64) {
            counters.started.lock().unwrap().push(n);
        }

        let outcome = match task.operation.as_str() {
            "echo" => Ok(task.payload),
            "sleep" => {
                let ms = task.payload.get("ms").and_then(Value::as_u64).unwrap_or(0);
                thread::sleep(Duration::from_millis(ms));
                Ok(task.payload)
            }
            "fail" => Err("scripted failure".to_string()),
            "crash" => {
                counters.active.fetch_sub(1, Ordering::SeqCst);
                counters.stopped.fetch_add(1, Ordering::SeqCst);
                events.exited(TerminationReason::Exited(101));
                return;
            }
            other => Err(format!("Unknown operation: {}", other)),
        };

        counters.active.fetch_sub(1, Ordering::SeqCst);
        if !events.reply(task.task_id, outcome) {
            break;
        }
    }
    counters.stopped.fetch_add(1, Ordering::SeqCst);
    events.exited(TerminationReason::Exited(0));
}

/// Poll `condition` until it holds or `limit` passes.
pub async fn eventually(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < limit {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
