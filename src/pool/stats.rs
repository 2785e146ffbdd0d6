//! Point-in-time pool counters.

use serde::Serialize;
use std::time::Duration;

/// Snapshot returned by [`WorkerPool::stats`](super::WorkerPool::stats).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub pool_size: usize,
    /// Slots whose unit is working on a task.
    pub active_workers: usize,
    /// Slots whose unit is running and waiting for work.
    pub idle_workers: usize,
    pub queue_length: usize,
    /// Tasks assigned to a worker whose caller has not been answered yet.
    pub pending_tasks: usize,
    pub total_processed: u64,
    pub total_restarts: u64,
}

impl PoolStats {
    /// Slots with no running unit (a relaunch failed).
    pub fn vacant_workers(&self) -> usize {
        self.pool_size
            .saturating_sub(self.active_workers + self.idle_workers)
    }
}

/// Outcome of [`WorkerPool::shutdown`](super::WorkerPool::shutdown).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// In-flight tasks that settled during the grace period.
    pub drained: usize,
    /// Queued tasks rejected because shutdown began before they were dispatched.
    pub abandoned: usize,
    /// In-flight tasks rejected because their workers were terminated.
    pub terminated: usize,
    /// Time from shutdown request to termination of all workers.
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

impl ShutdownReport {
    /// Whether every in-flight task finished before termination.
    pub fn is_clean(&self) -> bool {
        self.terminated == 0
    }
}

fn as_millis<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}
