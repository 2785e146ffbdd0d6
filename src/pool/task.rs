//! Tasks as they travel from a caller to a worker slot.

use super::TaskId;
use crate::error::Result;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Where a task's outcome is delivered. Dropping it makes the caller see
/// [`PoolError::Closed`](crate::PoolError::Closed).
pub(crate) type Completion = oneshot::Sender<Result<Value>>;

/// A submitted task that has not been assigned to a worker yet.
pub(crate) struct Task {
    pub id: TaskId,
    pub operation: String,
    pub payload: Value,
    pub timeout: Duration,
    pub submitted_at: Instant,
    pub completion: Completion,
}

impl Task {
    /// Fail the task with `error`. Returns `false` if the caller is gone.
    pub fn reject(self, error: crate::PoolError) -> bool {
        self.completion.send(Err(error)).is_ok()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("operation", &self.operation)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
