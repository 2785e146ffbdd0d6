//! Error types for imgpool.

use crate::pool::TaskId;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the worker pool.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Worker pool is shutting down")]
    Unavailable,

    #[error("Task {task_id} timed out after {}ms", .after.as_millis())]
    Timeout { task_id: TaskId, after: Duration },

    #[error("{0}")]
    Transform(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Task queue is full ({limit} tasks waiting)")]
    QueueFull { limit: usize },

    #[error("Task {0} was abandoned: pool shut down before it was dispatched")]
    Abandoned(TaskId),

    #[error("Task {0} was still running when the pool terminated its workers")]
    Terminated(TaskId),

    #[error("Worker pool coordinator has stopped")]
    Closed,

    #[error("Invalid pool configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PoolError {
    /// Whether the caller gave up waiting rather than the task failing.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
