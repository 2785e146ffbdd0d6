//! IPC protocol between the pool and process worker units.
//!
//! Messages are JSON-serialized and newline-delimited. The worker sends
//! `ready` once at startup, then exactly one `result` or `error` per `run`.

use crate::pool::TaskId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request from the pool to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkRequest {
    /// Run one transform.
    Run {
        task_id: TaskId,
        /// Transform name, e.g. "thumbnail"
        operation: String,
        /// Forwarded verbatim to the transform
        payload: Value,
    },

    /// Graceful shutdown request.
    Exit,
}

/// Message from a worker to the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkResponse {
    /// Worker started and is reading requests.
    Ready {
        #[serde(default)]
        pid: u32,
    },

    /// Transform succeeded.
    Result { task_id: TaskId, value: Value },

    /// Transform failed; the worker stays up.
    Error { task_id: TaskId, message: String },

    /// Worker is over its memory threshold and is about to exit.
    Recycle {
        memory_mib: usize,
        threshold_mib: usize,
    },
}

impl WorkRequest {
    pub fn run(task_id: TaskId, operation: impl Into<String>, payload: Value) -> Self {
        Self::Run {
            task_id,
            operation: operation.into(),
            payload,
        }
    }
}

impl WorkResponse {
    pub fn ready() -> Self {
        Self::Ready {
            pid: std::process::id(),
        }
    }

    /// Build the reply for a finished task.
    pub fn for_outcome(task_id: TaskId, outcome: Result<Value, String>) -> Self {
        match outcome {
            Ok(value) => Self::Result { task_id, value },
            Err(message) => Self::Error { task_id, message },
        }
    }

    /// Task this message answers, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::Result { task_id, .. } | Self::Error { task_id, .. } => Some(*task_id),
            Self::Ready { .. } | Self::Recycle { .. } => None,
        }
    }
}
