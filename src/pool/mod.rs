//! The worker pool and task-dispatch engine.
//!
//! [`WorkerPool`] is a cheap, cloneable handle. Every handle talks to one
//! coordinator task that owns the worker slots, the FIFO of waiting tasks and
//! the registry of in-flight tasks.
//!
//! ```text
//!  submit() ──► Command ──► ┌─────────────┐ ──► TaskMessage ──► worker unit
//!                           │ Coordinator │
//!  caller ◄── oneshot ◄──── └─────────────┘ ◄── WorkerEvent ◄── worker unit
//! ```
//!
//! A task goes straight to the lowest-numbered idle worker, or waits at the
//! tail of the queue. Each assigned task has a deadline; when it passes the
//! caller gets [`PoolError::Timeout`](crate::PoolError::Timeout) while the
//! worker keeps going. A worker that dies is replaced in the same slot; the
//! task it was running is not retried and settles by its deadline.

mod config;
mod coordinator;
mod handle;
mod queue;
mod registry;
mod slot;
mod stats;
mod task;

/// Task identifier: ascending, never reused within a pool.
pub type TaskId = u64;

pub use config::{
    DEFAULT_DRAIN_POLL_INTERVAL, DEFAULT_SHUTDOWN_GRACE, DEFAULT_TASK_TIMEOUT, PoolConfig,
    default_pool_size,
};
pub use handle::WorkerPool;
pub use stats::{PoolStats, ShutdownReport};
