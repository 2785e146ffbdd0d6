//! Pool configuration.
//!
//! # Environment Variables
//!
//! Read by [`PoolConfig::with_env_overrides`]:
//!
//! - `IMGPOOL_WORKERS` - Number of worker slots
//! - `IMGPOOL_TASK_TIMEOUT_MS` - Default per-task timeout
//! - `IMGPOOL_SHUTDOWN_GRACE_MS` - How long shutdown waits for in-flight tasks
//! - `IMGPOOL_MAX_QUEUE` - Queue limit (`0` rejects when no worker is idle)

use crate::error::{PoolError, Result};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Default per-task timeout.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default grace period for draining on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How often shutdown re-checks the pending count.
pub const DEFAULT_DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One slot per available core, keeping one core for the caller, never fewer than two.
pub fn default_pool_size() -> usize {
    let parallelism = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    parallelism.saturating_sub(1).max(2)
}

/// Configuration for [`WorkerPool`](super::WorkerPool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker slots.
    pub size: usize,
    /// Timeout applied when a submit call does not give its own.
    pub task_timeout: Duration,
    /// Upper bound on how long shutdown waits for in-flight tasks.
    pub shutdown_grace: Duration,
    pub drain_poll_interval: Duration,
    /// Fail submissions with `QueueFull` beyond this many queued tasks.
    pub max_queue_length: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            task_timeout: DEFAULT_TASK_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            drain_poll_interval: DEFAULT_DRAIN_POLL_INTERVAL,
            max_queue_length: None,
        }
    }
}

impl PoolConfig {
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_drain_poll_interval(mut self, interval: Duration) -> Self {
        self.drain_poll_interval = interval;
        self
    }

    pub fn with_max_queue_length(mut self, limit: Option<usize>) -> Self {
        self.max_queue_length = limit;
        self
    }

    /// Apply `IMGPOOL_*` environment variables. Unparsable values are logged
    /// and ignored.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(size) = parsed::<usize>(&var, "IMGPOOL_WORKERS") {
            self.size = size;
        }
        if let Some(ms) = parsed::<u64>(&var, "IMGPOOL_TASK_TIMEOUT_MS") {
            self.task_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed::<u64>(&var, "IMGPOOL_SHUTDOWN_GRACE_MS") {
            self.shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(limit) = parsed::<usize>(&var, "IMGPOOL_MAX_QUEUE") {
            self.max_queue_length = Some(limit);
        }
        self
    }

    /// Reject configurations the pool cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(PoolError::Config("pool size must be at least 1".into()));
        }
        if self.task_timeout.is_zero() {
            return Err(PoolError::Config("task timeout must be positive".into()));
        }
        if self.drain_poll_interval.is_zero() {
            return Err(PoolError::Config(
                "drain poll interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring invalid environment override");
            None
        }
    }
}
