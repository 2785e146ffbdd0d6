//! Public pool handle.

use super::config::PoolConfig;
use super::coordinator::{self, Command, PoolState};
use super::stats::{PoolStats, ShutdownReport};
use crate::error::{PoolError, Result};
use crate::transform::image_ops::{
    EncodedImage, ImageMetadata, ImageSource, MetadataRequest, SolidRequest, ThumbnailRequest,
};
use crate::worker::{Launcher, ProcessConfig, ProcessLauncher, ThreadLauncher};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

/// Handle to a running worker pool.
///
/// Clones share the same pool. When the last clone is dropped the
/// coordinator stops and terminates every worker.
#[derive(Clone)]
pub struct WorkerPool {
    commands: mpsc::UnboundedSender<Command>,
    shutting_down: Arc<AtomicBool>,
    size: usize,
    task_timeout: Duration,
}

impl WorkerPool {
    /// Launch `config.size` workers with `launcher` and start the coordinator
    /// on the current Tokio runtime.
    pub fn start(config: PoolConfig, launcher: impl Launcher + 'static) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            PoolError::Config("WorkerPool::start must be called within a Tokio runtime".into())
        })?;

        let size = config.size;
        let task_timeout = config.task_timeout;
        let shutting_down = Arc::new(AtomicBool::new(false));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = PoolState::start(
            config,
            Box::new(launcher),
            events_tx,
            Arc::clone(&shutting_down),
        )?;

        let (commands, commands_rx) = mpsc::unbounded_channel();
        runtime.spawn(coordinator::run(state, commands_rx, events_rx));

        Ok(Self {
            commands,
            shutting_down,
            size,
            task_timeout,
        })
    }

    /// Pool of subprocess workers running `process`.
    pub fn start_processes(config: PoolConfig, process: ProcessConfig) -> Result<Self> {
        Self::start(config, ProcessLauncher::new(process))
    }

    /// Pool of in-process thread workers running the built-in transforms.
    pub fn start_threads(config: PoolConfig) -> Result<Self> {
        Self::start(config, ThreadLauncher::builtin())
    }

    /// Run `operation` on `payload` with the pool's default timeout.
    pub async fn submit(&self, operation: impl Into<String>, payload: Value) -> Result<Value> {
        self.send_task(operation.into(), payload, None).await
    }

    /// Run `operation` on `payload`, failing with a timeout after `timeout`
    /// counted from when a worker picks the task up.
    pub async fn submit_with_timeout(
        &self,
        operation: impl Into<String>,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.send_task(operation.into(), payload, Some(timeout)).await
    }

    /// [`submit`](Self::submit) with typed request and response.
    pub async fn submit_typed<T, R>(&self, operation: impl Into<String>, request: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_value(request)?;
        let value = self.submit(operation, payload).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Resize and re-encode an image.
    pub async fn thumbnail(&self, request: &ThumbnailRequest) -> Result<EncodedImage> {
        self.submit_typed("thumbnail", request).await
    }

    /// Read an image's dimensions and pixel layout.
    pub async fn metadata(&self, source: ImageSource) -> Result<ImageMetadata> {
        self.submit_typed("metadata", &MetadataRequest { source }).await
    }

    /// Render a square of one colour.
    pub async fn solid(&self, request: &SolidRequest) -> Result<EncodedImage> {
        self.submit_typed("solid", request).await
    }

    async fn send_task(
        &self,
        operation: String,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if self.is_shutting_down() {
            return Err(PoolError::Unavailable);
        }
        let (completion, outcome) = oneshot::channel();
        self.commands
            .send(Command::Submit {
                operation,
                payload,
                timeout,
                completion,
            })
            .map_err(|_| PoolError::Closed)?;
        outcome.await.map_err(|_| PoolError::Closed)?
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        let (reply, stats) = oneshot::channel();
        self.commands
            .send(Command::Stats(reply))
            .map_err(|_| PoolError::Closed)?;
        stats.await.map_err(|_| PoolError::Closed)
    }

    /// Stop accepting tasks, wait up to the grace period for in-flight tasks,
    /// then terminate every worker. Every caller gets the same report.
    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        self.shutting_down.store(true, Ordering::Release);
        let (reply, report) = oneshot::channel();
        self.commands
            .send(Command::Shutdown(reply))
            .map_err(|_| PoolError::Closed)?;
        report.await.map_err(|_| PoolError::Closed)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Number of worker slots.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Timeout applied by [`submit`](Self::submit).
    pub fn task_timeout(&self) -> Duration {
        self.task_timeout
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("task_timeout", &self.task_timeout)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
