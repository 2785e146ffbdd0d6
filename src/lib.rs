//! imgpool - isolated worker pool for image processing.
//!
//! Callers submit `(operation, payload)` tasks to a [`WorkerPool`]. The pool
//! runs each task on one of a fixed number of worker units, either child
//! processes (`imgpool worker`) or threads, and resolves the caller with the
//! unit's result. Units that crash are replaced; tasks that overrun their
//! timeout fail without blocking the worker slot for anyone else's result.
//!
//! ```no_run
//! use imgpool::{PoolConfig, WorkerPool};
//! use imgpool::transform::image_ops::{ImageSource, ThumbnailRequest};
//!
//! # async fn run() -> imgpool::Result<()> {
//! let pool = WorkerPool::start_threads(PoolConfig::default())?;
//! let request = ThumbnailRequest::new(ImageSource::path("photo.jpg"), 256);
//! let thumb = pool.thumbnail(&request).await?;
//! println!("{}x{} {}", thumb.width, thumb.height, thumb.content_type);
//! pool.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod logging;
pub mod pool;
pub mod transform;
pub mod worker;

pub use error::{PoolError, Result};
pub use pool::{PoolConfig, PoolStats, ShutdownReport, TaskId, WorkerPool};
pub use transform::{Transform, TransformRegistry};
pub use worker::{
    Launcher, ProcessConfig, ProcessLauncher, TaskMessage, TerminationReason, ThreadLauncher,
    WorkerEvents, WorkerHandle,
};
