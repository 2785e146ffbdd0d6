//! Transform functions run inside worker units.
//!
//! A transform takes an opaque JSON payload and returns a JSON value. The pool
//! never looks inside either; it only forwards them. Failures are flattened to
//! a message string before they leave the unit, and a panicking transform is
//! reported the same way instead of taking the unit down.

pub mod image_ops;

use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// An operation a worker unit can run.
pub trait Transform: Send + Sync {
    fn apply(&self, payload: Value) -> Result<Value>;
}

impl<F> Transform for F
where
    F: Fn(Value) -> Result<Value> + Send + Sync,
{
    fn apply(&self, payload: Value) -> Result<Value> {
        self(payload)
    }
}

/// Operation name -> transform.
#[derive(Clone, Default)]
pub struct TransformRegistry {
    transforms: HashMap<String, Arc<dyn Transform>>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in image operations.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        image_ops::register(&mut registry);
        registry
    }

    /// Register `transform` under `operation`, replacing any previous one.
    pub fn register(
        &mut self,
        operation: impl Into<String>,
        transform: impl Transform + 'static,
    ) -> &mut Self {
        self.transforms.insert(operation.into(), Arc::new(transform));
        self
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(
        mut self,
        operation: impl Into<String>,
        transform: impl Transform + 'static,
    ) -> Self {
        self.register(operation, transform);
        self
    }

    pub fn contains(&self, operation: &str) -> bool {
        self.transforms.contains_key(operation)
    }

    /// Registered operation names, sorted.
    pub fn operations(&self) -> Vec<&str> {
        let mut ops: Vec<&str> = self.transforms.keys().map(String::as_str).collect();
        ops.sort_unstable();
        ops
    }

    /// Run `operation` on `payload`.
    ///
    /// Never panics: an unknown operation, a transform error and a transform
    /// panic all come back as `Err(message)`.
    pub fn run(&self, operation: &str, payload: Value) -> std::result::Result<Value, String> {
        let transform = self
            .transforms
            .get(operation)
            .ok_or_else(|| format!("Unknown operation: {}", operation))?;

        match panic::catch_unwind(AssertUnwindSafe(|| transform.apply(payload))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(panic) => Err(format!(
                "Transform '{}' panicked: {}",
                operation,
                panic_message(panic.as_ref())
            )),
        }
    }
}

impl std::fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformRegistry")
            .field("operations", &self.operations())
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
