//! Worker slots: stable identities that outlive the units running in them.

use super::TaskId;
use crate::worker::WorkerHandle;

pub(crate) struct WorkerSlot {
    pub id: usize,
    /// `None` while vacant (before launch, after exit, after a failed relaunch).
    pub handle: Option<Box<dyn WorkerHandle>>,
    /// Launch counter; events from older launches are stale.
    pub generation: u64,
    /// Task assigned to the unit and not yet answered by it.
    pub current: Option<TaskId>,
    pub tasks_processed: u64,
    pub restarts: u64,
}

impl WorkerSlot {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            handle: None,
            generation: 0,
            current: None,
            tasks_processed: 0,
            restarts: 0,
        }
    }

    /// Running and not working on anything.
    pub fn is_idle(&self) -> bool {
        self.handle.is_some() && self.current.is_none()
    }

    pub fn is_busy(&self) -> bool {
        self.handle.is_some() && self.current.is_some()
    }

    pub fn is_vacant(&self) -> bool {
        self.handle.is_none()
    }

    pub fn describe(&self) -> String {
        match &self.handle {
            Some(handle) => handle.describe(),
            None => "vacant".to_string(),
        }
    }

    /// Stop the unit, if any, and leave the slot vacant.
    pub fn terminate(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.terminate();
        }
        self.current = None;
    }
}

impl std::fmt::Debug for WorkerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSlot")
            .field("id", &self.id)
            .field("unit", &self.describe())
            .field("generation", &self.generation)
            .field("current", &self.current)
            .field("tasks_processed", &self.tasks_processed)
            .field("restarts", &self.restarts)
            .finish()
    }
}
