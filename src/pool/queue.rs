//! FIFO of tasks waiting for an idle worker.

use super::task::Task;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    tasks: VecDeque<Task>,
    /// `None` means unbounded.
    limit: Option<usize>,
}

impl TaskQueue {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            tasks: VecDeque::new(),
            limit,
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Append at the tail, handing the task back if the queue is full.
    pub fn push(&mut self, task: Task) -> Result<(), Task> {
        match self.limit {
            Some(limit) if self.tasks.len() >= limit => Err(task),
            _ => {
                self.tasks.push_back(task);
                Ok(())
            }
        }
    }

    /// Oldest queued task.
    pub fn pop(&mut self) -> Option<Task> {
        self.tasks.pop_front()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Remove every queued task, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = Task> + '_ {
        self.tasks.drain(..)
    }
}
