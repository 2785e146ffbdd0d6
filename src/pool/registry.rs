//! In-flight tasks and their deadlines.
//!
//! An entry exists from the moment a task is handed to a worker until it is
//! settled, by the worker's reply or by its deadline, whichever comes first.
//! Both paths go through [`PendingRegistry::take`] or
//! [`PendingRegistry::expire`], so an entry is removed exactly once.

use super::TaskId;
use super::task::Completion;
use crate::error::{PoolError, Result};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// Stand-in deadline for durations too long to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + after`, saturating to [`FAR_FUTURE`] instead of overflowing.
pub(crate) fn deadline_after(start: Instant, after: Duration) -> Instant {
    start
        .checked_add(after)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// Caller completion handle plus timing for one assigned task.
#[derive(Debug)]
pub(crate) struct PendingEntry {
    pub completion: Completion,
    pub slot: usize,
    pub submitted_at: Instant,
    pub assigned_at: Instant,
    pub timeout: Duration,
}

impl PendingEntry {
    pub fn deadline(&self) -> Instant {
        deadline_after(self.assigned_at, self.timeout)
    }

    /// Deliver the outcome. Returns `false` if the caller stopped waiting.
    pub fn resolve(self, result: Result<Value>) -> bool {
        self.completion.send(result).is_ok()
    }
}

#[derive(Debug, Default)]
pub(crate) struct PendingRegistry {
    entries: HashMap<TaskId, PendingEntry>,
    /// Ordered by deadline, then id.
    deadlines: BTreeSet<(Instant, TaskId)>,
}

impl PendingRegistry {
    /// Track `entry` under `task_id` and arm its deadline.
    pub fn register(&mut self, task_id: TaskId, entry: PendingEntry) {
        self.deadlines.insert((entry.deadline(), task_id));
        if let Some(previous) = self.entries.insert(task_id, entry) {
            // Ids are never reused; a collision would orphan the earlier caller.
            self.deadlines.remove(&(previous.deadline(), task_id));
            let _ = previous.resolve(Err(PoolError::Worker(format!(
                "Task id {} registered twice",
                task_id
            ))));
        }
    }

    /// Remove and return the entry for `task_id`, if still pending.
    pub fn take(&mut self, task_id: TaskId) -> Option<PendingEntry> {
        let entry = self.entries.remove(&task_id)?;
        self.deadlines.remove(&(entry.deadline(), task_id));
        Some(entry)
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.first().map(|(deadline, _)| *deadline)
    }

    /// Remove every entry whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<(TaskId, PendingEntry)> {
        let mut expired = Vec::new();
        while let Some(&(deadline, task_id)) = self.deadlines.first() {
            if deadline > now {
                break;
            }
            self.deadlines.pop_first();
            if let Some(entry) = self.entries.remove(&task_id) {
                expired.push((task_id, entry));
            }
        }
        expired
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.entries.contains_key(&task_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove everything, in task id order.
    pub fn drain(&mut self) -> Vec<(TaskId, PendingEntry)> {
        self.deadlines.clear();
        let mut all: Vec<_> = self.entries.drain().collect();
        all.sort_unstable_by_key(|(task_id, _)| *task_id);
        all
    }
}
