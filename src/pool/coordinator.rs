//! The coordinator task.
//!
//! One tokio task owns every slot, the queue and the pending registry, and
//! handles one message at a time: commands from [`WorkerPool`] handles,
//! events from worker units, task deadlines and the shutdown drain tick.
//! All pool state lives in [`PoolState`], which is plain synchronous code so
//! it can be driven directly from tests.
//!
//! [`WorkerPool`]: super::WorkerPool

use super::TaskId;
use super::config::PoolConfig;
use super::queue::TaskQueue;
use super::registry::{PendingEntry, PendingRegistry, deadline_after};
use super::slot::WorkerSlot;
use super::stats::{PoolStats, ShutdownReport};
use super::task::{Completion, Task};
use crate::error::{PoolError, Result};
use crate::worker::{
    Launcher, TaskMessage, TerminationReason, WorkerEvent, WorkerEvents, WorkerFailure,
};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Requests from pool handles.
pub(crate) enum Command {
    Submit {
        operation: String,
        payload: Value,
        timeout: Option<Duration>,
        completion: Completion,
    },
    Stats(oneshot::Sender<PoolStats>),
    Shutdown(oneshot::Sender<ShutdownReport>),
}

/// Bookkeeping for a shutdown in progress.
struct Drain {
    started: Instant,
    grace_deadline: Instant,
    in_flight_at_start: usize,
    abandoned: usize,
    waiters: Vec<oneshot::Sender<ShutdownReport>>,
}

pub(crate) struct PoolState {
    config: PoolConfig,
    launcher: Box<dyn Launcher>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    slots: Vec<WorkerSlot>,
    queue: TaskQueue,
    registry: PendingRegistry,
    next_task_id: TaskId,
    /// Shared with handles so `submit` can fail before sending anything.
    shutting_down: Arc<AtomicBool>,
    draining: Option<Drain>,
    finished: Option<ShutdownReport>,
    total_processed: u64,
    total_restarts: u64,
}

impl PoolState {
    /// Launch `config.size` units. Any launch failure fails the whole start;
    /// units already launched are terminated when the state is dropped.
    pub fn start(
        config: PoolConfig,
        launcher: Box<dyn Launcher>,
        events: mpsc::UnboundedSender<WorkerEvent>,
        shutting_down: Arc<AtomicBool>,
    ) -> Result<Self> {
        config.validate()?;
        let mut state = Self {
            slots: (0..config.size).map(WorkerSlot::new).collect(),
            queue: TaskQueue::new(config.max_queue_length),
            registry: PendingRegistry::default(),
            next_task_id: 1,
            draining: None,
            finished: None,
            total_processed: 0,
            total_restarts: 0,
            config,
            launcher,
            events,
            shutting_down,
        };
        for slot_id in 0..state.slots.len() {
            state.launch(slot_id)?;
        }
        info!(
            size = state.config.size,
            task_timeout_ms = state.config.task_timeout.as_millis() as u64,
            "Worker pool started"
        );
        Ok(state)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.draining.is_some() || self.finished.is_some()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.is_some()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.registry.next_deadline()
    }

    pub fn on_command(&mut self, command: Command) {
        match command {
            Command::Submit {
                operation,
                payload,
                timeout,
                completion,
            } => self.submit(operation, payload, timeout, completion),
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown(reply) => self.begin_shutdown(reply, Instant::now()),
        }
    }

    pub fn on_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Reply {
                slot,
                generation,
                task_id,
                outcome,
            } => self.on_reply(slot, generation, task_id, outcome),
            WorkerEvent::Exited {
                slot,
                generation,
                reason,
            } => self.on_exit(slot, generation, reason),
        }
    }

    /// Accept a task: straight to an idle slot, else to the queue tail.
    pub fn submit(
        &mut self,
        operation: String,
        payload: Value,
        timeout: Option<Duration>,
        completion: Completion,
    ) {
        if self.is_shutting_down() {
            let _ = completion.send(Err(PoolError::Unavailable));
            return;
        }

        let id = self.next_task_id;
        self.next_task_id += 1;
        let task = Task {
            id,
            operation,
            payload,
            timeout: timeout.unwrap_or(self.config.task_timeout),
            submitted_at: Instant::now(),
            completion,
        };

        if self.queue.is_empty()
            && let Some(slot_id) = self.idle_slot()
        {
            self.assign(slot_id, task);
            return;
        }

        match self.queue.push(task) {
            Ok(()) => trace!(task_id = id, queue_length = self.queue.len(), "Task queued"),
            Err(task) => {
                let limit = self.queue.limit().unwrap_or_default();
                debug!(task_id = id, limit, "Queue full, rejecting task");
                task.reject(PoolError::QueueFull { limit });
            }
        }
    }

    /// Lowest-numbered idle slot.
    fn idle_slot(&self) -> Option<usize> {
        self.slots.iter().position(WorkerSlot::is_idle)
    }

    /// Hand `task` to the unit in `slot_id` and arm its deadline.
    fn assign(&mut self, slot_id: usize, task: Task) {
        let Task {
            id,
            operation,
            payload,
            timeout,
            submitted_at,
            completion,
        } = task;

        let slot = &mut self.slots[slot_id];
        let Some(handle) = slot.handle.as_mut() else {
            let _ = completion.send(Err(PoolError::Worker(format!(
                "Worker {} is not running",
                slot_id
            ))));
            return;
        };

        let message = TaskMessage {
            task_id: id,
            operation,
            payload,
        };
        match handle.dispatch(message) {
            Ok(()) => {
                let assigned_at = Instant::now();
                slot.current = Some(id);
                trace!(
                    task_id = id,
                    slot = slot_id,
                    queued_ms = (assigned_at - submitted_at).as_millis() as u64,
                    "Task assigned"
                );
                self.registry.register(
                    id,
                    PendingEntry {
                        completion,
                        slot: slot_id,
                        submitted_at,
                        assigned_at,
                        timeout,
                    },
                );
            }
            Err(e) => {
                warn!(task_id = id, slot = slot_id, error = %e, "Dispatch failed, replacing worker");
                let _ = completion.send(Err(e));
                self.slots[slot_id].terminate();
                if !self.is_shutting_down() {
                    self.relaunch(slot_id);
                }
            }
        }
    }

    /// Move queued tasks onto idle slots, oldest task to lowest slot first.
    fn dispatch_next(&mut self) {
        while !self.queue.is_empty() {
            let Some(slot_id) = self.idle_slot() else {
                break;
            };
            let Some(task) = self.queue.pop() else {
                break;
            };
            self.assign(slot_id, task);
        }
    }

    fn on_reply(
        &mut self,
        slot_id: usize,
        generation: u64,
        task_id: TaskId,
        outcome: std::result::Result<Value, String>,
    ) {
        match self.slots.get_mut(slot_id) {
            Some(slot) if slot.generation == generation => {
                if slot.current == Some(task_id) {
                    slot.current = None;
                    slot.tasks_processed += 1;
                    self.total_processed += 1;
                } else {
                    warn!(
                        slot = slot_id,
                        task_id,
                        current = ?slot.current,
                        "Reply for a task the worker was not running"
                    );
                }
            }
            _ => debug!(slot = slot_id, generation, task_id, "Reply from a replaced worker"),
        }

        match self.registry.take(task_id) {
            Some(entry) => {
                let result = outcome.map_err(PoolError::Transform);
                trace!(
                    task_id,
                    slot = slot_id,
                    ok = result.is_ok(),
                    run_ms = entry.assigned_at.elapsed().as_millis() as u64,
                    total_ms = entry.submitted_at.elapsed().as_millis() as u64,
                    "Task settled"
                );
                if !entry.resolve(result) {
                    debug!(task_id, "Caller stopped waiting before the reply");
                }
            }
            None => debug!(task_id, slot = slot_id, "Reply for an already settled task, discarding"),
        }

        self.dispatch_next();
    }

    fn on_exit(&mut self, slot_id: usize, generation: u64, reason: TerminationReason) {
        let Some(slot) = self.slots.get_mut(slot_id) else {
            debug!(slot = slot_id, %reason, "Exit after pool teardown");
            return;
        };
        if slot.generation != generation {
            debug!(slot = slot_id, generation, %reason, "Exit of a replaced worker");
            return;
        }

        let orphan = slot.current.take();
        slot.handle = None;
        let failure = WorkerFailure::new(slot_id, reason).with_orphan(orphan);

        if self.is_shutting_down() {
            debug!(slot = slot_id, reason = %failure.reason, "Worker stopped during shutdown");
            return;
        }

        if failure.reason.is_clean() && orphan.is_none() {
            info!(slot = slot_id, reason = %failure.reason, "Worker exited");
        } else {
            // The orphaned task is not retried; its deadline settles it
            warn!(
                slot = slot_id,
                reason = %failure.reason,
                orphaned_task = ?orphan,
                "{}",
                failure
            );
        }

        self.relaunch(slot_id);
        let vacant: Vec<usize> = self
            .slots
            .iter()
            .filter(|s| s.is_vacant() && s.id != slot_id)
            .map(|s| s.id)
            .collect();
        for id in vacant {
            self.relaunch(id);
        }
        self.dispatch_next();
    }

    /// Fail every task whose deadline has passed. Workers are left alone.
    pub fn expire_deadlines(&mut self, now: Instant) {
        for (task_id, entry) in self.registry.expire(now) {
            warn!(
                task_id,
                slot = entry.slot,
                timeout_ms = entry.timeout.as_millis() as u64,
                "Task timed out"
            );
            let after = entry.timeout;
            entry.resolve(Err(PoolError::Timeout { task_id, after }));
        }
    }

    fn launch(&mut self, slot_id: usize) -> Result<()> {
        let slot = &mut self.slots[slot_id];
        slot.generation += 1;
        let events = WorkerEvents::new(slot_id, slot.generation, self.events.clone());
        let handle = self.launcher.launch(slot_id, events)?;
        debug!(
            slot = slot_id,
            generation = slot.generation,
            unit = %handle.describe(),
            "Worker launched"
        );
        slot.handle = Some(handle);
        Ok(())
    }

    fn relaunch(&mut self, slot_id: usize) {
        match self.launch(slot_id) {
            Ok(()) => {
                let slot = &mut self.slots[slot_id];
                slot.restarts += 1;
                self.total_restarts += 1;
                info!(
                    slot = slot_id,
                    unit = %slot.describe(),
                    restarts = slot.restarts,
                    "Worker restarted"
                );
            }
            Err(e) => {
                error!(slot = slot_id, error = %e, "Failed to restart worker, slot left vacant");
            }
        }
    }

    /// Stop admission and abandon queued tasks. Idempotent: later calls wait
    /// for the same report.
    pub fn begin_shutdown(&mut self, reply: oneshot::Sender<ShutdownReport>, now: Instant) {
        if let Some(report) = &self.finished {
            let _ = reply.send(report.clone());
            return;
        }
        if let Some(drain) = &mut self.draining {
            drain.waiters.push(reply);
            return;
        }

        self.shutting_down.store(true, Ordering::Release);
        let mut abandoned = 0;
        for task in self.queue.drain() {
            let id = task.id;
            task.reject(PoolError::Abandoned(id));
            abandoned += 1;
        }
        let in_flight = self.registry.len();
        info!(
            in_flight,
            abandoned,
            grace_ms = self.config.shutdown_grace.as_millis() as u64,
            "Shutting down worker pool"
        );

        self.draining = Some(Drain {
            started: now,
            grace_deadline: deadline_after(now, self.config.shutdown_grace),
            in_flight_at_start: in_flight,
            abandoned,
            waiters: vec![reply],
        });
        self.check_drain(now);
    }

    /// Finish shutdown once nothing is pending or the grace period is over.
    pub fn check_drain(&mut self, now: Instant) {
        let Some(drain) = &self.draining else {
            return;
        };
        if self.registry.is_empty() || now >= drain.grace_deadline {
            self.finish_shutdown(now);
        }
    }

    fn finish_shutdown(&mut self, now: Instant) {
        let Some(drain) = self.draining.take() else {
            return;
        };

        for slot in &mut self.slots {
            slot.terminate();
        }
        let remaining = self.registry.drain();
        let terminated = remaining.len();
        for (task_id, entry) in remaining {
            entry.resolve(Err(PoolError::Terminated(task_id)));
        }
        self.slots.clear();

        let report = ShutdownReport {
            drained: drain.in_flight_at_start.saturating_sub(terminated),
            abandoned: drain.abandoned,
            terminated,
            elapsed: now.saturating_duration_since(drain.started),
        };
        info!(
            drained = report.drained,
            abandoned = report.abandoned,
            terminated = report.terminated,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Worker pool shut down"
        );
        for waiter in drain.waiters {
            let _ = waiter.send(report.clone());
        }
        self.finished = Some(report);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pool_size: self.config.size,
            active_workers: self.slots.iter().filter(|s| s.is_busy()).count(),
            idle_workers: self.slots.iter().filter(|s| s.is_idle()).count(),
            queue_length: self.queue.len(),
            pending_tasks: self.registry.len(),
            total_processed: self.total_processed,
            total_restarts: self.total_restarts,
        }
    }
}

impl Drop for PoolState {
    fn drop(&mut self) {
        self.shutting_down.store(true, Ordering::Release);
        for slot in &mut self.slots {
            slot.terminate();
        }
    }
}

/// Sleep until `deadline`, or forever when there is none.
async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Coordinator loop. Returns once every pool handle has been dropped; the
/// state is dropped with it, terminating any units still running.
pub(crate) async fn run(
    mut state: PoolState,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
) {
    let mut drain_tick = time::interval(state.config().drain_poll_interval);
    drain_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let deadline = state.next_deadline();
        tokio::select! {
            biased;

            Some(event) = events.recv() => state.on_event(event),

            _ = sleep_until_deadline(deadline) => state.expire_deadlines(Instant::now()),

            command = commands.recv() => match command {
                Some(command) => state.on_command(command),
                None => break,
            },

            _ = drain_tick.tick(), if state.is_draining() => state.check_drain(Instant::now()),
        }
    }

    debug!("All pool handles dropped, stopping coordinator");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerHandle;
    use nix::sys::signal::Signal;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Record {
        launches: Vec<usize>,
        dispatched: Vec<(usize, TaskId)>,
        terminated: Vec<usize>,
        fail_launch: bool,
        fail_dispatch: bool,
    }

    /// Launcher whose units only record what they are asked to do.
    #[derive(Clone, Default)]
    struct FakeLauncher {
        record: Arc<Mutex<Record>>,
    }

    impl FakeLauncher {
        fn with<R>(&self, f: impl FnOnce(&mut Record) -> R) -> R {
            f(&mut self.record.lock().unwrap())
        }
    }

    struct FakeHandle {
        slot: usize,
        record: Arc<Mutex<Record>>,
    }

    impl Launcher for FakeLauncher {
        fn launch(&self, slot: usize, _events: WorkerEvents) -> Result<Box<dyn WorkerHandle>> {
            let mut record = self.record.lock().unwrap();
            if record.fail_launch {
                return Err(PoolError::Worker("launch refused".into()));
            }
            record.launches.push(slot);
            Ok(Box::new(FakeHandle {
                slot,
                record: Arc::clone(&self.record),
            }))
        }
    }

    impl WorkerHandle for FakeHandle {
        fn dispatch(&mut self, task: TaskMessage) -> Result<()> {
            let mut record = self.record.lock().unwrap();
            if record.fail_dispatch {
                return Err(PoolError::Worker("pipe closed".into()));
            }
            record.dispatched.push((self.slot, task.task_id));
            Ok(())
        }

        fn terminate(&mut self) {
            self.record.lock().unwrap().terminated.push(self.slot);
        }

        fn describe(&self) -> String {
            format!("fake {}", self.slot)
        }
    }

    type Outcome = oneshot::Receiver<Result<Value>>;

    fn pool(size: usize, launcher: &FakeLauncher) -> PoolState {
        pool_with(PoolConfig::default().with_size(size), launcher)
    }

    fn pool_with(config: PoolConfig, launcher: &FakeLauncher) -> PoolState {
        let (tx, _rx) = mpsc::unbounded_channel();
        PoolState::start(
            config,
            Box::new(launcher.clone()),
            tx,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
    }

    fn submit(state: &mut PoolState) -> Outcome {
        submit_with(state, None)
    }

    fn submit_with(state: &mut PoolState, timeout: Option<Duration>) -> Outcome {
        let (tx, rx) = oneshot::channel();
        state.submit("resize".into(), json!({}), timeout, tx);
        rx
    }

    fn reply(state: &mut PoolState, slot: usize, outcome: std::result::Result<Value, String>) {
        let task_id = state.slots[slot].current.expect("slot is idle");
        let generation = state.slots[slot].generation;
        state.on_event(WorkerEvent::Reply {
            slot,
            generation,
            task_id,
            outcome,
        });
    }

    fn crash(state: &mut PoolState, slot: usize) {
        let generation = state.slots[slot].generation;
        state.on_event(WorkerEvent::Exited {
            slot,
            generation,
            reason: TerminationReason::Signaled(Signal::SIGKILL),
        });
    }

    fn shutdown(state: &mut PoolState) -> oneshot::Receiver<ShutdownReport> {
        let (tx, rx) = oneshot::channel();
        state.begin_shutdown(tx, Instant::now());
        rx
    }

    #[test]
    fn test_start_launches_every_slot() {
        let launcher = FakeLauncher::default();
        let state = pool(3, &launcher);
        assert_eq!(launcher.with(|r| r.launches.clone()), vec![0, 1, 2]);
        assert!(state.slots.iter().all(|s| s.generation == 1));

        let stats = state.stats();
        assert_eq!(stats.pool_size, 3);
        assert_eq!(stats.idle_workers, 3);
        assert_eq!(stats.active_workers, 0);
    }

    #[test]
    fn test_start_fails_when_a_launch_fails() {
        let launcher = FakeLauncher::default();
        launcher.with(|r| r.fail_launch = true);
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = PoolState::start(
            PoolConfig::default().with_size(2),
            Box::new(launcher),
            tx,
            Arc::new(AtomicBool::new(false)),
        );
        assert!(matches!(result, Err(PoolError::Worker(_))));
    }

    #[test]
    fn test_two_workers_five_tasks() {
        let launcher = FakeLauncher::default();
        let mut state = pool(2, &launcher);
        let mut outcomes: Vec<Outcome> = (0..5).map(|_| submit(&mut state)).collect();

        assert_eq!(launcher.with(|r| r.dispatched.clone()), vec![(0, 1), (1, 2)]);
        let stats = state.stats();
        assert_eq!(stats.active_workers, 2);
        assert_eq!(stats.idle_workers, 0);
        assert_eq!(stats.queue_length, 3);
        assert_eq!(stats.pending_tasks, 2);

        reply(&mut state, 0, Ok(json!(1)));
        reply(&mut state, 1, Ok(json!(2)));
        reply(&mut state, 0, Ok(json!(3)));
        assert_eq!(
            launcher.with(|r| r.dispatched.clone()),
            vec![(0, 1), (1, 2), (0, 3), (1, 4), (0, 5)]
        );
        reply(&mut state, 1, Ok(json!(4)));
        reply(&mut state, 0, Ok(json!(5)));

        for (i, outcome) in outcomes.iter_mut().enumerate() {
            assert_eq!(outcome.try_recv().unwrap().unwrap(), json!(i + 1));
        }
        let stats = state.stats();
        assert_eq!(stats.total_processed, 5);
        assert_eq!(stats.idle_workers, 2);
        assert_eq!(stats.pending_tasks, 0);
    }

    #[test]
    fn test_transform_failure_reaches_caller() {
        let launcher = FakeLauncher::default();
        let mut state = pool(1, &launcher);
        let mut outcome = submit(&mut state);

        reply(&mut state, 0, Err("Unsupported image format".into()));
        match outcome.try_recv().unwrap() {
            Err(PoolError::Transform(message)) => assert_eq!(message, "Unsupported image format"),
            other => panic!("Expected transform error, got {:?}", other),
        }
        assert!(state.slots[0].is_idle());
    }

    #[test]
    fn test_timeout_leaves_worker_busy() {
        let launcher = FakeLauncher::default();
        let mut state = pool(1, &launcher);
        let mut first = submit_with(&mut state, Some(Duration::from_millis(50)));
        let mut second = submit(&mut state);

        state.expire_deadlines(Instant::now() + Duration::from_millis(60));
        match first.try_recv().unwrap() {
            Err(PoolError::Timeout { task_id, after }) => {
                assert_eq!(task_id, 1);
                assert_eq!(after, Duration::from_millis(50));
            }
            other => panic!("Expected timeout, got {:?}", other),
        }
        assert!(state.slots[0].is_busy());
        assert_eq!(state.stats().pending_tasks, 0);
        assert_eq!(state.stats().queue_length, 1);

        // The late reply frees the worker and is otherwise discarded
        reply(&mut state, 0, Ok(json!("late")));
        assert_eq!(launcher.with(|r| r.dispatched.clone()), vec![(0, 1), (0, 2)]);
        reply(&mut state, 0, Ok(json!("second")));
        assert_eq!(second.try_recv().unwrap().unwrap(), json!("second"));
    }

    #[test]
    fn test_crash_restarts_slot_and_orphan_times_out() {
        let launcher = FakeLauncher::default();
        let mut state = pool(2, &launcher);
        let mut orphan = submit_with(&mut state, Some(Duration::from_millis(100)));
        let old_generation = state.slots[0].generation;

        crash(&mut state, 0);
        assert_eq!(launcher.with(|r| r.launches.clone()), vec![0, 1, 0]);
        assert_eq!(state.slots[0].generation, old_generation + 1);
        assert!(state.slots[0].is_idle());
        assert_eq!(state.stats().total_restarts, 1);

        // Not retried, still pending
        assert!(orphan.try_recv().is_err());
        assert_eq!(state.stats().pending_tasks, 1);

        // Not before the deadline
        state.expire_deadlines(Instant::now());
        assert!(orphan.try_recv().is_err());

        state.expire_deadlines(Instant::now() + Duration::from_millis(150));
        assert!(matches!(
            orphan.try_recv().unwrap(),
            Err(PoolError::Timeout { task_id: 1, .. })
        ));
    }

    #[test]
    fn test_stale_events_are_ignored() {
        let launcher = FakeLauncher::default();
        let mut state = pool(1, &launcher);
        let _first = submit(&mut state);
        crash(&mut state, 0);

        // Exit of the old generation must not restart the new unit
        state.on_event(WorkerEvent::Exited {
            slot: 0,
            generation: 1,
            reason: TerminationReason::Exited(0),
        });
        assert_eq!(launcher.with(|r| r.launches.len()), 2);
        assert_eq!(state.slots[0].generation, 2);

        // Unknown slot after teardown
        state.on_event(WorkerEvent::Exited {
            slot: 9,
            generation: 1,
            reason: TerminationReason::Exited(0),
        });
    }

    #[test]
    fn test_failed_relaunch_is_retried_on_next_exit() {
        let launcher = FakeLauncher::default();
        let mut state = pool(2, &launcher);

        launcher.with(|r| r.fail_launch = true);
        crash(&mut state, 0);
        assert!(state.slots[0].is_vacant());
        let stats = state.stats();
        assert_eq!(stats.idle_workers, 1);
        assert_eq!(stats.vacant_workers(), 1);

        // Work still flows through the remaining slot
        let _task = submit(&mut state);
        assert_eq!(launcher.with(|r| r.dispatched.clone()), vec![(1, 1)]);

        launcher.with(|r| r.fail_launch = false);
        crash(&mut state, 1);
        assert!(!state.slots[0].is_vacant());
        assert!(!state.slots[1].is_vacant());
        assert_eq!(state.stats().idle_workers, 2);
    }

    #[test]
    fn test_dispatch_failure_rejects_and_replaces() {
        let launcher = FakeLauncher::default();
        let mut state = pool(1, &launcher);

        launcher.with(|r| r.fail_dispatch = true);
        let mut outcome = submit(&mut state);
        assert!(matches!(outcome.try_recv().unwrap(), Err(PoolError::Worker(_))));
        assert_eq!(launcher.with(|r| r.terminated.clone()), vec![0]);
        assert_eq!(launcher.with(|r| r.launches.clone()), vec![0, 0]);
        assert_eq!(state.stats().pending_tasks, 0);
        assert!(state.slots[0].is_idle());
    }

    #[test]
    fn test_queue_limit() {
        let launcher = FakeLauncher::default();
        let mut state = pool_with(
            PoolConfig::default()
                .with_size(1)
                .with_max_queue_length(Some(1)),
            &launcher,
        );
        let _running = submit(&mut state);
        let _queued = submit(&mut state);
        let mut rejected = submit(&mut state);
        assert!(matches!(
            rejected.try_recv().unwrap(),
            Err(PoolError::QueueFull { limit: 1 })
        ));
        assert_eq!(state.stats().queue_length, 1);
    }

    #[test]
    fn test_shutdown_drains_in_flight_tasks() {
        let launcher = FakeLauncher::default();
        let mut state = pool(2, &launcher);
        let mut outcome = submit(&mut state);

        let mut report = shutdown(&mut state);
        assert!(state.is_draining());
        assert!(report.try_recv().is_err());

        reply(&mut state, 0, Ok(json!("done")));
        assert_eq!(outcome.try_recv().unwrap().unwrap(), json!("done"));
        state.check_drain(Instant::now());

        let report = report.try_recv().unwrap();
        assert_eq!(report.drained, 1);
        assert_eq!(report.terminated, 0);
        assert!(report.is_clean());
        assert_eq!(launcher.with(|r| r.terminated.len()), 2);
    }

    #[test]
    fn test_shutdown_abandons_queue_and_terminates_after_grace() {
        let launcher = FakeLauncher::default();
        let mut state = pool_with(
            PoolConfig::default()
                .with_size(1)
                .with_shutdown_grace(Duration::from_millis(200)),
            &launcher,
        );
        let mut running = submit(&mut state);
        let mut queued: Vec<Outcome> = (0..2).map(|_| submit(&mut state)).collect();

        let started = Instant::now();
        let (tx, mut report) = oneshot::channel();
        state.begin_shutdown(tx, started);
        for outcome in &mut queued {
            assert!(matches!(outcome.try_recv().unwrap(), Err(PoolError::Abandoned(_))));
        }

        let mut late = submit(&mut state);
        assert!(matches!(late.try_recv().unwrap(), Err(PoolError::Unavailable)));

        state.check_drain(started + Duration::from_millis(100));
        assert!(report.try_recv().is_err());

        state.check_drain(started + Duration::from_millis(200));
        let report = report.try_recv().unwrap();
        assert_eq!(report.abandoned, 2);
        assert_eq!(report.terminated, 1);
        assert_eq!(report.elapsed, Duration::from_millis(200));
        assert!(matches!(running.try_recv().unwrap(), Err(PoolError::Terminated(1))));
        assert_eq!(launcher.with(|r| r.terminated.clone()), vec![0]);

        // Idempotent
        let mut again = shutdown(&mut state);
        assert_eq!(again.try_recv().unwrap().terminated, 1);

        // Exits of terminated units do not relaunch anything
        state.on_event(WorkerEvent::Exited {
            slot: 0,
            generation: 1,
            reason: TerminationReason::Signaled(Signal::SIGTERM),
        });
        assert_eq!(launcher.with(|r| r.launches.len()), 1);
    }

    #[test]
    fn test_concurrent_shutdown_callers_share_report() {
        let launcher = FakeLauncher::default();
        let mut state = pool(1, &launcher);
        let _outcome = submit(&mut state);

        let mut first = shutdown(&mut state);
        let mut second = shutdown(&mut state);
        reply(&mut state, 0, Ok(json!(null)));
        state.check_drain(Instant::now());

        assert_eq!(first.try_recv().unwrap(), second.try_recv().unwrap());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Submit,
        Reply(usize),
        Advance(u64),
        Crash(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Submit),
            3 => (0..4usize).prop_map(Op::Reply),
            1 => (1..80u64).prop_map(Op::Advance),
            1 => (0..4usize).prop_map(Op::Crash),
        ]
    }

    mod proptests {
        use super::*;

        proptest! {
            #[test]
            fn dispatcher_invariants_hold(
                size in 1..4usize,
                ops in prop::collection::vec(op_strategy(), 1..60),
            ) {
                let launcher = FakeLauncher::default();
                let mut state = pool_with(
                    PoolConfig::default()
                        .with_size(size)
                        .with_task_timeout(Duration::from_millis(100)),
                    &launcher,
                );
                let mut clock = Instant::now();
                let mut outcomes = Vec::new();
                let mut crashed = false;

                for op in ops {
                    match op {
                        Op::Submit => outcomes.push(submit(&mut state)),
                        Op::Reply(slot) => {
                            let slot = slot % size;
                            if state.slots[slot].is_busy() {
                                reply(&mut state, slot, Ok(json!(slot)));
                            }
                        }
                        Op::Advance(ms) => {
                            clock += Duration::from_millis(ms);
                            state.expire_deadlines(clock);
                        }
                        Op::Crash(slot) => {
                            crash(&mut state, slot % size);
                            crashed = true;
                        }
                    }

                    let stats = state.stats();
                    prop_assert!(stats.active_workers <= size);
                    prop_assert_eq!(stats.active_workers + stats.idle_workers, size);
                    prop_assert_eq!(stats.pending_tasks, state.registry.len());
                    // Work-conserving: nothing waits while a worker is idle
                    prop_assert!(stats.queue_length == 0 || stats.idle_workers == 0);
                    if !crashed {
                        prop_assert!(stats.pending_tasks <= stats.active_workers);
                        prop_assert!(stats.pending_tasks <= size + stats.queue_length);
                    }

                    let mut running: Vec<_> = state.slots.iter().filter_map(|s| s.current).collect();
                    let before = running.len();
                    running.sort_unstable();
                    running.dedup();
                    prop_assert_eq!(running.len(), before);
                }

                // FIFO: tasks reach workers in submission order
                let dispatched: Vec<TaskId> =
                    launcher.with(|r| r.dispatched.iter().map(|(_, id)| *id).collect());
                prop_assert!(dispatched.windows(2).all(|w| w[0] < w[1]));

                // Every caller hears at most once, and only about a dispatched or queued task
                let settled = outcomes.iter_mut().filter_map(|rx| rx.try_recv().ok()).count();
                prop_assert!(settled <= dispatched.len());
            }
        }
    }
}
