//! Parent-side handle for a process worker unit.
//!
//! The write end of the child's stdin stays with the [`Proc`]; the read end of
//! its stdout moves into a reader thread that forwards replies to the
//! coordinator, then reaps the child and reports why it went away.
//!
//! Only the reader thread reaps, and it does so under the same lock that
//! [`Proc::terminate`] holds while signalling, so a signal never reaches a
//! pid the kernel has already handed to another process.

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{WorkRequest, WorkResponse};
use super::signals::{TerminationReason, analyze_wait_status};
use super::{TaskMessage, WorkerEvents, WorkerHandle};
use crate::error::{PoolError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Handle to a worker subprocess.
pub struct Proc {
    pid: Pid,
    /// `None` once the unit has been told to stop.
    writer: Option<LineWriter>,
    /// Set by the reader thread, under the lock, when it reaps the child.
    reaped: Arc<Mutex<bool>>,
    reader: Option<JoinHandle<()>>,
}

impl Proc {
    /// Wrap a spawned child, taking its stdin and stdout.
    pub fn from_child(mut child: std::process::Child, events: WorkerEvents) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Worker("Child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Worker("Child stdout not captured".into()))?;

        let writer = LineWriter::new(PipeFd::from(OwnedFd::from(stdin)));
        let reader = LineReader::new(PipeFd::from(OwnedFd::from(stdout)));
        let reaped = Arc::new(Mutex::new(false));

        let thread_reaped = Arc::clone(&reaped);
        let handle = thread::Builder::new()
            .name(format!("imgpool-reader-{}", events.slot()))
            .spawn(move || read_until_exit(pid, reader, events, thread_reaped))?;

        Ok(Self {
            pid,
            writer: Some(writer),
            reaped,
            reader: Some(handle),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Whether the child has exited and been reaped.
    pub fn is_reaped(&self) -> bool {
        *lock(&self.reaped)
    }

    fn send(&mut self, request: &WorkRequest) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PoolError::Worker(format!("Worker pid {} is stopping", self.pid)))?;
        writer
            .write_message(request)
            .map_err(|e| PoolError::Worker(format!("Failed to send to worker: {}", e)))
    }
}

impl WorkerHandle for Proc {
    fn dispatch(&mut self, task: TaskMessage) -> Result<()> {
        self.send(&WorkRequest::run(task.task_id, task.operation, task.payload))
    }

    fn terminate(&mut self) {
        if self.writer.is_none() {
            return;
        }
        let _ = self.send(&WorkRequest::Exit);
        self.writer = None;

        let reaped = lock(&self.reaped);
        if !*reaped {
            let _ = signal::kill(self.pid, Signal::SIGTERM);
        }
    }

    fn describe(&self) -> String {
        format!("pid {}", self.pid)
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        self.terminate();
        // The reader thread reaps the child on its own; detach it.
        drop(self.reader.take());
    }
}

fn lock(reaped: &Mutex<bool>) -> MutexGuard<'_, bool> {
    reaped.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reap `pid` once it exits, flipping `reaped` in the same critical section.
fn reap(pid: Pid, reaped: &Mutex<bool>) -> nix::Result<WaitStatus> {
    let mut backoff = Duration::from_millis(1);
    loop {
        {
            let mut flag = lock(reaped);
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                // An error means the pid is no longer ours to signal either
                done => {
                    *flag = true;
                    return done;
                }
            }
        }
        thread::sleep(backoff);
        backoff = (backoff * 2).min(Duration::from_millis(50));
    }
}

/// Reader thread body: forward replies until EOF, then reap the child.
fn read_until_exit(
    pid: Pid,
    mut reader: LineReader,
    events: WorkerEvents,
    reaped: Arc<Mutex<bool>>,
) {
    let slot = events.slot();
    let mut recycled_at = None;
    let mut broken = false;

    loop {
        match reader.read_message::<WorkResponse>() {
            Ok(Some(Ok(response))) => match response {
                WorkResponse::Ready { pid: child } => {
                    debug!(slot, pid = child, "Worker ready");
                }
                WorkResponse::Result { task_id, value } => {
                    events.reply(task_id, Ok(value));
                }
                WorkResponse::Error { task_id, message } => {
                    events.reply(task_id, Err(message));
                }
                WorkResponse::Recycle {
                    memory_mib,
                    threshold_mib,
                } => {
                    info!(slot, memory_mib, threshold_mib, "Worker over memory threshold, recycling");
                    recycled_at = Some(memory_mib);
                }
            },
            Ok(Some(Err(e))) => {
                warn!(slot, error = %e, "Ignoring malformed line from worker");
            }
            Ok(None) => break,
            Err(e) => {
                warn!(slot, %pid, error = %e, "Worker pipe read failed, killing worker");
                broken = true;
                break;
            }
        }
    }

    drop(reader);
    if broken {
        // Not reaped yet: only this thread reaps, so the pid is still ours
        let _ = signal::kill(pid, Signal::SIGKILL);
    }

    let reason = match reap(pid, &reaped) {
        Ok(status) => match (analyze_wait_status(status), recycled_at) {
            (TerminationReason::Exited(0), Some(memory_mib)) => {
                TerminationReason::Recycled { memory_mib }
            }
            (reason, _) => reason,
        },
        Err(e) => {
            warn!(slot, %pid, error = %e, "waitpid failed");
            TerminationReason::Unknown
        }
    };
    events.exited(reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerEvent;
    use serde_json::json;
    use std::process::{Command, Stdio};
    use tokio::sync::mpsc;

    fn spawn_sh(script: &str) -> std::process::Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn sh")
    }

    #[test]
    fn test_exit_code_is_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _proc = Proc::from_child(spawn_sh("exit 3"), WorkerEvents::new(0, 1, tx)).unwrap();

        match rx.blocking_recv().unwrap() {
            WorkerEvent::Exited {
                slot,
                generation,
                reason,
            } => {
                assert_eq!((slot, generation), (0, 1));
                assert_eq!(reason, TerminationReason::Exited(3));
            }
            other => panic!("Expected Exited, got {:?}", other),
        }
    }

    #[test]
    fn test_reply_is_forwarded() {
        let script = r#"echo '{"type":"ready","pid":1}'; read line; echo '{"type":"result","task_id":5,"value":{"ok":true}}'"#;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut proc = Proc::from_child(spawn_sh(script), WorkerEvents::new(2, 1, tx)).unwrap();

        proc.dispatch(TaskMessage {
            task_id: 5,
            operation: "metadata".into(),
            payload: json!({}),
        })
        .unwrap();

        match rx.blocking_recv().unwrap() {
            WorkerEvent::Reply {
                task_id, outcome, ..
            } => {
                assert_eq!(task_id, 5);
                assert_eq!(outcome.unwrap(), json!({"ok": true}));
            }
            other => panic!("Expected Reply, got {:?}", other),
        }
        assert!(matches!(
            rx.blocking_recv().unwrap(),
            WorkerEvent::Exited {
                reason: TerminationReason::Exited(0),
                ..
            }
        ));
        assert!(proc.is_reaped());
    }

    #[test]
    fn test_terminate_stops_a_hung_child() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = WorkerEvents::new(0, 1, tx);
        let mut proc = Proc::from_child(spawn_sh("exec sleep 60"), events).unwrap();
        assert!(proc.describe().starts_with("pid "));

        proc.terminate();
        proc.terminate();

        assert!(matches!(
            rx.blocking_recv().unwrap(),
            WorkerEvent::Exited {
                reason: TerminationReason::Signaled(Signal::SIGTERM),
                ..
            }
        ));
        assert!(proc.dispatch(TaskMessage {
            task_id: 1,
            operation: "metadata".into(),
            payload: json!({}),
        })
        .is_err());
    }

    #[test]
    fn test_unreadable_output_kills_the_worker() {
        // Invalid UTF-8, then block on stdin, which the Proc keeps open
        let (tx, mut rx) = mpsc::unbounded_channel();
        let proc =
            Proc::from_child(spawn_sh(r"printf '\377\n'; read x"), WorkerEvents::new(1, 4, tx)).unwrap();

        match rx.blocking_recv().unwrap() {
            WorkerEvent::Exited {
                slot,
                generation,
                reason,
            } => {
                assert_eq!((slot, generation), (1, 4));
                assert_eq!(reason, TerminationReason::Signaled(Signal::SIGKILL));
            }
            other => panic!("Expected Exited, got {:?}", other),
        }
        assert!(proc.is_reaped());
    }

    #[test]
    fn test_terminate_after_reap_sends_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut proc = Proc::from_child(spawn_sh("exit 0"), WorkerEvents::new(0, 1, tx)).unwrap();

        assert!(matches!(
            rx.blocking_recv().unwrap(),
            WorkerEvent::Exited {
                reason: TerminationReason::Exited(0),
                ..
            }
        ));
        assert!(proc.is_reaped());
        proc.terminate();
        assert!(rx.try_recv().is_err());
    }
}
