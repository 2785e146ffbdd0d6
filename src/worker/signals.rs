//! Classification of worker unit terminations.

use crate::pool::TaskId;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Why a worker unit stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by a signal not covered below.
    Signaled(Signal),
    /// SIGKILL, most often the OOM killer.
    OutOfMemory,
    /// SIGSEGV on Linux / SIGBUS on macOS, typically a blown stack in a decoder.
    StackOverflow(Signal),
    /// Thread unit unwound outside a transform.
    Panicked,
    /// Unit left voluntarily after crossing its memory threshold.
    Recycled { memory_mib: usize },
    /// Exit status could not be collected.
    Unknown,
}

impl TerminationReason {
    /// Exit code 0 or a memory recycle: the unit was not faulty.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Exited(0) | Self::Recycled { .. })
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::OutOfMemory => "out of memory (SIGKILL)".to_string(),
            Self::StackOverflow(sig) => format!("stack overflow ({:?})", sig),
            Self::Panicked => "panicked".to_string(),
            Self::Recycled { memory_mib } => format!("recycled at {}MiB", memory_mib),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Map a `waitpid` status onto a [`TerminationReason`].
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => match signal {
            Signal::SIGKILL => TerminationReason::OutOfMemory,
            Signal::SIGSEGV | Signal::SIGBUS => TerminationReason::StackOverflow(signal),
            _ => TerminationReason::Signaled(signal),
        },
        _ => TerminationReason::Unknown,
    }
}

/// A unit death, with what it was doing at the time.
#[derive(Debug)]
pub struct WorkerFailure {
    pub slot: usize,
    pub reason: TerminationReason,
    /// Task the unit was running, which is now orphaned.
    pub orphaned: Option<TaskId>,
}

impl WorkerFailure {
    pub fn new(slot: usize, reason: TerminationReason) -> Self {
        Self {
            slot,
            reason,
            orphaned: None,
        }
    }

    pub fn with_orphan(mut self, task_id: Option<TaskId>) -> Self {
        self.orphaned = task_id;
        self
    }
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Worker {} {}", self.slot, self.reason)?;
        if let Some(task_id) = self.orphaned {
            write!(f, " while running task {}", task_id)?;
        }
        Ok(())
    }
}
