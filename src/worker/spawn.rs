//! Worker subprocess spawning.
//!
//! Uses `std::process::Command` (posix_spawn where available) rather than a
//! bare fork, so the parent's threads and runtime are never duplicated.

use super::proc::Proc;
use super::{Launcher, WorkerEvents, WorkerHandle};
use crate::error::{PoolError, Result};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::debug;

/// Default memory threshold (MiB) before a worker asks to be recycled.
pub const DEFAULT_MAX_MEMORY_MIB: usize = 2 * 1024;

/// How process worker units are started.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Executable to run. Defaults to the current executable.
    pub program: PathBuf,
    /// Arguments placed before `--slot` and `--max-memory`.
    pub args: Vec<String>,
    /// Peak RSS (MiB) above which the unit recycles itself; 0 disables.
    pub max_memory_mib: usize,
    /// Extra environment for the child.
    pub env: Vec<(String, String)>,
}

impl ProcessConfig {
    /// Run `program` with `args` instead of the current executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            max_memory_mib: DEFAULT_MAX_MEMORY_MIB,
            env: Vec::new(),
        }
    }

    /// Re-execute the current binary as `<exe> worker`.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| PoolError::Worker(format!("Failed to get current executable: {}", e)))?;
        Ok(Self::new(exe).with_args(["worker"]))
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_memory(mut self, mib: usize) -> Self {
        self.max_memory_mib = mib;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn command(&self, slot: usize) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.arg("--slot");
        cmd.arg(slot.to_string());
        cmd.arg("--max-memory");
        cmd.arg(self.max_memory_mib.to_string());

        // IPC on stdin/stdout; worker logs go to the parent's stderr
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());

        cmd.envs(self.env.iter().map(|(k, v)| (k, v)));
        cmd
    }
}

/// Launches one subprocess per slot.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    config: ProcessConfig,
}

impl ProcessLauncher {
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }

    /// Launcher for `<current exe> worker`.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(ProcessConfig::current_exe()?))
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, slot: usize, events: WorkerEvents) -> Result<Box<dyn WorkerHandle>> {
        let child = self.config.command(slot).spawn().map_err(|e| {
            PoolError::Worker(format!(
                "Failed to spawn worker {}: {}",
                self.config.program.display(),
                e
            ))
        })?;
        let proc = Proc::from_child(child, events)?;
        debug!(slot, pid = %proc.pid(), "Spawned worker process");
        Ok(Box::new(proc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{TerminationReason, WorkerEvent};
    use tokio::sync::mpsc;

    #[test]
    fn test_process_config_defaults() {
        let config = ProcessConfig::new("/bin/true");
        assert_eq!(config.max_memory_mib, DEFAULT_MAX_MEMORY_MIB);
        assert!(config.args.is_empty());

        let exe = ProcessConfig::current_exe().unwrap();
        assert_eq!(exe.args, vec!["worker".to_string()]);
    }

    #[test]
    fn test_command_appends_slot_and_memory() {
        let cmd = ProcessConfig::new("imgpool")
            .with_args(["worker"])
            .with_max_memory(512)
            .command(3);
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, ["worker", "--slot", "3", "--max-memory", "512"]);
    }

    #[test]
    fn test_launch_reports_exit() {
        // sh -c takes the trailing --slot/--max-memory as positional args
        let launcher = ProcessLauncher::new(
            ProcessConfig::new("sh")
                .with_args(["-c", "exit $EXIT_CODE"])
                .with_env("EXIT_CODE", "4"),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = launcher.launch(1, WorkerEvents::new(1, 1, tx)).unwrap();

        assert!(matches!(
            rx.blocking_recv().unwrap(),
            WorkerEvent::Exited {
                slot: 1,
                reason: TerminationReason::Exited(4),
                ..
            }
        ));
    }

    #[test]
    fn test_launch_missing_program_fails() {
        let launcher = ProcessLauncher::new(ProcessConfig::new("/nonexistent/imgpool-worker"));
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = launcher.launch(0, WorkerEvents::new(0, 1, tx)).err().unwrap();
        assert!(err.to_string().contains("Failed to spawn worker"));
    }
}
