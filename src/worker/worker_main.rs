//! Worker subprocess main entry point.
//!
//! Runs when the binary is invoked as `imgpool worker`. Reads `run` requests
//! from stdin, executes them against the built-in transforms and writes one
//! reply per request to stdout. stdout carries nothing but protocol lines;
//! logs go to stderr.

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{WorkRequest, WorkResponse};
use crate::transform::TransformRegistry;
use std::io::{self, Read, Write};
use tracing::{debug, info, warn};

/// Peak resident set size of this process in MiB.
fn get_memory_usage_mib() -> usize {
    use nix::sys::resource::{UsageWho, getrusage};

    match getrusage(UsageWho::RUSAGE_SELF) {
        Ok(usage) => {
            let max_rss = usage.max_rss();

            #[cfg(target_os = "macos")]
            {
                // macOS: max_rss is in bytes
                (max_rss as usize) / (1024 * 1024)
            }

            #[cfg(not(target_os = "macos"))]
            {
                // Linux: max_rss is in kilobytes
                (max_rss as usize) / 1024
            }
        }
        Err(_) => 0,
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    /// Parent closed stdin or sent `exit`.
    Requested,
    /// Over the memory threshold after a task.
    Recycle,
}

/// Serve requests until EOF, `exit`, or the memory threshold is crossed.
///
/// `max_memory_mib == 0` disables the memory check.
fn worker_loop<R: Read, W: Write>(
    reader: &mut LineReader<R>,
    writer: &mut LineWriter<W>,
    registry: &TransformRegistry,
    max_memory_mib: usize,
) -> io::Result<LoopExit> {
    writer.write_message(&WorkResponse::ready())?;

    loop {
        let request = match reader.read_message::<WorkRequest>()? {
            Some(Ok(request)) => request,
            Some(Err(e)) => {
                // No task id to answer; the pool's timeout settles whatever sent it
                warn!(error = %e, "Ignoring malformed request");
                continue;
            }
            None => return Ok(LoopExit::Requested),
        };

        match request {
            WorkRequest::Exit => return Ok(LoopExit::Requested),
            WorkRequest::Run {
                task_id,
                operation,
                payload,
            } => {
                let outcome = registry.run(&operation, payload);
                if let Err(message) = &outcome {
                    debug!(task_id, %operation, error = %message, "Task failed");
                }
                writer.write_message(&WorkResponse::for_outcome(task_id, outcome))?;

                if max_memory_mib > 0 {
                    let memory_mib = get_memory_usage_mib();
                    if memory_mib > max_memory_mib {
                        writer.write_message(&WorkResponse::Recycle {
                            memory_mib,
                            threshold_mib: max_memory_mib,
                        })?;
                        return Ok(LoopExit::Recycle);
                    }
                }
            }
        }
    }
}

/// Run the worker subprocess. Never returns.
pub fn run_worker_main(slot: usize, max_memory_mib: usize) -> ! {
    // Ignore SIGPIPE - pipe errors surface as io::Error
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    // Safety: fds 0 and 1 are the pipes the parent set up, and nothing else
    // in this process reads or writes them.
    let stdin_fd = unsafe { PipeFd::from_raw(0) };
    let stdout_fd = unsafe { PipeFd::from_raw(1) };

    let mut reader = LineReader::new(stdin_fd);
    let mut writer = LineWriter::new(stdout_fd);
    let registry = TransformRegistry::builtin();

    debug!(slot, max_memory_mib, pid = std::process::id(), "Worker started");

    match worker_loop(&mut reader, &mut writer, &registry, max_memory_mib) {
        Ok(LoopExit::Requested) => std::process::exit(0),
        Ok(LoopExit::Recycle) => {
            info!(slot, "Worker exiting for recycle");
            std::process::exit(0)
        }
        Err(e) => {
            eprintln!("Worker {} error: {}", slot, e);
            std::process::exit(1);
        }
    }
}
