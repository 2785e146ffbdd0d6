//! imgpool - batch image processing on an isolated worker pool

mod cli;

use anyhow::{Context, Result, bail};
use clap::Parser;
use imgpool::logging::{self, LogConfig};
use imgpool::transform::image_ops::{ImageSource, MetadataRequest, OutputFormat, ThumbnailRequest};
use imgpool::worker::run_worker_main;
use imgpool::{PoolError, ProcessConfig, WorkerPool};
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::{OwoColorize, Stream::Stderr};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use tokio::task::JoinSet;
use tracing::{info, warn};

use cli::{Cli, Commands, PoolArgs};

/// One input of a batch: a label for output and the task payload.
struct Job {
    input: String,
    payload: Value,
}

/// Program entry point: parses CLI arguments, dispatches the selected command,
/// and on error prints the error chain and exits with status 1.
fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    let result = match &cli.command {
        // Before any runtime exists: worker processes are single-threaded
        Commands::Worker(args) => {
            logging::init(
                LogConfig::for_worker()
                    .with_ansi(!cli.no_color)
                    .with_env_overrides(),
            );
            run_worker_main(args.slot, args.max_memory)
        }
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
        Commands::Thumbnail(args) => {
            init_cli_logging(&cli);
            let jobs = thumbnail_jobs(args);
            jobs.and_then(|jobs| run_batch(&cli, &args.pool, "thumbnail", jobs))
        }
        Commands::Metadata(args) => {
            init_cli_logging(&cli);
            let jobs = args
                .inputs
                .iter()
                .map(|path| {
                    let source = ImageSource::path(path);
                    job(path, &MetadataRequest { source })
                })
                .collect::<Result<Vec<_>>>();
            jobs.and_then(|jobs| run_batch(&cli, &args.pool, "metadata", jobs))
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn init_cli_logging(cli: &Cli) {
    logging::init(
        LogConfig::for_cli(cli.verbosity())
            .with_ansi(!cli.no_color)
            .with_env_overrides(),
    );
}

fn job(path: &Path, request: &impl serde::Serialize) -> Result<Job> {
    Ok(Job {
        input: path.display().to_string(),
        payload: serde_json::to_value(request)?,
    })
}

/// One `thumbnail` request per input, each writing `<out-dir>/<stem>.<ext>`.
fn thumbnail_jobs(args: &cli::ThumbnailArgs) -> Result<Vec<Job>> {
    let format: OutputFormat = args.format.into();
    let outputs = output_paths(&args.out_dir, &args.inputs, format.extension())?;

    std::fs::create_dir_all(&args.out_dir).with_context(|| {
        format!(
            "Failed to create output directory {}",
            args.out_dir.display()
        )
    })?;

    args.inputs
        .iter()
        .zip(outputs)
        .map(|(path, output)| {
            let mut request = ThumbnailRequest::new(ImageSource::path(path), args.max_side);
            request.quality = args.quality;
            request.without_enlargement = args.without_enlargement;
            request.crop = !args.no_crop;
            request.format = format;
            request.output = Some(output);
            job(path, &request)
        })
        .collect()
}

/// Output file for every input, refusing two inputs that share a target.
fn output_paths(out_dir: &Path, inputs: &[PathBuf], extension: &str) -> Result<Vec<PathBuf>> {
    let mut claimed: HashMap<PathBuf, &Path> = HashMap::with_capacity(inputs.len());
    let mut outputs = Vec::with_capacity(inputs.len());
    for input in inputs {
        let output = output_path(out_dir, input, extension);
        if let Some(first) = claimed.insert(output.clone(), input.as_path()) {
            bail!(
                "{} and {} would both be written to {}",
                first.display(),
                input.display(),
                output.display()
            );
        }
        outputs.push(output);
    }
    Ok(outputs)
}

fn output_path(out_dir: &Path, input: &Path, extension: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    out_dir.join(format!("{}.{}", stem, extension))
}

fn start_pool(cli: &Cli, args: &PoolArgs) -> Result<WorkerPool> {
    let config = args.pool_config();
    let pool = if args.threads {
        WorkerPool::start_threads(config)?
    } else {
        let level = LogConfig::for_cli(cli.verbosity()).level;
        let process = ProcessConfig::current_exe()?
            .with_max_memory(args.max_memory)
            .with_env("IMGPOOL_LOG_LEVEL", level.to_string());
        WorkerPool::start_processes(config, process)?
    };
    info!(
        workers = pool.size(),
        threads = args.threads,
        timeout_ms = pool.task_timeout().as_millis() as u64,
        "Worker pool started"
    );
    Ok(pool)
}

fn progress_bar(cli: &Cli, len: usize) -> Result<ProgressBar> {
    if cli.quiet || !std::io::stderr().is_terminal() {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")?
            .progress_chars("█▓▒░  "),
    );
    Ok(pb)
}

fn run_batch(cli: &Cli, args: &PoolArgs, operation: &'static str, jobs: Vec<Job>) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    runtime.block_on(batch(cli, args, operation, jobs))
}

/// Submit every job at once, print one JSON line per finished job, and fail
/// if any job failed.
async fn batch(
    cli: &Cli,
    args: &PoolArgs,
    operation: &'static str,
    jobs: Vec<Job>,
) -> Result<()> {
    let pool = start_pool(cli, args)?;
    let total = jobs.len();
    let pb = progress_bar(cli, total)?;

    let mut tasks = JoinSet::new();
    for Job { input, payload } in jobs {
        let pool = pool.clone();
        tasks.spawn(async move {
            let outcome = pool.submit(operation, payload).await;
            (input, outcome)
        });
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    let mut failed = 0usize;

    loop {
        tokio::select! {
            joined = tasks.join_next() => {
                let Some(joined) = joined else { break };
                let (input, outcome) = joined.context("Submit task panicked")?;
                if outcome.is_err() {
                    failed += 1;
                }
                let line = result_line(&input, outcome);
                pb.suspend(|| println!("{}", line));
                pb.inc(1);
            }
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                pb.set_message("interrupted, shutting down");
                warn!("Interrupted, shutting down worker pool");
                pool.shutdown().await?;
            }
        }
    }
    pb.finish_and_clear();

    if cli.verbose > 0 {
        let stats = pool.stats().await?;
        eprintln!(
            "{} {} tasks on {} workers ({} restarts)",
            "Processed".if_supports_color(Stderr, |text| text.green()),
            stats.total_processed,
            stats.pool_size,
            stats.total_restarts
        );
    }

    let report = pool.shutdown().await?;
    info!(
        drained = report.drained,
        abandoned = report.abandoned,
        terminated = report.terminated,
        "Worker pool stopped"
    );

    if interrupted {
        bail!("Interrupted ({} of {} inputs failed)", failed, total);
    }
    if failed > 0 {
        bail!("{} of {} inputs failed", failed, total);
    }
    Ok(())
}

fn result_line(input: &str, outcome: imgpool::Result<Value>) -> Value {
    match outcome {
        Ok(result) => json!({ "input": input, "ok": true, "result": result }),
        Err(e) => {
            let kind = match &e {
                PoolError::Transform(_) => "transform",
                PoolError::Timeout { .. } => "timeout",
                PoolError::Worker(_) => "worker",
                _ => "pool",
            };
            json!({ "input": input, "ok": false, "kind": kind, "error": e.to_string() })
        }
    }
}
