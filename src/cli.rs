//! Command-line interface definitions using clap.

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use imgpool::PoolConfig;
use imgpool::transform::image_ops::OutputFormat;
use imgpool::worker::DEFAULT_MAX_MEMORY_MIB;
use std::path::PathBuf;
use std::time::Duration;

/// Batch image thumbnails and metadata on an isolated worker pool.
#[derive(Parser, Debug)]
#[command(name = "imgpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors and results.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output (any non-empty NO_COLOR other than 0/false/no/off).
    #[arg(
        long,
        global = true,
        env = "NO_COLOR",
        value_parser = clap::builder::FalseyValueParser::new()
    )]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resize images and write them to a directory.
    Thumbnail(ThumbnailArgs),

    /// Print dimensions and pixel layout of images.
    Metadata(MetadataArgs),

    /// Generate shell completions.
    Completions(CompletionsArgs),

    /// Serve tasks from the parent pool over stdin/stdout.
    #[command(hide = true)]
    Worker(WorkerArgs),
}

/// Worker pool settings shared by the batch commands.
#[derive(Args, Debug, Clone)]
pub struct PoolArgs {
    /// Number of workers [default: CPUs - 1, at least 2].
    #[arg(short = 'j', long, env = "IMGPOOL_WORKERS")]
    pub workers: Option<usize>,

    /// Per-task timeout in milliseconds.
    #[arg(long, value_name = "MS", env = "IMGPOOL_TASK_TIMEOUT_MS", default_value_t = 30_000)]
    pub timeout: u64,

    /// How long shutdown waits for running tasks, in milliseconds.
    #[arg(long, value_name = "MS", env = "IMGPOOL_SHUTDOWN_GRACE_MS", default_value_t = 5_000)]
    pub grace: u64,

    /// Fail tasks beyond this many waiting for a worker.
    #[arg(long, env = "IMGPOOL_MAX_QUEUE")]
    pub max_queue: Option<usize>,

    /// Restart a worker process once its peak memory passes this many MiB (0 = never).
    #[arg(long, value_name = "MIB", env = "IMGPOOL_MAX_MEMORY_MIB", default_value_t = DEFAULT_MAX_MEMORY_MIB)]
    pub max_memory: usize,

    /// Run workers as threads in this process instead of child processes.
    #[arg(long, env = "IMGPOOL_THREADS")]
    pub threads: bool,
}

impl PoolArgs {
    pub fn pool_config(&self) -> PoolConfig {
        let mut config = PoolConfig::default()
            .with_task_timeout(Duration::from_millis(self.timeout))
            .with_shutdown_grace(Duration::from_millis(self.grace))
            .with_max_queue_length(self.max_queue);
        if let Some(workers) = self.workers {
            config = config.with_size(workers);
        }
        config
    }
}

/// Arguments for the thumbnail command.
#[derive(Parser, Debug)]
pub struct ThumbnailArgs {
    /// Images to resize.
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Directory the thumbnails are written to.
    #[arg(short, long)]
    pub out_dir: PathBuf,

    /// Longest side of the thumbnail in pixels.
    #[arg(short = 's', long, default_value_t = 256)]
    pub max_side: u32,

    /// JPEG quality (1-100).
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub quality: Option<u8>,

    /// Output encoding.
    #[arg(short, long, value_enum, default_value_t = FormatArg::Webp)]
    pub format: FormatArg,

    /// Keep the aspect ratio instead of cropping to a square.
    #[arg(long)]
    pub no_crop: bool,

    /// Leave images that already fit at their size.
    #[arg(long)]
    pub without_enlargement: bool,

    #[command(flatten)]
    pub pool: PoolArgs,
}

/// Arguments for the metadata command.
#[derive(Parser, Debug)]
pub struct MetadataArgs {
    /// Images to inspect.
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    #[command(flatten)]
    pub pool: PoolArgs,
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "imgpool",
            &mut std::io::stdout(),
        );
    }
}

/// Arguments the pool passes to its worker processes.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    #[arg(long)]
    pub slot: usize,

    #[arg(long, default_value_t = DEFAULT_MAX_MEMORY_MIB)]
    pub max_memory: usize,
}

/// Output format argument.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FormatArg {
    /// Lossless WebP.
    #[default]
    Webp,
    /// JPEG at --quality.
    #[value(alias = "jpg")]
    Jpeg,
    Png,
}

impl From<FormatArg> for OutputFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Webp => OutputFormat::Webp,
            FormatArg::Jpeg => OutputFormat::Jpeg,
            FormatArg::Png => OutputFormat::Png,
        }
    }
}

impl Cli {
    /// Logging verbosity: `-1` for `--quiet`, otherwise the `-v` count.
    pub fn verbosity(&self) -> i8 {
        if self.quiet {
            -1
        } else {
            self.verbose.min(i8::MAX as u8) as i8
        }
    }
}
