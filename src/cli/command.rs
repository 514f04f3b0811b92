//! Command-line interface definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Request optimization, work queue and HTTP retry toolkit
#[derive(Parser, Debug)]
#[command(name = "apiflow")]
#[command(version)]
pub struct Cli {
    /// Path to configuration file [default: $APIFLOW_CONFIG or apiflow.toml]
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Color output mode [auto, always, never]
    #[arg(long, global = true, default_value = "auto", hide_possible_values = true)]
    pub color: ColorChoice,

    /// JSON output for scripting
    #[arg(long, global = true)]
    pub json: bool,

    /// Decrease output verbosity
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Increase output verbosity
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Debug, Default, ValueEnum)]
pub enum ColorChoice {
    /// Detect automatically
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a request optimizer demonstration and print its statistics
    Optimize(OptimizeArgs),

    /// Push synthetic jobs through the priority work queue
    Queue(QueueArgs),

    /// Send requests through the retrying connection manager
    Connection(ConnectionArgs),

    /// Transform files through the work queue and async I/O
    Pipeline(PipelineArgs),

    /// Inspect configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Demo {
    /// Identical concurrent calls collapse onto one execution
    Dedup,
    /// Single-item lookups grouped into batch calls
    Batch,
    /// Header-driven adaptive pacing
    RateLimit,
    /// Dedup, batching and rate limiting together
    Combined,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Optimization {
    Dedup,
    Batch,
    Ratelimit,
}

#[derive(Parser, Debug)]
pub struct OptimizeArgs {
    #[arg(long, value_enum, default_value = "combined")]
    pub demo: Demo,

    /// Service name used for rate limit presets
    #[arg(long, default_value = "github")]
    pub service: String,

    /// Optimizations to turn off (comma-separated)
    #[arg(long, value_enum, value_delimiter = ',')]
    pub disable: Vec<Optimization>,

    /// Override the maximum batch size
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Override the deduplication TTL in milliseconds
    #[arg(long)]
    pub ttl_ms: Option<u64>,

    /// Number of simulated requests
    #[arg(long, default_value = "40")]
    pub requests: usize,
}

#[derive(Parser, Debug)]
pub struct QueueArgs {
    /// Number of jobs to submit
    #[arg(long, default_value = "20")]
    pub jobs: usize,

    /// Override the worker count
    #[arg(long)]
    pub workers: Option<usize>,

    /// Make every Nth job fail its first attempt (0 disables)
    #[arg(long, default_value = "0")]
    pub fail_every: usize,

    /// Simulated work per job in milliseconds
    #[arg(long, default_value = "20")]
    pub work_ms: u64,
}

#[derive(Parser, Debug)]
pub struct ConnectionArgs {
    /// URL to request
    #[arg(long)]
    pub url: String,

    /// Number of sequential requests
    #[arg(long, default_value = "1")]
    pub requests: usize,
}

#[derive(Parser, Debug)]
pub struct PipelineArgs {
    /// Files to process
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Suffix appended to each output file name
    #[arg(long, default_value = ".processed")]
    pub suffix: String,

    /// Upper-case file contents instead of copying them
    #[arg(long)]
    pub uppercase: bool,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the effective configuration
    Show,
    /// Validate the configuration file
    Validate,
}
