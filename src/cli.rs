//! CLI argument parsing for tmaprobe

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Output format for the session report
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "tmaprobe")]
#[command(version)]
#[command(
    about = "Top-down microarchitecture analysis of a single function call",
    long_about = "Top-down microarchitecture analysis of a single function call.\n\n\
        The function and measurement are configured through the environment:\n  \
        TMA_FUNCTION, TMA_CORE, TMA_OUTPUT_FILE, TMA_LEVEL (required)\n  \
        TMA_TOPLEV, TMA_TASKSET, TMA_PERF, TMA_PYTHON (optional)"
)]
pub struct Cli {
    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Attach to running process by PID (mutually exclusive with command)
    #[arg(short = 'p', long = "pid", value_name = "PID")]
    pub pid: Option<i32>,

    /// Read symbols from this image instead of /proc/<pid>/exe
    #[arg(long = "image", value_name = "PATH")]
    pub image: Option<PathBuf>,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug")]
    pub debug: bool,

    /// Command to run and measure (everything after --)
    #[arg(last = true)]
    pub command: Option<Vec<String>>,
}
