//! CLI argument parsing using clap

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Execution mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ExecutionMode {
    /// Local mode (default) - master and workers in one process
    #[default]
    Local,
    /// Master mode - orchestrate workers over the configured transport
    Master,
    /// Worker mode - serve one master until it sends exit
    Worker,
}

/// BenchLink - master/worker messaging for distributed benchmark runs
///
/// Deployment settings also read `BENCHLINK_*` environment variables; an
/// explicit flag wins over the environment.
#[derive(Parser, Debug, Default)]
#[command(name = "benchlink")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short = 'c', long, value_name = "FILE", env = "BENCHLINK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Execution mode: local, master, or worker
    #[arg(long, value_enum, default_value = "local")]
    pub mode: ExecutionMode,

    /// Base transport name (e.g. "process", "tcp", or a plugin module path)
    #[arg(long, env = "BENCHLINK_METHOD")]
    pub method: Option<String>,

    /// Listen (master) or connect (worker) address for the tcp transport
    #[arg(long, value_name = "HOST:PORT", env = "BENCHLINK_ADDRESS")]
    pub address: Option<String>,

    /// Channel name for the process transport
    #[arg(long, env = "BENCHLINK_CHANNEL")]
    pub channel: Option<String>,

    /// System under test
    #[arg(long, env = "BENCHLINK_SUT")]
    pub sut: Option<String>,

    /// Number of workers (master waits for this many; local mode spawns this many)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Worker identity (worker mode only)
    #[arg(long, env = "BENCHLINK_WORKER_ID")]
    pub worker_id: Option<String>,

    /// Network configuration file handed to the SUT adapter
    #[arg(long, value_name = "PATH")]
    pub network_config: Option<PathBuf>,

    /// Workspace directory handed to the SUT adapter
    #[arg(long, value_name = "PATH")]
    pub workspace: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Validate and print the configuration without running
    #[arg(long)]
    pub dry_run: bool,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate CLI arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == Some(0) {
            anyhow::bail!("workers must be at least 1");
        }

        if let Some(ref method) = self.method {
            if method.trim().is_empty() {
                anyhow::bail!("method must not be empty");
            }
        }

        if self.worker_id.is_some() && self.mode != ExecutionMode::Worker {
            anyhow::bail!("--worker-id is only valid in worker mode");
        }

        Ok(())
    }
}
