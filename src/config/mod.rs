//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.
//!
//! Precedence: built-in defaults, then the TOML file, then CLI flags.
//!
//! ```toml
//! [messaging]
//! method = "tcp"
//! address = "10.0.1.10:7878"
//! sut = "mock"
//!
//! [worker]
//! network_config_path = "networks/burrow.json"
//! workspace_path = "workspace"
//!
//! [master]
//! workers = 4
//! register_timeout = "60s"
//! round_timeout = "10m"
//!
//! [[master.rounds]]
//! label = "open"
//! settings = { txNumber = 1000 }
//! ```

pub mod cli;
pub mod cli_convert;
pub mod toml;
pub mod validator;

use crate::messaging::messenger::{default_address, default_channel};
use crate::messaging::MessengerConfig;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub master: MasterConfig,
}

/// Transport selection shared by master and workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Base transport name; the role qualifier is added by each bootstrap
    #[serde(default = "default_method")]
    pub method: String,
    /// Listen (master) or connect (worker) address for `tcp`
    #[serde(default = "default_address")]
    pub address: String,
    /// Hub name for `process`
    #[serde(default = "default_channel")]
    pub channel: String,
    /// System under test
    #[serde(default = "default_sut")]
    pub sut: String,
}

fn default_method() -> String {
    "process".to_string()
}

fn default_sut() -> String {
    crate::adapter::mock::SUT_NAME.to_string()
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            method: default_method(),
            address: default_address(),
            channel: default_channel(),
            sut: default_sut(),
        }
    }
}

/// Worker settings, handed to the SUT adapter on `init`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub network_config_path: PathBuf,
    #[serde(default)]
    pub workspace_path: PathBuf,
    /// Worker identity; random when absent
    #[serde(default)]
    pub worker_id: Option<String>,
}

/// Master settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Number of workers to wait for
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// How long to wait for every worker to register (e.g. "60s")
    #[serde(default = "default_register_timeout")]
    pub register_timeout: String,
    /// How long to wait for every worker in each phase of a round (e.g. "10m")
    #[serde(default = "default_round_timeout")]
    pub round_timeout: String,
    #[serde(default)]
    pub rounds: Vec<RoundConfig>,
}

fn default_workers() -> usize {
    1
}

fn default_register_timeout() -> String {
    "60s".to_string()
}

fn default_round_timeout() -> String {
    "10m".to_string()
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            register_timeout: default_register_timeout(),
            round_timeout: default_round_timeout(),
            rounds: Vec::new(),
        }
    }
}

/// One benchmark round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundConfig {
    pub label: String,
    /// Free-form settings passed to the adapter
    #[serde(default)]
    pub settings: serde_json::Value,
}

impl Config {
    /// Messenger configuration carrying the base transport name
    pub fn messenger_config(&self) -> MessengerConfig {
        MessengerConfig::new(self.messaging.method.clone())
            .with_address(self.messaging.address.clone())
            .with_channel(self.messaging.channel.clone())
            .with_sut(self.messaging.sut.clone())
    }
}

/// Load the configuration file named by `cli` (if any) and apply CLI overrides
pub fn load_config(cli: &cli::Cli) -> Result<Config> {
    let config = match cli.config {
        Some(ref path) => toml::parse_toml_file(path)?,
        None => Config::default(),
    };
    toml::merge_cli_with_config(cli, config)
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Configuration:")?;
        writeln!(f, "  Messaging: {}", self.messaging)?;
        writeln!(f, "  Worker: {}", self.worker)?;
        writeln!(f, "  Master: {}", self.master)?;
        for (i, round) in self.master.rounds.iter().enumerate() {
            writeln!(f, "    Round {}: {}", i, round)?;
        }
        Ok(())
    }
}

impl fmt::Display for MessagingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method={}, sut={}", self.method, self.sut)?;
        if self.method == "tcp" {
            write!(f, ", address={}", self.address)?;
        } else if self.method == "process" {
            write!(f, ", channel={}", self.channel)?;
        }
        Ok(())
    }
}

impl fmt::Display for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id={}, network_config={}, workspace={}",
            self.worker_id.as_deref().unwrap_or("<random>"),
            self.network_config_path.display(),
            self.workspace_path.display()
        )
    }
}

impl fmt::Display for MasterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "workers={}, register_timeout={}, round_timeout={}, rounds={}",
            self.workers,
            self.register_timeout,
            self.round_timeout,
            self.rounds.len()
        )
    }
}

impl fmt::Display for RoundConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.label, self.settings)
    }
}
