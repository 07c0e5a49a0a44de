//! Configuration validation

use super::*;
use crate::config::cli::ExecutionMode;
use anyhow::{Context, Result};

/// Validate complete configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_messaging(&config.messaging)?;
    validate_worker(&config.worker)?;
    validate_master(&config.master)?;

    Ok(())
}

/// Validate configuration for a specific execution mode
pub fn validate_for_mode(config: &Config, mode: ExecutionMode) -> Result<()> {
    validate_config(config)?;

    if mode == ExecutionMode::Local && config.messaging.method == "tcp" {
        // Local workers start before the master is guaranteed to be listening
        anyhow::bail!("local mode requires the process transport (got method=tcp)");
    }

    Ok(())
}

/// Validate messaging configuration
pub fn validate_messaging(messaging: &MessagingConfig) -> Result<()> {
    if messaging.method.trim().is_empty() {
        anyhow::bail!("messaging.method must not be empty");
    }

    if messaging.sut.trim().is_empty() {
        anyhow::bail!("messaging.sut must not be empty");
    }

    if messaging.method == "tcp" {
        validate_address(&messaging.address)?;
    }

    if messaging.method == "process" && messaging.channel.trim().is_empty() {
        anyhow::bail!("messaging.channel must not be empty for the process transport");
    }

    Ok(())
}

/// Validate a HOST:PORT address
fn validate_address(address: &str) -> Result<()> {
    let (host, port) = address
        .rsplit_once(':')
        .with_context(|| format!("messaging.address must be HOST:PORT, got '{}'", address))?;

    if host.is_empty() {
        anyhow::bail!("messaging.address has an empty host: '{}'", address);
    }

    port.parse::<u16>()
        .with_context(|| format!("messaging.address has an invalid port: '{}'", address))?;

    Ok(())
}

/// Validate worker configuration
pub fn validate_worker(worker: &WorkerConfig) -> Result<()> {
    if let Some(ref worker_id) = worker.worker_id {
        if worker_id.trim().is_empty() {
            anyhow::bail!("worker.worker_id must not be empty when set");
        }
        if worker_id == crate::messaging::BROADCAST {
            anyhow::bail!(
                "worker.worker_id '{}' is reserved for broadcast",
                crate::messaging::BROADCAST
            );
        }
    }

    Ok(())
}

/// Validate master configuration
pub fn validate_master(master: &MasterConfig) -> Result<()> {
    if master.workers == 0 {
        anyhow::bail!("master.workers must be at least 1");
    }

    let register_timeout = cli_convert::parse_duration(&master.register_timeout)
        .context("Invalid master.register_timeout")?;
    if register_timeout.is_zero() {
        anyhow::bail!("master.register_timeout must be greater than zero");
    }

    let round_timeout = cli_convert::parse_duration(&master.round_timeout)
        .context("Invalid master.round_timeout")?;
    if round_timeout.is_zero() {
        anyhow::bail!("master.round_timeout must be greater than zero");
    }

    for (i, round) in master.rounds.iter().enumerate() {
        if round.label.trim().is_empty() {
            anyhow::bail!("master.rounds[{}] has an empty label", i);
        }
        if !(round.settings.is_null() || round.settings.is_object()) {
            anyhow::bail!("master.rounds[{}] ({}) settings must be a table", i, round.label);
        }
    }

    Ok(())
}
