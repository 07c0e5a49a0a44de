//! TOML configuration file parsing

use super::*;
use crate::config::cli::Cli;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<Config> {
    let config: Config = ::toml::from_str(contents)
        .context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: Config) -> Result<Config> {
    // Messaging
    if let Some(ref method) = cli.method {
        config.messaging.method = method.clone();
    }
    if let Some(ref address) = cli.address {
        config.messaging.address = address.clone();
    }
    if let Some(ref channel) = cli.channel {
        config.messaging.channel = channel.clone();
    }
    if let Some(ref sut) = cli.sut {
        config.messaging.sut = sut.clone();
    }

    // Worker
    if let Some(ref path) = cli.network_config {
        config.worker.network_config_path = path.clone();
    }
    if let Some(ref path) = cli.workspace {
        config.worker.workspace_path = path.clone();
    }
    if let Some(ref worker_id) = cli.worker_id {
        config.worker.worker_id = Some(worker_id.clone());
    }

    // Master
    if let Some(workers) = cli.workers {
        config.master.workers = workers;
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    const SAMPLE: &str = r#"
[messaging]
method = "tcp"
address = "10.0.1.10:7878"
sut = "mock"

[worker]
network_config_path = "networks/burrow.json"
workspace_path = "workspace"

[master]
workers = 4
register_timeout = "30s"

[[master.rounds]]
label = "open"
settings = { txNumber = 1000, rate = { type = "fixed-rate", tps = 50 } }

[[master.rounds]]
label = "query"
"#;

    #[test]
    fn test_parse_toml_sections() {
        let config = parse_toml_string(SAMPLE).unwrap();

        assert_eq!(config.messaging.method, "tcp");
        assert_eq!(config.messaging.address, "10.0.1.10:7878");
        // Unset keys keep their defaults
        assert_eq!(config.messaging.channel, "benchlink");
        assert_eq!(config.master.round_timeout, "10m");

        assert_eq!(config.worker.network_config_path, PathBuf::from("networks/burrow.json"));
        assert_eq!(config.master.workers, 4);
        assert_eq!(config.master.rounds.len(), 2);
        assert_eq!(config.master.rounds[0].settings["txNumber"], 1000);
        assert_eq!(config.master.rounds[0].settings["rate"]["type"], "fixed-rate");
        assert!(config.master.rounds[1].settings.is_null());
    }

    #[test]
    fn test_parse_toml_empty_is_default() {
        assert_eq!(parse_toml_string("").unwrap(), Config::default());
    }

    #[test]
    fn test_parse_toml_rejects_bad_types() {
        assert!(parse_toml_string("[master]\nworkers = \"many\"\n").is_err());
    }

    #[test]
    fn test_parse_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = parse_toml_file(file.path()).unwrap();
        assert_eq!(config.master.workers, 4);

        let missing = file.path().with_extension("missing");
        let err = parse_toml_file(&missing).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to read config file"));
    }

    #[test]
    fn test_cli_overrides_file() {
        let config = parse_toml_string(SAMPLE).unwrap();
        let cli = Cli::try_parse_from([
            "benchlink",
            "--method",
            "process",
            "--workers",
            "2",
            "--workspace",
            "/srv/ws",
        ])
        .unwrap();

        let merged = merge_cli_with_config(&cli, config).unwrap();
        assert_eq!(merged.messaging.method, "process");
        assert_eq!(merged.master.workers, 2);
        assert_eq!(merged.worker.workspace_path, PathBuf::from("/srv/ws"));
        // Untouched by the CLI
        assert_eq!(merged.messaging.address, "10.0.1.10:7878");
        assert_eq!(merged.master.rounds.len(), 2);
    }
}
