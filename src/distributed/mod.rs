//! Master/worker bootstraps
//!
//! # Architecture
//!
//! BenchLink runs one master and N workers:
//!
//! - **Master** ([`MasterCoordinator`]): registers workers, drives rounds, collects results
//! - **Worker** ([`WorkerService`]): builds a SUT adapter and executes rounds on request
//!
//! Both sides talk only through a [`Messenger`](crate::messaging::Messenger);
//! which transport carries the envelopes is a configuration choice.
//!
//! # Modules
//!
//! - `protocol`: typed lifecycle messages
//! - `node_service`: worker bootstrap
//! - `coordinator`: master bootstrap

pub mod coordinator;
pub mod node_service;
pub mod protocol;

pub use coordinator::{MasterCoordinator, MasterSettings, RoundSummary, RunSummary, WorkerInfo};
pub use node_service::{WorkerHandle, WorkerReport, WorkerService};
pub use protocol::{Message, PROTOCOL_VERSION};

use crate::config::{Config, WorkerConfig};
use crate::Result;
use anyhow::Context;
use tracing::{info, warn};

/// Run master and workers in this process
///
/// Spawns `config.master.workers` workers named `local-<n>`, runs the master to
/// completion and waits for every worker to exit.
pub async fn run_local(config: &Config) -> Result<RunSummary> {
    let messaging = config.messenger_config();
    let mut workers = Vec::with_capacity(config.master.workers);

    for i in 0..config.master.workers {
        let worker = WorkerConfig {
            worker_id: Some(format!("local-{}", i)),
            ..config.worker.clone()
        };
        let handle = WorkerService::new(messaging.clone(), worker)
            .start()
            .await
            .with_context(|| format!("Failed to start local worker {}", i))?;
        workers.push(tokio::spawn(handle.run()));
    }

    info!("Started {} local worker(s)", workers.len());

    let settings = MasterSettings::from_config(&config.master)?;
    let outcome = MasterCoordinator::new(messaging, settings)?.run().await;

    for worker in workers {
        match worker.await {
            Ok(Ok(report)) => info!(
                worker_id = %report.worker_id,
                handled = report.handled,
                failed = report.failed,
                "Worker finished"
            ),
            Ok(Err(e)) => warn!("Worker ended with error: {:#}", e),
            Err(e) => warn!("Worker task panicked: {}", e),
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoundConfig;

    #[tokio::test]
    async fn test_run_local() {
        let mut config = Config::default();
        config.messaging.channel = "local-run-test".to_string();
        config.master.workers = 3;
        config.master.rounds = vec![RoundConfig {
            label: "open".to_string(),
            settings: serde_json::json!({ "txNumber": 7 }),
        }];

        let summary = run_local(&config).await.unwrap();
        assert_eq!(summary.workers.len(), 3);
        assert_eq!(summary.rounds.len(), 1);
        assert_eq!(summary.rounds[0].results.len(), 3);
        assert_eq!(summary.rounds[0].results["local-2"]["submitted"], 7);
    }

    #[tokio::test]
    async fn test_run_local_twice_on_one_channel() {
        let mut config = Config::default();
        config.messaging.channel = "local-rerun-test".to_string();
        config.master.workers = 2;

        for _ in 0..2 {
            let summary = run_local(&config).await.unwrap();
            assert_eq!(summary.workers.len(), 2);
        }

        // Every endpoint detached, so the hub is gone
        assert!(crate::messaging::ChannelHub::lookup("local-rerun-test").is_none());
    }
}
