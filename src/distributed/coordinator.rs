//! Master coordinator
//!
//! The coordinator:
//! - Builds a `<method>-master` messenger
//! - Broadcasts `register` until the expected number of workers answered
//! - Has every worker build its SUT adapter (`init` / `ready`)
//! - Drives each configured round (`prepare` / `prepared`, `test` / `testResult`)
//! - Broadcasts `exit`, flushes it to the workers and returns a [`RunSummary`]
//!
//! Worker replies are decoded by the master's handler table and forwarded over a
//! channel to the phase loop, which is the only place run state changes. An
//! `error` message from any worker aborts the run.

use crate::config::{cli_convert, MasterConfig, RoundConfig};
use crate::distributed::protocol::{self, types, Message};
use crate::messaging::{HandlerTable, MessageData, Messenger, MessengerConfig, Recipients, Role, TransportRegistry};
use crate::Result;
use anyhow::{anyhow, Context};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How often `register` is repeated while waiting for workers
pub const REGISTER_INTERVAL: Duration = Duration::from_secs(1);

/// Coordinator settings with durations resolved
#[derive(Debug, Clone)]
pub struct MasterSettings {
    pub workers: usize,
    pub register_timeout: Duration,
    pub round_timeout: Duration,
    pub register_interval: Duration,
    pub rounds: Vec<RoundConfig>,
}

impl MasterSettings {
    pub fn from_config(master: &MasterConfig) -> Result<Self> {
        Ok(Self {
            workers: master.workers,
            register_timeout: cli_convert::parse_duration(&master.register_timeout)
                .context("Invalid register_timeout")?,
            round_timeout: cli_convert::parse_duration(&master.round_timeout)
                .context("Invalid round_timeout")?,
            register_interval: REGISTER_INTERVAL,
            rounds: master.rounds.clone(),
        })
    }
}

/// A worker that answered `register`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub node: String,
    pub sut: Option<String>,
}

/// Outcome of one round
#[derive(Debug, Clone)]
pub struct RoundSummary {
    pub round: usize,
    pub label: String,
    /// Result reported by each worker
    pub results: BTreeMap<String, Value>,
    pub prepare_duration: Duration,
    pub test_duration: Duration,
}

/// Outcome of a complete run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub workers: Vec<WorkerInfo>,
    pub rounds: Vec<RoundSummary>,
    /// Registration plus adapter construction
    pub setup_duration: Duration,
    pub total_duration: Duration,
}

/// Handler context: forwards decoded worker messages to the phase loop
struct MasterContext {
    inbound: mpsc::UnboundedSender<Message>,
}

async fn forward(ctx: Arc<MasterContext>, data: MessageData) -> Result<Option<()>> {
    let message = Message::from_data(&data)?;
    ctx.inbound
        .send(message)
        .map_err(|_| anyhow!("Coordinator is no longer listening"))?;
    Ok(None)
}

fn build_handler_table(context: Arc<MasterContext>) -> Result<HandlerTable<MasterContext>> {
    let mut table = HandlerTable::new(context);
    for message_type in [
        types::CONNECTED,
        types::READY,
        types::PREPARED,
        types::TEST_RESULT,
        types::ERROR,
    ] {
        table.register(message_type, forward)?;
    }
    Ok(table)
}

/// Master bootstrap
pub struct MasterCoordinator {
    messaging: MessengerConfig,
    settings: MasterSettings,
    transports: TransportRegistry,
}

impl MasterCoordinator {
    /// Create a coordinator
    ///
    /// `messaging.transport_type` is the base transport name; the master role
    /// qualifier is added at run time.
    pub fn new(messaging: MessengerConfig, settings: MasterSettings) -> Result<Self> {
        if settings.workers == 0 {
            anyhow::bail!("Master requires at least one worker");
        }

        Ok(Self {
            messaging,
            settings,
            transports: TransportRegistry::with_builtins(),
        })
    }

    pub fn with_transports(mut self, transports: TransportRegistry) -> Self {
        self.transports = transports;
        self
    }

    /// Run the benchmark to completion
    pub async fn run(self) -> Result<RunSummary> {
        let started = Instant::now();

        let mut config = self.messaging.clone();
        config.transport_type = Role::Master.qualify(&config.transport_type);

        let messenger = Messenger::with_registry(config, &self.transports)
            .context("Failed to create master messenger")?;
        messenger
            .initialize()
            .await
            .context("Failed to initialize master messenger")?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let table = build_handler_table(Arc::new(MasterContext { inbound: inbound_tx }))?;
        messenger
            .configure(Arc::new(table))
            .await
            .context("Failed to configure master messenger")?;

        info!(
            transport = %messenger.transport_type(),
            identity = %messenger.identity(),
            "Master waiting for {} worker(s)",
            self.settings.workers
        );

        let mut run = Run {
            messenger,
            inbound: inbound_rx,
            settings: &self.settings,
            workers: BTreeMap::new(),
        };

        let outcome = run.execute(started).await;

        // Workers stop whatever the outcome
        if let Err(e) = protocol::send(&run.messenger, Recipients::all(), Message::Exit) {
            warn!("Failed to broadcast exit: {}", e);
        }
        // Exit must reach the wire before the caller can drop the runtime
        if let Err(e) = run.messenger.shutdown().await {
            warn!("Failed to shut down master messenger: {}", e);
        }

        outcome
    }
}

struct Run<'a> {
    messenger: Messenger,
    inbound: mpsc::UnboundedReceiver<Message>,
    settings: &'a MasterSettings,
    workers: BTreeMap<String, WorkerInfo>,
}

impl Run<'_> {
    async fn execute(&mut self, started: Instant) -> Result<RunSummary> {
        self.register_workers().await?;

        protocol::send(&self.messenger, self.recipients(), Message::Init)?;
        self.collect(types::READY, self.settings.round_timeout, |message| match message {
            Message::Ready { worker_id } => Some((worker_id, ())),
            _ => None,
        })
        .await?;
        info!("All {} worker(s) ready", self.workers.len());

        let setup_duration = started.elapsed();
        let mut rounds = Vec::with_capacity(self.settings.rounds.len());

        for (index, round) in self.settings.rounds.iter().enumerate() {
            rounds.push(self.run_round(index, round).await?);
        }

        Ok(RunSummary {
            workers: self.workers.values().cloned().collect(),
            rounds,
            setup_duration,
            total_duration: started.elapsed(),
        })
    }

    async fn register_workers(&mut self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.settings.register_timeout;
        let timeout = tokio::time::sleep_until(deadline);
        tokio::pin!(timeout);

        let mut ticker = tokio::time::interval(self.settings.register_interval);

        while self.workers.len() < self.settings.workers {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("Broadcasting register");
                    protocol::send(&self.messenger, Recipients::all(), Message::Register)?;
                }
                received = self.inbound.recv() => match received {
                    Some(Message::Connected { worker_id, node, sut }) => {
                        if !self.workers.contains_key(&worker_id) {
                            info!(
                                "Worker {} connected from {} ({}/{})",
                                worker_id,
                                node,
                                self.workers.len() + 1,
                                self.settings.workers
                            );
                            self.workers.insert(
                                worker_id.clone(),
                                WorkerInfo { worker_id, node, sut },
                            );
                        }
                    }
                    Some(Message::Error { worker_id, message_type, error }) => {
                        anyhow::bail!("Worker {} failed handling '{}': {}", worker_id, message_type, error);
                    }
                    Some(other) => debug!("Ignoring {} during registration", other.message_type()),
                    None => anyhow::bail!("Master inbound channel closed"),
                },
                _ = &mut timeout => {
                    anyhow::bail!(
                        "Timed out after {:?} waiting for workers: {}/{} connected",
                        self.settings.register_timeout,
                        self.workers.len(),
                        self.settings.workers
                    );
                }
            }
        }

        Ok(())
    }

    async fn run_round(&mut self, index: usize, round: &RoundConfig) -> Result<RoundSummary> {
        info!(round = index, label = %round.label, "Preparing round");
        let prepare_start = Instant::now();
        protocol::send(
            &self.messenger,
            self.recipients(),
            Message::Prepare {
                round: index,
                label: round.label.clone(),
                settings: round.settings.clone(),
            },
        )?;
        self.collect(types::PREPARED, self.settings.round_timeout, |message| match message {
            Message::Prepared { worker_id, round } if round == index => Some((worker_id, ())),
            _ => None,
        })
        .await
        .with_context(|| format!("Round {} ({}) failed to prepare", index, round.label))?;
        let prepare_duration = prepare_start.elapsed();

        info!(round = index, label = %round.label, "Running round");
        let test_start = Instant::now();
        protocol::send(
            &self.messenger,
            self.recipients(),
            Message::Test {
                round: index,
                label: round.label.clone(),
                settings: round.settings.clone(),
            },
        )?;
        let results = self
            .collect(types::TEST_RESULT, self.settings.round_timeout, |message| match message {
                Message::TestResult {
                    worker_id,
                    round,
                    result,
                } if round == index => Some((worker_id, result)),
                _ => None,
            })
            .await
            .with_context(|| format!("Round {} ({}) failed", index, round.label))?;
        let test_duration = test_start.elapsed();

        info!(round = index, label = %round.label, "Round complete in {:?}", test_duration);

        Ok(RoundSummary {
            round: index,
            label: round.label.clone(),
            results,
            prepare_duration,
            test_duration,
        })
    }

    /// Every registered worker
    fn recipients(&self) -> Recipients {
        Recipients::to(self.workers.keys().cloned())
    }

    /// Wait until every registered worker sent a message accepted by `accept`
    async fn collect<T, F>(&mut self, phase: &str, timeout: Duration, mut accept: F) -> Result<BTreeMap<String, T>>
    where
        F: FnMut(Message) -> Option<(String, T)>,
    {
        let mut collected = BTreeMap::new();
        let deadline = tokio::time::Instant::now() + timeout;

        while collected.len() < self.workers.len() {
            let message = match tokio::time::timeout_at(deadline, self.inbound.recv()).await {
                Ok(Some(message)) => message,
                Ok(None) => anyhow::bail!("Master inbound channel closed while waiting for {}", phase),
                Err(_) => {
                    let missing: Vec<&str> = self
                        .workers
                        .keys()
                        .filter(|id| !collected.contains_key(*id))
                        .map(String::as_str)
                        .collect();
                    anyhow::bail!(
                        "Timed out after {:?} waiting for {} from {}",
                        timeout,
                        phase,
                        missing.join(", ")
                    );
                }
            };

            if let Message::Error {
                worker_id,
                message_type,
                error,
            } = &message
            {
                anyhow::bail!("Worker {} failed handling '{}': {}", worker_id, message_type, error);
            }

            let kind = message.message_type();
            match accept(message) {
                Some((worker_id, value)) if self.workers.contains_key(&worker_id) => {
                    debug!(worker_id = %worker_id, "Received {}", phase);
                    collected.insert(worker_id, value);
                }
                Some((worker_id, _)) => debug!("Ignoring {} from unregistered worker {}", phase, worker_id),
                None => debug!("Ignoring {} while waiting for {}", kind, phase),
            }
        }

        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::MockFactory;
    use crate::adapter::AdapterRegistry;
    use crate::config::WorkerConfig;
    use crate::distributed::node_service::WorkerService;
    use serde_json::json;

    fn settings(workers: usize, rounds: Vec<RoundConfig>) -> MasterSettings {
        MasterSettings {
            workers,
            register_timeout: Duration::from_secs(5),
            round_timeout: Duration::from_secs(5),
            register_interval: Duration::from_millis(50),
            rounds,
        }
    }

    fn round(label: &str, tx_number: u64) -> RoundConfig {
        RoundConfig {
            label: label.to_string(),
            settings: json!({ "txNumber": tx_number }),
        }
    }

    fn messaging(channel: &str) -> MessengerConfig {
        MessengerConfig::new("process")
            .with_channel(channel)
            .with_identity("master")
            .with_sut("mock")
    }

    async fn spawn_worker(
        channel: &str,
        worker_id: &str,
        factory: MockFactory,
    ) -> tokio::task::JoinHandle<Result<crate::distributed::node_service::WorkerReport>> {
        let mut adapters = AdapterRegistry::empty();
        adapters.register("mock", Arc::new(factory)).unwrap();
        let worker = WorkerConfig {
            worker_id: Some(worker_id.to_string()),
            ..WorkerConfig::default()
        };
        let handle = WorkerService::new(
            MessengerConfig::new("process").with_channel(channel).with_sut("mock"),
            worker,
        )
        .with_adapters(adapters)
        .start()
        .await
        .unwrap();
        tokio::spawn(handle.run())
    }

    #[tokio::test]
    async fn test_run_with_two_workers() {
        let channel = "master-test-run";
        let w1 = spawn_worker(channel, "w1", MockFactory::default()).await;
        let w2 = spawn_worker(channel, "w2", MockFactory::default()).await;

        let coordinator = MasterCoordinator::new(
            messaging(channel),
            settings(2, vec![round("open", 10), round("query", 20)]),
        )
        .unwrap();
        let summary = coordinator.run().await.unwrap();

        let ids: Vec<&str> = summary.workers.iter().map(|w| w.worker_id.as_str()).collect();
        assert_eq!(ids, vec!["w1", "w2"]);
        assert_eq!(summary.rounds.len(), 2);
        assert_eq!(summary.rounds[1].label, "query");
        assert_eq!(summary.rounds[1].results["w2"]["submitted"], 20);
        assert_eq!(summary.rounds[0].results.len(), 2);
        assert!(summary.total_duration >= summary.setup_duration);

        // Exit reached both workers
        for worker in [w1, w2] {
            let report = tokio::time::timeout(Duration::from_secs(5), worker)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(report.failed, 0);
        }
    }

    #[tokio::test]
    async fn test_worker_error_aborts_run() {
        let channel = "master-test-abort";
        let worker = spawn_worker(channel, "w1", MockFactory::with_failing_rounds()).await;

        let coordinator =
            MasterCoordinator::new(messaging(channel), settings(1, vec![round("open", 5)])).unwrap();
        let err = coordinator.run().await.unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("w1"), "unexpected error: {}", msg);
        assert!(msg.contains("prepare"), "unexpected error: {}", msg);

        // The abort still sends exit
        let report = tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.failed, 1);
    }

    #[test]
    fn test_tcp_worker_gets_exit_before_master_runtime_drops() {
        let worker_rt = tokio::runtime::Runtime::new().unwrap();
        let master_rt = tokio::runtime::Runtime::new().unwrap();

        // Free port for the master to listen on
        let address = worker_rt.block_on(async {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        });
        let tcp = MessengerConfig::new("tcp").with_address(address).with_sut("mock");

        let coordinator = MasterCoordinator::new(
            tcp.clone().with_identity("master"),
            settings(1, vec![round("open", 3)]),
        )
        .unwrap();
        let master = master_rt.spawn(coordinator.run());

        let worker = worker_rt.block_on(async {
            let worker = WorkerConfig {
                worker_id: Some("w1".to_string()),
                ..WorkerConfig::default()
            };
            for _ in 0..250 {
                match WorkerService::new(tcp.clone(), worker.clone()).start().await {
                    Ok(handle) => return tokio::spawn(handle.run()),
                    Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
                }
            }
            panic!("master never started listening");
        });

        let summary = master_rt.block_on(master).unwrap().unwrap();
        assert_eq!(summary.rounds[0].results["w1"]["submitted"], 3);
        drop(master_rt);

        let report = worker_rt
            .block_on(async { tokio::time::timeout(Duration::from_secs(5), worker).await })
            .expect("worker never saw exit")
            .unwrap()
            .unwrap();
        assert_eq!(report.worker_id, "w1");
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_registration_timeout() {
        let mut settings = settings(1, vec![]);
        settings.register_timeout = Duration::from_millis(200);
        let coordinator = MasterCoordinator::new(messaging("master-test-timeout"), settings).unwrap();

        let err = coordinator.run().await.unwrap_err();
        assert!(format!("{}", err).contains("0/1 connected"));
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(MasterCoordinator::new(messaging("master-test-zero"), settings(0, vec![])).is_err());
    }

    #[test]
    fn test_settings_from_config() {
        let master = MasterConfig {
            workers: 3,
            register_timeout: "30s".to_string(),
            round_timeout: "5m".to_string(),
            rounds: vec![round("open", 1)],
        };
        let settings = MasterSettings::from_config(&master).unwrap();
        assert_eq!(settings.workers, 3);
        assert_eq!(settings.register_timeout, Duration::from_secs(30));
        assert_eq!(settings.round_timeout, Duration::from_secs(300));
        assert_eq!(settings.register_interval, REGISTER_INTERVAL);
    }
}
