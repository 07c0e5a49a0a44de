//! Worker bootstrap
//!
//! The worker service runs on every node that executes benchmark rounds. It:
//! - Builds a `<method>-worker` messenger and initializes it
//! - Registers handlers for the lifecycle messages
//! - Constructs the SUT adapter when the master sends `init`
//! - Prepares and executes rounds on request, replying to the master
//! - Returns when the master sends `exit` or goes away
//!
//! # State
//!
//! Handlers run concurrently (one task per inbound envelope). The only long-lived
//! mutable state, the adapter, is written by [`WorkerHandle::run`] alone when the
//! `init` handler completes; handlers only ever read it.
//!
//! The handle owns the messenger. Handlers reach it through a weak reference, so
//! once `run` returns the messenger, its transport and the handler table are
//! released.
//!
//! # Failures
//!
//! A failed handler is reported to the master with an `error` message and the
//! worker keeps serving. A failed `init` additionally ends the worker, since no
//! round can run without an adapter.

use crate::adapter::{AdapterFactory, AdapterRegistry, SutAdapter};
use crate::config::WorkerConfig;
use crate::distributed::protocol::{self, types, Message};
use crate::messaging::{
    DispatchEvent, HandlerTable, MessageData, Messenger, MessengerConfig, Recipients, Role,
    TransportRegistry, BROADCAST,
};
use crate::Result;
use anyhow::{anyhow, Context};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

/// Shared state every worker handler receives
pub struct WorkerContext {
    pub network_config_path: PathBuf,
    pub workspace_path: PathBuf,
    pub worker_id: String,
    sut: String,
    node: String,
    messenger: Weak<Messenger>,
    factory: Arc<dyn AdapterFactory>,
    /// Written only by [`WorkerHandle::run`]
    adapter: RwLock<Option<Arc<dyn SutAdapter>>>,
}

impl WorkerContext {
    /// Adapter built by `init`
    pub async fn adapter(&self) -> Result<Arc<dyn SutAdapter>> {
        self.adapter
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("Worker {} has no adapter yet (init not completed)", self.worker_id))
    }

    pub async fn has_adapter(&self) -> bool {
        self.adapter.read().await.is_some()
    }

    pub fn sut(&self) -> &str {
        &self.sut
    }

    /// Send a lifecycle message to the master
    fn reply(&self, message: Message) -> Result<()> {
        let messenger = self
            .messenger
            .upgrade()
            .ok_or_else(|| anyhow!("Worker {} has stopped", self.worker_id))?;
        // Worker-side transports only route to the master
        protocol::send(&messenger, Recipients::all(), message)?;
        Ok(())
    }
}

/// Value a worker handler hands back to the bootstrap
pub enum WorkerOutput {
    Adapter(Arc<dyn SutAdapter>),
    Exit,
}

impl fmt::Debug for WorkerOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerOutput::Adapter(adapter) => write!(f, "Adapter({})", adapter.sut()),
            WorkerOutput::Exit => write!(f, "Exit"),
        }
    }
}

type WorkerTable = HandlerTable<WorkerContext, WorkerOutput>;

/// Worker bootstrap
pub struct WorkerService {
    messaging: MessengerConfig,
    worker: WorkerConfig,
    transports: TransportRegistry,
    adapters: AdapterRegistry,
}

impl WorkerService {
    /// Create a worker service
    ///
    /// `messaging.transport_type` is the base transport name; the worker role
    /// qualifier is added at start.
    pub fn new(messaging: MessengerConfig, worker: WorkerConfig) -> Self {
        Self {
            messaging,
            worker,
            transports: TransportRegistry::with_builtins(),
            adapters: AdapterRegistry::with_builtins(),
        }
    }

    pub fn with_transports(mut self, transports: TransportRegistry) -> Self {
        self.transports = transports;
        self
    }

    pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = adapters;
        self
    }

    /// Construct, initialize and configure the worker messenger
    ///
    /// After this returns the worker is listening; drive it with
    /// [`WorkerHandle::run`].
    pub async fn start(self) -> Result<WorkerHandle> {
        let sut = self
            .messaging
            .sut
            .clone()
            .context("Worker requires a SUT (--sut or [messaging] sut)")?;
        let factory = self.adapters.get(&sut)?;

        let worker_id = self
            .worker
            .worker_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if worker_id.trim().is_empty() {
            anyhow::bail!("Worker identity must not be empty");
        }
        if worker_id == BROADCAST {
            anyhow::bail!("Worker identity '{}' is reserved for broadcast", BROADCAST);
        }

        let mut config = self.messaging.clone();
        config.transport_type = Role::Worker.qualify(&config.transport_type);
        config.identity = Some(worker_id.clone());

        let messenger = Arc::new(
            Messenger::with_registry(config, &self.transports)
                .context("Failed to create worker messenger")?,
        );
        messenger
            .initialize()
            .await
            .context("Failed to initialize worker messenger")?;

        let context = Arc::new(WorkerContext {
            network_config_path: self.worker.network_config_path.clone(),
            workspace_path: self.worker.workspace_path.clone(),
            worker_id: worker_id.clone(),
            sut,
            node: get_node_id()?,
            messenger: Arc::downgrade(&messenger),
            factory,
            adapter: RwLock::new(None),
        });

        let table = Arc::new(build_handler_table(context.clone())?);
        let events = table
            .take_events()
            .context("Worker handler events already taken")?;

        messenger
            .configure(table.clone())
            .await
            .context("Failed to configure worker messenger")?;

        info!(
            worker_id = %worker_id,
            transport = %messenger.transport_type(),
            sut = %context.sut,
            "Worker listening"
        );

        Ok(WorkerHandle {
            context,
            messenger,
            table,
            events,
        })
    }
}

fn build_handler_table(context: Arc<WorkerContext>) -> Result<WorkerTable> {
    let table = WorkerTable::new(context)
        .with_handler(types::REGISTER, on_register)?
        .with_handler(types::INIT, on_init)?
        .with_handler(types::PREPARE, on_prepare)?
        .with_handler(types::TEST, on_test)?
        .with_handler(types::EXIT, on_exit)?;
    Ok(table)
}

async fn on_register(ctx: Arc<WorkerContext>, _data: MessageData) -> Result<Option<WorkerOutput>> {
    ctx.reply(Message::Connected {
        worker_id: ctx.worker_id.clone(),
        node: ctx.node.clone(),
        sut: Some(ctx.sut.clone()),
    })?;
    Ok(None)
}

async fn on_init(ctx: Arc<WorkerContext>, _data: MessageData) -> Result<Option<WorkerOutput>> {
    info!(
        worker_id = %ctx.worker_id,
        network_config = %ctx.network_config_path.display(),
        workspace = %ctx.workspace_path.display(),
        "Building {} adapter",
        ctx.sut
    );

    let adapter = ctx
        .factory
        .create(&ctx.network_config_path, &ctx.workspace_path, &ctx.worker_id)
        .with_context(|| format!("Failed to build {} adapter", ctx.sut))?;

    Ok(Some(WorkerOutput::Adapter(adapter)))
}

async fn on_prepare(ctx: Arc<WorkerContext>, data: MessageData) -> Result<Option<WorkerOutput>> {
    let (round, label, settings) = match Message::from_data(&data)? {
        Message::Prepare { round, label, settings } => (round, label, settings),
        other => anyhow::bail!("Expected prepare payload, got {:?}", other),
    };

    debug!(worker_id = %ctx.worker_id, round, label = %label, "Preparing round");
    let adapter = ctx.adapter().await?;
    adapter
        .prepare_round(round, &settings)
        .await
        .with_context(|| format!("Failed to prepare round {} ({})", round, label))?;

    ctx.reply(Message::Prepared {
        worker_id: ctx.worker_id.clone(),
        round,
    })?;
    Ok(None)
}

async fn on_test(ctx: Arc<WorkerContext>, data: MessageData) -> Result<Option<WorkerOutput>> {
    let (round, label, settings) = match Message::from_data(&data)? {
        Message::Test { round, label, settings } => (round, label, settings),
        other => anyhow::bail!("Expected test payload, got {:?}", other),
    };

    info!(worker_id = %ctx.worker_id, round, label = %label, "Running round");
    let adapter = ctx.adapter().await?;
    let result = adapter
        .run_round(round, &settings)
        .await
        .with_context(|| format!("Round {} ({}) failed", round, label))?;

    ctx.reply(Message::TestResult {
        worker_id: ctx.worker_id.clone(),
        round,
        result,
    })?;
    Ok(None)
}

async fn on_exit(_ctx: Arc<WorkerContext>, _data: MessageData) -> Result<Option<WorkerOutput>> {
    Ok(Some(WorkerOutput::Exit))
}

/// Counters reported when a worker stops
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker_id: String,
    pub handled: u64,
    pub failed: u64,
    pub unknown: u64,
}

/// Running worker
pub struct WorkerHandle {
    context: Arc<WorkerContext>,
    messenger: Arc<Messenger>,
    table: Arc<WorkerTable>,
    events: mpsc::UnboundedReceiver<DispatchEvent<WorkerOutput>>,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &str {
        &self.context.worker_id
    }

    pub fn context(&self) -> &Arc<WorkerContext> {
        &self.context
    }

    /// Process handler outcomes until the master sends `exit`
    ///
    /// Fails when `init` fails or the master goes away. The messenger is shut
    /// down before this returns.
    pub async fn run(mut self) -> Result<WorkerReport> {
        let outcome = self.serve().await;

        if let Err(e) = self.messenger.shutdown().await {
            warn!(worker_id = %self.context.worker_id, "Failed to shut down messenger: {}", e);
        }

        outcome
    }

    async fn serve(&mut self) -> Result<WorkerReport> {
        while let Some(event) = self.events.recv().await {
            match event {
                DispatchEvent::Completed {
                    value: WorkerOutput::Adapter(adapter),
                    ..
                } => {
                    *self.context.adapter.write().await = Some(adapter);
                    info!(worker_id = %self.context.worker_id, "Adapter ready");
                    self.context.reply(Message::Ready {
                        worker_id: self.context.worker_id.clone(),
                    })?;
                }
                DispatchEvent::Completed {
                    value: WorkerOutput::Exit,
                    ..
                } => {
                    info!(worker_id = %self.context.worker_id, "Exit requested by master");
                    return Ok(self.report());
                }
                DispatchEvent::Failed {
                    message_type,
                    error,
                } => {
                    if let Err(e) = self.context.reply(Message::Error {
                        worker_id: self.context.worker_id.clone(),
                        message_type: message_type.clone(),
                        error: error.clone(),
                    }) {
                        warn!("Failed to report error to master: {:#}", e);
                    }

                    if message_type == types::INIT {
                        error!(worker_id = %self.context.worker_id, "Initialization failed: {}", error);
                        anyhow::bail!("Worker {} failed to initialize: {}", self.context.worker_id, error);
                    }
                }
                DispatchEvent::Closed => {
                    anyhow::bail!(
                        "Worker {} lost its connection to the master before exit",
                        self.context.worker_id
                    );
                }
            }
        }

        anyhow::bail!("Worker {} event channel closed", self.context.worker_id)
    }

    fn report(&self) -> WorkerReport {
        let stats = self.table.stats();
        WorkerReport {
            worker_id: self.context.worker_id.clone(),
            handled: stats.handled(),
            failed: stats.failed(),
            unknown: stats.unknown(),
        }
    }
}

/// Get node identifier (hostname)
pub fn get_node_id() -> Result<String> {
    if let Ok(hostname) = hostname::get() {
        if let Ok(hostname_str) = hostname.into_string() {
            return Ok(hostname_str);
        }
    }

    Ok("unknown".to_string())
}
