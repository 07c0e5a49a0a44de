//! Messenger facade
//!
//! A [`Messenger`] owns exactly one transport for its whole lifetime and exposes
//! a small, fixed operation set. Which transport sits behind it is decided by the
//! `type` field of its configuration, so swapping transports is a configuration
//! change rather than a code change.
//!
//! # Example
//!
//! ```no_run
//! use benchlink::messaging::{Messenger, MessengerConfig, MessageData, Recipients};
//!
//! # async fn demo() -> benchlink::Result<()> {
//! let messenger = Messenger::new(MessengerConfig::new("process-master"))?;
//! messenger.initialize().await?;
//! messenger.send(Recipients::all(), "register", MessageData::new())?;
//! # Ok(())
//! # }
//! ```

use super::clock::MonotonicClock;
use super::envelope::{Envelope, MessageData, Recipients};
use super::registry::TransportRegistry;
use super::transport::{Dispatch, Role, Transport};
use crate::error::{MessagingError, MessagingResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Messenger configuration
///
/// Handed unchanged to the transport factory, so plugin-specific settings travel
/// in `options`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessengerConfig {
    /// Transport type identifier (built-in name or plugin module path)
    #[serde(rename = "type")]
    pub transport_type: String,
    /// SUT this process drives, informational
    #[serde(default)]
    pub sut: Option<String>,
    /// Fixed sender identity; a random UUID when absent
    #[serde(default)]
    pub identity: Option<String>,
    /// Hub name for the single-process channel transport
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Listen (master) or connect (worker) address for the network transport
    #[serde(default = "default_address")]
    pub address: String,
    /// Free-form settings for plugin transports
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

pub fn default_channel() -> String {
    "benchlink".to_string()
}

pub fn default_address() -> String {
    "127.0.0.1:7878".to_string()
}

impl MessengerConfig {
    pub fn new(transport_type: impl Into<String>) -> Self {
        Self {
            transport_type: transport_type.into(),
            sut: None,
            identity: None,
            channel: default_channel(),
            address: default_address(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_sut(mut self, sut: impl Into<String>) -> Self {
        self.sut = Some(sut.into());
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Configured identity or a fresh UUID
    pub fn identity_or_random(&self) -> String {
        self.identity
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

const CONSTRUCTED: u8 = 0;
const INITIALIZING: u8 = 1;
const INITIALIZED: u8 = 2;
const CONFIGURING: u8 = 3;
const CONFIGURED: u8 = 4;
const SHUT_DOWN: u8 = 5;

/// Process-local facade over one transport plugin
pub struct Messenger {
    config: MessengerConfig,
    transport: Box<dyn Transport>,
    clock: MonotonicClock,
    /// Held from stamping to transport handoff so acceptance order matches timestamp order
    send_order: Mutex<()>,
    state: AtomicU8,
}

impl Messenger {
    /// Create a messenger backed by one of the built-in transports
    pub fn new(config: MessengerConfig) -> MessagingResult<Self> {
        Self::with_registry(config, &TransportRegistry::with_builtins())
    }

    /// Create a messenger, resolving the transport type against `registry`
    ///
    /// Fails with [`MessagingError::Configuration`] when the type cannot be
    /// resolved or the plugin module lacks its factory. The returned transport is
    /// not validated further; a broken plugin shows up on first use.
    pub fn with_registry(config: MessengerConfig, registry: &TransportRegistry) -> MessagingResult<Self> {
        match config.sut {
            Some(ref sut) => info!(
                "Creating messenger of type \"{}\" for SUT {}",
                config.transport_type, sut
            ),
            None => info!("Creating messenger of type \"{}\"", config.transport_type),
        }

        let transport = registry.create(&config)?;

        Ok(Self {
            config,
            transport,
            clock: MonotonicClock::new(),
            send_order: Mutex::new(()),
            state: AtomicU8::new(CONSTRUCTED),
        })
    }

    /// Establish the underlying connection or channel
    ///
    /// Must complete before `configure` or `send`. A failed attempt leaves the
    /// messenger uninitialized.
    pub async fn initialize(&self) -> MessagingResult<()> {
        if self
            .state
            .compare_exchange(CONSTRUCTED, INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(MessagingError::Transport(format!(
                "messenger \"{}\" is already initialized",
                self.config.transport_type
            )));
        }

        match self.transport.initialize().await {
            Ok(()) => {
                self.state.store(INITIALIZED, Ordering::Release);
                debug!(
                    transport = %self.config.transport_type,
                    identity = %self.identity(),
                    "Messenger initialized"
                );
                Ok(())
            }
            Err(e) => {
                self.state.store(CONSTRUCTED, Ordering::Release);
                Err(into_transport_error(e))
            }
        }
    }

    /// Bind a dispatch target; inbound envelopes flow to it from now on
    ///
    /// Allowed exactly once, after `initialize`.
    pub async fn configure(&self, dispatcher: Arc<dyn Dispatch>) -> MessagingResult<()> {
        if let Err(current) = self.state.compare_exchange(
            INITIALIZED,
            CONFIGURING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(match current {
                CONFIGURING | CONFIGURED => MessagingError::Configuration(format!(
                    "messenger \"{}\" is already configured",
                    self.config.transport_type
                )),
                _ => MessagingError::Transport(format!(
                    "messenger \"{}\" must be initialized before configure",
                    self.config.transport_type
                )),
            });
        }

        match self.transport.configure(dispatcher).await {
            Ok(()) => {
                self.state.store(CONFIGURED, Ordering::Release);
                debug!(transport = %self.config.transport_type, "Messenger configured");
                Ok(())
            }
            Err(e) => {
                self.state.store(INITIALIZED, Ordering::Release);
                Err(into_transport_error(e))
            }
        }
    }

    /// Stable sender identity used as `from` on every outbound envelope
    pub fn identity(&self) -> &str {
        self.transport.identity()
    }

    /// Stamp and hand an envelope to the transport
    ///
    /// Sets `data.type = message_type`, the sender identity and the current
    /// timestamp. Returns once the transport has accepted the envelope; there is
    /// no acknowledgment or reply correlation.
    pub fn send(&self, to: Recipients, message_type: &str, mut data: MessageData) -> MessagingResult<()> {
        match self.state.load(Ordering::Acquire) {
            CONSTRUCTED | INITIALIZING => {
                return Err(MessagingError::Transport(format!(
                    "messenger \"{}\" must be initialized before send",
                    self.config.transport_type
                )))
            }
            SHUT_DOWN => {
                return Err(MessagingError::Transport(format!(
                    "messenger \"{}\" is shut down",
                    self.config.transport_type
                )))
            }
            _ => {}
        }

        data.stamp_type(message_type);

        let _order = self
            .send_order
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let envelope = Envelope {
            to,
            from: self.transport.identity().to_string(),
            timestamp: self.clock.now(),
            data,
        };

        self.transport.send(envelope)
    }

    /// Flush queued envelopes and detach from the peers
    ///
    /// Later sends fail. Calling it again is a no-op.
    pub async fn shutdown(&self) -> MessagingResult<()> {
        let previous = self.state.swap(SHUT_DOWN, Ordering::AcqRel);
        if previous == SHUT_DOWN || previous == CONSTRUCTED {
            return Ok(());
        }

        // Envelopes stamped before the swap are already with the transport
        drop(self.send_order.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));

        self.transport.shutdown().await.map_err(into_transport_error)?;
        debug!(transport = %self.config.transport_type, "Messenger shut down");
        Ok(())
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.config
    }

    pub fn transport_type(&self) -> &str {
        &self.config.transport_type
    }

    /// Role encoded in the transport type, if it carries a qualifier
    pub fn role(&self) -> Option<Role> {
        Role::split(&self.config.transport_type).map(|(_, role)| role)
    }

    pub fn is_configured(&self) -> bool {
        self.state.load(Ordering::Acquire) == CONFIGURED
    }
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("type", &self.config.transport_type)
            .field("identity", &self.identity())
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}

fn into_transport_error(err: MessagingError) -> MessagingError {
    match err {
        MessagingError::Transport(_) => err,
        other => MessagingError::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::registry::PluginModule;
    use async_trait::async_trait;

    /// Transport that records every envelope handed to it
    #[derive(Clone, Default)]
    struct RecordingTransport {
        identity: String,
        sent: Arc<Mutex<Vec<Envelope>>>,
        fail_initialize: bool,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn initialize(&self) -> MessagingResult<()> {
            if self.fail_initialize {
                return Err(MessagingError::Transport("connection refused".to_string()));
            }
            Ok(())
        }

        async fn configure(&self, _dispatcher: Arc<dyn Dispatch>) -> MessagingResult<()> {
            Ok(())
        }

        fn send(&self, envelope: Envelope) -> MessagingResult<()> {
            self.sent.lock().unwrap().push(envelope);
            Ok(())
        }

        fn identity(&self) -> &str {
            &self.identity
        }
    }

    struct NoopDispatch;

    #[async_trait]
    impl Dispatch for NoopDispatch {
        async fn dispatch(&self, _envelope: Envelope) {}
    }

    fn recording_messenger(fail_initialize: bool) -> (Messenger, Arc<Mutex<Vec<Envelope>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = RecordingTransport {
            identity: "rec-1".to_string(),
            sent: sent.clone(),
            fail_initialize,
        };

        let mut registry = TransportRegistry::with_builtins();
        registry
            .register_module(PluginModule::new("test/recording").with_factory(move |_config| {
                Ok(Box::new(transport.clone()) as Box<dyn Transport>)
            }))
            .unwrap();

        let messenger =
            Messenger::with_registry(MessengerConfig::new("test/recording"), &registry).unwrap();
        (messenger, sent)
    }

    #[tokio::test]
    async fn test_send_stamps_type_identity_and_timestamp() {
        let (messenger, sent) = recording_messenger(false);
        messenger.initialize().await.unwrap();

        let before = chrono::Utc::now();
        let data = MessageData::new().with("type", "caller-value").with("round", 2);
        messenger.send(Recipients::to(["w1"]), "prepare", data).unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let envelope = &sent[0];
        assert_eq!(envelope.data.message_type(), Some("prepare"));
        assert_eq!(envelope.data.get("round"), Some(&serde_json::json!(2)));
        assert_eq!(envelope.from, messenger.identity());
        assert_eq!(envelope.to, Recipients::to(["w1"]));
        assert!(envelope.timestamp >= before);
    }

    #[tokio::test]
    async fn test_concurrent_sends_never_decrease() {
        let (messenger, sent) = recording_messenger(false);
        messenger.initialize().await.unwrap();
        let messenger = Arc::new(messenger);

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let messenger = messenger.clone();
                tokio::spawn(async move {
                    for j in 0..50 {
                        let data = MessageData::new().with("seq", i * 100 + j);
                        messenger.send(Recipients::all(), "txUpdate", data).unwrap();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 400);
        // Recording order is transport acceptance order
        assert!(sent.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_identity_is_stable() {
        let (messenger, _) = recording_messenger(false);
        let first = messenger.identity().to_string();
        messenger.initialize().await.unwrap();
        assert!(!first.is_empty());
        assert_eq!(messenger.identity(), first);
    }

    #[tokio::test]
    async fn test_lifecycle_order_is_enforced() {
        let (messenger, _) = recording_messenger(false);

        assert!(matches!(
            messenger.send(Recipients::all(), "register", MessageData::new()),
            Err(MessagingError::Transport(_))
        ));
        assert!(matches!(
            messenger.configure(Arc::new(NoopDispatch)).await,
            Err(MessagingError::Transport(_))
        ));

        messenger.initialize().await.unwrap();
        assert!(matches!(
            messenger.initialize().await,
            Err(MessagingError::Transport(_))
        ));

        messenger.configure(Arc::new(NoopDispatch)).await.unwrap();
        assert!(messenger.is_configured());
        assert!(matches!(
            messenger.configure(Arc::new(NoopDispatch)).await,
            Err(MessagingError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails() {
        let (messenger, sent) = recording_messenger(false);
        messenger.initialize().await.unwrap();
        messenger.send(Recipients::all(), "exit", MessageData::new()).unwrap();

        messenger.shutdown().await.unwrap();
        messenger.shutdown().await.unwrap();

        assert!(matches!(
            messenger.send(Recipients::all(), "exit", MessageData::new()),
            Err(MessagingError::Transport(_))
        ));
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_initialize_failure_is_transport_error() {
        let (messenger, _) = recording_messenger(true);
        assert!(matches!(
            messenger.initialize().await,
            Err(MessagingError::Transport(_))
        ));
        assert!(!messenger.is_configured());
    }

    #[test]
    fn test_unknown_type_fails_construction() {
        match Messenger::new(MessengerConfig::new("no-such-transport")) {
            Err(MessagingError::Configuration(msg)) => assert!(msg.contains("no-such-transport")),
            Err(other) => panic!("Wrong error: {}", other),
            Ok(_) => panic!("Construction should fail"),
        }
    }

    #[test]
    fn test_plugin_without_factory_fails_construction() {
        let mut registry = TransportRegistry::with_builtins();
        registry
            .register_module(PluginModule::new("./plugins/no-factory"))
            .unwrap();

        match Messenger::with_registry(MessengerConfig::new("./plugins/no-factory"), &registry) {
            Err(MessagingError::Configuration(msg)) => {
                assert!(msg.contains("mandatory factory function"));
            }
            Err(other) => panic!("Wrong error: {}", other),
            Ok(_) => panic!("Construction should fail"),
        }
    }

    #[test]
    fn test_builtin_messengers_are_distinct() {
        let a = Messenger::new(MessengerConfig::new("process-worker")).unwrap();
        let b = Messenger::new(MessengerConfig::new("process-worker")).unwrap();
        assert!(!a.identity().is_empty());
        assert_ne!(a.identity(), b.identity());
        assert_eq!(a.role(), Some(Role::Worker));
    }

    #[test]
    fn test_config_from_toml() {
        let config: MessengerConfig = toml::from_str(
            r#"
type = "tcp-worker"
sut = "mock"
address = "10.0.1.10:7878"
"#,
        )
        .unwrap();
        assert_eq!(config.transport_type, "tcp-worker");
        assert_eq!(config.sut.as_deref(), Some("mock"));
        assert_eq!(config.channel, "benchlink");
        assert!(config.identity.is_none());
    }
}
