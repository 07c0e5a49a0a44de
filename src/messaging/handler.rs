//! Handler dispatch table
//!
//! A [`HandlerTable`] maps a message type (`data.type`) to one async handler and
//! owns the context every handler receives. Registration happens before the table
//! is attached to a messenger, so duplicate types fail at setup rather than when
//! traffic is flowing.
//!
//! # Results and failures
//!
//! Handlers return `anyhow::Result<Option<R>>`. Called directly,
//! [`HandlerTable::handle`] hands the value back to the caller. Called by a
//! transport through [`Dispatch`], the outcome is published as a
//! [`DispatchEvent`] on the table's event channel:
//!
//! - `Ok(Some(value))` becomes [`DispatchEvent::Completed`]
//! - `Ok(None)` publishes nothing
//! - `Err(e)` becomes [`DispatchEvent::Failed`], is logged and counted, and never
//!   stops the table
//!
//! Unknown types are logged, counted and dropped without an event. When the
//! transport stops delivering, [`DispatchEvent::Closed`] is published after the
//! last handler has finished.
//!
//! # Concurrency
//!
//! Transports dispatch every envelope on its own task, so handlers (including
//! repeated handlers for the same type) can be in flight at the same time. The
//! table gives no mutual exclusion over the context; handlers that share mutable
//! state must synchronize it themselves.

use super::envelope::{Envelope, MessageData};
use super::transport::Dispatch;
use crate::error::{MessagingError, MessagingResult};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Boxed future returned by a type-erased handler
pub type HandlerFuture<R> = BoxFuture<'static, anyhow::Result<Option<R>>>;

/// Type-erased handler: shared context plus the envelope's data
type HandlerFn<C, R> = Arc<dyn Fn(Arc<C>, MessageData) -> HandlerFuture<R> + Send + Sync>;

/// Outcome of a handler invoked through [`Dispatch`]
#[derive(Debug)]
pub enum DispatchEvent<R> {
    /// The handler returned a value for the bootstrap to keep
    Completed { message_type: String, value: R },
    /// The handler failed
    Failed { message_type: String, error: String },
    /// No further envelopes will arrive
    Closed,
}

impl<R> DispatchEvent<R> {
    pub fn message_type(&self) -> Option<&str> {
        match self {
            Self::Completed { message_type, .. } | Self::Failed { message_type, .. } => {
                Some(message_type)
            }
            Self::Closed => None,
        }
    }
}

/// Counters for diagnostics
#[derive(Debug, Default)]
pub struct DispatchStats {
    handled: AtomicU64,
    unknown: AtomicU64,
    failed: AtomicU64,
}

impl DispatchStats {
    /// Envelopes whose handler completed successfully
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    /// Envelopes dropped because no handler matched
    pub fn unknown(&self) -> u64 {
        self.unknown.load(Ordering::Relaxed)
    }

    /// Envelopes whose handler returned an error
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Registry routing a message type to an async handler bound to a shared context
pub struct HandlerTable<C, R = ()> {
    context: Arc<C>,
    handlers: HashMap<String, HandlerFn<C, R>>,
    stats: DispatchStats,
    events_tx: mpsc::UnboundedSender<DispatchEvent<R>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<DispatchEvent<R>>>>,
}

impl<C, R> HandlerTable<C, R>
where
    C: Send + Sync + 'static,
    R: Send + 'static,
{
    /// Create an empty table around `context`
    pub fn new(context: Arc<C>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            context,
            handlers: HashMap::new(),
            stats: DispatchStats::default(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Bind `message_type` to `handler`
    ///
    /// Fails with [`MessagingError::Configuration`] if the type is empty or
    /// already has a handler.
    pub fn register<F, Fut>(&mut self, message_type: impl Into<String>, handler: F) -> MessagingResult<()>
    where
        F: Fn(Arc<C>, MessageData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<R>>> + Send + 'static,
    {
        let message_type = message_type.into();
        if message_type.trim().is_empty() {
            return Err(MessagingError::Configuration(
                "message type must not be empty".to_string(),
            ));
        }
        if self.handlers.contains_key(&message_type) {
            return Err(MessagingError::Configuration(format!(
                "a handler for message type '{}' is already registered",
                message_type
            )));
        }

        debug!(message_type = %message_type, "Registering handler");
        let handler: HandlerFn<C, R> = Arc::new(move |context, data| Box::pin(handler(context, data)));
        self.handlers.insert(message_type, handler);
        Ok(())
    }

    /// Builder-style [`register`](Self::register)
    pub fn with_handler<F, Fut>(mut self, message_type: impl Into<String>, handler: F) -> MessagingResult<Self>
    where
        F: Fn(Arc<C>, MessageData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<R>>> + Send + 'static,
    {
        self.register(message_type, handler)?;
        Ok(self)
    }

    pub fn context(&self) -> &Arc<C> {
        &self.context
    }

    pub fn has_handler(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    /// Registered message types, sorted
    pub fn message_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Take the receiving end of the event channel (once)
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DispatchEvent<R>>> {
        self.events_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Run the handler bound to `envelope.data.type` and return its value
    ///
    /// An unregistered or missing type yields
    /// [`MessagingError::UnknownMessageType`] and invokes nothing.
    pub async fn handle(&self, envelope: Envelope) -> MessagingResult<Option<R>> {
        let found = envelope
            .data
            .message_type()
            .and_then(|message_type| self.handlers.get_key_value(message_type));

        let (message_type, handler) = match found {
            Some((message_type, handler)) => (message_type.clone(), handler.clone()),
            None => {
                let message_type = envelope.data.message_type().unwrap_or_default().to_string();
                self.stats.unknown.fetch_add(1, Ordering::Relaxed);
                warn!(
                    message_type = %message_type,
                    from = %envelope.from,
                    "Dropping message with no registered handler"
                );
                return Err(MessagingError::UnknownMessageType(message_type));
            }
        };

        match handler(self.context.clone(), envelope.data).await {
            Ok(value) => {
                self.stats.handled.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(message_type = %message_type, "Handler failed: {:#}", e);
                Err(MessagingError::Handler {
                    message_type,
                    reason: format!("{:#}", e),
                })
            }
        }
    }
}

#[async_trait]
impl<C, R> Dispatch for HandlerTable<C, R>
where
    C: Send + Sync + 'static,
    R: Send + 'static,
{
    async fn dispatch(&self, envelope: Envelope) {
        let message_type = envelope.data.message_type().unwrap_or_default().to_string();

        let event = match self.handle(envelope).await {
            Ok(Some(value)) => DispatchEvent::Completed { message_type, value },
            Ok(None) | Err(MessagingError::UnknownMessageType(_)) => return,
            Err(e) => DispatchEvent::Failed {
                message_type,
                error: match e {
                    MessagingError::Handler { reason, .. } => reason,
                    other => other.to_string(),
                },
            },
        };

        // Nobody listening is fine: the outcome was already logged
        let _ = self.events_tx.send(event);
    }

    async fn closed(&self) {
        debug!("Inbound delivery ended");
        let _ = self.events_tx.send(DispatchEvent::Closed);
    }
}
