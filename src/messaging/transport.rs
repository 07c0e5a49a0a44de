//! Transport plugin contract
//!
//! A transport moves [`Envelope`]s between one master and its workers. The
//! [`Messenger`](super::Messenger) only ever calls the four operations of the
//! [`Transport`] trait; everything else (sockets, channels, brokers) stays inside
//! the plugin.
//!
//! # Lifecycle
//!
//! 1. Constructed by a factory from the messenger configuration
//! 2. `initialize()` establishes the connection or channel
//! 3. `configure()` wires in a [`Dispatch`] target and starts inbound delivery
//! 4. `send()` until the process is done with it
//! 5. `shutdown()` flushes queued envelopes and detaches from the peers

use super::envelope::Envelope;
use crate::error::MessagingResult;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, trace};

/// Which side of a transport a process sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Master,
    Worker,
}

impl Role {
    pub fn suffix(self) -> &'static str {
        match self {
            Role::Master => "-master",
            Role::Worker => "-worker",
        }
    }

    /// Role-qualified transport type identifier, e.g. `tcp` -> `tcp-worker`
    pub fn qualify(self, base: &str) -> String {
        format!("{}{}", base, self.suffix())
    }

    /// Split a qualified identifier into its base name and role
    pub fn split(type_id: &str) -> Option<(&str, Role)> {
        [Role::Master, Role::Worker].into_iter().find_map(|role| {
            type_id
                .strip_suffix(role.suffix())
                .filter(|base| !base.is_empty())
                .map(|base| (base, role))
        })
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Worker => write!(f, "worker"),
        }
    }
}

/// Target of inbound delivery
///
/// Implemented by [`HandlerTable`](super::HandlerTable). Transports call
/// `dispatch` once per inbound envelope addressed to this process; failures are
/// the implementor's to record, so there is nothing to return.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, envelope: Envelope);

    /// Inbound delivery has ended; every earlier `dispatch` call has returned
    async fn closed(&self) {}
}

/// Transport plugin
///
/// Implementations use interior mutability: the messenger holds the plugin
/// behind a shared reference for the whole process lifetime.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection or channel. Called once.
    async fn initialize(&self) -> MessagingResult<()>;

    /// Start delivering inbound envelopes to `dispatcher`
    async fn configure(&self, dispatcher: Arc<dyn Dispatch>) -> MessagingResult<()>;

    /// Best-effort delivery to the envelope's recipients; never waits for peers
    fn send(&self, envelope: Envelope) -> MessagingResult<()>;

    /// Sender identity, stable for the process lifetime
    fn identity(&self) -> &str;

    /// Deliver what is already queued, then detach from the peers
    async fn shutdown(&self) -> MessagingResult<()> {
        Ok(())
    }
}

/// Drain `inbox` into `dispatcher`, one task per envelope
///
/// Handlers for different envelopes run concurrently. Once every sender side of
/// the inbox is gone the loop waits for in-flight handlers, then calls
/// [`Dispatch::closed`].
pub(crate) fn spawn_dispatch_loop(
    identity: String,
    mut inbox: mpsc::UnboundedReceiver<Envelope>,
    dispatcher: Arc<dyn Dispatch>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                received = inbox.recv() => match received {
                    Some(envelope) => {
                        trace!(
                            identity = %identity,
                            from = %envelope.from,
                            message_type = envelope.message_type().unwrap_or("<none>"),
                            "Inbound envelope"
                        );
                        let dispatcher = dispatcher.clone();
                        in_flight.spawn(async move {
                            dispatcher.dispatch(envelope).await;
                        });
                    }
                    None => break,
                },
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }

        while in_flight.join_next().await.is_some() {}
        debug!(identity = %identity, "Inbound channel closed");
        dispatcher.closed().await;
    })
}
