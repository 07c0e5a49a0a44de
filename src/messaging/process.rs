//! Single-process channel transport (`process-master`, `process-worker`)
//!
//! Master and workers live in the same OS process and meet on a named
//! [`ChannelHub`]. Each endpoint owns an unbounded tokio channel; the hub only
//! routes:
//!
//! - master -> every attached worker whose identity matches `to`
//! - worker -> the master
//!
//! Endpoints attach during `initialize`, so envelopes sent to a worker that has
//! not been configured yet wait in its channel instead of being lost. They
//! detach on `shutdown` or when dropped; a hub with no endpoints left is
//! forgotten, so a channel name can be reused by a later run.

use super::envelope::Envelope;
use super::messenger::MessengerConfig;
use super::transport::{spawn_dispatch_loop, Dispatch, Role, Transport};
use crate::error::{MessagingError, MessagingResult};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

type Inbox = mpsc::UnboundedSender<Envelope>;

/// Hubs by channel name, shared by every process transport in this process
///
/// Attach and detach hold this lock, then the hub's own; routing takes only the
/// hub lock.
static HUBS: Lazy<Mutex<HashMap<String, ChannelHub>>> = Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Default)]
struct HubState {
    master: Option<(String, Inbox)>,
    workers: HashMap<String, Inbox>,
}

impl HubState {
    fn is_empty(&self) -> bool {
        self.master.is_none() && self.workers.is_empty()
    }
}

/// Meeting point for one master and its workers
#[derive(Clone, Default)]
pub struct ChannelHub {
    state: Arc<Mutex<HubState>>,
}

impl ChannelHub {
    /// Hub currently registered under `name`
    pub fn lookup(name: &str) -> Option<Self> {
        lock(&*HUBS).get(name).cloned()
    }

    /// Attach an endpoint to the hub named `name`, creating the hub if needed
    fn attach(name: &str, role: Role, identity: &str, inbox: Inbox) -> MessagingResult<Self> {
        let mut hubs = lock(&*HUBS);
        let hub = hubs.entry(name.to_string()).or_default().clone();

        let mut state = lock(&hub.state);
        match role {
            Role::Master => {
                if let Some((existing, tx)) = &state.master {
                    if !tx.is_closed() {
                        return Err(MessagingError::Transport(format!(
                            "channel already has a master ({})",
                            existing
                        )));
                    }
                }
                state.master = Some((identity.to_string(), inbox));
            }
            Role::Worker => {
                if let Some(tx) = state.workers.get(identity) {
                    if !tx.is_closed() {
                        return Err(MessagingError::Transport(format!(
                            "worker identity '{}' is already attached to this channel",
                            identity
                        )));
                    }
                }
                state.workers.insert(identity.to_string(), inbox);
            }
        }
        drop(state);

        Ok(hub)
    }

    /// Remove the endpoint that attached with `inbox`
    ///
    /// A newer endpoint that reused the identity is left alone.
    fn detach(&self, name: &str, role: Role, identity: &str, inbox: &Inbox) {
        let mut hubs = lock(&*HUBS);

        let empty = {
            let mut state = lock(&self.state);
            match role {
                Role::Master => {
                    if matches!(&state.master, Some((_, tx)) if tx.same_channel(inbox)) {
                        state.master = None;
                    }
                }
                Role::Worker => {
                    if matches!(state.workers.get(identity), Some(tx) if tx.same_channel(inbox)) {
                        state.workers.remove(identity);
                    }
                }
            }
            state.is_empty()
        };

        let registered = hubs
            .get(name)
            .map_or(false, |hub| Arc::ptr_eq(&hub.state, &self.state));
        if empty && registered {
            hubs.remove(name);
        }
    }

    /// Route an envelope from an endpoint with `role`; returns deliveries made
    fn route(&self, role: Role, envelope: Envelope) -> usize {
        let mut state = lock(&self.state);
        match role {
            Role::Master => {
                state.workers.retain(|_, tx| !tx.is_closed());
                let mut delivered = 0;
                for (identity, tx) in state.workers.iter() {
                    if envelope.is_addressed_to(identity) && tx.send(envelope.clone()).is_ok() {
                        delivered += 1;
                    }
                }
                delivered
            }
            Role::Worker => match &state.master {
                Some((_, tx)) => usize::from(tx.send(envelope).is_ok()),
                None => 0,
            },
        }
    }

    /// Identities of attached workers, sorted
    pub fn worker_identities(&self) -> Vec<String> {
        let state = lock(&self.state);
        let mut ids: Vec<String> = state
            .workers
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn has_master(&self) -> bool {
        lock(&self.state).master.is_some()
    }
}

/// Hub membership held by an initialized endpoint
struct Attachment {
    hub: ChannelHub,
    inbox: Inbox,
}

/// Channel transport endpoint
pub struct ProcessTransport {
    role: Role,
    identity: String,
    channel: String,
    attachment: Mutex<Option<Attachment>>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
}

impl ProcessTransport {
    pub fn new(role: Role, config: &MessengerConfig) -> Self {
        Self {
            role,
            identity: config.identity_or_random(),
            channel: config.channel.clone(),
            attachment: Mutex::new(None),
            inbox: Mutex::new(None),
        }
    }

    /// Hub this endpoint is attached to
    pub fn hub(&self) -> Option<ChannelHub> {
        lock(&self.attachment).as_ref().map(|a| a.hub.clone())
    }

    fn detach(&self) {
        if let Some(attachment) = lock(&self.attachment).take() {
            attachment
                .hub
                .detach(&self.channel, self.role, &self.identity, &attachment.inbox);
            debug!(
                channel = %self.channel,
                role = %self.role,
                identity = %self.identity,
                "Detached from channel hub"
            );
        }
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn initialize(&self) -> MessagingResult<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = ChannelHub::attach(&self.channel, self.role, &self.identity, tx.clone())?;
        *lock(&self.attachment) = Some(Attachment { hub, inbox: tx });
        *lock(&self.inbox) = Some(rx);
        debug!(
            channel = %self.channel,
            role = %self.role,
            identity = %self.identity,
            "Attached to channel hub"
        );
        Ok(())
    }

    async fn configure(&self, dispatcher: Arc<dyn Dispatch>) -> MessagingResult<()> {
        let inbox = lock(&self.inbox).take().ok_or_else(|| {
            MessagingError::Transport(format!(
                "process transport '{}' is not initialized or already configured",
                self.identity
            ))
        })?;
        spawn_dispatch_loop(self.identity.clone(), inbox, dispatcher);
        Ok(())
    }

    fn send(&self, envelope: Envelope) -> MessagingResult<()> {
        let hub = self.hub().ok_or_else(|| {
            MessagingError::Transport(format!(
                "process transport '{}' is not attached to a channel",
                self.identity
            ))
        })?;

        let message_type = envelope.message_type().unwrap_or_default().to_string();
        let delivered = hub.route(self.role, envelope);
        if delivered == 0 {
            debug!(
                channel = %self.channel,
                message_type = %message_type,
                "No reachable recipient, envelope dropped"
            );
        }
        Ok(())
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    async fn shutdown(&self) -> MessagingResult<()> {
        // Channel sends are synchronous, so nothing is left to flush
        self.detach();
        Ok(())
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        self.detach();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
