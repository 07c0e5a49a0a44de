//! Network transport (`tcp-master`, `tcp-worker`)
//!
//! The master listens on `MessengerConfig::address`; workers connect to it.
//! Every connection opens with a `Hello` frame from the worker carrying its
//! identity and protocol version, after which both directions carry envelope
//! frames (see [`codec`](super::codec)).
//!
//! ```text
//! Master                          Worker
//!   |                               |
//!   |<------ HELLO(identity) -------|   (initialize)
//!   |                               |
//!   |------- ENVELOPE ------------->|
//!   |<------ ENVELOPE --------------|
//! ```
//!
//! Each peer has a dedicated writer task fed by an unbounded channel, so `send`
//! never waits on a socket. A peer whose writer fails is forgotten; envelopes
//! addressed to it are dropped.
//!
//! `shutdown` closes every outbox and waits (up to [`FLUSH_TIMEOUT`]) for the
//! writers to drain and close their sockets. The master also waits for workers
//! to close their end, so nothing it sent is cut off by a reset. A worker whose
//! master goes away sees its inbound delivery end.

use super::codec::{read_frame, write_frame, PROTOCOL_VERSION};
use super::envelope::Envelope;
use super::messenger::MessengerConfig;
use super::transport::{spawn_dispatch_loop, Dispatch, Role, Transport};
use crate::error::{MessagingError, MessagingResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a freshly accepted worker has to introduce itself
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `shutdown` waits for queued frames to reach the sockets
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Unit on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Frame {
    /// First frame from a worker
    Hello { identity: String, protocol_version: u32 },
    Envelope(Envelope),
}

type Outbox = mpsc::UnboundedSender<Frame>;
type Tasks = Arc<Mutex<Vec<JoinHandle<()>>>>;

#[derive(Default)]
struct Peers {
    master: Option<Outbox>,
    workers: HashMap<String, Outbox>,
}

/// TCP transport endpoint
pub struct TcpTransport {
    role: Role,
    identity: String,
    address: String,
    local_addr: Mutex<Option<SocketAddr>>,
    peers: Arc<Mutex<Peers>>,
    writers: Tasks,
    /// Per-worker connection tasks (master only)
    connections: Tasks,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    /// Handed to the accept loop (master) or the read loop (worker) on initialize
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
}

impl TcpTransport {
    pub fn new(role: Role, config: &MessengerConfig) -> MessagingResult<Self> {
        let address = config.address.trim();
        if address.is_empty() {
            return Err(MessagingError::Configuration(
                "tcp transport requires an address".to_string(),
            ));
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        Ok(Self {
            role,
            identity: config.identity_or_random(),
            address: address.to_string(),
            local_addr: Mutex::new(None),
            peers: Arc::new(Mutex::new(Peers::default())),
            writers: Arc::new(Mutex::new(Vec::new())),
            connections: Arc::new(Mutex::new(Vec::new())),
            acceptor: Mutex::new(None),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx: Mutex::new(Some(inbound_rx)),
        })
    }

    /// Address the master is listening on, once initialized
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    /// Identities of workers that completed the hello exchange, sorted
    pub fn worker_identities(&self) -> Vec<String> {
        let peers = lock(&self.peers);
        let mut ids: Vec<String> = peers
            .workers
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    async fn listen(&self) -> MessagingResult<()> {
        let listener = TcpListener::bind(&self.address).await.map_err(|e| {
            MessagingError::Transport(format!("failed to bind {}: {}", self.address, e))
        })?;
        let local = listener
            .local_addr()
            .map_err(|e| MessagingError::Transport(format!("failed to read local address: {}", e)))?;

        let inbound = self.take_inbound()?;
        *lock(&self.local_addr) = Some(local);
        info!("Master listening on {}", local);

        let acceptor = tokio::spawn(accept_loop(
            listener,
            self.peers.clone(),
            self.writers.clone(),
            self.connections.clone(),
            inbound,
        ));
        *lock(&self.acceptor) = Some(acceptor);
        Ok(())
    }

    async fn connect(&self) -> MessagingResult<()> {
        let stream = TcpStream::connect(&self.address).await.map_err(|e| {
            MessagingError::Transport(format!("failed to connect to {}: {}", self.address, e))
        })?;
        let _ = stream.set_nodelay(true);

        let (reader, mut writer) = stream.into_split();

        let hello = Frame::Hello {
            identity: self.identity.clone(),
            protocol_version: PROTOCOL_VERSION,
        };
        write_frame(&mut writer, &hello)
            .await
            .map_err(|e| MessagingError::Transport(format!("failed to send hello: {:#}", e)))?;

        let inbound = self.take_inbound()?;
        let outbox = spawn_writer("master".to_string(), writer, &self.writers);
        lock(&self.peers).master = Some(outbox);

        info!("Connected to master at {}", self.address);

        // Owns the only inbound sender, so delivery ends with the connection
        tokio::spawn(read_loop(
            "master".to_string(),
            reader,
            inbound,
            self.peers.clone(),
            Role::Master,
        ));
        Ok(())
    }

    fn take_inbound(&self) -> MessagingResult<mpsc::UnboundedSender<Envelope>> {
        lock(&self.inbound_tx).take().ok_or_else(|| {
            MessagingError::Transport(format!(
                "tcp transport '{}' is already initialized",
                self.identity
            ))
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn initialize(&self) -> MessagingResult<()> {
        match self.role {
            Role::Master => self.listen().await,
            Role::Worker => self.connect().await,
        }
    }

    async fn configure(&self, dispatcher: Arc<dyn Dispatch>) -> MessagingResult<()> {
        let inbox = lock(&self.inbound_rx).take().ok_or_else(|| {
            MessagingError::Transport(format!(
                "tcp transport '{}' is already configured",
                self.identity
            ))
        })?;
        spawn_dispatch_loop(self.identity.clone(), inbox, dispatcher);
        Ok(())
    }

    fn send(&self, envelope: Envelope) -> MessagingResult<()> {
        let mut peers = lock(&self.peers);

        let delivered = match self.role {
            Role::Master => {
                peers.workers.retain(|_, tx| !tx.is_closed());
                let mut delivered = 0;
                for (identity, tx) in peers.workers.iter() {
                    if envelope.is_addressed_to(identity)
                        && tx.send(Frame::Envelope(envelope.clone())).is_ok()
                    {
                        delivered += 1;
                    }
                }
                delivered
            }
            Role::Worker => match &peers.master {
                Some(tx) => {
                    if tx.send(Frame::Envelope(envelope.clone())).is_err() {
                        return Err(MessagingError::Transport(
                            "connection to master is closed".to_string(),
                        ));
                    }
                    1
                }
                None => {
                    return Err(MessagingError::Transport(
                        "not connected to a master".to_string(),
                    ))
                }
            },
        };

        if delivered == 0 {
            debug!(
                message_type = envelope.message_type().unwrap_or_default(),
                "No connected recipient, envelope dropped"
            );
        }
        Ok(())
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    async fn shutdown(&self) -> MessagingResult<()> {
        if let Some(acceptor) = lock(&self.acceptor).take() {
            acceptor.abort();
        }

        // Dropping the outboxes lets each writer drain and close its socket
        {
            let mut peers = lock(&self.peers);
            peers.master = None;
            peers.workers.clear();
        }

        let writers: Vec<JoinHandle<()>> = lock(&self.writers).drain(..).collect();
        let connections: Vec<JoinHandle<()>> = lock(&self.connections).drain(..).collect();
        let pending = writers.len();
        let closed = tokio::time::timeout(FLUSH_TIMEOUT, async {
            futures::future::join_all(writers).await;
            futures::future::join_all(connections).await;
        })
        .await;
        if closed.is_err() {
            warn!(
                identity = %self.identity,
                "Gave up closing {} connection(s) after {:?}",
                pending,
                FLUSH_TIMEOUT
            );
        }

        info!(identity = %self.identity, role = %self.role, "Transport shut down");
        Ok(())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(acceptor) = lock(&self.acceptor).take() {
            acceptor.abort();
        }
        let mut peers = lock(&self.peers);
        peers.master = None;
        peers.workers.clear();
    }
}

async fn accept_loop(
    listener: TcpListener,
    peers: Arc<Mutex<Peers>>,
    writers: Tasks,
    connections: Tasks,
    inbound: mpsc::UnboundedSender<Envelope>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("Connection from {}", addr);
                let connection = tokio::spawn(handle_worker(
                    stream,
                    addr,
                    peers.clone(),
                    writers.clone(),
                    inbound.clone(),
                ));
                track(&connections, connection);
            }
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_worker(
    stream: TcpStream,
    addr: SocketAddr,
    peers: Arc<Mutex<Peers>>,
    writers: Tasks,
    inbound: mpsc::UnboundedSender<Envelope>,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = stream.into_split();

    let hello = match tokio::time::timeout(HELLO_TIMEOUT, read_frame::<_, Frame>(&mut reader)).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(e)) => {
            warn!("Dropping {}: failed to read hello: {:#}", addr, e);
            return;
        }
        Err(_) => {
            warn!("Dropping {}: no hello within {:?}", addr, HELLO_TIMEOUT);
            return;
        }
    };

    let identity = match hello {
        Frame::Hello {
            identity,
            protocol_version,
        } if protocol_version == PROTOCOL_VERSION => identity,
        Frame::Hello {
            identity,
            protocol_version,
        } => {
            warn!(
                "Dropping worker {} at {}: protocol version mismatch (master={}, worker={})",
                identity, addr, PROTOCOL_VERSION, protocol_version
            );
            return;
        }
        Frame::Envelope(_) => {
            warn!("Dropping {}: expected hello, got an envelope", addr);
            return;
        }
    };

    {
        let mut peers = lock(&peers);
        if let Some(existing) = peers.workers.get(&identity) {
            if !existing.is_closed() {
                warn!("Dropping {}: worker identity '{}' is already connected", addr, identity);
                return;
            }
        }
        let outbox = spawn_writer(identity.clone(), writer, &writers);
        peers.workers.insert(identity.clone(), outbox);
    }

    info!("Worker {} connected from {}", identity, addr);

    read_loop(identity, reader, inbound, peers, Role::Worker).await;
}

/// Forward envelope frames from `peer` until the connection ends
async fn read_loop(
    peer: String,
    mut reader: OwnedReadHalf,
    inbound: mpsc::UnboundedSender<Envelope>,
    peers: Arc<Mutex<Peers>>,
    peer_role: Role,
) {
    loop {
        match read_frame::<_, Frame>(&mut reader).await {
            Ok(Frame::Envelope(envelope)) => {
                if inbound.send(envelope).is_err() {
                    break;
                }
            }
            Ok(Frame::Hello { .. }) => {
                warn!("Ignoring repeated hello from {}", peer);
            }
            Err(e) => {
                debug!("Connection to {} closed: {:#}", peer, e);
                break;
            }
        }
    }

    let mut peers = lock(&peers);
    match peer_role {
        Role::Master => peers.master = None,
        Role::Worker => {
            peers.workers.remove(&peer);
        }
    }
    info!(peer = %peer, role = %peer_role, "Peer disconnected");
}

/// Start the writer task for `peer`; it closes the socket once the outbox is dropped
fn spawn_writer(peer: String, mut writer: OwnedWriteHalf, writers: &Tasks) -> Outbox {
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                warn!("Failed to write to {}: {:#}", peer, e);
                return;
            }
        }
        if let Err(e) = writer.shutdown().await {
            debug!("Failed to close connection to {}: {}", peer, e);
        }
    });

    track(writers, handle);
    tx
}

fn track(tasks: &Tasks, handle: JoinHandle<()>) {
    let mut tasks = lock(tasks);
    tasks.retain(|task| !task.is_finished());
    tasks.push(handle);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::envelope::{MessageData, Recipients};

    struct Collector {
        tx: mpsc::UnboundedSender<Envelope>,
    }

    #[async_trait]
    impl Dispatch for Collector {
        async fn dispatch(&self, envelope: Envelope) {
            let _ = self.tx.send(envelope);
        }
    }

    fn envelope(to: Recipients, from: &str, message_type: &str) -> Envelope {
        let mut data = MessageData::new();
        data.stamp_type(message_type);
        Envelope {
            to,
            from: from.to_string(),
            timestamp: chrono::Utc::now(),
            data,
        }
    }

    async fn master() -> (TcpTransport, mpsc::UnboundedReceiver<Envelope>) {
        let config = MessengerConfig::new("tcp-master")
            .with_identity("m")
            .with_address("127.0.0.1:0");
        let transport = TcpTransport::new(Role::Master, &config).unwrap();
        transport.initialize().await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        transport.configure(Arc::new(Collector { tx })).await.unwrap();
        (transport, rx)
    }

    async fn worker(addr: SocketAddr, identity: &str) -> (TcpTransport, mpsc::UnboundedReceiver<Envelope>) {
        let config = MessengerConfig::new("tcp-worker")
            .with_identity(identity)
            .with_address(addr.to_string());
        let transport = TcpTransport::new(Role::Worker, &config).unwrap();
        transport.initialize().await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        transport.configure(Arc::new(Collector { tx })).await.unwrap();
        (transport, rx)
    }

    async fn wait_for_workers(master: &TcpTransport, count: usize) {
        for _ in 0..200 {
            if master.worker_identities().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workers did not connect: {:?}", master.worker_identities());
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for envelope")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_envelopes_cross_the_socket_both_ways() {
        let (master, mut master_rx) = master().await;
        let addr = master.local_addr().unwrap();
        let (w1, mut w1_rx) = worker(addr, "w1").await;
        let (_w2, mut w2_rx) = worker(addr, "w2").await;
        wait_for_workers(&master, 2).await;

        master
            .send(envelope(Recipients::to(["w1"]), "m", "init"))
            .unwrap();
        let received = recv(&mut w1_rx).await;
        assert_eq!(received.message_type(), Some("init"));
        assert_eq!(received.from, "m");

        master.send(envelope(Recipients::all(), "m", "exit")).unwrap();
        assert_eq!(recv(&mut w2_rx).await.message_type(), Some("exit"));
        assert_eq!(recv(&mut w1_rx).await.message_type(), Some("exit"));

        w1.send(envelope(Recipients::to(["m"]), "w1", "ready")).unwrap();
        let upstream = recv(&mut master_rx).await;
        assert_eq!(upstream.from, "w1");
        assert_eq!(upstream.message_type(), Some("ready"));
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        // Bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = MessengerConfig::new("tcp-worker").with_address(addr.to_string());
        let transport = TcpTransport::new(Role::Worker, &config).unwrap();
        assert!(matches!(
            transport.initialize().await,
            Err(MessagingError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_version_mismatch_is_dropped() {
        let (master, _rx) = master().await;
        let addr = master.local_addr().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let hello = Frame::Hello {
            identity: "stale".to_string(),
            protocol_version: PROTOCOL_VERSION + 1,
        };
        write_frame(&mut stream, &hello).await.unwrap();
        stream.flush().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(master.worker_identities().is_empty());
    }

    #[test]
    fn test_empty_address_rejected() {
        let config = MessengerConfig::new("tcp-worker").with_address("  ");
        assert!(matches!(
            TcpTransport::new(Role::Worker, &config),
            Err(MessagingError::Configuration(_))
        ));
    }

    #[test]
    fn test_worker_send_without_master_fails() {
        let config = MessengerConfig::new("tcp-worker");
        let transport = TcpTransport::new(Role::Worker, &config).unwrap();
        assert!(transport
            .send(envelope(Recipients::all(), "w", "ready"))
            .is_err());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_queued_frames() {
        let (master, _master_rx) = master().await;
        let addr = master.local_addr().unwrap();
        let (_w1, mut w1_rx) = worker(addr, "w1").await;
        wait_for_workers(&master, 1).await;

        for round in 0..100 {
            let mut env = envelope(Recipients::all(), "m", "prepare");
            env.data.insert("round", round);
            master.send(env).unwrap();
        }
        master.send(envelope(Recipients::all(), "m", "exit")).unwrap();
        master.shutdown().await.unwrap();
        drop(master);

        // Dispatch runs one task per envelope, so only the set is fixed
        let mut exits = 0;
        for _ in 0..101 {
            if recv(&mut w1_rx).await.message_type() == Some("exit") {
                exits += 1;
            }
        }
        assert_eq!(exits, 1);

        // The master closed the connection, so the worker's delivery ends
        assert!(tokio::time::timeout(Duration::from_secs(5), w1_rx.recv())
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_exit_survives_master_runtime_drop() {
        let worker_rt = tokio::runtime::Runtime::new().unwrap();
        let master_rt = tokio::runtime::Runtime::new().unwrap();

        let master = master_rt.block_on(async {
            let (master, _rx) = master().await;
            master
        });
        let addr = master.local_addr().unwrap();

        let (_worker, mut worker_rx) = worker_rt.block_on(worker(addr, "w1"));
        master_rt.block_on(async {
            wait_for_workers(&master, 1).await;
            master.send(envelope(Recipients::all(), "m", "exit")).unwrap();
            master.shutdown().await.unwrap();
        });
        drop(master);
        drop(master_rt);

        worker_rt.block_on(async {
            assert_eq!(recv(&mut worker_rx).await.message_type(), Some("exit"));
        });
    }
}
