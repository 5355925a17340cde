//! Connection manager: the single task that owns every live connection.
//!
//! # Concurrency model (for beginners)
//!
//! ```text
//!  ManagerHandle (any thread) ──Command──┐
//!  beacon listener thread ──────Command──┤
//!                                        ▼
//!                           ┌────────────────────────┐      ManagerEvent
//!  per-socket reader task ─►│  ConnectionManager::run│────────────────────► pairing workflow
//!  per-socket writer task ◄─│  (owns all Connections)│
//!                           └────────────────────────┘
//! ```
//!
//! Nothing outside `run` ever touches a [`Connection`].  Other threads talk
//! to the manager by sending a command through a cloneable
//! [`ManagerHandle`]; sending wakes the loop, which drains the command on
//! its own task.  Each socket has a reader task that forwards received
//! bytes and a writer task that drains queued bytes, so the loop itself
//! never blocks on I/O.
//!
//! A failure on one connection (protocol violation, TLS error, socket
//! error) closes that connection only.  The loop runs until
//! [`ManagerHandle::shutdown`] is called or every handle is dropped.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use deskemes_core::protocol::control::ControlRequest;
use deskemes_core::{Beacon, PublicId};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::pairing::PairingLink;
use crate::application::services::ServiceRegistry;
use crate::infrastructure::network::beacon_listener::{AddressBlacklist, BeaconConsumer};
use crate::infrastructure::network::connection::{
    Connection, ConnectionError, ConnectionEvent, ConnectionId, LocalIdentity, PairingRequest,
    ProtocolState,
};
use crate::infrastructure::storage::trust_store::{PeerRecord, TrustStore};

/// How long a TCP connect may take before the dial is abandoned.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Size of one socket read.
const READ_CHUNK: usize = 16 * 1024;

/// Capacity of the socket-task → loop channel.
const IO_CHANNEL_CAPACITY: usize = 256;

// ── Public types ──────────────────────────────────────────────────────────────

/// Error returned by [`ManagerHandle`] once the manager has stopped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error("connection manager has stopped")]
    Stopped,
}

/// Manager settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Name and ID this device sends in the handshake.
    pub local: LocalIdentity,
    /// Dial unknown desktops that beacon in discovery mode.
    pub respond_to_discovery: bool,
    /// Close connections still in cleartext after this long; `None` disables.
    pub handshake_timeout: Option<Duration>,
    /// How often the timeout sweep runs.
    pub sweep_interval: Duration,
}

impl ManagerConfig {
    /// Config with a one-minute handshake timeout swept every second.
    pub fn new(local: LocalIdentity) -> Self {
        Self {
            local,
            respond_to_discovery: true,
            handshake_timeout: Some(Duration::from_secs(60)),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Events emitted by the manager to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    PairingRequired(PairingRequest),
    Connected {
        id: ConnectionId,
        addr: SocketAddr,
    },
    Encrypted {
        id: ConnectionId,
    },
    Closed {
        id: ConnectionId,
        addr: SocketAddr,
        reason: String,
    },
}

/// Snapshot of one live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    pub remote_public_id: Option<PublicId>,
    pub state: ProtocolState,
}

/// Requests handed to the manager loop.
#[derive(Debug)]
enum Command {
    Beacon(Beacon),
    Dial {
        addr: SocketAddr,
        expected_public_id: Option<PublicId>,
    },
    LocalKeyGenerated {
        remote_public_id: PublicId,
        local_public_key: Vec<u8>,
    },
    PeerApproved(PeerRecord),
    Ping {
        id: ConnectionId,
        data: Vec<u8>,
    },
    ActiveConnections(oneshot::Sender<Vec<ConnectionStatus>>),
    Shutdown,
}

/// Cloneable, thread-safe handle for talking to a running manager.
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ManagerHandle {
    fn send(&self, command: Command) -> Result<(), ManagerError> {
        self.commands.send(command).map_err(|_| ManagerError::Stopped)
    }

    /// Dials `addr` without an expected public ID.
    pub fn connect_to(&self, addr: SocketAddr) -> Result<(), ManagerError> {
        self.dial(addr, None)
    }

    /// Dials `addr`; the handshake aborts if the desktop's ID differs from
    /// `expected_public_id`.
    pub fn dial(
        &self,
        addr: SocketAddr,
        expected_public_id: Option<PublicId>,
    ) -> Result<(), ManagerError> {
        self.send(Command::Dial {
            addr,
            expected_public_id,
        })
    }

    /// Forwards a freshly generated local public key to every connection
    /// with `remote_public_id`.
    pub fn local_key_generated(
        &self,
        remote_public_id: PublicId,
        local_public_key: Vec<u8>,
    ) -> Result<(), ManagerError> {
        self.send(Command::LocalKeyGenerated {
            remote_public_id,
            local_public_key,
        })
    }

    /// Resumes every connection to the approved peer.
    pub fn peer_approved(&self, record: PeerRecord) -> Result<(), ManagerError> {
        self.send(Command::PeerApproved(record))
    }

    /// Sends a channel-zero `ping` on an encrypted connection.
    pub fn ping(&self, id: ConnectionId, data: Vec<u8>) -> Result<(), ManagerError> {
        self.send(Command::Ping { id, data })
    }

    /// Returns a snapshot of the live connections.
    pub async fn active_connections(&self) -> Result<Vec<ConnectionStatus>, ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ActiveConnections(tx))?;
        rx.await.map_err(|_| ManagerError::Stopped)
    }

    /// Asks the loop to close every connection and stop.
    pub fn shutdown(&self) -> Result<(), ManagerError> {
        self.send(Command::Shutdown)
    }
}

impl BeaconConsumer for ManagerHandle {
    fn beacon_received(&self, beacon: Beacon) {
        if self.send(Command::Beacon(beacon)).is_err() {
            debug!("Beacon dropped, connection manager has stopped");
        }
    }
}

impl PairingLink for ManagerHandle {
    fn local_key_generated(
        &self,
        remote_public_id: PublicId,
        local_public_key: Vec<u8>,
    ) -> Result<(), String> {
        ManagerHandle::local_key_generated(self, remote_public_id, local_public_key)
            .map_err(|e| e.to_string())
    }

    fn peer_approved(&self, record: PeerRecord) -> Result<(), String> {
        ManagerHandle::peer_approved(self, record).map_err(|e| e.to_string())
    }
}

// ── Manager ───────────────────────────────────────────────────────────────────

/// What the socket tasks report to the loop.
#[derive(Debug)]
enum IoEvent {
    Dialed {
        addr: SocketAddr,
        expected_public_id: Option<PublicId>,
        result: std::io::Result<TcpStream>,
    },
    Data {
        id: ConnectionId,
        bytes: Vec<u8>,
    },
    ReadClosed {
        id: ConnectionId,
        reason: String,
    },
    WriteFailed {
        id: ConnectionId,
        reason: String,
    },
}

struct LiveConnection {
    conn: Connection,
    writer: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
}

/// Owns every connection; see the module docs.
pub struct ConnectionManager {
    config: ManagerConfig,
    trust: Arc<dyn TrustStore>,
    registry: ServiceRegistry,
    blacklist: Arc<AddressBlacklist>,
    connections: HashMap<ConnectionId, LiveConnection>,
    dialing: HashSet<SocketAddr>,
    commands: mpsc::UnboundedReceiver<Command>,
    io_tx: mpsc::Sender<IoEvent>,
    io_rx: mpsc::Receiver<IoEvent>,
    events: mpsc::UnboundedSender<ManagerEvent>,
}

impl ConnectionManager {
    /// Creates a manager together with its handle and event receiver.
    ///
    /// Nothing happens until [`run`](Self::run) is awaited.
    pub fn new(
        config: ManagerConfig,
        trust: Arc<dyn TrustStore>,
        registry: ServiceRegistry,
        blacklist: Arc<AddressBlacklist>,
    ) -> (Self, ManagerHandle, mpsc::UnboundedReceiver<ManagerEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (io_tx, io_rx) = mpsc::channel(IO_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let manager = Self {
            config,
            trust,
            registry,
            blacklist,
            connections: HashMap::new(),
            dialing: HashSet::new(),
            commands: command_rx,
            io_tx,
            io_rx,
            events: event_tx,
        };
        let handle = ManagerHandle {
            commands: command_tx,
        };
        (manager, handle, event_rx)
    }

    /// Runs the loop until shutdown.
    pub async fn run(mut self) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Connection manager started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(io) = self.io_rx.recv() => self.handle_io(io),
                _ = sweep.tick() => self.sweep(Instant::now()),
            }
        }

        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.close_connection(id, "manager stopped".to_string());
        }
        info!("Connection manager stopped");
    }

    fn emit(&self, event: ManagerEvent) {
        if self.events.send(event).is_err() {
            debug!("Manager event dropped, nobody is listening");
        }
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Beacon(beacon) => self.on_beacon(beacon),
            Command::Dial {
                addr,
                expected_public_id,
            } => self.dial(addr, expected_public_id),
            Command::LocalKeyGenerated {
                remote_public_id,
                local_public_key,
            } => {
                for id in self.connections_to(&remote_public_id) {
                    self.with_connection(id, |conn| conn.on_local_key_generated(&local_public_key));
                }
            }
            Command::PeerApproved(record) => {
                for id in self.connections_to(&record.remote_public_id) {
                    self.with_connection(id, |conn| conn.on_peer_approved(record.clone()));
                }
            }
            Command::Ping { id, data } => self.ping(id, data),
            Command::ActiveConnections(reply) => {
                let mut statuses: Vec<ConnectionStatus> = self
                    .connections
                    .values()
                    .map(|live| ConnectionStatus {
                        id: live.conn.id(),
                        addr: live.conn.remote_addr(),
                        remote_public_id: live.conn.remote_public_id().cloned(),
                        state: live.conn.state(),
                    })
                    .collect();
                statuses.sort_by_key(|s| s.addr);
                let _ = reply.send(statuses);
            }
            Command::Shutdown => {}
        }
    }

    fn on_beacon(&mut self, beacon: Beacon) {
        let approved = self
            .trust
            .lookup(&beacon.public_id)
            .is_some_and(|record| record.approved);
        if approved || (beacon.is_discovery && self.config.respond_to_discovery) {
            self.dial(beacon.addr, Some(beacon.public_id));
        } else {
            debug!(
                "Ignoring beacon from {} ({}): not approved",
                beacon.addr, beacon.public_id
            );
        }
    }

    fn dial(&mut self, addr: SocketAddr, expected_public_id: Option<PublicId>) {
        let already_connected = self
            .connections
            .values()
            .any(|live| live.conn.remote_addr() == addr);
        if already_connected || !self.dialing.insert(addr) {
            debug!("Already connected or connecting to {addr}");
            return;
        }
        self.blacklist.block(addr.ip());
        info!("Dialing {addr}");

        let io_tx = self.io_tx.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(result) => result,
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                )),
            };
            let _ = io_tx
                .send(IoEvent::Dialed {
                    addr,
                    expected_public_id,
                    result,
                })
                .await;
        });
    }

    fn ping(&mut self, id: ConnectionId, data: Vec<u8>) {
        match self.connections.get(&id).map(|live| live.conn.state()) {
            Some(ProtocolState::Encrypted) => {
                self.with_connection(id, |conn| {
                    conn.send_control_request(&ControlRequest::Ping { data })
                });
            }
            Some(ProtocolState::Cleartext) => debug!("Cannot ping {id} before encryption"),
            None => debug!("Cannot ping unknown connection {id}"),
        }
    }

    fn connections_to(&self, remote_public_id: &PublicId) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|live| live.conn.remote_public_id() == Some(remote_public_id))
            .map(|live| live.conn.id())
            .collect()
    }

    // ── Socket events ────────────────────────────────────────────────────────

    fn handle_io(&mut self, io: IoEvent) {
        match io {
            IoEvent::Dialed {
                addr,
                expected_public_id,
                result,
            } => self.on_dialed(addr, expected_public_id, result),
            IoEvent::Data { id, bytes } => {
                self.with_connection(id, |conn| conn.on_bytes_received(&bytes));
            }
            IoEvent::ReadClosed { id, reason } | IoEvent::WriteFailed { id, reason } => {
                self.close_connection(id, reason);
            }
        }
    }

    fn on_dialed(
        &mut self,
        addr: SocketAddr,
        expected_public_id: Option<PublicId>,
        result: std::io::Result<TcpStream>,
    ) {
        self.dialing.remove(&addr);
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Could not connect to {addr}: {e}");
                self.blacklist.allow(addr.ip());
                return;
            }
        };

        let conn = Connection::new(
            addr,
            expected_public_id,
            self.config.local.clone(),
            Arc::clone(&self.trust),
            self.registry.clone(),
        );
        let id = conn.id();
        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(id, read_half, self.io_tx.clone()));
        tokio::spawn(write_loop(id, write_half, writer_rx, self.io_tx.clone()));

        self.connections.insert(
            id,
            LiveConnection {
                conn,
                writer: writer_tx,
                reader,
            },
        );
        info!("Connected to {addr} ({id})");
        self.emit(ManagerEvent::Connected { id, addr });
    }

    /// Runs `f` on connection `id`, then flushes its output and events.
    ///
    /// An error from `f` closes that connection.
    fn with_connection<F>(&mut self, id: ConnectionId, f: F)
    where
        F: FnOnce(&mut Connection) -> Result<(), ConnectionError>,
    {
        let Some(live) = self.connections.get_mut(&id) else {
            debug!("Ignoring event for closed connection {id}");
            return;
        };
        let result = f(&mut live.conn);

        let outgoing = live.conn.take_outgoing();
        let write_failed = !outgoing.is_empty() && live.writer.send(outgoing).is_err();
        for event in live.conn.drain_events() {
            match event {
                ConnectionEvent::PairingRequired(request) => {
                    self.emit(ManagerEvent::PairingRequired(request));
                }
                ConnectionEvent::Encrypted => self.emit(ManagerEvent::Encrypted { id }),
            }
        }

        match result {
            Err(e) => {
                warn!("Closing connection {id}: {e}");
                self.close_connection(id, e.to_string());
            }
            Ok(()) if write_failed => self.close_connection(id, "writer stopped".to_string()),
            Ok(()) => {}
        }
    }

    /// Removes and closes connection `id`.  Unknown IDs are ignored.
    fn close_connection(&mut self, id: ConnectionId, reason: String) {
        let Some(mut live) = self.connections.remove(&id) else {
            return;
        };
        if !live.conn.close() {
            return;
        }
        live.reader.abort();
        let addr = live.conn.remote_addr();
        self.blacklist.allow(addr.ip());
        info!("Connection {id} to {addr} closed: {reason}");
        self.emit(ManagerEvent::Closed { id, addr, reason });
    }

    /// Enforces the handshake timeout and expires stale control requests.
    fn sweep(&mut self, now: Instant) {
        let Some(timeout) = self.config.handshake_timeout else {
            return;
        };
        let mut expired = Vec::new();
        for (id, live) in &mut self.connections {
            match live.conn.state() {
                ProtocolState::Cleartext if live.conn.age(now) > timeout => expired.push(*id),
                ProtocolState::Cleartext => {}
                ProtocolState::Encrypted => {
                    let pruned = live.conn.prune_pending(timeout, now);
                    if pruned > 0 {
                        debug!("Forgot {pruned} unanswered control request(s) on {id}");
                    }
                }
            }
        }
        for id in expired {
            self.close_connection(id, "handshake timed out".to_string());
        }
    }
}

// ── Socket tasks ──────────────────────────────────────────────────────────────

/// Forwards everything read from the socket to the loop.
async fn read_loop(id: ConnectionId, mut reader: OwnedReadHalf, io_tx: mpsc::Sender<IoEvent>) {
    let mut buf = vec![0u8; READ_CHUNK];
    let reason = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break "closed by remote".to_string(),
            Ok(n) => {
                let bytes = buf[..n].to_vec();
                if io_tx.send(IoEvent::Data { id, bytes }).await.is_err() {
                    return;
                }
            }
            Err(e) => break format!("read error: {e}"),
        }
    };
    let _ = io_tx.send(IoEvent::ReadClosed { id, reason }).await;
}

/// Writes queued bytes until the loop drops the sender.
async fn write_loop(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    io_tx: mpsc::Sender<IoEvent>,
) {
    while let Some(bytes) = queue.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            let reason = format!("write error: {e}");
            let _ = io_tx.send(IoEvent::WriteFailed { id, reason }).await;
            return;
        }
    }
    let _ = writer.shutdown().await;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
