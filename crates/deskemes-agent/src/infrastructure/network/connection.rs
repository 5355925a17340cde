//! Per-peer connection state machine.
//!
//! A [`Connection`] is one TCP session to one desktop.  It never touches the
//! socket itself: the connection manager feeds it every received chunk with
//! [`Connection::on_bytes_received`] and writes whatever
//! [`Connection::take_outgoing`] returns.  This keeps the whole handshake
//! testable from plain unit tests.
//!
//! # Handshake (for beginners)
//!
//! ```text
//! desktop                                   phone (this side)
//!   dsms ───────────────────────────────────►
//!        ◄─────────────────────────────────── dsms, fnam, pubi
//!   fnam, pubi, pubk ───────────────────────►
//!        ◄─────────────────────────────────── pubk        (approved peer only)
//!   stls ───────────────────────────────────►
//!        ◄─────────────────────────────────── stls + TLS ClientHello
//!   ════════════ TLS, then mux frames ══════════════
//! ```
//!
//! A desktop this device has not approved gets `pair` instead of `pubk` or
//! `stls`, and the connection emits [`ConnectionEvent::PairingRequired`] so
//! the pairing workflow can ask a human.  Once the human approves, the
//! manager calls [`Connection::on_local_key_generated`] and
//! [`Connection::on_peer_approved`], which resume the handshake on the same
//! socket.
//!
//! Every protocol violation is returned as a [`ConnectionError`]; the
//! manager then closes this connection and nothing else.

use std::fmt;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use deskemes_core::protocol::control::ControlRequest;
use deskemes_core::protocol::messages::PROTOCOL_VERSION;
use deskemes_core::{
    decode_cleartext_frame, decode_mux_frame, encode_cleartext_frame, encode_mux_frame,
    CleartextFrame, CleartextMessage, Decoded, FourCc, MuxFrame, ProtocolError, PublicId,
    WireError,
};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::services::ServiceRegistry;
use crate::infrastructure::crypto::TlsSession;
use crate::infrastructure::network::mux::ChannelTable;
use crate::infrastructure::storage::trust_store::{PeerRecord, TrustStore};

/// Incoming bytes a connection may hold without being able to decode a frame.
pub const MAX_INCOMING_DATA: usize = 66_000;

/// Cleartext bytes a connection may queue before they are written.
pub const MAX_OUTGOING_DATA: usize = 66_000;

// ── Types ─────────────────────────────────────────────────────────────────────

/// Opaque handle identifying one connection inside the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which framing the connection currently speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Cleartext,
    Encrypted,
}

/// How this device introduces itself in `fnam` and `pubi`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub friendly_name: String,
    pub public_id: PublicId,
}

/// A desktop that needs a human decision before the handshake can finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRequest {
    pub friendly_name: String,
    pub remote_public_id: PublicId,
    pub remote_public_key: Vec<u8>,
    pub remote_addr: SocketAddr,
}

/// Things a connection reports to its owner besides outgoing bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    PairingRequired(PairingRequest),
    /// Both sides sent `stls` and the TLS session is installed.
    Encrypted,
}

/// Reasons a connection is torn down.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The first message was not the `dsms` banner.
    #[error("expected `dsms` as the first message, received `{0}`")]
    DsmsExpected(FourCc),

    /// A frame could not be interpreted (unknown tag, bad banner, ...).
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// The `pubi` the desktop sent differs from the one in its beacon.
    #[error("public ID mismatch: beacon advertised {expected}, handshake sent {received}")]
    PublicIdMismatch {
        expected: PublicId,
        received: PublicId,
    },

    /// `pubk` arrived before `pubi`.
    #[error("public key received before the public ID")]
    KeyBeforeId,

    /// A second `pubk` arrived.
    #[error("public key received twice")]
    DuplicateKey,

    /// `stls` arrived before both `pubi` and `pubk`.
    #[error("`stls` received before the public ID and key")]
    PrematureStls,

    /// A buffer reached its cap.
    #[error("buffer overflow")]
    BufferOverflow,

    /// A cleartext message was queued after `stls` had been sent.
    #[error("cannot send `{0}` in cleartext after `stls`")]
    CleartextAfterStls(FourCc),

    /// A frame could not be encoded.
    #[error("cannot encode frame: {0}")]
    Encode(#[from] WireError),

    /// The TLS layer failed.
    #[error("TLS failure: {0}")]
    Tls(String),

    /// The connection is already closed.
    #[error("connection closed")]
    Closed,
}

// ── Connection ────────────────────────────────────────────────────────────────

/// Sans-IO state of one connection to a desktop.
pub struct Connection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    created_at: Instant,
    local: LocalIdentity,
    trust: Arc<dyn TrustStore>,
    registry: ServiceRegistry,

    /// Public ID advertised by the beacon that caused this dial.
    expected_public_id: Option<PublicId>,
    remote_friendly_name: Option<String>,
    remote_public_id: Option<PublicId>,
    remote_public_key: Option<Vec<u8>>,
    /// Approved record for the remote; `None` while unapproved.
    peer: Option<PeerRecord>,

    received_dsms: bool,
    received_stls: bool,
    sent_stls: bool,
    sent_pair: bool,

    incoming: Vec<u8>,
    outgoing: Vec<u8>,
    tls: Option<TlsSession>,
    /// Decrypted bytes that do not yet form a whole mux frame.
    plaintext: Vec<u8>,
    channels: Option<ChannelTable>,
    events: Vec<ConnectionEvent>,
    closed: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("remote_public_id", &self.remote_public_id)
            .field("state", &self.state())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Creates the state for a freshly dialed socket.
    ///
    /// `expected_public_id` is the ID from the beacon that triggered the
    /// dial; the handshake aborts if the desktop's `pubi` differs.
    pub fn new(
        remote_addr: SocketAddr,
        expected_public_id: Option<PublicId>,
        local: LocalIdentity,
        trust: Arc<dyn TrustStore>,
        registry: ServiceRegistry,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            remote_addr,
            created_at: Instant::now(),
            local,
            trust,
            registry,
            expected_public_id,
            remote_friendly_name: None,
            remote_public_id: None,
            remote_public_key: None,
            peer: None,
            received_dsms: false,
            received_stls: false,
            sent_stls: false,
            sent_pair: false,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            tls: None,
            plaintext: Vec::new(),
            channels: None,
            events: Vec::new(),
            closed: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn remote_public_id(&self) -> Option<&PublicId> {
        self.remote_public_id.as_ref()
    }

    pub fn remote_friendly_name(&self) -> Option<&str> {
        self.remote_friendly_name.as_deref()
    }

    pub fn state(&self) -> ProtocolState {
        if self.tls.is_some() {
            ProtocolState::Encrypted
        } else {
            ProtocolState::Cleartext
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// How long the connection has existed.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// The open mux channel table, once encrypted.
    pub fn channels(&self) -> Option<&ChannelTable> {
        self.channels.as_ref()
    }

    /// Drains the bytes waiting to be written to the socket.
    pub fn take_outgoing(&mut self) -> Vec<u8> {
        mem::take(&mut self.outgoing)
    }

    /// Drains the events raised since the last call.
    pub fn drain_events(&mut self) -> Vec<ConnectionEvent> {
        mem::take(&mut self.events)
    }

    /// Marks the connection closed.  Calling it again has no effect.
    ///
    /// Returns `true` only for the call that actually closed it.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        debug!("Connection {} to {} closed", self.id, self.remote_addr);
        true
    }

    /// Processes a chunk of bytes read from the socket.
    ///
    /// # Errors
    ///
    /// Any [`ConnectionError`] means the connection must be closed.
    pub fn on_bytes_received(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        if self.tls.is_some() {
            return self.on_ciphertext(data);
        }

        self.incoming.extend_from_slice(data);
        while self.tls.is_none() {
            match decode_cleartext_frame(&self.incoming) {
                Decoded::Complete { frame, consumed } => {
                    self.incoming.drain(..consumed);
                    self.handle_cleartext(frame)?;
                }
                Decoded::Incomplete { .. } => break,
            }
        }

        if self.tls.is_some() {
            // Whatever followed the `stls` frame is already TLS.
            let rest = mem::take(&mut self.incoming);
            if !rest.is_empty() {
                self.on_ciphertext(&rest)?;
            }
        } else if self.incoming.len() >= MAX_INCOMING_DATA {
            warn!(
                "Connection {} buffered {} bytes without a complete frame",
                self.id,
                self.incoming.len()
            );
            return Err(ConnectionError::BufferOverflow);
        }
        Ok(())
    }

    /// Sends `pubk` once the pairing workflow has generated the local key.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if the frame cannot be queued.
    pub fn on_local_key_generated(&mut self, local_public_key: &[u8]) -> Result<(), ConnectionError> {
        if !self.received_dsms || self.sent_stls {
            debug!("Connection {} does not want a public key now", self.id);
            return Ok(());
        }
        debug!("Sending local public key to {}", self.remote_addr);
        self.send_cleartext(CleartextMessage::Pubk(local_public_key.to_vec()))
    }

    /// Resumes the handshake after a human approved the remote.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if `stls` cannot be queued or TLS cannot
    /// be installed.
    pub fn on_peer_approved(&mut self, record: PeerRecord) -> Result<(), ConnectionError> {
        if self.sent_stls || self.remote_public_key.is_none() {
            return Ok(());
        }
        self.peer = Some(record);
        info!("Starting TLS with {}", self.remote_addr);
        self.send_cleartext(CleartextMessage::Stls)?;
        self.sent_stls = true;
        self.maybe_start_tls()
    }

    /// Sends a locally initiated control request on channel 0.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::Closed`] if the connection is not encrypted yet.
    pub fn send_control_request(&mut self, request: &ControlRequest) -> Result<(), ConnectionError> {
        let frame = match self.channels.as_mut() {
            Some(channels) => channels.send_request(request)?,
            None => return Err(ConnectionError::Closed),
        };
        self.send_mux(vec![frame])
    }

    /// Forgets control requests unanswered for longer than `max_age`.
    pub fn prune_pending(&mut self, max_age: Duration, now: Instant) -> usize {
        self.channels
            .as_mut()
            .map_or(0, |channels| channels.prune_pending(max_age, now))
    }

    // ── Cleartext phase ──────────────────────────────────────────────────────

    fn handle_cleartext(&mut self, frame: CleartextFrame) -> Result<(), ConnectionError> {
        debug!(
            "Connection {} received `{}` ({} bytes)",
            self.id,
            frame.tag,
            frame.payload.len()
        );
        if !self.received_dsms && frame.tag != FourCc::DSMS {
            return Err(ConnectionError::DsmsExpected(frame.tag));
        }

        match CleartextMessage::from_frame(&frame)? {
            CleartextMessage::Dsms { version } => self.handle_dsms(version),
            CleartextMessage::Fnam(name) => {
                self.remote_friendly_name = Some(name);
                Ok(())
            }
            CleartextMessage::Avtr(_) => Ok(()),
            CleartextMessage::Pubi(id) => self.handle_pubi(PublicId::new(id)),
            CleartextMessage::Pubk(key) => self.handle_pubk(key),
            CleartextMessage::Stls => self.handle_stls(),
            CleartextMessage::Pair => {
                self.peer = None;
                self.notify_pairing_required()
            }
        }
    }

    fn handle_dsms(&mut self, version: u16) -> Result<(), ConnectionError> {
        if version > PROTOCOL_VERSION {
            debug!("Remote {} uses newer protocol version {version}", self.remote_addr);
        }
        self.received_dsms = true;
        self.send_cleartext(CleartextMessage::banner())?;
        self.send_cleartext(CleartextMessage::Fnam(self.local.friendly_name.clone()))?;
        self.send_cleartext(CleartextMessage::Pubi(
            self.local.public_id.as_bytes().to_vec(),
        ))
    }

    fn handle_pubi(&mut self, id: PublicId) -> Result<(), ConnectionError> {
        if let Some(expected) = &self.expected_public_id {
            if *expected != id {
                return Err(ConnectionError::PublicIdMismatch {
                    expected: expected.clone(),
                    received: id,
                });
            }
        }
        if self.peer.is_none() {
            self.peer = self.trust.lookup(&id).filter(|record| record.approved);
        }
        self.remote_public_id = Some(id);
        Ok(())
    }

    fn handle_pubk(&mut self, key: Vec<u8>) -> Result<(), ConnectionError> {
        if self.remote_public_id.is_none() {
            return Err(ConnectionError::KeyBeforeId);
        }
        if self.remote_public_key.is_some() {
            return Err(ConnectionError::DuplicateKey);
        }
        self.remote_public_key = Some(key.clone());

        let (key_matches, local_key) = match &self.peer {
            None => return self.notify_pairing_required(),
            Some(peer) => (
                peer.remote_public_key.as_deref() == Some(key.as_slice()),
                peer.local_public_key().map(<[u8]>::to_vec),
            ),
        };
        if !key_matches {
            warn!(
                "Remote {} presented a public key different from the approved one",
                self.remote_addr
            );
            self.peer = None;
            return self.notify_pairing_required();
        }
        match local_key {
            Some(local_key) => self.send_cleartext(CleartextMessage::Pubk(local_key)),
            None => {
                warn!("Approved record for {} has no local key pair", self.remote_addr);
                self.peer = None;
                self.notify_pairing_required()
            }
        }
    }

    fn handle_stls(&mut self) -> Result<(), ConnectionError> {
        if self.remote_public_id.is_none() || self.remote_public_key.is_none() {
            return Err(ConnectionError::PrematureStls);
        }
        self.received_stls = true;
        if self.peer.is_none() {
            return self.notify_pairing_required();
        }
        if !self.sent_stls {
            self.send_cleartext(CleartextMessage::Stls)?;
            self.sent_stls = true;
        }
        self.maybe_start_tls()
    }

    /// Raises [`ConnectionEvent::PairingRequired`] once the remote's name,
    /// ID and key are known, and tells the remote that pairing is pending.
    fn notify_pairing_required(&mut self) -> Result<(), ConnectionError> {
        match (
            &self.remote_friendly_name,
            &self.remote_public_id,
            &self.remote_public_key,
        ) {
            (Some(name), Some(id), Some(key)) => {
                info!(
                    "Remote {name} ({}) is not paired, requesting approval",
                    self.remote_addr
                );
                self.events
                    .push(ConnectionEvent::PairingRequired(PairingRequest {
                        friendly_name: name.clone(),
                        remote_public_id: id.clone(),
                        remote_public_key: key.clone(),
                        remote_addr: self.remote_addr,
                    }));
            }
            _ => debug!(
                "Remote {} is not paired but has not identified itself yet",
                self.remote_addr
            ),
        }

        if !self.sent_stls && !self.sent_pair {
            self.send_cleartext(CleartextMessage::Pair)?;
            self.sent_pair = true;
        }
        Ok(())
    }

    fn send_cleartext(&mut self, message: CleartextMessage) -> Result<(), ConnectionError> {
        let tag = message.tag();
        if self.sent_stls {
            return Err(ConnectionError::CleartextAfterStls(tag));
        }
        let bytes = encode_cleartext_frame(tag, &message.encode_payload())?;
        if self.outgoing.len() + bytes.len() > MAX_OUTGOING_DATA {
            return Err(ConnectionError::BufferOverflow);
        }
        debug!("Connection {} sending `{tag}` ({} bytes)", self.id, bytes.len());
        self.outgoing.extend_from_slice(&bytes);
        Ok(())
    }

    // ── Encrypted phase ──────────────────────────────────────────────────────

    /// Installs TLS and channel 0 once both sides sent `stls`.
    fn maybe_start_tls(&mut self) -> Result<(), ConnectionError> {
        if self.tls.is_some() || !self.sent_stls || !self.received_stls {
            return Ok(());
        }
        let Some(peer) = &self.peer else {
            return Ok(());
        };
        let (Some(local_key), Some(remote_key)) =
            (&peer.local_key_pair, &peer.remote_public_key)
        else {
            return Err(ConnectionError::Tls(
                "approved record lacks key material".to_string(),
            ));
        };

        let mut session = TlsSession::new(local_key, remote_key)
            .map_err(|e| ConnectionError::Tls(e.to_string()))?;
        let client_hello = session
            .take_ciphertext()
            .map_err(|e| ConnectionError::Tls(e.to_string()))?;
        self.outgoing.extend_from_slice(&client_hello);
        self.tls = Some(session);
        self.channels = Some(ChannelTable::new(self.registry.clone()));
        self.events.push(ConnectionEvent::Encrypted);
        info!("Connection {} to {} is now encrypted", self.id, self.remote_addr);
        Ok(())
    }

    fn on_ciphertext(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let Some(tls) = self.tls.as_mut() else {
            return Err(ConnectionError::Closed);
        };
        let plaintext = tls
            .read_ciphertext(data)
            .map_err(|e| ConnectionError::Tls(e.to_string()))?;
        let peer_closed = tls.peer_has_closed();
        self.plaintext.extend_from_slice(&plaintext);
        self.flush_tls()?;

        let mut replies = Vec::new();
        loop {
            match decode_mux_frame(&self.plaintext) {
                Decoded::Complete { frame, consumed } => {
                    self.plaintext.drain(..consumed);
                    replies.extend(self.dispatch_mux(frame));
                }
                Decoded::Incomplete { .. } => break,
            }
        }
        self.send_mux(replies)?;

        if self.plaintext.len() >= MAX_INCOMING_DATA {
            return Err(ConnectionError::BufferOverflow);
        }
        if peer_closed {
            debug!("Remote {} sent close_notify", self.remote_addr);
            return Err(ConnectionError::Closed);
        }
        Ok(())
    }

    fn dispatch_mux(&mut self, frame: MuxFrame) -> Vec<MuxFrame> {
        match self.channels.as_mut() {
            Some(channels) => channels.handle_frame(frame),
            None => Vec::new(),
        }
    }

    fn send_mux(&mut self, frames: Vec<MuxFrame>) -> Result<(), ConnectionError> {
        if frames.is_empty() {
            return Ok(());
        }
        let Some(tls) = self.tls.as_mut() else {
            return Err(ConnectionError::Closed);
        };
        for frame in frames {
            let bytes = encode_mux_frame(frame.channel_id, &frame.payload)?;
            tls.write_plaintext(&bytes)
                .map_err(|e| ConnectionError::Tls(e.to_string()))?;
        }
        self.flush_tls()
    }

    fn flush_tls(&mut self) -> Result<(), ConnectionError> {
        if let Some(tls) = self.tls.as_mut() {
            let ciphertext = tls
                .take_ciphertext()
                .map_err(|e| ConnectionError::Tls(e.to_string()))?;
            self.outgoing.extend_from_slice(&ciphertext);
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
