//! UDP beacon listener.
//!
//! Desktops running Deskemes broadcast a small beacon datagram every few
//! seconds.  The listener binds the well-known beacon port, parses every
//! datagram with [`parse_beacon`], and hands each valid [`Beacon`] to a
//! [`BeaconConsumer`].  Datagrams that are not beacons are dropped and the
//! listener keeps going.
//!
//! # Ports
//!
//! The listener first tries the primary port (24816).  If another process
//! already holds it, the fallback port (4816) is used instead.
//!
//! # Consumer chain
//!
//! Consumers can wrap each other.  The agent installs
//!
//! ```text
//! listener ──► BlacklistFilter ──► ManagerHandle
//! ```
//!
//! so that a desktop that is already connected does not get dialed again
//! every time it beacons.  Discovery beacons always pass the filter: a
//! desktop in discovery mode is actively looking for phones and may want a
//! fresh connection to re-pair.
//!
//! # Read timeout
//!
//! The socket has a 500 ms read timeout.  After each timeout the loop checks
//! the shared `running` flag and exits once it is cleared.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};
use std::time::Duration;

use deskemes_core::{parse_beacon, Beacon};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Error type for the beacon listener.
#[derive(Debug, Error)]
pub enum BeaconError {
    /// Neither the primary nor the fallback port could be bound.
    #[error("failed to bind beacon socket on port {primary} or {fallback}: {source}")]
    BindFailed {
        primary: u16,
        fallback: u16,
        #[source]
        source: std::io::Error,
    },

    /// The listener thread could not be started.
    #[error("failed to spawn beacon listener thread: {0}")]
    Spawn(std::io::Error),
}

/// Ports and buffer size used by [`start_beacon_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconListenerConfig {
    pub primary_port: u16,
    pub fallback_port: u16,
    pub max_datagram_size: usize,
}

/// Receives every beacon that passed parsing.
///
/// Called from the listener thread, so implementations must not block for
/// long.
pub trait BeaconConsumer: Send + Sync {
    fn beacon_received(&self, beacon: Beacon);
}

impl<C: BeaconConsumer + ?Sized> BeaconConsumer for Arc<C> {
    fn beacon_received(&self, beacon: Beacon) {
        (**self).beacon_received(beacon);
    }
}

// ── Blacklist filter ──────────────────────────────────────────────────────────

/// IP addresses that currently have an active connection.
///
/// Shared between the [`BlacklistFilter`] (which reads it) and the
/// connection manager (which blocks an address when it dials and allows it
/// again when the connection closes).
#[derive(Debug, Default)]
pub struct AddressBlacklist {
    blocked: Mutex<HashSet<IpAddr>>,
}

impl AddressBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suppresses non-discovery beacons from `ip`.
    pub fn block(&self, ip: IpAddr) {
        if self.blocked().insert(ip) {
            debug!("Blacklisted {ip}");
        }
    }

    /// Lets beacons from `ip` through again.
    pub fn allow(&self, ip: IpAddr) {
        if self.blocked().remove(&ip) {
            debug!("Removed {ip} from the blacklist");
        }
    }

    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.blocked().contains(&ip)
    }

    fn blocked(&self) -> MutexGuard<'_, HashSet<IpAddr>> {
        self.blocked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drops non-discovery beacons from blacklisted addresses.
pub struct BlacklistFilter<C> {
    blacklist: Arc<AddressBlacklist>,
    inner: C,
}

impl<C: BeaconConsumer> BlacklistFilter<C> {
    pub fn new(blacklist: Arc<AddressBlacklist>, inner: C) -> Self {
        Self { blacklist, inner }
    }
}

impl<C: BeaconConsumer> BeaconConsumer for BlacklistFilter<C> {
    fn beacon_received(&self, beacon: Beacon) {
        if !beacon.is_discovery && self.blacklist.is_blocked(beacon.addr.ip()) {
            debug!("Ignoring beacon from blacklisted {}", beacon.addr);
            return;
        }
        self.inner.beacon_received(beacon);
    }
}

// ── Listener ──────────────────────────────────────────────────────────────────

/// Binds the beacon socket and spawns the listener thread.
///
/// Returns the bound address.  The thread runs until `running` is cleared.
///
/// # Errors
///
/// - [`BeaconError::BindFailed`] if both ports are unavailable.
/// - [`BeaconError::Spawn`] if the thread cannot be created.
pub fn start_beacon_listener(
    config: BeaconListenerConfig,
    consumer: Arc<dyn BeaconConsumer>,
    running: Arc<AtomicBool>,
) -> Result<SocketAddr, BeaconError> {
    let socket = bind_with_fallback(config.primary_port, config.fallback_port)?;
    if let Err(e) = socket.set_read_timeout(Some(READ_TIMEOUT)) {
        warn!("Could not set beacon socket read timeout: {e}");
    }
    let local_addr = socket
        .local_addr()
        .map_err(|source| BeaconError::BindFailed {
            primary: config.primary_port,
            fallback: config.fallback_port,
            source,
        })?;

    let buf_size = config.max_datagram_size.max(1);
    std::thread::Builder::new()
        .name("deskemes-beacons".to_string())
        .spawn(move || listener_loop(socket, buf_size, consumer.as_ref(), &running))
        .map_err(BeaconError::Spawn)?;

    info!("Beacon listener listening on UDP {local_addr}");
    Ok(local_addr)
}

fn bind_with_fallback(primary: u16, fallback: u16) -> Result<UdpSocket, BeaconError> {
    let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    match UdpSocket::bind(SocketAddr::new(any, primary)) {
        Ok(socket) => Ok(socket),
        Err(e) => {
            info!("Beacon port {primary} unavailable ({e}), falling back to {fallback}");
            UdpSocket::bind(SocketAddr::new(any, fallback)).map_err(|source| {
                BeaconError::BindFailed {
                    primary,
                    fallback,
                    source,
                }
            })
        }
    }
}

/// The receive loop executed on the listener thread.
fn listener_loop(
    socket: UdpSocket,
    buf_size: usize,
    consumer: &dyn BeaconConsumer,
    running: &AtomicBool,
) {
    let mut buf = vec![0u8; buf_size];

    while running.load(Ordering::Relaxed) {
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if is_timeout_error(&e) => continue,
            Err(e) => {
                error!("Beacon recv error: {e}");
                continue;
            }
        };
        handle_datagram(&buf[..len], src, consumer);
    }

    info!("Beacon listener stopped");
}

/// Parses one datagram and forwards it if it is a beacon.
fn handle_datagram(datagram: &[u8], src: SocketAddr, consumer: &dyn BeaconConsumer) {
    match parse_beacon(datagram, src.ip()) {
        Ok(beacon) => {
            debug!(
                "Beacon from {src}: id={}, port={}, discovery={}",
                beacon.public_id,
                beacon.addr.port(),
                beacon.is_discovery
            );
            consumer.beacon_received(beacon);
        }
        Err(e) => debug!("Discarding {}-byte datagram from {src}: {e}", datagram.len()),
    }
}

/// Returns `true` for OS timeout / would-block errors that should be retried.
fn is_timeout_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────
