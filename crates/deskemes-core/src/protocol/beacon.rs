//! UDP discovery beacon format.
//!
//! A Deskemes desktop periodically broadcasts:
//!
//! ```text
//! ["Deskemes":8][version:BE16][public_id:BE16-len blob][tcp_port:BE16][is_discovery:1]
//! ```
//!
//! A beacon carries no address of its own: the phone dials the datagram's
//! *sender IP* combined with the advertised TCP port.  Trailing bytes after
//! the discovery flag are ignored so newer desktops can append fields.

use std::net::{IpAddr, SocketAddr};

use crate::domain::identity::PublicId;
use crate::protocol::codec::ProtocolError;
use crate::protocol::messages::MAGIC;
use crate::protocol::wire::{write_be16, write_blob, ByteReader, WireError};

/// Receive buffer size; anything longer is truncated by the socket.
pub const MAX_DATAGRAM_SIZE: usize = 1000;

/// A parsed discovery beacon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    /// Sender IP combined with the advertised TCP port.
    pub addr: SocketAddr,
    pub protocol_version: u16,
    pub public_id: PublicId,
    /// Set while the desktop is actively looking for new phones to pair.
    pub is_discovery: bool,
}

/// Parses a received datagram.
///
/// # Errors
///
/// - [`ProtocolError::BadMagic`] if the datagram does not start with `"Deskemes"`.
/// - [`ProtocolError::Wire`] if the datagram is truncated.
/// - [`ProtocolError::Malformed`] if the advertised public ID is empty.
///
/// # Examples
///
/// ```rust
/// use deskemes_core::protocol::beacon::{encode_beacon, parse_beacon};
///
/// let datagram = encode_beacon(1, b"abc", 9000, true).unwrap();
/// let beacon = parse_beacon(&datagram, "192.168.1.7".parse().unwrap()).unwrap();
/// assert_eq!(beacon.addr, "192.168.1.7:9000".parse().unwrap());
/// assert!(beacon.is_discovery);
/// ```
pub fn parse_beacon(datagram: &[u8], sender: IpAddr) -> Result<Beacon, ProtocolError> {
    let mut reader = ByteReader::new(datagram);
    if !reader.check_ascii(MAGIC) {
        return Err(ProtocolError::BadMagic);
    }
    let protocol_version = reader.read_be16()?;
    let public_id = reader.read_blob()?;
    if public_id.is_empty() {
        return Err(ProtocolError::Malformed("beacon carries an empty public ID".to_string()));
    }
    let tcp_port = reader.read_be16()?;
    let is_discovery = reader.read_bool()?;
    Ok(Beacon {
        addr: SocketAddr::new(sender, tcp_port),
        protocol_version,
        public_id: PublicId::from(public_id),
        is_discovery,
    })
}

/// Encodes a beacon datagram.
pub fn encode_beacon(
    protocol_version: u16,
    public_id: &[u8],
    tcp_port: u16,
    is_discovery: bool,
) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::with_capacity(MAGIC.len() + 7 + public_id.len());
    buf.extend_from_slice(MAGIC);
    write_be16(&mut buf, protocol_version);
    write_blob(&mut buf, public_id)?;
    write_be16(&mut buf, tcp_port);
    buf.push(u8::from(is_discovery));
    Ok(buf)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
