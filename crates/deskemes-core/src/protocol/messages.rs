//! Cleartext handshake message definitions.
//!
//! Before the TLS upgrade, every message on a Deskemes TCP connection is a
//! cleartext frame identified by a four-character ASCII tag:
//!
//! | Tag    | Payload                               |
//! |--------|---------------------------------------|
//! | `dsms` | `"Deskemes"` + protocol version BE16  |
//! | `fnam` | UTF-8 friendly name                   |
//! | `avtr` | avatar image (accepted, ignored)      |
//! | `pubi` | raw public ID bytes                   |
//! | `pubk` | raw public key bytes (SPKI DER)       |
//! | `stls` | empty – "start TLS"                   |
//! | `pair` | empty – "pairing is pending"          |

use std::fmt;

use crate::protocol::codec::{CleartextFrame, ProtocolError};
use crate::protocol::wire::{write_be16, ByteReader};

/// Magic ASCII prefix carried by both the `dsms` banner and UDP beacons.
pub const MAGIC: &[u8; 8] = b"Deskemes";

/// Protocol version announced in `dsms` and in beacons.
pub const PROTOCOL_VERSION: u16 = 1;

/// UDP port the beacon listener tries first.
pub const PRIMARY_BEACON_PORT: u16 = 24816;

/// UDP port used when the primary port is already taken.
pub const FALLBACK_BEACON_PORT: u16 = 4816;

/// A four-character ASCII code, carried on the wire as a BE32 integer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const DSMS: FourCc = FourCc(*b"dsms");
    pub const FNAM: FourCc = FourCc(*b"fnam");
    pub const AVTR: FourCc = FourCc(*b"avtr");
    pub const PUBI: FourCc = FourCc(*b"pubi");
    pub const PUBK: FourCc = FourCc(*b"pubk");
    pub const STLS: FourCc = FourCc(*b"stls");
    pub const PAIR: FourCc = FourCc(*b"pair");

    pub fn from_be32(value: u32) -> Self {
        Self(value.to_be_bytes())
    }

    pub fn as_be32(self) -> u32 {
        u32::from_be_bytes(self.0)
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.iter().all(|b| b.is_ascii_graphic()) {
            for b in self.0 {
                write!(f, "{}", b as char)?;
            }
            Ok(())
        } else {
            write!(f, "0x{:08X}", self.as_be32())
        }
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({self})")
    }
}

/// A decoded cleartext handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleartextMessage {
    /// Protocol banner.
    Dsms { version: u16 },
    /// Friendly (display) name of the sender.
    Fnam(String),
    /// Avatar image; carried for completeness, never acted upon.
    Avtr(Vec<u8>),
    /// Public ID of the sender.
    Pubi(Vec<u8>),
    /// Public key the sender uses for this pairing.
    Pubk(Vec<u8>),
    /// Request to start TLS.
    Stls,
    /// The sender is waiting for a human to approve the pairing.
    Pair,
}

impl CleartextMessage {
    /// The protocol banner this device sends.
    pub fn banner() -> Self {
        Self::Dsms {
            version: PROTOCOL_VERSION,
        }
    }

    pub fn tag(&self) -> FourCc {
        match self {
            Self::Dsms { .. } => FourCc::DSMS,
            Self::Fnam(_) => FourCc::FNAM,
            Self::Avtr(_) => FourCc::AVTR,
            Self::Pubi(_) => FourCc::PUBI,
            Self::Pubk(_) => FourCc::PUBK,
            Self::Stls => FourCc::STLS,
            Self::Pair => FourCc::PAIR,
        }
    }

    /// Serializes the message body (without the frame header).
    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            Self::Dsms { version } => {
                let mut buf = Vec::with_capacity(MAGIC.len() + 2);
                buf.extend_from_slice(MAGIC);
                write_be16(&mut buf, *version);
                buf
            }
            Self::Fnam(name) => name.as_bytes().to_vec(),
            Self::Avtr(data) | Self::Pubi(data) | Self::Pubk(data) => data.clone(),
            Self::Stls | Self::Pair => Vec::new(),
        }
    }

    /// Interprets a decoded cleartext frame.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::UnknownTag`] for a tag outside the handshake set.
    /// - [`ProtocolError::BadMagic`] for a `dsms` banner with the wrong magic.
    /// - [`ProtocolError::Malformed`] for a truncated or oversized `dsms`
    ///   banner or a non-UTF-8 `fnam`.
    pub fn from_frame(frame: &CleartextFrame) -> Result<Self, ProtocolError> {
        let payload = frame.payload.as_slice();
        match frame.tag {
            FourCc::DSMS => decode_dsms(payload),
            FourCc::FNAM => String::from_utf8(payload.to_vec())
                .map(Self::Fnam)
                .map_err(|_| ProtocolError::Malformed("fnam is not valid UTF-8".to_string())),
            FourCc::AVTR => Ok(Self::Avtr(payload.to_vec())),
            FourCc::PUBI => Ok(Self::Pubi(payload.to_vec())),
            FourCc::PUBK => Ok(Self::Pubk(payload.to_vec())),
            FourCc::STLS => Ok(Self::Stls),
            FourCc::PAIR => Ok(Self::Pair),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

fn decode_dsms(payload: &[u8]) -> Result<CleartextMessage, ProtocolError> {
    let mut reader = ByteReader::new(payload);
    if !reader.check_ascii(MAGIC) {
        return Err(ProtocolError::BadMagic);
    }
    let version = reader
        .read_be16()
        .map_err(|_| ProtocolError::Malformed("dsms banner is truncated".to_string()))?;
    if !reader.is_empty() {
        return Err(ProtocolError::Malformed(format!(
            "dsms banner carries {} trailing bytes",
            reader.remaining()
        )));
    }
    Ok(CleartextMessage::Dsms { version })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
