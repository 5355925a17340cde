//! Frame codecs for the two Deskemes TCP framings.
//!
//! Cleartext (handshake) frame:
//! ```text
//! [tag:4 ASCII][payload_len:BE16][payload:N]
//! ```
//!
//! Mux frame (inside the TLS stream, after `stls`):
//! ```text
//! [channel_id:BE16][payload_len:BE16][payload:N]
//! ```
//!
//! Decoding never fails on a short buffer: it returns [`Decoded::Incomplete`]
//! and the caller keeps the bytes until more arrive.  Neither frame layout
//! can be malformed at the framing level, so decoding has no error path at
//! all; interpretation errors surface later as [`ProtocolError`].

use crate::protocol::messages::FourCc;
use crate::protocol::wire::{checked_len, write_be16, write_be32, ByteReader, WireError};
use thiserror::Error;

/// Header size of a cleartext frame.
pub const CLEARTEXT_HEADER_LEN: usize = 6;

/// Header size of a mux frame.
pub const MUX_HEADER_LEN: usize = 4;

/// Errors raised while interpreting decoded frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A primitive field could not be read or written.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The `"Deskemes"` magic prefix is missing.
    #[error("missing Deskemes magic")]
    BadMagic,

    /// A cleartext message tag outside the handshake set.
    #[error("unknown message tag {0}")]
    UnknownTag(FourCc),

    /// A channel-zero kind byte that is not Request, Response or Error.
    #[error("unknown control message kind: 0x{0:02X}")]
    UnknownKind(u8),

    /// The payload could not be parsed.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Outcome of attempting to decode one frame from the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T> {
    /// A whole frame was available; `consumed` bytes may be discarded.
    Complete { frame: T, consumed: usize },
    /// At least `needed` bytes in total must be buffered before retrying.
    Incomplete { needed: usize },
}

/// One cleartext handshake frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleartextFrame {
    pub tag: FourCc,
    pub payload: Vec<u8>,
}

/// One multiplexed frame addressed to a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxFrame {
    pub channel_id: u16,
    pub payload: Vec<u8>,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a cleartext frame.
///
/// # Errors
///
/// [`WireError::PayloadTooLarge`] if `payload` exceeds 65535 bytes.
///
/// # Examples
///
/// ```rust
/// use deskemes_core::protocol::codec::{decode_cleartext_frame, encode_cleartext_frame, Decoded};
/// use deskemes_core::protocol::messages::FourCc;
///
/// let bytes = encode_cleartext_frame(FourCc::FNAM, b"Desktop").unwrap();
/// match decode_cleartext_frame(&bytes) {
///     Decoded::Complete { frame, consumed } => {
///         assert_eq!(frame.tag, FourCc::FNAM);
///         assert_eq!(consumed, bytes.len());
///     }
///     Decoded::Incomplete { .. } => unreachable!(),
/// }
/// ```
pub fn encode_cleartext_frame(tag: FourCc, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let len = checked_len(payload.len())?;
    let mut buf = Vec::with_capacity(CLEARTEXT_HEADER_LEN + payload.len());
    write_be32(&mut buf, tag.as_be32());
    write_be16(&mut buf, len);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decodes one cleartext frame from the beginning of `bytes`.
pub fn decode_cleartext_frame(bytes: &[u8]) -> Decoded<CleartextFrame> {
    let mut reader = ByteReader::new(bytes);
    let (tag, len) = match (reader.read_be32(), reader.read_be16()) {
        (Ok(tag), Ok(len)) => (FourCc::from_be32(tag), len),
        _ => {
            return Decoded::Incomplete {
                needed: CLEARTEXT_HEADER_LEN,
            }
        }
    };
    match reader.read_bytes(len as usize) {
        Ok(payload) => Decoded::Complete {
            frame: CleartextFrame {
                tag,
                payload: payload.to_vec(),
            },
            consumed: reader.position(),
        },
        Err(_) => Decoded::Incomplete {
            needed: CLEARTEXT_HEADER_LEN + len as usize,
        },
    }
}

/// Encodes a mux frame for `channel_id`.
///
/// # Errors
///
/// [`WireError::PayloadTooLarge`] if `payload` exceeds 65535 bytes.
pub fn encode_mux_frame(channel_id: u16, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let len = checked_len(payload.len())?;
    let mut buf = Vec::with_capacity(MUX_HEADER_LEN + payload.len());
    write_be16(&mut buf, channel_id);
    write_be16(&mut buf, len);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decodes one mux frame from the beginning of `bytes`.
pub fn decode_mux_frame(bytes: &[u8]) -> Decoded<MuxFrame> {
    let mut reader = ByteReader::new(bytes);
    let (channel_id, len) = match (reader.read_be16(), reader.read_be16()) {
        (Ok(channel_id), Ok(len)) => (channel_id, len),
        _ => {
            return Decoded::Incomplete {
                needed: MUX_HEADER_LEN,
            }
        }
    };
    match reader.read_bytes(len as usize) {
        Ok(payload) => Decoded::Complete {
            frame: MuxFrame {
                channel_id,
                payload: payload.to_vec(),
            },
            consumed: reader.position(),
        },
        Err(_) => Decoded::Incomplete {
            needed: MUX_HEADER_LEN + len as usize,
        },
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
