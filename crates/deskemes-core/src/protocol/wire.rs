//! Primitive field encoding shared by every Deskemes frame format.
//!
//! All multi-byte integers are unsigned big-endian.  Variable-length fields
//! (blobs and strings) are prefixed with a 2-byte length:
//!
//! ```text
//! [len:BE16][bytes:len]
//! ```
//!
//! # Incomplete vs. malformed (for beginners)
//!
//! Bytes arrive from TCP in arbitrary chunks.  A reader that runs out of
//! buffered bytes in the middle of a field has not found *bad* data, only
//! *not enough* data.  [`ByteReader`] reports that case as
//! [`WireError::InsufficientData`] and never panics, so callers can keep the
//! buffer and retry once more bytes arrive.

use thiserror::Error;

/// Largest payload a 16-bit length prefix can describe.
pub const MAX_FIELD_LEN: usize = u16::MAX as usize;

/// Errors produced while reading or writing primitive fields.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes are buffered than the field declares.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// A field longer than a 16-bit length prefix can describe.
    #[error("payload of {0} bytes exceeds the 65535-byte field limit")]
    PayloadTooLarge(usize),

    /// A string field does not contain valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
}

/// Cursor over a borrowed byte slice that decodes primitive fields.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Number of bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Consumes exactly `n` bytes.
    ///
    /// # Errors
    ///
    /// [`WireError::InsufficientData`] if fewer than `n` bytes remain; the
    /// cursor is left untouched in that case.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::InsufficientData {
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Consumes every remaining byte.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_be16(&mut self) -> Result<u16, WireError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_be32(&mut self) -> Result<u32, WireError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a single byte and interprets any non-zero value as `true`.
    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a BE16-length-prefixed blob.
    ///
    /// When the prefix itself is readable but the body is not yet complete,
    /// the cursor is rewound to the start of the prefix.
    pub fn read_blob(&mut self) -> Result<&'a [u8], WireError> {
        let start = self.pos;
        let len = self.read_be16()? as usize;
        match self.read_bytes(len) {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                self.pos = start;
                Err(e)
            }
        }
    }

    /// Reads a BE16-length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, WireError> {
        let bytes = self.read_blob()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    /// Returns `true` and consumes the bytes if the next bytes equal `expected`.
    ///
    /// Returns `false` (consuming nothing) on mismatch or when not enough
    /// bytes are buffered.
    pub fn check_ascii(&mut self, expected: &[u8]) -> bool {
        if self.remaining() < expected.len() {
            return false;
        }
        if &self.buf[self.pos..self.pos + expected.len()] != expected {
            return false;
        }
        self.pos += expected.len();
        true
    }
}

// ── Writers ───────────────────────────────────────────────────────────────────

pub fn write_be16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub fn write_be32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Appends a BE16-length-prefixed blob.
///
/// # Errors
///
/// [`WireError::PayloadTooLarge`] if `data` is longer than 65535 bytes.
pub fn write_blob(buf: &mut Vec<u8>, data: &[u8]) -> Result<(), WireError> {
    let len = checked_len(data.len())?;
    write_be16(buf, len);
    buf.extend_from_slice(data);
    Ok(())
}

/// Appends a BE16-length-prefixed UTF-8 string.
pub fn write_string(buf: &mut Vec<u8>, s: &str) -> Result<(), WireError> {
    write_blob(buf, s.as_bytes())
}

/// Converts a payload length to its 16-bit wire form.
pub fn checked_len(len: usize) -> Result<u16, WireError> {
    u16::try_from(len).map_err(|_| WireError::PayloadTooLarge(len))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
