//! `info` service: answers device-status queries.
//!
//! A request is a sequence of 4-byte ID masks.  Each mask selects every known
//! value ID that matches it byte-for-byte, with `?` acting as a wildcard, so
//! `????` asks for everything.  The response concatenates one entry per
//! selected value:
//!
//! ```text
//! [id:4 ASCII][type:1][value...]
//! ```
//!
//! | ID     | Type         | Value                              |
//! |--------|--------------|------------------------------------|
//! | `batl` | Short (0x02) | battery charge in percent, -1 if unknown |
//! | `imei` | String (0x07)| BE16 length + UTF-8                |
//! | `sigs` | Byte (0x01)  | signal strength percent, -1 if unknown |
//! | `time` | Long (0x04)  | seconds since the Unix epoch       |
//!
//! Responses are split into several messages so that none exceeds
//! [`MAX_RESPONSE_LEN`] bytes.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use deskemes_core::protocol::wire::write_string;
use tracing::debug;

use super::{ChannelSink, ServiceError};

/// Largest response message the service emits.
pub const MAX_RESPONSE_LEN: usize = 65_000;

/// Value IDs the service knows, in response order.
pub const KNOWN_IDS: [&[u8; 4]; 4] = [b"batl", b"imei", b"sigs", b"time"];

/// Type codes prefixed to every value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueType {
    Byte = 0x01,
    Short = 0x02,
    Int = 0x03,
    Long = 0x04,
    Fixed32 = 0x05,
    Fixed64 = 0x06,
    String = 0x07,
}

/// A typed value ready for serialisation.
#[derive(Debug, Clone, PartialEq)]
pub enum InfoValue {
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Fixed32(f32),
    Fixed64(f64),
    String(String),
}

impl InfoValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Byte(_) => ValueType::Byte,
            Self::Short(_) => ValueType::Short,
            Self::Int(_) => ValueType::Int,
            Self::Long(_) => ValueType::Long,
            Self::Fixed32(_) => ValueType::Fixed32,
            Self::Fixed64(_) => ValueType::Fixed64,
            Self::String(_) => ValueType::String,
        }
    }

    /// Appends `[type][value]` to `buf`.
    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.value_type() as u8);
        match self {
            Self::Byte(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Self::Short(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Self::Int(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Self::Long(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Self::Fixed32(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Self::Fixed64(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Self::String(s) => {
                if write_string(buf, s).is_err() {
                    // Over-long strings are sent empty rather than dropped.
                    buf.extend_from_slice(&[0, 0]);
                }
            }
        }
    }
}

/// Source of device status values.
///
/// Implementations must answer immediately; they are called from the
/// connection loop.
pub trait DeviceInfoProvider: Send + Sync {
    /// Battery charge in percent, or `None` if unknown.
    fn battery_percent(&self) -> Option<i16>;

    /// Device IMEI, or `None` if unavailable.
    fn imei(&self) -> Option<String>;

    /// Signal strength in percent, or `None` if unknown.
    fn signal_percent(&self) -> Option<i8>;
}

/// Provider returning fixed values; used by the headless binary and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticDeviceInfo {
    pub battery_percent: Option<i16>,
    pub imei: Option<String>,
    pub signal_percent: Option<i8>,
}

impl DeviceInfoProvider for StaticDeviceInfo {
    fn battery_percent(&self) -> Option<i16> {
        self.battery_percent
    }

    fn imei(&self) -> Option<String> {
        self.imei.clone()
    }

    fn signal_percent(&self) -> Option<i8> {
        self.signal_percent
    }
}

/// Channel state of one open `info` service.
pub struct InfoChannel {
    provider: Arc<dyn DeviceInfoProvider>,
}

impl fmt::Debug for InfoChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfoChannel").finish_non_exhaustive()
    }
}

impl InfoChannel {
    pub fn new(provider: Arc<dyn DeviceInfoProvider>) -> Self {
        Self { provider }
    }

    /// The service needs no init data and no permissions.
    pub fn initialize(&mut self, _init_data: &[u8]) -> Result<(), ServiceError> {
        Ok(())
    }

    pub fn process_message(&mut self, message: &[u8], sink: &mut ChannelSink) {
        if message.len() % 4 != 0 {
            debug!(
                "info request of {} bytes has a partial trailing mask; ignoring it",
                message.len()
            );
        }

        let mut response = Vec::new();
        let mut entry = Vec::new();
        for mask in message.chunks_exact(4) {
            for id in KNOWN_IDS.iter().filter(|id| matches_mask(id, mask)) {
                entry.clear();
                entry.extend_from_slice(&id[..]);
                self.value_for(id).write_to(&mut entry);
                if response.len() + entry.len() > MAX_RESPONSE_LEN {
                    sink.send_message(std::mem::take(&mut response));
                }
                response.extend_from_slice(&entry);
            }
        }
        if !response.is_empty() {
            sink.send_message(response);
        }
    }

    fn value_for(&self, id: &[u8; 4]) -> InfoValue {
        match id {
            b"batl" => InfoValue::Short(self.provider.battery_percent().unwrap_or(-1)),
            b"imei" => InfoValue::String(self.provider.imei().unwrap_or_default()),
            b"sigs" => InfoValue::Byte(self.provider.signal_percent().unwrap_or(-1)),
            _ => InfoValue::Long(unix_seconds()),
        }
    }
}

/// Returns `true` if `id` matches `mask`, where `?` in the mask matches any byte.
fn matches_mask(id: &[u8; 4], mask: &[u8]) -> bool {
    id.iter()
        .zip(mask)
        .all(|(&i, &m)| m == b'?' || m == i)
}

fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
