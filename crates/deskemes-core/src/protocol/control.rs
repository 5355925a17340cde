//! Channel-zero control protocol.
//!
//! Mux channel 0 always exists and carries three message kinds:
//!
//! ```text
//! Request:  [0x00][request_id:1][request_type:4 ASCII][body...]
//! Response: [0x01][request_id:1][payload...]
//! Error:    [0x02][request_id:1][error_code:BE16][message:UTF-8]
//! ```
//!
//! Request types understood by the agent:
//!
//! | Type   | Body                                              | Response payload     |
//! |--------|---------------------------------------------------|----------------------|
//! | `open` | BE16-len service name + BE16-len init data        | new channel ID BE16  |
//! | `clse` | channel ID BE16                                   | empty                |
//! | `ping` | arbitrary bytes                                   | the same bytes       |
//!
//! The request ID is echoed in the matching Response or Error so the sender
//! can correlate replies.

use crate::protocol::codec::ProtocolError;
use crate::protocol::messages::FourCc;
use crate::protocol::wire::{write_be16, write_be32, write_blob, write_string, ByteReader};

/// Channel ID of the control channel.
pub const CONTROL_CHANNEL_ID: u16 = 0;

/// Request type tags.
pub const REQ_OPEN: FourCc = FourCc(*b"open");
pub const REQ_CLOSE: FourCc = FourCc(*b"clse");
pub const REQ_PING: FourCc = FourCc(*b"ping");

/// The kind byte that starts every channel-zero message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlKind {
    Request = 0x00,
    Response = 0x01,
    Error = 0x02,
}

impl TryFrom<u8> for ControlKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x00 => Ok(ControlKind::Request),
            0x01 => Ok(ControlKind::Response),
            0x02 => Ok(ControlKind::Error),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// Error codes carried in channel-zero Error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    UnsupportedRequestType = 1,
    NoSuchService = 2,
    NoAvailableChannelId = 3,
    ServiceInitFailed = 4,
    ServiceNoPermission = 5,
    NoSuchChannel = 6,
    MalformedRequest = 7,
}

impl TryFrom<u16> for ErrorCode {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, u16> {
        match value {
            1 => Ok(Self::UnsupportedRequestType),
            2 => Ok(Self::NoSuchService),
            3 => Ok(Self::NoAvailableChannelId),
            4 => Ok(Self::ServiceInitFailed),
            5 => Ok(Self::ServiceNoPermission),
            6 => Ok(Self::NoSuchChannel),
            7 => Ok(Self::MalformedRequest),
            other => Err(other),
        }
    }
}

/// One channel-zero message.
///
/// Request bodies are kept raw so that a request with a well-formed header
/// but a malformed body can still be answered with
/// [`ErrorCode::MalformedRequest`] on the right request ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Request {
        request_id: u8,
        request_type: FourCc,
        body: Vec<u8>,
    },
    Response {
        request_id: u8,
        payload: Vec<u8>,
    },
    Error {
        request_id: u8,
        code: u16,
        message: String,
    },
}

impl ControlMessage {
    /// Builds a Request from a typed [`ControlRequest`].
    pub fn request(request_id: u8, request: &ControlRequest) -> Result<Self, ProtocolError> {
        Ok(Self::Request {
            request_id,
            request_type: request.request_type(),
            body: request.encode_body()?,
        })
    }

    pub fn response(request_id: u8, payload: Vec<u8>) -> Self {
        Self::Response {
            request_id,
            payload,
        }
    }

    pub fn error(request_id: u8, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            request_id,
            code: code as u16,
            message: message.into(),
        }
    }

    pub fn request_id(&self) -> u8 {
        match self {
            Self::Request { request_id, .. }
            | Self::Response { request_id, .. }
            | Self::Error { request_id, .. } => *request_id,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Request {
                request_id,
                request_type,
                body,
            } => {
                buf.push(ControlKind::Request as u8);
                buf.push(*request_id);
                write_be32(&mut buf, request_type.as_be32());
                buf.extend_from_slice(body);
            }
            Self::Response {
                request_id,
                payload,
            } => {
                buf.push(ControlKind::Response as u8);
                buf.push(*request_id);
                buf.extend_from_slice(payload);
            }
            Self::Error {
                request_id,
                code,
                message,
            } => {
                buf.push(ControlKind::Error as u8);
                buf.push(*request_id);
                write_be16(&mut buf, *code);
                buf.extend_from_slice(message.as_bytes());
            }
        }
        buf
    }

    /// Decodes one channel-zero payload.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::Wire`] when the payload is shorter than its header.
    /// - [`ProtocolError::UnknownKind`] for an unrecognised kind byte.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = ByteReader::new(payload);
        let kind = ControlKind::try_from(reader.read_u8()?)?;
        let request_id = reader.read_u8()?;
        match kind {
            ControlKind::Request => {
                let request_type = FourCc::from_be32(reader.read_be32()?);
                Ok(Self::Request {
                    request_id,
                    request_type,
                    body: reader.read_rest().to_vec(),
                })
            }
            ControlKind::Response => Ok(Self::Response {
                request_id,
                payload: reader.read_rest().to_vec(),
            }),
            ControlKind::Error => {
                let code = reader.read_be16()?;
                let message = String::from_utf8_lossy(reader.read_rest()).into_owned();
                Ok(Self::Error {
                    request_id,
                    code,
                    message,
                })
            }
        }
    }
}

/// A typed channel-zero request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    Open { service: String, init_data: Vec<u8> },
    Close { channel_id: u16 },
    Ping { data: Vec<u8> },
}

impl ControlRequest {
    pub fn request_type(&self) -> FourCc {
        match self {
            Self::Open { .. } => REQ_OPEN,
            Self::Close { .. } => REQ_CLOSE,
            Self::Ping { .. } => REQ_PING,
        }
    }

    pub fn encode_body(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::new();
        match self {
            Self::Open { service, init_data } => {
                write_string(&mut buf, service)?;
                write_blob(&mut buf, init_data)?;
            }
            Self::Close { channel_id } => write_be16(&mut buf, *channel_id),
            Self::Ping { data } => buf.extend_from_slice(data),
        }
        Ok(buf)
    }

    /// Parses a request body.
    ///
    /// Returns `Ok(None)` for a request type this side does not understand.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Malformed`] if the body of a known request type
    /// cannot be parsed.
    pub fn parse(request_type: FourCc, body: &[u8]) -> Result<Option<Self>, ProtocolError> {
        let mut reader = ByteReader::new(body);
        let malformed = |what: &str| ProtocolError::Malformed(format!("{request_type}: {what}"));
        match request_type {
            REQ_OPEN => {
                let service = reader
                    .read_string()
                    .map_err(|e| malformed(&format!("service name: {e}")))?;
                let init_data = reader
                    .read_blob()
                    .map_err(|e| malformed(&format!("init data: {e}")))?
                    .to_vec();
                Ok(Some(Self::Open { service, init_data }))
            }
            REQ_CLOSE => {
                let channel_id = reader
                    .read_be16()
                    .map_err(|e| malformed(&format!("channel id: {e}")))?;
                Ok(Some(Self::Close { channel_id }))
            }
            REQ_PING => Ok(Some(Self::Ping {
                data: reader.read_rest().to_vec(),
            })),
            _ => Ok(None),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_values_match_wire_protocol() {
        assert_eq!(ErrorCode::UnsupportedRequestType as u16, 1);
        assert_eq!(ErrorCode::NoSuchService as u16, 2);
        assert_eq!(ErrorCode::NoAvailableChannelId as u16, 3);
        assert_eq!(ErrorCode::ServiceInitFailed as u16, 4);
        assert_eq!(ErrorCode::ServiceNoPermission as u16, 5);
        assert_eq!(ErrorCode::NoSuchChannel as u16, 6);
        assert_eq!(ErrorCode::MalformedRequest as u16, 7);
        assert_eq!(ErrorCode::try_from(8), Err(8));
    }

    #[test]
    fn test_decode_ping_request() {
        // Arrange
        let payload = [0x00, 0x07, b'p', b'i', b'n', b'g', 0xAA, 0xBB];

        // Act
        let msg = ControlMessage::decode(&payload).unwrap();

        // Assert
        assert_eq!(
            msg,
            ControlMessage::Request {
                request_id: 7,
                request_type: REQ_PING,
                body: vec![0xAA, 0xBB],
            }
        );
    }

    #[test]
    fn test_encode_response_layout() {
        let msg = ControlMessage::response(7, vec![0xAA, 0xBB]);
        assert_eq!(msg.encode(), [0x01, 0x07, 0xAA, 0xBB]);
    }

    #[test]
    fn test_encode_error_layout() {
        // Arrange
        let msg = ControlMessage::error(3, ErrorCode::NoSuchService, "nope");

        // Act
        let bytes = msg.encode();

        // Assert
        assert_eq!(bytes, b"\x02\x03\x00\x02nope");
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        assert_eq!(
            ControlMessage::decode(&[0x09, 0x01]).unwrap_err(),
            ProtocolError::UnknownKind(0x09)
        );
    }

    #[test]
    fn test_decode_one_byte_payload_is_wire_error() {
        assert!(matches!(
            ControlMessage::decode(&[0x00]),
            Err(ProtocolError::Wire(_))
        ));
    }

    #[test]
    fn test_parse_open_request() {
        // Arrange
        let request = ControlRequest::Open {
            service: "info".to_string(),
            init_data: vec![1, 2],
        };
        let body = request.encode_body().unwrap();

        // Act
        let parsed = ControlRequest::parse(REQ_OPEN, &body).unwrap();

        // Assert
        assert_eq!(body, b"\x00\x04info\x00\x02\x01\x02");
        assert_eq!(parsed, Some(request));
    }

    #[test]
    fn test_parse_truncated_open_is_malformed() {
        let result = ControlRequest::parse(REQ_OPEN, b"\x00\x09inf");
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_parse_close_without_channel_id_is_malformed() {
        let result = ControlRequest::parse(REQ_CLOSE, &[0x01]);
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_parse_unknown_request_type_returns_none() {
        let result = ControlRequest::parse(FourCc(*b"zzzz"), b"").unwrap();
        assert_eq!(result, None);
    }
}
