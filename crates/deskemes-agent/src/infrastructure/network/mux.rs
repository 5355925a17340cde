//! Mux channel table: routes decrypted mux frames to channel handlers.
//!
//! Every encrypted connection owns one [`ChannelTable`].  Channel 0 is the
//! control channel and is handled by the table itself, so it always exists
//! and can never be closed.  Every other channel ID maps to a
//! [`ServiceChannel`] created by a remote `open` request.
//!
//! # Frame routing (for beginners)
//!
//! ```text
//! MuxFrame { channel_id: 0, .. }  ──► handle_control ──► Request  ─► open / clse / ping
//!                                                    └─► Response / Error ─► pending table
//! MuxFrame { channel_id: n, .. }  ──► channels[n].process_message
//! MuxFrame { channel_id: ?, .. }  ──► dropped (logged)
//! ```
//!
//! The table never performs I/O.  Each call returns the frames that must be
//! sent back, and the owning connection encrypts and queues them.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use deskemes_core::protocol::codec::MuxFrame;
use deskemes_core::protocol::control::CONTROL_CHANNEL_ID;
use deskemes_core::protocol::RequestIdCounter;
use deskemes_core::{ControlMessage, ControlRequest, ErrorCode, FourCc, ProtocolError};
use tracing::debug;

use crate::application::services::{ChannelSink, ServiceChannel, ServiceError, ServiceRegistry};

/// A control request this side sent and has not yet seen answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub request_type: FourCc,
    pub issued_at: Instant,
}

/// How a locally initiated request was answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Response(Vec<u8>),
    Error { code: u16, message: String },
}

/// Per-connection table of open mux channels.
#[derive(Debug)]
pub struct ChannelTable {
    registry: ServiceRegistry,
    channels: BTreeMap<u16, ServiceChannel>,
    request_ids: RequestIdCounter,
    pending: HashMap<u8, PendingRequest>,
}

impl ChannelTable {
    /// Creates a table holding only the control channel.
    pub fn new(registry: ServiceRegistry) -> Self {
        Self {
            registry,
            channels: BTreeMap::new(),
            request_ids: RequestIdCounter::new(),
            pending: HashMap::new(),
        }
    }

    /// Returns `true` if `channel_id` is open.  Channel 0 is always open.
    pub fn contains(&self, channel_id: u16) -> bool {
        channel_id == CONTROL_CHANNEL_ID || self.channels.contains_key(&channel_id)
    }

    /// IDs of the open service channels, ascending (channel 0 excluded).
    pub fn channel_ids(&self) -> Vec<u16> {
        self.channels.keys().copied().collect()
    }

    /// Number of control requests awaiting an answer.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Routes one inbound frame and returns the frames to send in reply.
    pub fn handle_frame(&mut self, frame: MuxFrame) -> Vec<MuxFrame> {
        if frame.channel_id == CONTROL_CHANNEL_ID {
            return self.handle_control(&frame.payload);
        }

        let Some(channel) = self.channels.get_mut(&frame.channel_id) else {
            debug!(
                "Dropping {} bytes for unknown channel {}",
                frame.payload.len(),
                frame.channel_id
            );
            return Vec::new();
        };

        let mut sink = ChannelSink::new(frame.channel_id);
        channel.process_message(&frame.payload, &mut sink);
        sink.into_messages()
            .into_iter()
            .map(|payload| MuxFrame {
                channel_id: frame.channel_id,
                payload,
            })
            .collect()
    }

    /// Builds a locally initiated control request and records it as pending.
    ///
    /// # Errors
    ///
    /// Returns the encoding error if the request body exceeds a field limit.
    pub fn send_request(&mut self, request: &ControlRequest) -> Result<MuxFrame, ProtocolError> {
        let request_id = self.request_ids.next();
        let message = ControlMessage::request(request_id, request)?;
        if self
            .pending
            .insert(
                request_id,
                PendingRequest {
                    request_type: request.request_type(),
                    issued_at: Instant::now(),
                },
            )
            .is_some()
        {
            debug!("Request ID {request_id} reused while still pending; older request forgotten");
        }
        Ok(control_frame(message))
    }

    /// Forgets pending requests issued more than `max_age` before `now`.
    ///
    /// Returns the number of entries removed.
    pub fn prune_pending(&mut self, max_age: Duration, now: Instant) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, p| now.saturating_duration_since(p.issued_at) <= max_age);
        before - self.pending.len()
    }

    // ── Control channel ──────────────────────────────────────────────────────

    fn handle_control(&mut self, payload: &[u8]) -> Vec<MuxFrame> {
        if payload.len() < 2 {
            debug!("Dropping a {}-byte control message", payload.len());
            return Vec::new();
        }

        let message = match ControlMessage::decode(payload) {
            Ok(m) => m,
            Err(e) => {
                debug!("Undecodable control message: {e}");
                // A Request whose header was cut short still has a usable ID.
                if payload[0] == 0x00 {
                    return vec![control_frame(ControlMessage::error(
                        payload[1],
                        ErrorCode::MalformedRequest,
                        "Request header is incomplete",
                    ))];
                }
                return Vec::new();
            }
        };

        match message {
            ControlMessage::Request {
                request_id,
                request_type,
                body,
            } => {
                let reply = self.handle_request(request_id, request_type, &body);
                vec![control_frame(reply)]
            }
            ControlMessage::Response {
                request_id,
                payload,
            } => {
                self.resolve(request_id, RequestOutcome::Response(payload));
                Vec::new()
            }
            ControlMessage::Error {
                request_id,
                code,
                message,
            } => {
                self.resolve(request_id, RequestOutcome::Error { code, message });
                Vec::new()
            }
        }
    }

    fn handle_request(&mut self, request_id: u8, request_type: FourCc, body: &[u8]) -> ControlMessage {
        let request = match ControlRequest::parse(request_type, body) {
            Ok(Some(r)) => r,
            Ok(None) => {
                debug!("Unsupported control request `{request_type}`");
                return ControlMessage::error(
                    request_id,
                    ErrorCode::UnsupportedRequestType,
                    format!(
                        "Unsupported request type: `{request_type}` ({:x})",
                        request_type.as_be32()
                    ),
                );
            }
            Err(e) => {
                debug!("Malformed control request: {e}");
                return ControlMessage::error(request_id, ErrorCode::MalformedRequest, e.to_string());
            }
        };

        match request {
            ControlRequest::Open { service, init_data } => {
                self.open_channel(request_id, &service, &init_data)
            }
            ControlRequest::Close { channel_id } => self.close_channel(request_id, channel_id),
            ControlRequest::Ping { data } => ControlMessage::response(request_id, data),
        }
    }

    fn open_channel(&mut self, request_id: u8, service: &str, init_data: &[u8]) -> ControlMessage {
        let Some(mut channel) = self.registry.create(service) else {
            return ControlMessage::error(
                request_id,
                ErrorCode::NoSuchService,
                format!("No such service: {service}"),
            );
        };

        if let Err(e) = channel.initialize(init_data) {
            return match e {
                ServiceError::InitFailed(msg) => ControlMessage::error(
                    request_id,
                    ErrorCode::ServiceInitFailed,
                    format!("Service init failed: {msg}"),
                ),
                ServiceError::NoPermission(permission) => {
                    ControlMessage::error(request_id, ErrorCode::ServiceNoPermission, permission)
                }
            };
        }

        let Some(channel_id) = self.lowest_free_id() else {
            return ControlMessage::error(
                request_id,
                ErrorCode::NoAvailableChannelId,
                "Too many open channels, no free ID to assign to the new channel",
            );
        };

        debug!("Opened channel {channel_id}: {service}");
        self.channels.insert(channel_id, channel);
        ControlMessage::response(request_id, channel_id.to_be_bytes().to_vec())
    }

    fn close_channel(&mut self, request_id: u8, channel_id: u16) -> ControlMessage {
        if channel_id == CONTROL_CHANNEL_ID {
            return ControlMessage::error(
                request_id,
                ErrorCode::NoSuchChannel,
                "Channel 0 cannot be closed",
            );
        }
        match self.channels.remove(&channel_id) {
            Some(channel) => {
                debug!("Closed channel {channel_id} ({})", channel.service_name());
                ControlMessage::response(request_id, Vec::new())
            }
            None => ControlMessage::error(request_id, ErrorCode::NoSuchChannel, "No such channel."),
        }
    }

    /// Lowest unused ID in `1..=65535`.
    fn lowest_free_id(&self) -> Option<u16> {
        let mut candidate: u16 = 1;
        for &used in self.channels.keys() {
            if used != candidate {
                break;
            }
            candidate = candidate.checked_add(1)?;
        }
        Some(candidate)
    }

    fn resolve(&mut self, request_id: u8, outcome: RequestOutcome) {
        match self.pending.remove(&request_id) {
            Some(pending) => debug!(
                "Control request {request_id} (`{}`) answered: {outcome:?}",
                pending.request_type
            ),
            None => debug!("Unsolicited control reply for request {request_id}: {outcome:?}"),
        }
    }
}

fn control_frame(message: ControlMessage) -> MuxFrame {
    MuxFrame {
        channel_id: CONTROL_CHANNEL_ID,
        payload: message.encode(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use deskemes_core::protocol::control::{REQ_CLOSE, REQ_OPEN};

    use crate::application::services::{LogOnlyTextSender, StaticDeviceInfo};

    fn table() -> ChannelTable {
        ChannelTable::new(ServiceRegistry::with_default_services(
            Arc::new(StaticDeviceInfo::default()),
            Arc::new(LogOnlyTextSender::default()),
        ))
    }

    fn control(payload: Vec<u8>) -> MuxFrame {
        MuxFrame {
            channel_id: 0,
            payload,
        }
    }

    fn request(request_id: u8, request: ControlRequest) -> MuxFrame {
        control(ControlMessage::request(request_id, &request).unwrap().encode())
    }

    fn open(request_id: u8, service: &str) -> MuxFrame {
        request(
            request_id,
            ControlRequest::Open {
                service: service.to_string(),
                init_data: Vec::new(),
            },
        )
    }

    fn single_reply(table: &mut ChannelTable, frame: MuxFrame) -> ControlMessage {
        let replies = table.handle_frame(frame);
        assert_eq!(replies.len(), 1, "expected exactly one reply: {replies:?}");
        assert_eq!(replies[0].channel_id, 0);
        ControlMessage::decode(&replies[0].payload).unwrap()
    }

    #[test]
    fn test_ping_echoes_trailing_bytes_with_same_request_id() {
        // Arrange
        let mut table = table();
        let ping = control(vec![0x00, 0x07, b'p', b'i', b'n', b'g', 0xAA, 0xBB]);

        // Act
        let reply = single_reply(&mut table, ping);

        // Assert
        assert_eq!(reply, ControlMessage::response(7, vec![0xAA, 0xBB]));
    }

    #[test]
    fn test_open_unknown_service_yields_no_such_service() {
        // Arrange
        let mut table = table();

        // Act
        let reply = single_reply(&mut table, open(42, "bogus"));

        // Assert
        match reply {
            ControlMessage::Error {
                request_id, code, ..
            } => {
                assert_eq!(request_id, 42);
                assert_eq!(code, ErrorCode::NoSuchService as u16);
            }
            other => panic!("expected Error, got {other:?}"),
        }
        assert!(table.channel_ids().is_empty());
    }

    #[test]
    fn test_open_allocates_lowest_free_id() {
        // Arrange
        let mut table = table();

        // Act
        let first = single_reply(&mut table, open(1, "info"));
        let second = single_reply(&mut table, open(2, "sms.send"));
        single_reply(&mut table, request(3, ControlRequest::Close { channel_id: 1 }));
        let third = single_reply(&mut table, open(4, "info"));

        // Assert
        assert_eq!(first, ControlMessage::response(1, vec![0x00, 0x01]));
        assert_eq!(second, ControlMessage::response(2, vec![0x00, 0x02]));
        assert_eq!(third, ControlMessage::response(4, vec![0x00, 0x01]));
        assert_eq!(table.channel_ids(), vec![1, 2]);
    }

    #[test]
    fn test_close_channel_zero_is_refused() {
        let mut table = table();
        let reply = single_reply(&mut table, request(5, ControlRequest::Close { channel_id: 0 }));
        assert!(matches!(
            reply,
            ControlMessage::Error { request_id: 5, code, .. } if code == ErrorCode::NoSuchChannel as u16
        ));
        assert!(table.contains(0));
    }

    #[test]
    fn test_close_unknown_channel_yields_no_such_channel() {
        let mut table = table();
        let reply = single_reply(&mut table, request(6, ControlRequest::Close { channel_id: 9 }));
        assert!(matches!(
            reply,
            ControlMessage::Error { code, .. } if code == ErrorCode::NoSuchChannel as u16
        ));
    }

    #[test]
    fn test_unsupported_request_type_is_reported() {
        let mut table = table();
        let reply = single_reply(&mut table, control(vec![0x00, 0x09, b'w', b'h', b'a', b't']));
        assert!(matches!(
            reply,
            ControlMessage::Error { request_id: 9, code, .. }
                if code == ErrorCode::UnsupportedRequestType as u16
        ));
    }

    #[test]
    fn test_malformed_open_and_close_bodies_are_reported() {
        // Arrange
        let mut table = table();
        let mut bad_open = vec![0x00, 0x0A];
        bad_open.extend_from_slice(&REQ_OPEN.0);
        bad_open.extend_from_slice(&[0x00, 0x05, b'i']);
        let mut bad_close = vec![0x00, 0x0B];
        bad_close.extend_from_slice(&REQ_CLOSE.0);
        bad_close.push(0x01);

        // Act
        let open_reply = single_reply(&mut table, control(bad_open));
        let close_reply = single_reply(&mut table, control(bad_close));

        // Assert
        for (reply, id) in [(open_reply, 0x0A), (close_reply, 0x0B)] {
            assert!(matches!(
                reply,
                ControlMessage::Error { request_id, code, .. }
                    if request_id == id && code == ErrorCode::MalformedRequest as u16
            ));
        }
    }

    #[test]
    fn test_short_control_frame_is_dropped() {
        let mut table = table();
        assert!(table.handle_frame(control(vec![0x00])).is_empty());
    }

    #[test]
    fn test_frame_for_unknown_channel_is_dropped() {
        let mut table = table();
        let frame = MuxFrame {
            channel_id: 77,
            payload: b"batl".to_vec(),
        };
        assert!(table.handle_frame(frame).is_empty());
    }

    #[test]
    fn test_service_replies_carry_their_channel_id() {
        // Arrange
        let mut table = table();
        single_reply(&mut table, open(1, "info"));

        // Act
        let replies = table.handle_frame(MuxFrame {
            channel_id: 1,
            payload: b"sigs".to_vec(),
        });

        // Assert
        assert_eq!(
            replies,
            vec![MuxFrame {
                channel_id: 1,
                payload: b"sigs\x01\xFF".to_vec(),
            }]
        );
    }

    #[test]
    fn test_response_resolves_pending_request() {
        // Arrange
        let mut table = table();
        let sent = table
            .send_request(&ControlRequest::Ping { data: vec![1] })
            .unwrap();
        let request_id = ControlMessage::decode(&sent.payload).unwrap().request_id();
        assert_eq!(table.pending_requests(), 1);

        // Act
        let replies =
            table.handle_frame(control(ControlMessage::response(request_id, vec![1]).encode()));

        // Assert
        assert!(replies.is_empty());
        assert_eq!(table.pending_requests(), 0);
    }

    #[test]
    fn test_unmatched_error_is_ignored() {
        let mut table = table();
        let frame = control(ControlMessage::error(200, ErrorCode::NoSuchChannel, "x").encode());
        assert!(table.handle_frame(frame).is_empty());
        assert_eq!(table.pending_requests(), 0);
    }

    #[test]
    fn test_prune_pending_drops_stale_entries() {
        // Arrange
        let mut table = table();
        table
            .send_request(&ControlRequest::Ping { data: Vec::new() })
            .unwrap();
        let later = Instant::now() + Duration::from_secs(120);

        // Act
        let removed = table.prune_pending(Duration::from_secs(60), later);

        // Assert
        assert_eq!(removed, 1);
        assert_eq!(table.pending_requests(), 0);
    }
}
