//! `sms.send` service: sends text messages on the desktop's behalf.
//!
//! Every inbound message starts with a big-endian 32-bit type:
//!
//! | Type   | Body                                         | Success reply |
//! |--------|----------------------------------------------|---------------|
//! | `send` | BE16-length recipient, BE16-length message   | `[0x02]`      |
//! | `dvde` | UTF-8 message text (rest of the frame)       | `[0x02]` then BE16-length part per message part |
//!
//! Failures are reported as `[0x01][code:BE16][UTF-8 description]`.
//! Messages shorter than four bytes are dropped without a reply.

use std::fmt;
use std::sync::Arc;

use deskemes_core::protocol::wire::{write_be16, write_string, ByteReader};
use tracing::{debug, info, warn};

use super::{ChannelSink, ServiceError};

const MSG_SEND: u32 = u32::from_be_bytes(*b"send");
const MSG_DIVIDE: u32 = u32::from_be_bytes(*b"dvde");

const RESP_ERROR: u8 = 0x01;
const RESP_SUCCESS: u8 = 0x02;

/// Error codes carried in `[0x01]` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SendTextErrorCode {
    UnsupportedMessageType = 0x0001,
    MalformedRequest = 0x0007,
    SendingFailed = 0x1000,
    DividingFailed = 0x1001,
}

/// Platform hook that actually delivers text messages.
pub trait TextSender: Send + Sync {
    /// Whether the device allows this application to send messages.
    fn has_permission(&self) -> bool {
        true
    }

    /// Sends `message` to `recipient`; `Err` carries a human-readable reason.
    fn send_text(&self, recipient: &str, message: &str) -> Result<(), String>;

    /// Splits `message` into the parts the network would send.
    fn divide_text(&self, message: &str) -> Result<Vec<String>, String>;
}

/// Sender that only logs; used when no telephony backend is available.
#[derive(Debug, Clone)]
pub struct LogOnlyTextSender {
    /// Maximum characters per part when dividing.
    pub part_len: usize,
}

impl Default for LogOnlyTextSender {
    fn default() -> Self {
        Self { part_len: 160 }
    }
}

impl TextSender for LogOnlyTextSender {
    fn send_text(&self, recipient: &str, message: &str) -> Result<(), String> {
        info!(
            "Would send a {}-character text message to {recipient}",
            message.chars().count()
        );
        Ok(())
    }

    fn divide_text(&self, message: &str) -> Result<Vec<String>, String> {
        if self.part_len == 0 {
            return Err("part length is zero".to_string());
        }
        let chars: Vec<char> = message.chars().collect();
        Ok(chars
            .chunks(self.part_len)
            .map(|part| part.iter().collect())
            .collect())
    }
}

/// Channel state of one open `sms.send` service.
pub struct SendTextChannel {
    sender: Arc<dyn TextSender>,
}

impl fmt::Debug for SendTextChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendTextChannel").finish_non_exhaustive()
    }
}

impl SendTextChannel {
    pub fn new(sender: Arc<dyn TextSender>) -> Self {
        Self { sender }
    }

    /// Refuses to open when the platform denies the send permission.
    pub fn initialize(&mut self, _init_data: &[u8]) -> Result<(), ServiceError> {
        if self.sender.has_permission() {
            Ok(())
        } else {
            Err(ServiceError::NoPermission("SEND_SMS".to_string()))
        }
    }

    pub fn process_message(&mut self, message: &[u8], sink: &mut ChannelSink) {
        let mut reader = ByteReader::new(message);
        let msg_type = match reader.read_be32() {
            Ok(t) => t,
            Err(_) => {
                debug!("Dropping a {}-byte sms.send message", message.len());
                return;
            }
        };

        match msg_type {
            MSG_SEND => self.process_send(&mut reader, sink),
            MSG_DIVIDE => self.process_divide(reader.read_rest(), sink),
            _ => send_error(
                sink,
                SendTextErrorCode::UnsupportedMessageType,
                "Unknown message type",
            ),
        }
    }

    fn process_send(&self, reader: &mut ByteReader<'_>, sink: &mut ChannelSink) {
        let (recipient, text) = match (reader.read_string(), reader.read_string()) {
            (Ok(r), Ok(t)) => (r, t),
            _ => {
                debug!("Incomplete `send` message on channel {}", sink.channel_id());
                send_error(
                    sink,
                    SendTextErrorCode::MalformedRequest,
                    "The protocol message is incomplete",
                );
                return;
            }
        };

        match self.sender.send_text(&recipient, &text) {
            Ok(()) => sink.send_message(vec![RESP_SUCCESS]),
            Err(e) => {
                warn!("Failed to send text message: {e}");
                send_error(
                    sink,
                    SendTextErrorCode::SendingFailed,
                    &format!("Sending failed: {e}"),
                );
            }
        }
    }

    fn process_divide(&self, body: &[u8], sink: &mut ChannelSink) {
        let text = String::from_utf8_lossy(body);
        let parts = match self.sender.divide_text(&text) {
            Ok(parts) => parts,
            Err(e) => {
                send_error(
                    sink,
                    SendTextErrorCode::DividingFailed,
                    &format!("Dividing failed: {e}"),
                );
                return;
            }
        };

        let mut resp = vec![RESP_SUCCESS];
        for part in &parts {
            if let Err(e) = write_string(&mut resp, part) {
                send_error(
                    sink,
                    SendTextErrorCode::DividingFailed,
                    &format!("Failed to construct a response: {e}"),
                );
                return;
            }
        }
        sink.send_message(resp);
    }
}

fn send_error(sink: &mut ChannelSink, code: SendTextErrorCode, message: &str) {
    let mut resp = vec![RESP_ERROR];
    write_be16(&mut resp, code as u16);
    resp.extend_from_slice(message.as_bytes());
    sink.send_message(resp);
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every call; fails when `fail` is set.
    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(String, String)>>,
        fail: bool,
        denied: bool,
    }

    impl TextSender for RecordingSender {
        fn has_permission(&self) -> bool {
            !self.denied
        }

        fn send_text(&self, recipient: &str, message: &str) -> Result<(), String> {
            if self.fail {
                return Err("radio off".to_string());
            }
            self.sent
                .lock()
                .unwrap()
                .push((recipient.to_string(), message.to_string()));
            Ok(())
        }

        fn divide_text(&self, message: &str) -> Result<Vec<String>, String> {
            if self.fail {
                return Err("radio off".to_string());
            }
            Ok(message.split(' ').map(str::to_string).collect())
        }
    }

    fn run(sender: Arc<RecordingSender>, message: &[u8]) -> Vec<Vec<u8>> {
        let mut channel = SendTextChannel::new(sender);
        let mut sink = ChannelSink::new(3);
        channel.process_message(message, &mut sink);
        sink.into_messages()
    }

    fn send_request(recipient: &str, text: &str) -> Vec<u8> {
        let mut msg = b"send".to_vec();
        write_string(&mut msg, recipient).unwrap();
        write_string(&mut msg, text).unwrap();
        msg
    }

    #[test]
    fn test_send_delivers_and_replies_success() {
        // Arrange
        let sender = Arc::new(RecordingSender::default());

        // Act
        let replies = run(Arc::clone(&sender), &send_request("+420123", "hello"));

        // Assert
        assert_eq!(replies, vec![vec![0x02]]);
        assert_eq!(
            *sender.sent.lock().unwrap(),
            vec![("+420123".to_string(), "hello".to_string())]
        );
    }

    #[test]
    fn test_truncated_send_replies_malformed() {
        // Arrange: the message text length claims 10 bytes but only 2 follow.
        let mut msg = b"send".to_vec();
        write_string(&mut msg, "+1").unwrap();
        msg.extend_from_slice(&[0x00, 0x0A, b'h', b'i']);

        // Act
        let replies = run(Arc::new(RecordingSender::default()), &msg);

        // Assert
        let mut expected = vec![0x01, 0x00, 0x07];
        expected.extend_from_slice(b"The protocol message is incomplete");
        assert_eq!(replies, vec![expected]);
    }

    #[test]
    fn test_send_failure_reports_code_0x1000() {
        let sender = Arc::new(RecordingSender {
            fail: true,
            ..Default::default()
        });
        let replies = run(sender, &send_request("+1", "x"));
        assert_eq!(&replies[0][..3], &[0x01, 0x10, 0x00]);
        assert_eq!(&replies[0][3..], b"Sending failed: radio off");
    }

    #[test]
    fn test_divide_returns_length_prefixed_parts() {
        // Arrange
        let mut msg = b"dvde".to_vec();
        msg.extend_from_slice(b"ab cde");

        // Act
        let replies = run(Arc::new(RecordingSender::default()), &msg);

        // Assert
        assert_eq!(
            replies,
            vec![vec![0x02, 0x00, 0x02, b'a', b'b', 0x00, 0x03, b'c', b'd', b'e']]
        );
    }

    #[test]
    fn test_divide_failure_reports_code_0x1001() {
        let sender = Arc::new(RecordingSender {
            fail: true,
            ..Default::default()
        });
        let replies = run(sender, b"dvdetext");
        assert_eq!(&replies[0][..3], &[0x01, 0x10, 0x01]);
    }

    #[test]
    fn test_unknown_type_replies_unsupported() {
        let replies = run(Arc::new(RecordingSender::default()), b"zzzz");
        let mut expected = vec![0x01, 0x00, 0x01];
        expected.extend_from_slice(b"Unknown message type");
        assert_eq!(replies, vec![expected]);
    }

    #[test]
    fn test_short_message_is_dropped_silently() {
        let replies = run(Arc::new(RecordingSender::default()), b"sen");
        assert!(replies.is_empty());
    }

    #[test]
    fn test_initialize_without_permission_fails() {
        // Arrange
        let mut channel = SendTextChannel::new(Arc::new(RecordingSender {
            denied: true,
            ..Default::default()
        }));

        // Act
        let result = channel.initialize(&[]);

        // Assert
        assert_eq!(
            result,
            Err(ServiceError::NoPermission("SEND_SMS".to_string()))
        );
    }

    #[test]
    fn test_log_only_sender_divides_by_part_length() {
        let sender = LogOnlyTextSender { part_len: 3 };
        assert_eq!(
            sender.divide_text("abcdefg").unwrap(),
            vec!["abc", "def", "g"]
        );
    }
}
