//! Application services exposed over mux channels.
//!
//! A desktop opens a service by name with a channel-zero `open` request.
//! The [`ServiceRegistry`] maps that name to a constructor, the resulting
//! [`ServiceChannel`] is initialised with the request's init data, and from
//! then on every frame on the new channel ID goes to
//! [`ServiceChannel::process_message`].
//!
//! The set of channel implementations is closed: each one is a variant of
//! [`ServiceChannel`].  Adding a service means adding a variant and
//! registering a name for it, not implementing a trait object.
//!
//! # Services
//!
//! | Name       | Variant                    | Purpose                           |
//! |------------|----------------------------|-----------------------------------|
//! | `info`     | [`ServiceChannel::Info`]   | battery, IMEI, signal, clock      |
//! | `sms.send` | [`ServiceChannel::SendText`] | send and split text messages    |

pub mod info;
pub mod send_text;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

pub use info::{DeviceInfoProvider, InfoChannel, StaticDeviceInfo};
pub use send_text::{LogOnlyTextSender, SendTextChannel, TextSender};

/// Name under which the device-info service is registered.
pub const INFO_SERVICE: &str = "info";

/// Name under which the text-message service is registered.
pub const SEND_TEXT_SERVICE: &str = "sms.send";

/// Reasons a service refuses to start on a freshly opened channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The service could not initialise.
    #[error("service initialisation failed: {0}")]
    InitFailed(String),

    /// A capability the service needs has not been granted.
    #[error("missing permission: {0}")]
    NoPermission(String),
}

/// Collects the messages a service sends on its own channel.
///
/// The owning connection drains it after every call into the service and
/// frames each message with the channel's ID.
#[derive(Debug)]
pub struct ChannelSink {
    channel_id: u16,
    messages: Vec<Vec<u8>>,
}

impl ChannelSink {
    pub fn new(channel_id: u16) -> Self {
        Self {
            channel_id,
            messages: Vec::new(),
        }
    }

    pub fn channel_id(&self) -> u16 {
        self.channel_id
    }

    /// Queues one outbound message on this channel.
    pub fn send_message(&mut self, payload: Vec<u8>) {
        self.messages.push(payload);
    }

    pub fn into_messages(self) -> Vec<Vec<u8>> {
        self.messages
    }
}

/// A service bound to one mux channel.
#[derive(Debug)]
pub enum ServiceChannel {
    Info(InfoChannel),
    SendText(SendTextChannel),
}

impl ServiceChannel {
    /// Name the service was opened under.
    pub fn service_name(&self) -> &'static str {
        match self {
            Self::Info(_) => INFO_SERVICE,
            Self::SendText(_) => SEND_TEXT_SERVICE,
        }
    }

    /// Prepares the service using the init data from the `open` request.
    pub fn initialize(&mut self, init_data: &[u8]) -> Result<(), ServiceError> {
        match self {
            Self::Info(ch) => ch.initialize(init_data),
            Self::SendText(ch) => ch.initialize(init_data),
        }
    }

    /// Handles one inbound message; replies go to `sink`.
    pub fn process_message(&mut self, message: &[u8], sink: &mut ChannelSink) {
        match self {
            Self::Info(ch) => ch.process_message(message, sink),
            Self::SendText(ch) => ch.process_message(message, sink),
        }
    }
}

/// Constructor stored in the registry.
pub type ServiceFactory = Arc<dyn Fn() -> ServiceChannel + Send + Sync>;

/// Name → constructor map consulted by channel-zero `open`.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    factories: HashMap<String, ServiceFactory>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with `info` and `sms.send` registered.
    pub fn with_default_services(
        device_info: Arc<dyn DeviceInfoProvider>,
        text_sender: Arc<dyn TextSender>,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(INFO_SERVICE, move || {
            ServiceChannel::Info(InfoChannel::new(Arc::clone(&device_info)))
        });
        registry.register(SEND_TEXT_SERVICE, move || {
            ServiceChannel::SendText(SendTextChannel::new(Arc::clone(&text_sender)))
        });
        registry
    }

    /// Registers (or replaces) the constructor for `name`.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> ServiceChannel + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Instantiates a fresh, uninitialised channel for `name`.
    pub fn create(&self, name: &str) -> Option<ServiceChannel> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("ServiceRegistry")
            .field("services", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ServiceRegistry {
        ServiceRegistry::with_default_services(
            Arc::new(StaticDeviceInfo::default()),
            Arc::new(LogOnlyTextSender::default()),
        )
    }

    #[test]
    fn test_default_registry_knows_both_services() {
        let registry = registry();
        assert!(registry.contains("info"));
        assert!(registry.contains("sms.send"));
        assert!(!registry.contains("bogus"));
    }

    #[test]
    fn test_create_returns_fresh_channel_for_name() {
        // Arrange
        let registry = registry();

        // Act
        let channel = registry.create("sms.send").expect("registered");

        // Assert
        assert_eq!(channel.service_name(), "sms.send");
        assert!(registry.create("bogus").is_none());
    }

    #[test]
    fn test_channel_sink_collects_messages_in_order() {
        let mut sink = ChannelSink::new(4);
        sink.send_message(vec![1]);
        sink.send_message(vec![2]);
        assert_eq!(sink.channel_id(), 4);
        assert_eq!(sink.into_messages(), vec![vec![1], vec![2]]);
    }
}
