//! Protocol module containing the wire primitives, frame codecs and message types.

pub mod beacon;
pub mod codec;
pub mod control;
pub mod messages;
pub mod sequence;
pub mod wire;

pub use codec::{Decoded, ProtocolError};
pub use messages::*;
pub use sequence::RequestIdCounter;
