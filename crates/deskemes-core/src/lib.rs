//! # deskemes-core
//!
//! Shared, sans-IO foundation of the Deskemes phone agent: the binary wire
//! protocol, the UDP beacon format, and the primitives used while pairing
//! with a desktop peer.
//!
//! This crate never touches a socket, a thread, or the file system.  Every
//! function takes bytes in and hands bytes (or typed values) back, so the
//! whole protocol can be exercised from plain unit tests.
//!
//! # Architecture overview (for beginners)
//!
//! A Deskemes desktop broadcasts small UDP *beacons* on the LAN.  The phone
//! hears a beacon, dials the advertised TCP port, and the two sides run a
//! short cleartext handshake (exchange names, public IDs and public keys).
//! Once both sides trust each other they switch to TLS, and from then on the
//! single TCP connection carries many logical *mux channels*.
//!
//! - **`protocol`** – how bytes travel: primitive field encoding
//!   ([`protocol::wire`]), the two frame formats ([`protocol::codec`]), the
//!   cleartext handshake messages ([`protocol::messages`]), the channel-zero
//!   control protocol ([`protocol::control`]) and the beacon datagram
//!   ([`protocol::beacon`]).
//!
//! - **`domain`** – identity types shared by both sides of the handshake and
//!   the visual thumbprint a human compares while approving a pairing.

pub mod domain;
pub mod protocol;

pub use domain::identity::PublicId;
pub use domain::thumbprint::Thumbprint;
pub use protocol::beacon::{parse_beacon, Beacon};
pub use protocol::codec::{
    decode_cleartext_frame, decode_mux_frame, encode_cleartext_frame, encode_mux_frame,
    CleartextFrame, Decoded, MuxFrame, ProtocolError,
};
pub use protocol::control::{ControlMessage, ControlRequest, ErrorCode};
pub use protocol::messages::{CleartextMessage, FourCc};
pub use protocol::wire::WireError;
