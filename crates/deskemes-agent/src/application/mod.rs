//! Application layer use cases for the phone agent.
//!
//! # What is the "application" layer? (for beginners)
//!
//! The application layer holds the decisions a user of the phone cares
//! about (should this desktop be trusted? what does the desktop get when it
//! asks for device info?) without knowing how bytes reach a socket.  The
//! infrastructure layer calls into it and is driven by it, but the code
//! here never opens a socket or a file itself.
//!
//! # Sub-modules
//!
//! - **`pairing`** – turns a pairing request from a connection into a key
//!   pair, a thumbprint shown to the human, and finally an approved peer.
//!
//! - **`services`** – the mux channel services a desktop can open once the
//!   connection is encrypted (`info` and `sms.send`).

pub mod pairing;
pub mod services;
