//! Infrastructure layer for the phone agent.
//!
//! Contains everything that touches the outside world: UDP and TCP sockets,
//! TLS and key material, and files on disk.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `deskemes_core`, but MUST NOT be imported by `deskemes_core`.
//!
//! # Sub-modules
//!
//! - **`crypto`** – EC key pairs, self-signed certificates and the rustls
//!   session that pins the desktop's public key.
//!
//! - **`network`** – beacon listener, connection manager, per-connection
//!   handshake state machine and the mux channel table.
//!
//! - **`storage`** – the TOML agent config and the trust store of paired
//!   desktops.

pub mod crypto;
pub mod network;
pub mod storage;
