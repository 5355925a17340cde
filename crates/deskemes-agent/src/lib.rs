//! deskemes-agent library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does deskemes-agent do? (for beginners)
//!
//! The agent is the *phone* side of Deskemes.  A desktop running Deskemes
//! broadcasts UDP beacons on the LAN; the agent:
//!
//! 1. Listens for beacons and ignores addresses it is already talking to.
//! 2. Dials desktops it trusts (or any desktop in discovery mode) over TCP.
//! 3. Runs the cleartext handshake: banner, friendly name, public ID and
//!    public key.
//! 4. Asks the human to compare a thumbprint when the desktop is new.
//! 5. Upgrades the connection to TLS with both public keys pinned.
//! 6. Serves mux channels (`info`, `sms.send`) opened by the desktop.

/// Application layer: pairing workflow and channel services.
pub mod application;

/// Infrastructure layer: sockets, TLS, and storage.
pub mod infrastructure;
