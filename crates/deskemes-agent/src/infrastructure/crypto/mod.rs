//! Per-peer key material and the TLS session that replaces the cleartext
//! protocol once both sides have sent `stls`.
//!
//! - **`keys`** – [`LocalKeyPair`]: the key pair this device generates for
//!   one specific desktop, plus the self-signed certificate built from it.
//! - **`tls`** – [`TlsSession`]: a sans-IO `rustls` client whose server
//!   certificate is pinned to the desktop's stored public key.

pub mod keys;
pub mod tls;

use thiserror::Error;

pub use keys::LocalKeyPair;
pub use tls::{PinnedServerVerifier, TlsSession};

/// Errors raised by key handling and the TLS engine.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The key generator failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Stored key bytes could not be parsed.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// A certificate could not be built or parsed.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// The TLS engine rejected the session.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Moving bytes in or out of the TLS engine failed.
    #[error("TLS I/O error: {0}")]
    Io(#[from] std::io::Error),
}
