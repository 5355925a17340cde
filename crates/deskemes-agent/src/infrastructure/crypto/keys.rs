//! Local key pairs generated per remote peer.
//!
//! A fresh key pair is generated the first time a human starts approving a
//! desktop.  Its public half is sent to that desktop in `pubk`; its private
//! half signs the self-signed certificate this device presents as the TLS
//! client identity.  Both halves are persisted as DER so the pair can be
//! rebuilt after a restart:
//!
//! - private key: PKCS#8
//! - public key: SubjectPublicKeyInfo

use std::fmt;

use rcgen::{CertificateParams, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use super::CryptoError;

/// Subject name written into every self-signed certificate.
pub const CERTIFICATE_NAME: &str = "deskemes";

/// DER-encoded key pair owned by this device for one remote peer.
#[derive(Clone, PartialEq, Eq)]
pub struct LocalKeyPair {
    private_key_der: Vec<u8>,
    public_key_der: Vec<u8>,
}

impl LocalKeyPair {
    /// Generates a fresh ECDSA P-256 key pair.
    ///
    /// # Errors
    ///
    /// [`CryptoError::KeyGeneration`] if the system RNG or key generator fails.
    pub fn generate() -> Result<Self, CryptoError> {
        let key_pair = KeyPair::generate().map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Ok(Self::from_rcgen(&key_pair))
    }

    /// Rebuilds a key pair from its persisted PKCS#8 private key.
    ///
    /// # Errors
    ///
    /// [`CryptoError::InvalidKey`] if `der` is not a supported PKCS#8 key.
    pub fn from_private_key_der(der: &[u8]) -> Result<Self, CryptoError> {
        let key_pair = KeyPair::try_from(der).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self::from_rcgen(&key_pair))
    }

    fn from_rcgen(key_pair: &KeyPair) -> Self {
        Self {
            private_key_der: key_pair.serialize_der(),
            public_key_der: key_pair.public_key_der(),
        }
    }

    /// PKCS#8 DER of the private key.
    pub fn private_key_der(&self) -> &[u8] {
        &self.private_key_der
    }

    /// SubjectPublicKeyInfo DER of the public key; this is what `pubk` carries.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    /// The private key in the form `rustls` expects.
    pub fn rustls_private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.private_key_der.clone()))
    }

    /// Builds a self-signed certificate for this key pair.
    ///
    /// # Errors
    ///
    /// [`CryptoError::Certificate`] if the certificate cannot be signed.
    pub fn self_signed_certificate(&self) -> Result<CertificateDer<'static>, CryptoError> {
        let key_pair = KeyPair::try_from(self.private_key_der.as_slice())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let params = CertificateParams::new(vec![CERTIFICATE_NAME.to_string()])
            .map_err(|e| CryptoError::Certificate(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CryptoError::Certificate(e.to_string()))?;
        Ok(cert.der().clone())
    }
}

impl fmt::Debug for LocalKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKeyPair")
            .field("public_key_der_len", &self.public_key_der.len())
            .finish_non_exhaustive()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_produces_distinct_key_pairs() {
        let a = LocalKeyPair::generate().unwrap();
        let b = LocalKeyPair::generate().unwrap();
        assert_ne!(a.public_key_der(), b.public_key_der());
    }

    #[test]
    fn test_key_pair_survives_private_key_round_trip() {
        // Arrange
        let original = LocalKeyPair::generate().unwrap();

        // Act
        let restored = LocalKeyPair::from_private_key_der(original.private_key_der()).unwrap();

        // Assert
        assert_eq!(restored.public_key_der(), original.public_key_der());
    }

    #[test]
    fn test_from_private_key_der_rejects_garbage() {
        let result = LocalKeyPair::from_private_key_der(b"not a key");
        assert!(matches!(result, Err(CryptoError::InvalidKey(_))));
    }

    #[test]
    fn test_certificate_carries_the_public_key() {
        // Arrange
        let key_pair = LocalKeyPair::generate().unwrap();

        // Act
        let cert = key_pair.self_signed_certificate().unwrap();
        let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref()).unwrap();

        // Assert
        assert_eq!(parsed.tbs_certificate.subject_pki.raw, key_pair.public_key_der());
    }

    #[test]
    fn test_debug_does_not_print_private_key() {
        let key_pair = LocalKeyPair::generate().unwrap();
        let text = format!("{key_pair:?}");
        assert!(text.starts_with("LocalKeyPair"));
        assert!(!text.contains("private_key_der:"));
    }
}
