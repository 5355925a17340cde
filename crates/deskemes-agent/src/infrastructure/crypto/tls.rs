//! Sans-IO TLS client used after the `stls` exchange.
//!
//! The phone is always the TLS client.  It presents a self-signed
//! certificate built from the [`LocalKeyPair`] generated for this desktop,
//! and accepts the desktop's certificate only if its public key equals the
//! key stored when the desktop was approved.  There is no certificate
//! authority involved: trust comes entirely from the pairing.
//!
//! # Driving the session (for beginners)
//!
//! `rustls` never touches a socket.  The owning connection moves bytes in
//! both directions:
//!
//! ```text
//! socket ──► read_ciphertext() ──► plaintext mux frames
//! mux frames ──► write_plaintext() ──► take_ciphertext() ──► socket
//! ```

use std::io::{Read, Write};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme};
use tracing::debug;

use super::{CryptoError, LocalKeyPair};

/// Server name sent in the ClientHello.  The pinned verifier ignores it.
pub const TLS_SERVER_NAME: &str = "deskemes";

/// Extracts the SubjectPublicKeyInfo DER from a certificate.
///
/// # Errors
///
/// [`CryptoError::Certificate`] if `cert_der` is not a parseable X.509 certificate.
pub fn subject_public_key_info(cert_der: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| CryptoError::Certificate(e.to_string()))?;
    Ok(cert.tbs_certificate.subject_pki.raw.to_vec())
}

/// Accepts exactly one server public key.
#[derive(Debug)]
pub struct PinnedServerVerifier {
    expected_public_key: Vec<u8>,
    provider: Arc<CryptoProvider>,
}

impl PinnedServerVerifier {
    pub fn new(expected_public_key: Vec<u8>, provider: Arc<CryptoProvider>) -> Self {
        Self {
            expected_public_key,
            provider,
        }
    }
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let presented = subject_public_key_info(end_entity.as_ref())
            .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;
        if presented == self.expected_public_key {
            Ok(ServerCertVerified::assertion())
        } else {
            debug!("Server certificate key does not match the approved peer's key");
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client side of one encrypted session.
pub struct TlsSession {
    conn: ClientConnection,
    peer_closed: bool,
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("handshaking", &self.conn.is_handshaking())
            .field("peer_closed", &self.peer_closed)
            .finish()
    }
}

impl TlsSession {
    /// Starts a session; the ClientHello is immediately available from
    /// [`take_ciphertext`](Self::take_ciphertext).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError`] if the client certificate cannot be built or
    /// `rustls` rejects the configuration.
    pub fn new(local_key: &LocalKeyPair, remote_public_key: &[u8]) -> Result<Self, CryptoError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = Arc::new(PinnedServerVerifier::new(
            remote_public_key.to_vec(),
            Arc::clone(&provider),
        ));
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(
                vec![local_key.self_signed_certificate()?],
                local_key.rustls_private_key(),
            )?;
        let server_name = ServerName::try_from(TLS_SERVER_NAME)
            .map_err(|e| CryptoError::Certificate(e.to_string()))?;

        let mut conn = ClientConnection::new(Arc::new(config), server_name)?;
        // The owning connection enforces its own buffer caps.
        conn.set_buffer_limit(None);
        Ok(Self {
            conn,
            peer_closed: false,
        })
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// `true` once the server has sent `close_notify`.
    pub fn peer_has_closed(&self) -> bool {
        self.peer_closed
    }

    /// Feeds bytes received from the socket and returns any decrypted plaintext.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Tls`] on any TLS failure, including a server
    /// certificate that does not match the pinned key.
    pub fn read_ciphertext(&mut self, mut ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut plaintext = Vec::new();
        while !ciphertext.is_empty() {
            let read = self.conn.read_tls(&mut ciphertext)?;
            let state = self.conn.process_new_packets()?;
            let available = state.plaintext_bytes_to_read();
            if available > 0 {
                let start = plaintext.len();
                plaintext.resize(start + available, 0);
                self.conn.reader().read_exact(&mut plaintext[start..])?;
            }
            if state.peer_has_closed() {
                self.peer_closed = true;
            }
            if read == 0 {
                break;
            }
        }
        Ok(plaintext)
    }

    /// Queues plaintext for encryption.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Io`] if the session is already closed for writing.
    pub fn write_plaintext(&mut self, plaintext: &[u8]) -> Result<(), CryptoError> {
        self.conn.writer().write_all(plaintext)?;
        Ok(())
    }

    /// Drains the TLS records waiting to be written to the socket.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Io`] if `rustls` fails to serialise a record.
    pub fn take_ciphertext(&mut self) -> Result<Vec<u8>, CryptoError> {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            self.conn.write_tls(&mut out)?;
        }
        Ok(out)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
