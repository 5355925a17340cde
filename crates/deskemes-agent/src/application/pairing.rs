//! PairingWorkflow: turns a pairing request into an approved peer.
//!
//! # Flow (for beginners)
//!
//! When a desktop that this phone does not trust yet finishes the cleartext
//! part of the handshake, its connection raises a [`PairingRequest`] and
//! waits.  The workflow then:
//!
//! 1. picks the local key pair for that desktop (the one already stored
//!    for its public ID, or a fresh one from the trust store),
//! 2. tells the waiting connection which public key to send (`pubk`),
//! 3. renders the [`Thumbprint`] both screens show,
//! 4. asks an [`Approver`] (the human) whether the pictures match,
//! 5. on approval stores the desktop's name and key with the key pair,
//!    marks the record approved and lets the connection continue into TLS.
//!
//! Nothing is written to the trust store before step 5.  A rejection leaves
//! any existing record, approved or not, exactly as it was, and the
//! connection waits until the handshake timeout closes it.
//!
//! # Architecture
//!
//! The workflow depends only on traits: [`TrustStore`] for key material,
//! [`PairingLink`] for reaching the connections, and [`Approver`] for the
//! decision.  All three are injected, so every step is unit-testable.

use std::collections::HashSet;
use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use deskemes_core::{PublicId, Thumbprint};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::infrastructure::network::connection::PairingRequest;
use crate::infrastructure::storage::trust_store::{PeerRecord, TrustError, TrustStore};

/// Error type for the pairing workflow.
#[derive(Debug, Error)]
pub enum PairingError {
    #[error(transparent)]
    Trust(#[from] TrustError),
    /// The connections could not be told about the pairing.
    #[error("could not reach connections: {0}")]
    Link(String),
}

/// What became of one pairing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingOutcome {
    Approved(PeerRecord),
    Rejected,
    /// Another request for the same public ID is still waiting for a decision.
    AlreadyPending,
}

/// Reaches the connections waiting on a pairing.
///
/// The connection manager handle implements this; tests record calls.
pub trait PairingLink: Send + Sync {
    /// Hands the local public key to every connection with `remote_public_id`.
    fn local_key_generated(
        &self,
        remote_public_id: PublicId,
        local_public_key: Vec<u8>,
    ) -> Result<(), String>;

    /// Resumes every connection to the approved peer.
    fn peer_approved(&self, record: PeerRecord) -> Result<(), String>;
}

/// Decides whether a desktop may pair.
#[async_trait]
pub trait Approver: Send + Sync {
    /// Returns `true` to trust `request`'s desktop.
    async fn decide(&self, request: &PairingRequest, thumbprint: &Thumbprint) -> bool;
}

/// Approves every request.  Only meant for trusted networks and testing.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprover;

#[async_trait]
impl Approver for AutoApprover {
    async fn decide(&self, request: &PairingRequest, _thumbprint: &Thumbprint) -> bool {
        info!(
            "Auto-approving \"{}\" ({})",
            request.friendly_name, request.remote_public_id
        );
        true
    }
}

/// Prints the thumbprint and asks on stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleApprover;

#[async_trait]
impl Approver for ConsoleApprover {
    async fn decide(&self, request: &PairingRequest, thumbprint: &Thumbprint) -> bool {
        let prompt = format!(
            "\nPairing request from \"{}\" at {} ({})\n{}\nDoes the desktop show the same picture? [y/N] ",
            request.friendly_name,
            request.remote_addr,
            request.remote_public_id,
            thumbprint.render()
        );
        let answer = tokio::task::spawn_blocking(move || {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(prompt.as_bytes());
            let _ = stdout.flush();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;

        match answer {
            Ok(Ok(line)) => is_yes(&line),
            Ok(Err(e)) => {
                warn!("Could not read approval from stdin: {e}");
                false
            }
            Err(e) => {
                warn!("Approval prompt task failed: {e}");
                false
            }
        }
    }
}

fn is_yes(line: &str) -> bool {
    matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Drives pairing requests to a decision.
pub struct PairingWorkflow {
    trust: Arc<dyn TrustStore>,
    link: Arc<dyn PairingLink>,
    approver: Arc<dyn Approver>,
    local_public_id: PublicId,
    pending: Mutex<HashSet<PublicId>>,
}

impl PairingWorkflow {
    pub fn new(
        trust: Arc<dyn TrustStore>,
        link: Arc<dyn PairingLink>,
        approver: Arc<dyn Approver>,
        local_public_id: PublicId,
    ) -> Self {
        Self {
            trust,
            link,
            approver,
            local_public_id,
            pending: Mutex::new(HashSet::new()),
        }
    }

    /// Handles one pairing request end to end.
    ///
    /// # Errors
    ///
    /// Returns [`PairingError::Trust`] if key material cannot be generated,
    /// stored, or approved (including [`TrustError::NoKeyMaterial`]), and
    /// [`PairingError::Link`] if the connection manager has stopped.
    pub async fn handle(&self, request: PairingRequest) -> Result<PairingOutcome, PairingError> {
        let id = request.remote_public_id.clone();
        if !self.lock_pending().insert(id.clone()) {
            debug!("Pairing with {id} is already waiting for a decision");
            return Ok(PairingOutcome::AlreadyPending);
        }

        let result = self.pair(&request).await;
        self.lock_pending().remove(&id);

        if let Err(e) = &result {
            warn!("Pairing with \"{}\" ({id}) failed: {e}", request.friendly_name);
        }
        result
    }

    async fn pair(&self, request: &PairingRequest) -> Result<PairingOutcome, PairingError> {
        let id = &request.remote_public_id;
        let key_pair = match self.trust.lookup(id).and_then(|record| record.local_key_pair) {
            Some(key_pair) => {
                debug!("Reusing stored key pair for {id}");
                key_pair
            }
            None => self.trust.generate_key_pair()?,
        };
        let local_public_key = key_pair.public_key_der().to_vec();
        self.link
            .local_key_generated(id.clone(), local_public_key.clone())
            .map_err(PairingError::Link)?;

        let thumbprint = Thumbprint::compute(
            id.as_bytes(),
            self.local_public_id.as_bytes(),
            &request.remote_public_key,
            &local_public_key,
        );
        if !self.approver.decide(request, &thumbprint).await {
            info!("Pairing with \"{}\" ({id}) rejected", request.friendly_name);
            return Ok(PairingOutcome::Rejected);
        }

        // The trust store is untouched until a human said yes.
        self.trust.store_unapproved(
            &request.friendly_name,
            id,
            &request.remote_public_key,
            key_pair,
        )?;
        let record = self.trust.approve(id)?;
        info!("Paired with \"{}\" ({id})", record.friendly_name);
        self.link
            .peer_approved(record.clone())
            .map_err(PairingError::Link)?;
        Ok(PairingOutcome::Approved(record))
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashSet<PublicId>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::Notify;

    use crate::infrastructure::crypto::LocalKeyPair;
    use crate::infrastructure::storage::trust_store::{ApprovedPeers, MockTrustStore};

    // ── Test doubles ──────────────────────────────────────────────────────────

    #[derive(Default)]
    struct RecordingLink {
        keys: Mutex<Vec<(PublicId, Vec<u8>)>>,
        approved: Mutex<Vec<PeerRecord>>,
    }

    impl PairingLink for RecordingLink {
        fn local_key_generated(&self, id: PublicId, key: Vec<u8>) -> Result<(), String> {
            self.keys.lock().unwrap().push((id, key));
            Ok(())
        }

        fn peer_approved(&self, record: PeerRecord) -> Result<(), String> {
            self.approved.lock().unwrap().push(record);
            Ok(())
        }
    }

    struct FixedApprover {
        answer: bool,
        seen: Mutex<Vec<Thumbprint>>,
    }

    impl FixedApprover {
        fn new(answer: bool) -> Self {
            Self {
                answer,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Approver for FixedApprover {
        async fn decide(&self, _request: &PairingRequest, thumbprint: &Thumbprint) -> bool {
            self.seen.lock().unwrap().push(thumbprint.clone());
            self.answer
        }
    }

    /// Approves once released, after announcing that it was asked.
    #[derive(Default)]
    struct GatedApprover {
        asked: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Approver for GatedApprover {
        async fn decide(&self, _request: &PairingRequest, _thumbprint: &Thumbprint) -> bool {
            self.asked.notify_one();
            self.release.notified().await;
            true
        }
    }

    const PHONE_ID: &[u8] = b"phone-id";

    fn request() -> PairingRequest {
        PairingRequest {
            friendly_name: "Desktop".to_string(),
            remote_public_id: PublicId::new(b"abc".to_vec()),
            remote_public_key: b"desktop-key".to_vec(),
            remote_addr: "192.168.1.20:9000".parse().unwrap(),
        }
    }

    fn workflow(
        trust: Arc<dyn TrustStore>,
        link: Arc<RecordingLink>,
        approver: Arc<dyn Approver>,
    ) -> PairingWorkflow {
        PairingWorkflow::new(trust, link, approver, PublicId::new(PHONE_ID.to_vec()))
    }

    #[tokio::test]
    async fn test_approved_request_stores_key_and_resumes_connections() {
        // Arrange
        let trust = Arc::new(ApprovedPeers::in_memory());
        let link = Arc::new(RecordingLink::default());
        let flow = workflow(trust.clone(), link.clone(), Arc::new(AutoApprover));

        // Act
        let outcome = flow.handle(request()).await.unwrap();

        // Assert
        let record = trust.lookup(&request().remote_public_id).unwrap();
        assert!(record.approved);
        assert_eq!(record.remote_public_key.as_deref(), Some(&b"desktop-key"[..]));
        assert_eq!(outcome, PairingOutcome::Approved(record.clone()));
        let keys = link.keys.lock().unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(Some(keys[0].1.as_slice()), record.local_public_key());
        assert_eq!(*link.approved.lock().unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn test_rejected_request_stores_nothing() {
        // Arrange
        let trust = Arc::new(ApprovedPeers::in_memory());
        let link = Arc::new(RecordingLink::default());
        let flow = workflow(trust.clone(), link.clone(), Arc::new(FixedApprover::new(false)));

        // Act
        let outcome = flow.handle(request()).await.unwrap();

        // Assert
        assert_eq!(outcome, PairingOutcome::Rejected);
        assert!(trust.lookup(&request().remote_public_id).is_none());
        assert_eq!(link.keys.lock().unwrap().len(), 1, "pubk is still sent");
        assert!(link.approved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_request_for_approved_peer_keeps_existing_pairing() {
        // Arrange
        let trust = Arc::new(ApprovedPeers::in_memory());
        let existing = LocalKeyPair::generate().unwrap();
        let id = request().remote_public_id;
        trust
            .store_unapproved("Desktop", &id, b"real-key", existing.clone())
            .unwrap();
        let before = trust.approve(&id).unwrap();
        let link = Arc::new(RecordingLink::default());
        let flow = workflow(trust.clone(), link.clone(), Arc::new(FixedApprover::new(false)));
        let impostor = PairingRequest {
            friendly_name: "Evil".to_string(),
            remote_public_key: b"impostor-key".to_vec(),
            ..request()
        };

        // Act
        let outcome = flow.handle(impostor).await.unwrap();

        // Assert
        assert_eq!(outcome, PairingOutcome::Rejected);
        assert_eq!(trust.lookup(&id), Some(before));
        assert!(link.approved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_approved_request_for_known_peer_replaces_key_and_keeps_key_pair() {
        // Arrange
        let trust = Arc::new(ApprovedPeers::in_memory());
        let existing = LocalKeyPair::generate().unwrap();
        let id = request().remote_public_id;
        trust
            .store_unapproved("Desktop", &id, b"old-key", existing.clone())
            .unwrap();
        trust.approve(&id).unwrap();
        let link = Arc::new(RecordingLink::default());
        let flow = workflow(trust.clone(), link.clone(), Arc::new(AutoApprover));

        // Act
        flow.handle(request()).await.unwrap();

        // Assert
        let record = trust.lookup(&id).unwrap();
        assert!(record.approved);
        assert_eq!(record.remote_public_key.as_deref(), Some(&b"desktop-key"[..]));
        assert_eq!(record.local_key_pair, Some(existing));
    }

    #[tokio::test]
    async fn test_stored_unapproved_key_pair_is_reused() {
        // Arrange
        let trust = Arc::new(ApprovedPeers::in_memory());
        let existing = LocalKeyPair::generate().unwrap();
        trust
            .store_unapproved("Desktop", &request().remote_public_id, b"old", existing.clone())
            .unwrap();
        let link = Arc::new(RecordingLink::default());
        let flow = workflow(trust.clone(), link.clone(), Arc::new(FixedApprover::new(false)));

        // Act
        flow.handle(request()).await.unwrap();

        // Assert
        let keys = link.keys.lock().unwrap();
        assert_eq!(keys[0].1, existing.public_key_der());
        let record = trust.lookup(&request().remote_public_id).unwrap();
        assert_eq!(record.remote_public_key.as_deref(), Some(&b"old"[..]));
        assert!(!record.approved);
    }

    #[tokio::test]
    async fn test_approver_sees_thumbprint_of_both_ids_and_keys() {
        // Arrange
        let trust = Arc::new(ApprovedPeers::in_memory());
        let link = Arc::new(RecordingLink::default());
        let approver = Arc::new(FixedApprover::new(true));
        let flow = workflow(trust, link.clone(), approver.clone());

        // Act
        flow.handle(request()).await.unwrap();

        // Assert
        let local_key = link.keys.lock().unwrap()[0].1.clone();
        let expected = Thumbprint::compute(b"abc", PHONE_ID, b"desktop-key", &local_key);
        assert_eq!(*approver.seen.lock().unwrap(), vec![expected]);
    }

    #[tokio::test]
    async fn test_duplicate_request_while_pending_is_coalesced() {
        // Arrange
        let trust = Arc::new(ApprovedPeers::in_memory());
        let link = Arc::new(RecordingLink::default());
        let approver = Arc::new(GatedApprover::default());
        let flow = Arc::new(workflow(trust, link.clone(), approver.clone()));
        let first = tokio::spawn({
            let flow = Arc::clone(&flow);
            async move { flow.handle(request()).await }
        });
        approver.asked.notified().await;

        // Act
        let second = flow.handle(request()).await.unwrap();
        approver.release.notify_one();
        let first = first.await.unwrap().unwrap();

        // Assert
        assert_eq!(second, PairingOutcome::AlreadyPending);
        assert!(matches!(first, PairingOutcome::Approved(_)));
        assert_eq!(link.keys.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_key_material_is_reported_and_nothing_resumes() {
        // Arrange
        let mut trust = MockTrustStore::new();
        trust.expect_lookup().returning(|_| None);
        trust
            .expect_generate_key_pair()
            .times(1)
            .returning(|| Ok(LocalKeyPair::generate().unwrap()));
        trust
            .expect_store_unapproved()
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        trust
            .expect_approve()
            .returning(|id| Err(TrustError::NoKeyMaterial(id.clone())));
        let link = Arc::new(RecordingLink::default());
        let flow = workflow(Arc::new(trust), link.clone(), Arc::new(AutoApprover));

        // Act
        let result = flow.handle(request()).await;

        // Assert
        assert!(matches!(
            result,
            Err(PairingError::Trust(TrustError::NoKeyMaterial(_)))
        ));
        assert!(link.approved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trust_store_is_not_written_before_approval() {
        // Arrange
        let mut trust = MockTrustStore::new();
        trust.expect_lookup().returning(|_| None);
        trust
            .expect_generate_key_pair()
            .times(1)
            .returning(|| Ok(LocalKeyPair::generate().unwrap()));
        trust.expect_store_unapproved().never();
        trust.expect_approve().never();
        let flow = workflow(
            Arc::new(trust),
            Arc::new(RecordingLink::default()),
            Arc::new(FixedApprover::new(false)),
        );

        // Act
        let outcome = flow.handle(request()).await.unwrap();

        // Assert
        assert_eq!(outcome, PairingOutcome::Rejected);
    }

    #[tokio::test]
    async fn test_pending_entry_is_released_after_failure() {
        // Arrange
        let mut trust = MockTrustStore::new();
        trust.expect_lookup().returning(|_| None);
        trust
            .expect_generate_key_pair()
            .returning(|| Err(TrustError::KeyGeneration("no entropy".to_string())));
        let flow = workflow(
            Arc::new(trust),
            Arc::new(RecordingLink::default()),
            Arc::new(AutoApprover),
        );

        // Act
        let first = flow.handle(request()).await;
        let second = flow.handle(request()).await;

        // Assert
        assert!(first.is_err());
        assert!(second.is_err(), "second attempt runs instead of being coalesced");
    }

    #[test]
    fn test_auto_approver_always_approves() {
        let thumbprint = Thumbprint::from_digest(&[0u8; 32]);

        let approved = tokio_test::block_on(AutoApprover.decide(&request(), &thumbprint));

        assert!(approved);
    }

    #[test]
    fn test_is_yes_accepts_only_affirmative_answers() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES \r\n"));
        assert!(!is_yes("\n"));
        assert!(!is_yes("no"));
    }
}
