//! Trust store: the desktops this device knows and the keys it holds for them.
//!
//! # Pairing lifecycle (for beginners)
//!
//! Every desktop is identified by its *public ID*.  For each one the store
//! moves through three states:
//!
//! ```text
//! Unknown ──store_unapproved()──► KeysGenerated ──approve()──► Approved
//!    ▲                                 │  ▲
//!    └── (no record) ──────────────────┘  └── store_unapproved() replaces it
//! ```
//!
//! - **Unknown**: no record.  `lookup` returns `None`.
//! - **KeysGenerated**: a local key pair was generated for the desktop and
//!   stored together with the desktop's claimed public key and name.
//! - **Approved**: a human compared the thumbprints and accepted.  Later
//!   connections reuse the stored key pair and check the desktop's key
//!   against the stored one.
//!
//! Approving a desktop that never reached KeysGenerated fails with
//! [`TrustError::NoKeyMaterial`].
//!
//! # Persistence
//!
//! [`ApprovedPeers`] keeps every record in memory behind a mutex and writes
//! the full set through a [`PeerRecordStore`] after each change.
//! [`FilePeerStore`] writes a TOML file with base64-encoded keys;
//! [`MemoryPeerStore`] persists nothing and is used by tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use deskemes_core::PublicId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::infrastructure::crypto::LocalKeyPair;

/// Error type for trust store operations.
#[derive(Debug, Error)]
pub enum TrustError {
    /// `approve` was called for a peer with no stored key pair.
    #[error("no key material stored for peer {0}")]
    NoKeyMaterial(PublicId),

    /// A new local key pair could not be generated.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// The backing store could not be read or written.
    #[error("trust store persistence failed: {0}")]
    Storage(String),
}

/// Everything this device knows about one remote public ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub friendly_name: String,
    pub remote_public_id: PublicId,
    /// The remote's public key (SubjectPublicKeyInfo DER) once learned.
    pub remote_public_key: Option<Vec<u8>>,
    /// Key pair generated by this device for this peer.
    pub local_key_pair: Option<LocalKeyPair>,
    pub approved: bool,
}

impl PeerRecord {
    /// Public half of the local key pair, if one was generated.
    pub fn local_public_key(&self) -> Option<&[u8]> {
        self.local_key_pair.as_ref().map(LocalKeyPair::public_key_der)
    }
}

/// The trust operations the connection engine and pairing workflow need.
#[cfg_attr(test, mockall::automock)]
pub trait TrustStore: Send + Sync {
    /// Returns the record for `remote_public_id`; never mutates.
    fn lookup(&self, remote_public_id: &PublicId) -> Option<PeerRecord>;

    /// Generates a fresh key pair not yet tied to any peer.
    fn generate_key_pair(&self) -> Result<LocalKeyPair, TrustError>;

    /// Replaces any record for `remote_public_id` with a new unapproved one.
    fn store_unapproved(
        &self,
        friendly_name: &str,
        remote_public_id: &PublicId,
        remote_public_key: &[u8],
        key_pair: LocalKeyPair,
    ) -> Result<(), TrustError>;

    /// Marks an existing record approved and returns it.
    fn approve(&self, remote_public_id: &PublicId) -> Result<PeerRecord, TrustError>;
}

/// Where [`ApprovedPeers`] persists its records.
pub trait PeerRecordStore: Send + Sync {
    fn load(&self) -> Result<Vec<PeerRecord>, TrustError>;
    fn save(&self, records: &[PeerRecord]) -> Result<(), TrustError>;
}

/// In-memory trust store with write-through persistence.
#[derive(Debug)]
pub struct ApprovedPeers<S: PeerRecordStore> {
    records: Mutex<HashMap<PublicId, PeerRecord>>,
    store: S,
}

impl ApprovedPeers<MemoryPeerStore> {
    /// Creates an empty store that persists nothing.
    pub fn in_memory() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            store: MemoryPeerStore,
        }
    }
}

impl<S: PeerRecordStore> ApprovedPeers<S> {
    /// Loads all records from `store`.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::Storage`] if the backing store cannot be read.
    pub fn open(store: S) -> Result<Self, TrustError> {
        let records = store
            .load()?
            .into_iter()
            .map(|r| (r.remote_public_id.clone(), r))
            .collect::<HashMap<_, _>>();
        info!("Trust store loaded with {} peer record(s)", records.len());
        Ok(Self {
            records: Mutex::new(records),
            store,
        })
    }

    /// Number of records, approved or not.
    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn records(&self) -> MutexGuard<'_, HashMap<PublicId, PeerRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, records: &HashMap<PublicId, PeerRecord>) -> Result<(), TrustError> {
        let mut all: Vec<PeerRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| a.remote_public_id.cmp(&b.remote_public_id));
        self.store.save(&all)
    }
}

impl<S: PeerRecordStore> TrustStore for ApprovedPeers<S> {
    fn lookup(&self, remote_public_id: &PublicId) -> Option<PeerRecord> {
        self.records().get(remote_public_id).cloned()
    }

    fn generate_key_pair(&self) -> Result<LocalKeyPair, TrustError> {
        LocalKeyPair::generate().map_err(|e| TrustError::KeyGeneration(e.to_string()))
    }

    fn store_unapproved(
        &self,
        friendly_name: &str,
        remote_public_id: &PublicId,
        remote_public_key: &[u8],
        key_pair: LocalKeyPair,
    ) -> Result<(), TrustError> {
        let mut records = self.records();
        let mut updated = records.clone();
        updated.insert(
            remote_public_id.clone(),
            PeerRecord {
                friendly_name: friendly_name.to_string(),
                remote_public_id: remote_public_id.clone(),
                remote_public_key: Some(remote_public_key.to_vec()),
                local_key_pair: Some(key_pair),
                approved: false,
            },
        );
        self.persist(&updated)?;
        *records = updated;
        debug!("Stored unapproved peer {remote_public_id} ({friendly_name})");
        Ok(())
    }

    fn approve(&self, remote_public_id: &PublicId) -> Result<PeerRecord, TrustError> {
        let mut records = self.records();
        let mut updated = records.clone();
        let approved = match updated.get_mut(remote_public_id) {
            Some(record) if record.local_key_pair.is_some() => {
                record.approved = true;
                record.clone()
            }
            _ => return Err(TrustError::NoKeyMaterial(remote_public_id.clone())),
        };
        // Memory only changes once the new state is on disk.
        self.persist(&updated)?;
        *records = updated;
        info!(
            "Approved peer {} ({})",
            approved.remote_public_id, approved.friendly_name
        );
        Ok(approved)
    }
}

// ── Backing stores ────────────────────────────────────────────────────────────

/// Persists nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryPeerStore;

impl PeerRecordStore for MemoryPeerStore {
    fn load(&self) -> Result<Vec<PeerRecord>, TrustError> {
        Ok(Vec::new())
    }

    fn save(&self, _records: &[PeerRecord]) -> Result<(), TrustError> {
        Ok(())
    }
}

/// Persists records to a TOML file.
#[derive(Debug, Clone)]
pub struct FilePeerStore {
    path: PathBuf,
}

impl FilePeerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// On-disk layout of the trust store file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PeerFile {
    #[serde(default)]
    peers: Vec<StoredPeer>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredPeer {
    friendly_name: String,
    remote_public_id: PublicId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remote_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    local_private_key: Option<String>,
    #[serde(default)]
    approved: bool,
}

impl From<&PeerRecord> for StoredPeer {
    fn from(record: &PeerRecord) -> Self {
        Self {
            friendly_name: record.friendly_name.clone(),
            remote_public_id: record.remote_public_id.clone(),
            remote_public_key: record.remote_public_key.as_ref().map(|k| BASE64.encode(k)),
            local_private_key: record
                .local_key_pair
                .as_ref()
                .map(|kp| BASE64.encode(kp.private_key_der())),
            approved: record.approved,
        }
    }
}

impl TryFrom<StoredPeer> for PeerRecord {
    type Error = TrustError;

    fn try_from(stored: StoredPeer) -> Result<Self, TrustError> {
        let corrupt = |what: &str, e: &dyn std::fmt::Display| {
            TrustError::Storage(format!("{what} of peer {}: {e}", stored.remote_public_id))
        };
        let remote_public_key = stored
            .remote_public_key
            .as_deref()
            .map(|k| BASE64.decode(k))
            .transpose()
            .map_err(|e| corrupt("remote public key", &e))?;
        let local_key_pair = stored
            .local_private_key
            .as_deref()
            .map(|k| {
                let der = BASE64.decode(k).map_err(|e| corrupt("local private key", &e))?;
                LocalKeyPair::from_private_key_der(&der)
                    .map_err(|e| corrupt("local private key", &e))
            })
            .transpose()?;
        Ok(Self {
            friendly_name: stored.friendly_name,
            remote_public_id: stored.remote_public_id,
            remote_public_key,
            local_key_pair,
            approved: stored.approved,
        })
    }
}

impl PeerRecordStore for FilePeerStore {
    fn load(&self) -> Result<Vec<PeerRecord>, TrustError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(TrustError::Storage(format!(
                    "reading {}: {e}",
                    self.path.display()
                )))
            }
        };
        let file: PeerFile = toml::from_str(&content)
            .map_err(|e| TrustError::Storage(format!("parsing {}: {e}", self.path.display())))?;
        file.peers.into_iter().map(PeerRecord::try_from).collect()
    }

    fn save(&self, records: &[PeerRecord]) -> Result<(), TrustError> {
        let file = PeerFile {
            peers: records.iter().map(StoredPeer::from).collect(),
        };
        let content =
            toml::to_string_pretty(&file).map_err(|e| TrustError::Storage(e.to_string()))?;
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| {
                TrustError::Storage(format!("creating {}: {e}", dir.display()))
            })?;
        }
        std::fs::write(&self.path, content)
            .map_err(|e| TrustError::Storage(format!("writing {}: {e}", self.path.display())))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PublicId {
        PublicId::new(s.as_bytes().to_vec())
    }

    #[test]
    fn test_lookup_unknown_peer_returns_none() {
        let store = ApprovedPeers::in_memory();
        assert!(store.lookup(&id("abc")).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_store_unapproved_twice_keeps_last_write() {
        // Arrange
        let store = ApprovedPeers::in_memory();
        let first = store.generate_key_pair().unwrap();
        let second = store.generate_key_pair().unwrap();

        // Act
        store
            .store_unapproved("Old name", &id("abc"), b"key-1", first)
            .unwrap();
        store
            .store_unapproved("New name", &id("abc"), b"key-2", second.clone())
            .unwrap();

        // Assert
        assert_eq!(store.len(), 1);
        let record = store.lookup(&id("abc")).unwrap();
        assert_eq!(record.friendly_name, "New name");
        assert_eq!(record.remote_public_key.as_deref(), Some(&b"key-2"[..]));
        assert_eq!(record.local_key_pair, Some(second));
        assert!(!record.approved);
    }

    #[test]
    fn test_approve_without_key_material_fails() {
        // Arrange
        let store = ApprovedPeers::in_memory();

        // Act
        let result = store.approve(&id("abc"));

        // Assert
        assert!(matches!(result, Err(TrustError::NoKeyMaterial(ref p)) if *p == id("abc")));
        assert!(store.lookup(&id("abc")).is_none());
    }

    #[test]
    fn test_approve_after_store_unapproved_succeeds() {
        // Arrange
        let store = ApprovedPeers::in_memory();
        let key_pair = store.generate_key_pair().unwrap();
        store
            .store_unapproved("Desktop", &id("abc"), b"remote-key", key_pair)
            .unwrap();

        // Act
        let approved = store.approve(&id("abc")).unwrap();

        // Assert
        assert!(approved.approved);
        assert!(store.lookup(&id("abc")).unwrap().approved);
        assert!(approved.local_public_key().is_some());
    }

    /// Refuses to save any state that contains an approved record.
    struct RefusesApprovalStore;

    impl PeerRecordStore for RefusesApprovalStore {
        fn load(&self) -> Result<Vec<PeerRecord>, TrustError> {
            Ok(Vec::new())
        }

        fn save(&self, records: &[PeerRecord]) -> Result<(), TrustError> {
            if records.iter().any(|r| r.approved) {
                return Err(TrustError::Storage("disk full".to_string()));
            }
            Ok(())
        }
    }

    /// Refuses every save.
    struct BrokenStore;

    impl PeerRecordStore for BrokenStore {
        fn load(&self) -> Result<Vec<PeerRecord>, TrustError> {
            Ok(Vec::new())
        }

        fn save(&self, _records: &[PeerRecord]) -> Result<(), TrustError> {
            Err(TrustError::Storage("read-only".to_string()))
        }
    }

    #[test]
    fn test_failed_approval_save_leaves_peer_unapproved() {
        // Arrange
        let store = ApprovedPeers::open(RefusesApprovalStore).unwrap();
        let key_pair = store.generate_key_pair().unwrap();
        store
            .store_unapproved("Desktop", &id("abc"), b"remote-key", key_pair)
            .unwrap();

        // Act
        let result = store.approve(&id("abc"));

        // Assert
        assert!(matches!(result, Err(TrustError::Storage(_))));
        assert!(!store.lookup(&id("abc")).unwrap().approved);
    }

    #[test]
    fn test_failed_store_unapproved_save_keeps_previous_state() {
        // Arrange
        let store = ApprovedPeers::open(BrokenStore).unwrap();
        let key_pair = store.generate_key_pair().unwrap();

        // Act
        let result = store.store_unapproved("Desktop", &id("abc"), b"remote-key", key_pair);

        // Assert
        assert!(matches!(result, Err(TrustError::Storage(_))));
        assert!(store.lookup(&id("abc")).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_lookup_does_not_mutate() {
        let store = ApprovedPeers::in_memory();
        let _ = store.lookup(&id("abc"));
        let _ = store.lookup(&id("abc"));
        assert!(store.is_empty());
    }
}
