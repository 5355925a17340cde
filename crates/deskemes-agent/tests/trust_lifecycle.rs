//! Integration tests for the file-backed trust store.
//!
//! Each test works in its own directory under the system temp dir and
//! reopens the store from disk to check what actually got persisted.

use std::path::PathBuf;

use deskemes_agent::infrastructure::crypto::LocalKeyPair;
use deskemes_agent::infrastructure::storage::trust_store::{
    ApprovedPeers, FilePeerStore, TrustError, TrustStore,
};
use deskemes_core::PublicId;

fn temp_store_path(test: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("deskemes-trust-{test}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir.join("peers.toml")
}

fn open(path: &PathBuf) -> ApprovedPeers<FilePeerStore> {
    ApprovedPeers::open(FilePeerStore::new(path)).unwrap()
}

#[test]
fn test_approved_peer_survives_reopen_with_same_keys() {
    // Arrange
    let path = temp_store_path("reopen");
    let id = PublicId::new(b"abc".to_vec());
    let key_pair = LocalKeyPair::generate().unwrap();
    {
        let store = open(&path);
        store
            .store_unapproved("Desktop", &id, b"desktop-key", key_pair.clone())
            .unwrap();
        store.approve(&id).unwrap();
    }

    // Act
    let reopened = open(&path);
    let record = reopened.lookup(&id).unwrap();

    // Assert
    assert!(record.approved);
    assert_eq!(record.friendly_name, "Desktop");
    assert_eq!(record.remote_public_key.as_deref(), Some(&b"desktop-key"[..]));
    assert_eq!(record.local_public_key(), Some(key_pair.public_key_der()));
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn test_unapproved_peer_is_persisted_as_unapproved() {
    let path = temp_store_path("unapproved");
    let id = PublicId::new(b"abc".to_vec());
    {
        let store = open(&path);
        let key_pair = store.generate_key_pair().unwrap();
        store
            .store_unapproved("Desktop", &id, b"desktop-key", key_pair)
            .unwrap();
    }

    let record = open(&path).lookup(&id).unwrap();

    assert!(!record.approved);
    assert!(record.local_key_pair.is_some());
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn test_second_store_unapproved_replaces_first_on_disk() {
    // Arrange
    let path = temp_store_path("replace");
    let id = PublicId::new(b"abc".to_vec());
    let store = open(&path);
    let first = store.generate_key_pair().unwrap();
    let second = store.generate_key_pair().unwrap();

    // Act
    store.store_unapproved("Old name", &id, b"old-key", first).unwrap();
    store.store_unapproved("New name", &id, b"new-key", second.clone()).unwrap();

    // Assert
    let reopened = open(&path);
    assert_eq!(reopened.len(), 1);
    let record = reopened.lookup(&id).unwrap();
    assert_eq!(record.friendly_name, "New name");
    assert_eq!(record.local_key_pair, Some(second));
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn test_approving_unknown_peer_fails_and_writes_nothing() {
    // Arrange
    let path = temp_store_path("unknown");
    let store = open(&path);

    // Act
    let result = store.approve(&PublicId::new(b"nobody".to_vec()));

    // Assert
    assert!(matches!(result, Err(TrustError::NoKeyMaterial(_))));
    assert!(open(&path).is_empty());
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}
