//! Tests for the content-addressed store.
//!
//! Validates verified pushes, tag resolution, bounded reads, and that a
//! failed push never leaves a visible blob behind.

use forge_deployer::error::{Error, ErrorKind};
use forge_deployer::storage::{ContentStore, Descriptor, sha256_digest};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const MEDIA: &str = "application/octet-stream";

fn open_store(temp: &TempDir) -> ContentStore {
    ContentStore::open(temp.path().join("store")).unwrap()
}

// =============================================================================
// Push Tests
// =============================================================================

#[tokio::test]
async fn test_push_and_fetch_round_trip() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp);
    let cancel = CancellationToken::new();

    let desc = Descriptor::for_bytes(MEDIA, b"hello world");
    store.push(&cancel, &desc, &b"hello world"[..]).await.unwrap();

    assert!(store.exists(&desc));
    let data = store.read_bounded(&cancel, &desc, 1024).await.unwrap();
    assert_eq!(data, b"hello world");
}

#[tokio::test]
async fn test_push_digest_mismatch_leaves_nothing() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp);
    let cancel = CancellationToken::new();

    let desc = Descriptor::new(MEDIA, sha256_digest(b"content A"), 9);
    let err = store.push(&cancel, &desc, &b"content B"[..]).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DigestMismatch);
    assert!(!store.exists(&desc));
    assert!(!store.blob_path(&desc.digest).unwrap().exists());
}

#[tokio::test]
async fn test_push_size_mismatch() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp);
    let cancel = CancellationToken::new();

    let short = Descriptor::new(MEDIA, sha256_digest(b"abc"), 2);
    let err = store.push(&cancel, &short, &b"abc"[..]).await.unwrap_err();
    assert!(matches!(err, Error::SizeMismatch { expected: 2, .. }));

    let long = Descriptor::new(MEDIA, sha256_digest(b"abc"), 10);
    let err = store.push(&cancel, &long, &b"abc"[..]).await.unwrap_err();
    assert!(matches!(err, Error::SizeMismatch { expected: 10, actual: 3, .. }));

    assert!(!store.exists(&short));
    assert!(!store.exists(&long));
}

#[tokio::test]
async fn test_push_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp);
    let cancel = CancellationToken::new();

    let desc = Descriptor::for_bytes(MEDIA, b"same");
    store.push(&cancel, &desc, &b"same"[..]).await.unwrap();
    // Present blobs are not re-read, so a bogus reader is fine
    store.push(&cancel, &desc, &b"ignored"[..]).await.unwrap();

    assert_eq!(store.read_bounded(&cancel, &desc, 64).await.unwrap(), b"same");
}

#[tokio::test]
async fn test_push_cancelled() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let desc = Descriptor::for_bytes(MEDIA, b"data");
    let err = store.push(&cancel, &desc, &b"data"[..]).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(!store.exists(&desc));
}

// =============================================================================
// Digest Validation Tests
// =============================================================================

#[test]
fn test_blob_path_rejects_malformed_digests() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp);

    for digest in [
        "md5:abc",
        "sha256:../../etc/passwd",
        "sha256:ABCDEF",
        &format!("sha256:{}", "g".repeat(64)),
    ] {
        let err = store.blob_path(digest).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRef, "{} should be rejected", digest);
    }

    let ok = sha256_digest(b"x");
    assert!(store.blob_path(&ok).unwrap().starts_with(store.root()));
}

// =============================================================================
// Tags and Reads
// =============================================================================

#[tokio::test]
async fn test_tag_and_resolve() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp);
    let desc = Descriptor::for_bytes(MEDIA, b"manifest");

    store.tag(&desc, "ghcr.io/org/module:v1").unwrap();
    assert_eq!(store.resolve("ghcr.io/org/module:v1").unwrap(), desc);
    assert_eq!(store.resolve("ghcr.io/org/module:v2").unwrap_err().kind(), ErrorKind::NotFound);
    assert!(store.tag(&desc, "").is_err());

    store.close();
    assert!(store.resolve("ghcr.io/org/module:v1").is_err());
}

#[tokio::test]
async fn test_read_bounded_enforces_limit() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp);
    let cancel = CancellationToken::new();

    let desc = Descriptor::for_bytes(MEDIA, b"0123456789");
    store.push(&cancel, &desc, &b"0123456789"[..]).await.unwrap();

    assert_eq!(store.read_bounded(&cancel, &desc, 10).await.unwrap().len(), 10);
    let err = store.read_bounded(&cancel, &desc, 9).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceLimit);
}

#[tokio::test]
async fn test_fetch_missing_blob() {
    let temp = TempDir::new().unwrap();
    let store = open_store(&temp);

    let desc = Descriptor::for_bytes(MEDIA, b"never pushed");
    let err = store.fetch(&CancellationToken::new(), &desc).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_remove_and_reopen() {
    let temp = TempDir::new().unwrap();
    let cancel = CancellationToken::new();
    let desc = Descriptor::for_bytes(MEDIA, b"persisted");

    {
        let store = open_store(&temp);
        store.push(&cancel, &desc, &b"persisted"[..]).await.unwrap();
    }

    // Blobs survive a reopen
    let store = open_store(&temp);
    assert!(store.exists(&desc));

    store.remove(&desc).await.unwrap();
    store.remove(&desc).await.unwrap();
    assert!(!store.exists(&desc));
}
