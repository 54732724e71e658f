//! TTL boundary condition tests.
//!
//! Sessions and temp documents both rely on TTL for their inactivity expiry,
//! so zero, very large and refreshed TTLs must behave predictably.

#![allow(clippy::expect_used, clippy::panic)]

use std::time::Duration;

use bytes::Bytes;
use sigbroker_storage::{MemoryBackend, StorageBackend, testutil::temp_fs_backend};

#[tokio::test]
async fn zero_ttl_is_immediately_expired() {
    let backend = MemoryBackend::new();

    backend
        .set_with_ttl(b"zero-ttl".to_vec(), b"ephemeral".to_vec(), Duration::ZERO)
        .await
        .expect("set_with_ttl with zero duration should succeed");

    let result = backend.get(b"zero-ttl").await.expect("get should not error");
    assert_eq!(result, None, "a key with zero TTL should be expired on the next read");
}

#[tokio::test]
async fn zero_ttl_excluded_from_prefix_scan() {
    let backend = MemoryBackend::new();

    backend.set(b"p:a".to_vec(), b"permanent".to_vec()).await.expect("set");
    backend.set_with_ttl(b"p:b".to_vec(), b"ghost".to_vec(), Duration::ZERO).await.expect("ttl");
    backend.set(b"p:c".to_vec(), b"also-permanent".to_vec()).await.expect("set");

    let results = backend.get_prefix(b"p:").await.expect("get_prefix");
    assert_eq!(results.len(), 2, "zero-TTL key should be filtered from prefix results");
    assert_eq!(results[0].value, Bytes::from("permanent"));
    assert_eq!(results[1].value, Bytes::from("also-permanent"));
}

#[tokio::test]
async fn very_large_ttl_does_not_overflow() {
    let backend = MemoryBackend::new();
    let ten_years = Duration::from_secs(10 * 365 * 24 * 3600);

    backend.set_with_ttl(b"long".to_vec(), b"v".to_vec(), ten_years).await.expect("set_with_ttl");
    assert_eq!(backend.get(b"long").await.expect("get"), Some(Bytes::from("v")));

    let (_dir, fs) = temp_fs_backend().await;
    fs.set_with_ttl(b"long".to_vec(), b"v".to_vec(), Duration::MAX).await.expect("fs set_with_ttl");
    assert_eq!(fs.get(b"long").await.expect("fs get"), Some(Bytes::from("v")));
}

#[tokio::test(start_paused = true)]
async fn refreshing_ttl_extends_lifetime() {
    let backend = MemoryBackend::new();

    backend
        .set_with_ttl(b"session".to_vec(), b"v1".to_vec(), Duration::from_secs(10))
        .await
        .expect("set");
    tokio::time::advance(Duration::from_secs(8)).await;

    // A commit rewrites the entry with a fresh inactivity window.
    backend
        .set_with_ttl(b"session".to_vec(), b"v2".to_vec(), Duration::from_secs(10))
        .await
        .expect("refresh");
    tokio::time::advance(Duration::from_secs(8)).await;

    assert_eq!(backend.get(b"session").await.expect("get"), Some(Bytes::from("v2")));

    tokio::time::advance(Duration::from_secs(3)).await;
    assert_eq!(backend.get(b"session").await.expect("get"), None);
}

#[tokio::test(start_paused = true)]
async fn key_alive_just_before_boundary() {
    let backend = MemoryBackend::new();

    backend
        .set_with_ttl(b"edge".to_vec(), b"v".to_vec(), Duration::from_millis(100))
        .await
        .expect("set");
    tokio::time::advance(Duration::from_millis(99)).await;
    assert!(backend.get(b"edge").await.expect("get").is_some());

    tokio::time::advance(Duration::from_millis(1)).await;
    assert_eq!(backend.get(b"edge").await.expect("get"), None, "expiry instant is exclusive");
}
