//! Conformance test suite for [`StorageBackend`] implementations.
//!
//! Both the in-process and the shared-directory backend must honour the same
//! contract, because the broker swaps one for the other when
//! high-availability mode is switched on. Each function here checks one
//! aspect of that contract against a fresh backend.
//!
//! ```no_run
//! use std::sync::Arc;
//! use sigbroker_storage::{MemoryBackend, conformance};
//!
//! #[tokio::test]
//! async fn memory_backend_conformance() {
//!     conformance::run_all(Arc::new(MemoryBackend::new())).await;
//! }
//! ```
//!
//! | Category | Contract aspect |
//! |----------|-----------------|
//! | CRUD | Basic get/set/delete semantics |
//! | Prefix | `get_prefix` / `clear_prefix` ordering and boundaries |
//! | TTL | `set_with_ttl` expiration behavior |
//! | CAS | `compare_and_set`, `compare_and_delete` preconditions |
//! | Take | Exactly-once `take` |
//! | Concurrent | Thread-safety under parallel access |

use std::{sync::Arc, time::Duration};

use bytes::Bytes;

use crate::{assert_storage_error, backend::StorageBackend, error::StorageError};

// ============================================================================
// CRUD
// ============================================================================

/// `get` on a nonexistent key returns `Ok(None)`.
pub async fn crud_get_returns_none_for_missing_key<B: StorageBackend>(backend: &B) {
    let result = backend.get(b"nonexistent").await;
    assert!(result.is_ok(), "get should not error on missing key: {result:?}");
    assert_eq!(result.expect("checked above"), None, "missing key should return None");
}

/// `set` then `get` round-trips the value.
pub async fn crud_set_then_get_returns_value<B: StorageBackend>(backend: &B) {
    backend.set(b"k1".to_vec(), b"v1".to_vec()).await.expect("set should succeed");
    let val = backend.get(b"k1").await.expect("get should succeed");
    assert_eq!(val, Some(Bytes::from("v1")));
}

/// `set` on an existing key overwrites the value.
pub async fn crud_set_overwrites_existing<B: StorageBackend>(backend: &B) {
    backend.set(b"k1".to_vec(), b"original".to_vec()).await.expect("set");
    backend.set(b"k1".to_vec(), b"updated".to_vec()).await.expect("overwrite");
    let val = backend.get(b"k1").await.expect("get");
    assert_eq!(val, Some(Bytes::from("updated")));
}

/// `delete` twice is a silent no-op the second time.
pub async fn crud_delete_is_idempotent<B: StorageBackend>(backend: &B) {
    backend.set(b"k2".to_vec(), b"val".to_vec()).await.expect("set");
    backend.delete(b"k2").await.expect("first delete");
    backend.delete(b"k2").await.expect("second delete should be a no-op");
    assert_eq!(backend.get(b"k2").await.expect("get after delete"), None);
}

/// Keys are byte-level distinct: `"key"` and `"key\x00"` are different.
pub async fn crud_keys_are_byte_distinct<B: StorageBackend>(backend: &B) {
    backend.set(b"key".to_vec(), b"a".to_vec()).await.expect("set key");
    backend.set(b"key\x00".to_vec(), b"b".to_vec()).await.expect("set key+null");
    assert_eq!(backend.get(b"key").await.expect("get key"), Some(Bytes::from("a")));
    assert_eq!(backend.get(b"key\x00").await.expect("get key+null"), Some(Bytes::from("b")));
}

/// Document-sized binary values (1 MiB) round-trip byte for byte.
pub async fn crud_large_value_roundtrip<B: StorageBackend>(backend: &B) {
    let big: Vec<u8> = (0..1_048_576u32).map(|i| (i % 251) as u8).collect();
    backend.set(b"big".to_vec(), big.clone()).await.expect("set large value");
    let val = backend.get(b"big").await.expect("get large value");
    assert_eq!(val, Some(Bytes::from(big)));
}

// ============================================================================
// Prefix
// ============================================================================

/// `get_prefix` returns only matching keys, in key order.
pub async fn prefix_results_are_ordered_and_bounded<B: StorageBackend>(backend: &B) {
    for key in [b"p/c".as_slice(), b"p/a", b"p/b", b"q/a", b"p0"] {
        backend.set(key.to_vec(), b"v".to_vec()).await.expect("set");
    }
    let results = backend.get_prefix(b"p/").await.expect("get_prefix");
    let keys: Vec<&[u8]> = results.iter().map(|kv| kv.key.as_ref()).collect();
    assert_eq!(keys, vec![b"p/a".as_slice(), b"p/b", b"p/c"], "prefix results must be sorted");
}

/// `clear_prefix` removes matching keys and leaves the rest.
pub async fn prefix_clear_removes_only_matching<B: StorageBackend>(backend: &B) {
    for key in [b"c/1".as_slice(), b"c/2", b"d/1"] {
        backend.set(key.to_vec(), b"v".to_vec()).await.expect("set");
    }
    backend.clear_prefix(b"c/").await.expect("clear_prefix");
    assert!(backend.get_prefix(b"c/").await.expect("get_prefix").is_empty());
    assert_eq!(backend.get(b"d/1").await.expect("get"), Some(Bytes::from("v")));
}

// ============================================================================
// TTL
// ============================================================================

/// A key set with a TTL disappears once the TTL elapses.
pub async fn ttl_key_expires<B: StorageBackend>(backend: &B) {
    backend
        .set_with_ttl(b"ttl:k".to_vec(), b"v".to_vec(), Duration::from_millis(50))
        .await
        .expect("set_with_ttl");
    assert!(backend.get(b"ttl:k").await.expect("get").is_some(), "key should exist before TTL");

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(backend.get(b"ttl:k").await.expect("get"), None, "key should expire");
}

/// A plain `set` over a TTL key makes it permanent.
pub async fn ttl_overwrite_clears_ttl<B: StorageBackend>(backend: &B) {
    backend
        .set_with_ttl(b"ttl:o".to_vec(), b"temp".to_vec(), Duration::from_millis(50))
        .await
        .expect("set_with_ttl");
    backend.set(b"ttl:o".to_vec(), b"permanent".to_vec()).await.expect("set");

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(backend.get(b"ttl:o").await.expect("get"), Some(Bytes::from("permanent")));
}

/// Expired keys are excluded from prefix scans.
pub async fn ttl_expired_keys_excluded_from_prefix<B: StorageBackend>(backend: &B) {
    backend.set(b"tp/live".to_vec(), b"v".to_vec()).await.expect("set");
    backend
        .set_with_ttl(b"tp/dead".to_vec(), b"v".to_vec(), Duration::from_millis(50))
        .await
        .expect("set_with_ttl");

    tokio::time::sleep(Duration::from_millis(150)).await;
    let results = backend.get_prefix(b"tp/").await.expect("get_prefix");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].key, Bytes::from("tp/live"));
}

// ============================================================================
// CAS
// ============================================================================

/// `compare_and_set` with `expected: None` succeeds on an absent key.
pub async fn cas_insert_if_absent<B: StorageBackend>(backend: &B) {
    let result = backend.compare_and_set(b"cas:new", None, b"created".to_vec()).await;
    assert!(result.is_ok(), "CAS insert-if-absent should succeed: {result:?}");
    assert_eq!(backend.get(b"cas:new").await.expect("get"), Some(Bytes::from("created")));
}

/// `compare_and_set` with `expected: None` fails if the key exists.
pub async fn cas_insert_if_absent_fails_when_key_exists<B: StorageBackend>(backend: &B) {
    backend.set(b"cas:exists".to_vec(), b"val".to_vec()).await.expect("set");
    let result = backend.compare_and_set(b"cas:exists", None, b"nope".to_vec()).await;
    assert_storage_error!(result, Conflict, "CAS insert on existing key should conflict");
}

/// `compare_and_set` with a mismatched expected value leaves the value alone.
pub async fn cas_update_with_mismatched_value<B: StorageBackend>(backend: &B) {
    backend.set(b"cas:mm".to_vec(), b"actual".to_vec()).await.expect("set");
    let result = backend.compare_and_set(b"cas:mm", Some(b"wrong"), b"nope".to_vec()).await;
    assert_storage_error!(result, Conflict, "CAS mismatch should return Conflict");
    assert_eq!(backend.get(b"cas:mm").await.expect("get"), Some(Bytes::from("actual")));
}

/// A lease written with `compare_and_set_with_ttl` lapses and can be
/// re-acquired by another holder.
pub async fn cas_with_ttl_lease_lapses<B: StorageBackend>(backend: &B) {
    backend
        .compare_and_set_with_ttl(b"lease:x", None, b"node-a".to_vec(), Duration::from_millis(50))
        .await
        .expect("first acquire");
    let contended = backend
        .compare_and_set_with_ttl(b"lease:x", None, b"node-b".to_vec(), Duration::from_millis(50))
        .await;
    assert_storage_error!(contended, Conflict, "held lease must not be stolen");

    tokio::time::sleep(Duration::from_millis(150)).await;
    backend
        .compare_and_set_with_ttl(b"lease:x", None, b"node-b".to_vec(), Duration::from_secs(5))
        .await
        .expect("lapsed lease should be acquirable");
}

/// `compare_and_delete` removes only the expected value.
pub async fn cas_compare_and_delete<B: StorageBackend>(backend: &B) {
    backend.set(b"cad:k".to_vec(), b"owner-a".to_vec()).await.expect("set");
    let wrong = backend.compare_and_delete(b"cad:k", b"owner-b").await;
    assert_storage_error!(wrong, Conflict, "foreign owner must not release");

    backend.compare_and_delete(b"cad:k", b"owner-a").await.expect("owner releases");
    assert_eq!(backend.get(b"cad:k").await.expect("get"), None);
}

// ============================================================================
// Take
// ============================================================================

/// `take` returns the value once and `None` afterwards.
pub async fn take_returns_value_once<B: StorageBackend>(backend: &B) {
    backend.set(b"take:k".to_vec(), b"doc".to_vec()).await.expect("set");
    assert_eq!(backend.take(b"take:k").await.expect("take"), Some(Bytes::from("doc")));
    assert_eq!(backend.take(b"take:k").await.expect("second take"), None);
    assert_eq!(backend.get(b"take:k").await.expect("get"), None);
}

// ============================================================================
// Concurrent access
// ============================================================================

/// Concurrent `take` of one key: exactly one caller observes the value.
pub async fn concurrent_take_exactly_once<B: StorageBackend + 'static>(backend: Arc<B>) {
    backend.set(b"ctake:k".to_vec(), b"payload".to_vec()).await.expect("set");

    let mut handles = Vec::new();
    for _ in 0..10 {
        let backend = Arc::clone(&backend);
        handles.push(tokio::spawn(async move { backend.take(b"ctake:k").await }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.expect("task join").expect("take") {
            Some(value) => {
                assert_eq!(value, Bytes::from("payload"), "no partial data");
                winners += 1;
            },
            None => {},
        }
    }
    assert_eq!(winners, 1, "exactly one take should observe the value");
}

/// Concurrent CAS on the same key: exactly one writer wins.
pub async fn concurrent_cas_exactly_one_winner<B: StorageBackend + 'static>(backend: Arc<B>) {
    backend.compare_and_set(b"ccas:k", None, b"v0".to_vec()).await.expect("initial CAS");

    let mut handles = Vec::new();
    for i in 0u32..10 {
        let backend = Arc::clone(&backend);
        let new_val = format!("writer-{i}").into_bytes();
        handles.push(tokio::spawn(async move {
            backend.compare_and_set(b"ccas:k", Some(b"v0"), new_val).await
        }));
    }

    let mut successes = 0u32;
    let mut conflicts = 0u32;
    for handle in handles {
        match handle.await.expect("task join") {
            Ok(()) => successes += 1,
            Err(StorageError::Conflict) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }

    assert_eq!(successes, 1, "exactly one CAS writer should win");
    assert_eq!(conflicts, 9, "remaining writers should get Conflict");
}

/// `health_check` succeeds on a fresh backend.
pub async fn health_check_passes<B: StorageBackend>(backend: &B) {
    backend.health_check().await.expect("fresh backend should be healthy");
}

// ============================================================================
// Convenience runner
// ============================================================================

/// Run the full conformance suite against the given backend.
///
/// Keys used by the individual checks do not overlap, so one backend can
/// serve the whole run.
pub async fn run_all<B: StorageBackend + 'static>(backend: Arc<B>) {
    crud_get_returns_none_for_missing_key(backend.as_ref()).await;
    crud_set_then_get_returns_value(backend.as_ref()).await;
    crud_set_overwrites_existing(backend.as_ref()).await;
    crud_delete_is_idempotent(backend.as_ref()).await;
    crud_keys_are_byte_distinct(backend.as_ref()).await;
    crud_large_value_roundtrip(backend.as_ref()).await;

    prefix_results_are_ordered_and_bounded(backend.as_ref()).await;
    prefix_clear_removes_only_matching(backend.as_ref()).await;

    ttl_key_expires(backend.as_ref()).await;
    ttl_overwrite_clears_ttl(backend.as_ref()).await;
    ttl_expired_keys_excluded_from_prefix(backend.as_ref()).await;

    cas_insert_if_absent(backend.as_ref()).await;
    cas_insert_if_absent_fails_when_key_exists(backend.as_ref()).await;
    cas_update_with_mismatched_value(backend.as_ref()).await;
    cas_with_ttl_lease_lapses(backend.as_ref()).await;
    cas_compare_and_delete(backend.as_ref()).await;

    take_returns_value_once(backend.as_ref()).await;

    concurrent_take_exactly_once(Arc::clone(&backend)).await;
    concurrent_cas_exactly_one_winner(Arc::clone(&backend)).await;

    health_check_passes(backend.as_ref()).await;
}
