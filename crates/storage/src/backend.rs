//! Storage backend trait definition.
//!
//! [`StorageBackend`] is the byte-oriented key-value abstraction underneath
//! the broker's session store and temp document store. The in-process
//! [`MemoryBackend`](crate::MemoryBackend) serves single-node deployments;
//! the shared-directory [`FsBackend`](crate::FsBackend) is the medium that
//! lets several nodes serve the same transaction.
//!
//! # Design
//!
//! - **Keys and values are bytes**: no assumption about serialization format
//! - **Object safe**: stores hold an `Arc<dyn StorageBackend>` chosen once at startup
//! - **Atomic primitives only**: compare-and-set, compare-and-delete and take are enough to build
//!   leases and exactly-once retrieval on top

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{error::StorageResult, types::KeyValue};

/// Abstract storage backend for key-value operations.
///
/// Backends are thread-safe (`Send + Sync`) and support concurrent
/// operations from many request workers.
///
/// # Key Operations
///
/// | Method | Description |
/// |--------|-------------|
/// | [`get`](StorageBackend::get) | Retrieve a single value by key |
/// | [`set`](StorageBackend::set) | Store a key-value pair |
/// | [`set_with_ttl`](StorageBackend::set_with_ttl) | Store with automatic expiration |
/// | [`compare_and_set`](StorageBackend::compare_and_set) | Atomic compare-and-swap |
/// | [`compare_and_delete`](StorageBackend::compare_and_delete) | Delete only if unchanged |
/// | [`take`](StorageBackend::take) | Atomic get-and-delete |
/// | [`delete`](StorageBackend::delete) | Remove a key |
/// | [`get_prefix`](StorageBackend::get_prefix) | Retrieve every key under a prefix |
/// | [`clear_prefix`](StorageBackend::clear_prefix) | Delete every key under a prefix |
/// | [`health_check`](StorageBackend::health_check) | Verify backend availability |
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use sigbroker_storage::{MemoryBackend, StorageBackend};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let backend = MemoryBackend::new();
///
/// backend.set(b"key".to_vec(), b"value".to_vec()).await.unwrap();
/// assert_eq!(backend.take(b"key").await.unwrap(), Some(Bytes::from("value")));
/// assert_eq!(backend.get(b"key").await.unwrap(), None);
/// # });
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Retrieves a value by key.
    ///
    /// Expired entries are reported as absent even if the background sweep
    /// has not removed them yet.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Stores a key-value pair, clearing any TTL previously set on the key.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()>;

    /// Stores a key-value pair that expires after `ttl`.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()>;

    /// Atomically sets a key's value if it matches the expected current value.
    ///
    /// - **`expected: None`**: insert-if-absent. An expired key counts as absent.
    /// - **`expected: Some(value)`**: update-if-unchanged, exact byte comparison.
    ///
    /// On success any existing TTL on the key is cleared.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Conflict`](crate::StorageError::Conflict): the precondition did not hold.
    #[must_use = "compare-and-set may fail with a conflict and errors must be handled"]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()>;

    /// Same as [`compare_and_set`](StorageBackend::compare_and_set) but the
    /// stored value expires after `ttl`.
    ///
    /// This is the primitive behind cross-node leases: a holder that dies
    /// leaves a lease that lapses on its own.
    #[must_use = "compare-and-set may fail with a conflict and errors must be handled"]
    async fn compare_and_set_with_ttl(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Duration,
    ) -> StorageResult<()>;

    /// Deletes a key only if its current value equals `expected`.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Conflict`](crate::StorageError::Conflict): the key is absent or holds a
    ///   different value.
    #[must_use = "compare-and-delete may fail with a conflict and errors must be handled"]
    async fn compare_and_delete(&self, key: &[u8], expected: &[u8]) -> StorageResult<()>;

    /// Atomically reads and removes a key.
    ///
    /// Of several concurrent callers taking the same key, at most one
    /// observes the value; the rest observe `None`.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn take(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Deletes a key. Deleting a missing key is a no-op.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn delete(&self, key: &[u8]) -> StorageResult<()>;

    /// Retrieves every live key-value pair whose key starts with `prefix`,
    /// ordered by key.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<KeyValue>>;

    /// Deletes every key starting with `prefix`.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn clear_prefix(&self, prefix: &[u8]) -> StorageResult<()>;

    /// Verifies the backend can serve traffic.
    #[must_use = "health check results indicate backend availability and must be inspected"]
    async fn health_check(&self) -> StorageResult<()>;
}

#[async_trait]
impl<T: StorageBackend + ?Sized> StorageBackend for Arc<T> {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        (**self).get(key).await
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        (**self).set(key, value).await
    }

    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        (**self).set_with_ttl(key, value, ttl).await
    }

    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        (**self).compare_and_set(key, expected, new_value).await
    }

    async fn compare_and_set_with_ttl(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Duration,
    ) -> StorageResult<()> {
        (**self).compare_and_set_with_ttl(key, expected, new_value, ttl).await
    }

    async fn compare_and_delete(&self, key: &[u8], expected: &[u8]) -> StorageResult<()> {
        (**self).compare_and_delete(key, expected).await
    }

    async fn take(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        (**self).take(key).await
    }

    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        (**self).delete(key).await
    }

    async fn get_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<KeyValue>> {
        (**self).get_prefix(prefix).await
    }

    async fn clear_prefix(&self, prefix: &[u8]) -> StorageResult<()> {
        (**self).clear_prefix(prefix).await
    }

    async fn health_check(&self) -> StorageResult<()> {
        (**self).health_check().await
    }
}
