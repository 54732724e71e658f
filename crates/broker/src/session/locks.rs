//! Key-scoped locking for sessions and documents.
//!
//! Two layers:
//!
//! - [`KeyedLocks`]: one async mutex per key inside this process. Requests
//!   for different transactions never contend.
//! - [`SharedLease`]: a lease entry in the shared backend, acquired with
//!   compare-and-set and released with compare-and-delete, giving the
//!   single-writer guarantee across nodes in high-availability mode. The lease
//!   is renewed in the background while held, and lapses by TTL if its holder
//!   dies.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use sigbroker_storage::{StorageBackend, StorageError, StorageResult};
use tokio::{
    sync::OwnedMutexGuard,
    task::JoinHandle,
    time::{Instant, sleep},
};

/// Table size above which dead entries are pruned on the next acquisition.
const PRUNE_THRESHOLD: usize = 1024;

const INITIAL_BACKOFF: Duration = Duration::from_millis(2);
const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// Per-key async mutexes, created on demand and dropped when unused.
#[derive(Default)]
pub(crate) struct KeyedLocks {
    table: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Waits for the lock on `key`.
    pub(crate) async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut table = self.table.lock();
            if table.len() >= PRUNE_THRESHOLD {
                table.retain(|_, weak| weak.strong_count() > 0);
            }
            match table.get(key).and_then(Weak::upgrade) {
                Some(mutex) => mutex,
                None => {
                    let mutex = Arc::new(tokio::sync::Mutex::new(()));
                    table.insert(key.to_owned(), Arc::downgrade(&mutex));
                    mutex
                },
            }
        };
        mutex.lock_owned().await
    }

    #[cfg(test)]
    fn live_entries(&self) -> usize {
        self.table.lock().values().filter(|weak| weak.strong_count() > 0).count()
    }
}

/// Lease on a shared-store key.
pub(crate) struct SharedLease {
    backend: Arc<dyn StorageBackend>,
    key: Vec<u8>,
    token: Vec<u8>,
    renewal: JoinHandle<()>,
    released: bool,
}

impl SharedLease {
    /// Acquires the lease on `key`, waiting up to `wait` for a current holder.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Timeout`] if the lease is still held elsewhere
    /// after `wait`, or any backend error.
    pub(crate) async fn acquire(
        backend: Arc<dyn StorageBackend>,
        key: Vec<u8>,
        lease: Duration,
        wait: Duration,
    ) -> StorageResult<Self> {
        let token = hex::encode(rand::random::<[u8; 16]>()).into_bytes();
        let deadline = Instant::now() + wait;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match backend.compare_and_set_with_ttl(&key, None, token.clone(), lease).await {
                Ok(()) => break,
                Err(StorageError::Conflict) => {
                    if Instant::now() >= deadline {
                        return Err(StorageError::timeout());
                    }
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                },
                Err(err) => return Err(err),
            }
        }

        let renewal = tokio::spawn(renew(Arc::clone(&backend), key.clone(), token.clone(), lease));
        Ok(Self { backend, key, token, renewal, released: false })
    }

    /// Releases the lease if it is still ours.
    pub(crate) async fn release(mut self) {
        self.released = true;
        self.renewal.abort();
        release(&*self.backend, &self.key, &self.token).await;
    }
}

impl fmt::Debug for SharedLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedLease")
            .field("key", &String::from_utf8_lossy(&self.key))
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for SharedLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.renewal.abort();
        let backend = Arc::clone(&self.backend);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { release(&*backend, &key, &token).await });
            },
            // Without a runtime the lease lapses by TTL.
            Err(_) => tracing::debug!("no runtime to release session lease"),
        }
    }
}

async fn release(backend: &dyn StorageBackend, key: &[u8], token: &[u8]) {
    match backend.compare_and_delete(key, token).await {
        Ok(()) => {},
        Err(StorageError::Conflict) => {
            tracing::warn!(
                key = %String::from_utf8_lossy(key),
                "session lease lost before release"
            );
        },
        Err(err) => {
            tracing::warn!(
                key = %String::from_utf8_lossy(key),
                error = %err,
                "failed to release session lease"
            );
        },
    }
}

async fn renew(backend: Arc<dyn StorageBackend>, key: Vec<u8>, token: Vec<u8>, lease: Duration) {
    let period = (lease / 3).max(Duration::from_millis(1));
    loop {
        sleep(period).await;
        let renewed =
            backend
                .compare_and_set_with_ttl(&key, Some(token.as_slice()), token.clone(), lease)
                .await;
        match renewed {
            Ok(()) => {},
            Err(StorageError::Conflict) => {
                tracing::warn!(key = %String::from_utf8_lossy(&key), "session lease lost");
                return;
            },
            Err(err) => {
                tracing::warn!(
                    key = %String::from_utf8_lossy(&key),
                    error = %err,
                    "session lease renewal failed"
                );
            },
        }
    }
}

/// Lock held by a [`SessionHandle`](super::SessionHandle) obtained for update.
pub(crate) struct SessionLock {
    shared: Option<SharedLease>,
    _local: OwnedMutexGuard<()>,
}

impl SessionLock {
    pub(crate) fn new(local: OwnedMutexGuard<()>, shared: Option<SharedLease>) -> Self {
        Self { shared, _local: local }
    }

    /// Releases the shared lease, then the local lock.
    pub(crate) async fn release(mut self) {
        if let Some(lease) = self.shared.take() {
            lease.release().await;
        }
    }
}

impl fmt::Debug for SessionLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLock").field("shared", &self.shared).finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use sigbroker_storage::MemoryBackend;

    use super::*;

    #[tokio::test]
    async fn same_key_serializes() {
        let locks = Arc::new(KeyedLocks::new());
        let active = Arc::new(AtomicUsize::new(0));
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let active = Arc::clone(&active);
            tasks.spawn(async move {
                let _guard = locks.lock("tr").await;
                assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                tokio::task::yield_now().await;
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn unused_entries_are_dropped() {
        let locks = KeyedLocks::new();
        {
            let _guard = locks.lock("a").await;
            assert_eq!(locks.live_entries(), 1);
        }
        assert_eq!(locks.live_entries(), 0);
    }

    #[tokio::test]
    async fn lease_excludes_second_holder_until_released() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let lease = SharedLease::acquire(
            Arc::clone(&backend),
            b"session-lock/x".to_vec(),
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await
        .unwrap();

        let second = SharedLease::acquire(
            Arc::clone(&backend),
            b"session-lock/x".to_vec(),
            Duration::from_secs(5),
            Duration::from_millis(20),
        )
        .await;
        assert!(matches!(second, Err(StorageError::Timeout)));

        lease.release().await;
        assert!(backend.get(b"session-lock/x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dropped_lease_is_released_in_background() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let lease = SharedLease::acquire(
            Arc::clone(&backend),
            b"session-lock/y".to_vec(),
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        drop(lease);

        let reacquired = SharedLease::acquire(
            Arc::clone(&backend),
            b"session-lock/y".to_vec(),
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
        .await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn lease_is_renewed_while_held() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let lease = SharedLease::acquire(
            Arc::clone(&backend),
            b"session-lock/z".to_vec(),
            Duration::from_millis(90),
            Duration::from_millis(10),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(backend.get(b"session-lock/z").await.unwrap().is_some());
        lease.release().await;
    }
}
