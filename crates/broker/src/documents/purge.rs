//! Bounded background queue purging redundant shared-store copies.
//!
//! Request workers enqueue with [`PurgeQueue::enqueue`], which never blocks:
//! when the queue is full the job is dropped and counted. A single worker
//! deletes the keys one by one. Failures are logged and counted, never
//! retried.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use sigbroker_storage::{StorageBackend, StorageError};
use tokio::sync::{mpsc, mpsc::error::TrySendError};

/// Snapshot of purge queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    /// Jobs accepted by the queue.
    pub enqueued: u64,
    /// Jobs that deleted their key.
    pub completed: u64,
    /// Jobs whose delete failed.
    pub failed: u64,
    /// Jobs rejected because the queue was full or closed.
    pub dropped: u64,
}

impl PurgeStats {
    /// Jobs accepted but not yet processed.
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.enqueued.saturating_sub(self.completed + self.failed)
    }
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Handle to the purge worker. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PurgeQueue {
    tx: mpsc::Sender<Vec<u8>>,
    counters: Arc<Counters>,
}

impl PurgeQueue {
    /// Spawns the worker deleting keys from `backend`.
    ///
    /// The worker exits once every handle is dropped and the queue drains.
    /// Must be called from within a Tokio runtime.
    pub fn spawn(backend: Arc<dyn StorageBackend>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(Counters::default());
        tokio::spawn(run_worker(backend, rx, Arc::clone(&counters)));
        Self { tx, counters }
    }

    /// Enqueues the deletion of `key`. Returns `false` if the job was dropped.
    pub fn enqueue(&self, key: Vec<u8>) -> bool {
        match self.tx.try_send(key) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            },
            Err(err) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                let (reason, key) = match &err {
                    TrySendError::Full(key) => ("queue full", key),
                    TrySendError::Closed(key) => ("worker stopped", key),
                };
                tracing::warn!(
                    key = %String::from_utf8_lossy(key),
                    reason,
                    "dropping purge job"
                );
                false
            },
        }
    }

    /// Current counter values.
    #[must_use]
    pub fn stats(&self) -> PurgeStats {
        PurgeStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Waits until every accepted job has been processed or `timeout` elapses.
    ///
    /// Returns `true` if the queue drained.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.stats().pending() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

async fn run_worker(
    backend: Arc<dyn StorageBackend>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    counters: Arc<Counters>,
) {
    while let Some(key) = rx.recv().await {
        match purge(&*backend, &key).await {
            Ok(()) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
            },
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    key = %String::from_utf8_lossy(&key),
                    error = %err,
                    "failed to purge shared copy"
                );
            },
        }
    }
    tracing::debug!("purge worker stopped");
}

async fn purge(backend: &dyn StorageBackend, key: &[u8]) -> Result<(), StorageError> {
    fail::fail_point!("purge-delete", |_| Err(StorageError::internal("injected purge failure")));
    backend.delete(key).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use sigbroker_storage::MemoryBackend;

    use super::*;

    #[tokio::test]
    async fn purges_enqueued_keys() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set(b"doc/a".to_vec(), b"x".to_vec()).await.unwrap();
        let queue = PurgeQueue::spawn(backend.clone(), 8);

        assert!(queue.enqueue(b"doc/a".to_vec()));
        assert!(queue.wait_idle(Duration::from_secs(2)).await);

        assert!(backend.get(b"doc/a").await.unwrap().is_none());
        let stats = queue.stats();
        assert_eq!(stats.enqueued, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn full_queue_drops_without_blocking() {
        let backend = Arc::new(MemoryBackend::new());
        let queue = PurgeQueue::spawn(backend, 2);

        // The worker cannot run until this task yields.
        let accepted = (0..5).filter(|i| queue.enqueue(format!("doc/{i}").into_bytes())).count();
        assert_eq!(accepted, 2);
        assert_eq!(queue.stats().dropped, 3);

        assert!(queue.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(queue.stats().completed, 2);
    }

    #[tokio::test]
    async fn deleting_absent_key_completes() {
        let queue = PurgeQueue::spawn(Arc::new(MemoryBackend::new()), 4);
        queue.enqueue(b"doc/missing".to_vec());
        assert!(queue.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(queue.stats().completed, 1);
    }
}
