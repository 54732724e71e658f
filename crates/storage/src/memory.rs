//! In-memory storage backend implementation.
//!
//! This module provides [`MemoryBackend`], the in-process medium used when
//! high-availability mode is off, and by tests.
//!
//! # Features
//!
//! - **Thread-safe**: Uses [`parking_lot::RwLock`] for concurrent access
//! - **Ordered storage**: Keys are stored in a [`BTreeMap`] for efficient prefix scans
//! - **TTL support**: Background task sweeps expired keys
//! - **Atomic primitives**: CAS, compare-and-delete and take run under a single write lock
//!
//! # Example
//!
//! ```
//! use sigbroker_storage::{MemoryBackend, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = MemoryBackend::new();
//!
//!     backend.set(b"greeting".to_vec(), b"hello".to_vec()).await.unwrap();
//!     let value = backend.get(b"greeting").await.unwrap();
//!
//!     assert_eq!(value.unwrap().as_ref(), b"hello");
//! }
//! ```
//!
//! # Limitations
//!
//! - Data is not persisted; all data is lost when the process exits
//! - Not shared between processes, so it cannot back high-availability mode
//! - Expired keys stay in memory until the next sweep, though reads never see them

use std::{collections::BTreeMap, ops::Bound, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::{
    select,
    sync::watch,
    time::{Instant, sleep},
};

use crate::{
    backend::StorageBackend,
    error::{StorageError, StorageResult},
    shutdown::ShutdownGuard,
    size_limits::{SizeLimits, validate_key_size, validate_sizes},
    types::{KeyValue, prefix_upper_bound},
};

/// Default interval between expired-key sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

type Table = BTreeMap<Vec<u8>, Entry>;

/// In-memory storage backend using [`BTreeMap`].
///
/// # Cloning
///
/// `MemoryBackend` is cheaply cloneable via [`Arc`]. All clones share the
/// same underlying data store.
///
/// # Shutdown
///
/// The background TTL sweep stops automatically when all clones of the
/// `MemoryBackend` are dropped. [`shutdown`](Self::shutdown) stops it
/// explicitly.
#[derive(Clone)]
pub struct MemoryBackend {
    data: Arc<RwLock<Table>>,
    limits: SizeLimits,
    shutdown_guard: Arc<ShutdownGuard>,
}

impl MemoryBackend {
    /// Creates a new in-memory storage backend with default limits and a
    /// one-second sweep.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new() -> Self {
        Self::with_options(SizeLimits::default(), DEFAULT_SWEEP_INTERVAL)
    }

    /// Creates a backend with explicit size limits and sweep interval.
    pub fn with_options(limits: SizeLimits, sweep_interval: Duration) -> Self {
        let (shutdown_guard, shutdown_rx) = ShutdownGuard::new();
        let backend = Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            limits,
            shutdown_guard: Arc::new(shutdown_guard),
        };

        // The task holds only the table so that dropping every clone of the
        // backend drops the guard and ends the loop.
        let data = Arc::clone(&backend.data);
        tokio::spawn(async move {
            sweep_expired_keys(data, sweep_interval, shutdown_rx).await;
        });

        backend
    }

    /// Explicitly signals the background sweep to stop.
    pub fn shutdown(&self) {
        self.shutdown_guard.signal();
    }

    /// Number of entries physically held, including expired entries that
    /// have not been swept yet.
    #[must_use]
    pub fn raw_len(&self) -> usize {
        self.data.read().len()
    }

    fn live_value(table: &Table, key: &[u8], now: Instant) -> Option<Bytes> {
        table.get(key).filter(|entry| entry.is_live(now)).map(|entry| entry.value.clone())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

async fn sweep_expired_keys(
    data: Arc<RwLock<Table>>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        select! {
            _ = sleep(interval) => {}
            _ = shutdown_rx.changed() => {
                return;
            }
        }

        let now = Instant::now();
        let removed = {
            let mut table = data.write();
            let before = table.len();
            table.retain(|_, entry| entry.is_live(now));
            before - table.len()
        };
        if removed > 0 {
            tracing::trace!(removed, "swept expired keys");
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    #[tracing::instrument(skip(self, key), fields(key_len = key.len()))]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        validate_key_size(key, &self.limits)?;
        let data = self.data.read();
        Ok(Self::live_value(&data, key, Instant::now()))
    }

    #[tracing::instrument(
        skip(self, key, value),
        fields(key_len = key.len(), value_len = value.len())
    )]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        validate_sizes(&key, &value, &self.limits)?;
        let mut data = self.data.write();
        data.insert(key, Entry { value: Bytes::from(value), expires_at: None });
        Ok(())
    }

    #[tracing::instrument(
        skip(self, key, value),
        fields(key_len = key.len(), value_len = value.len())
    )]
    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        validate_sizes(&key, &value, &self.limits)?;
        // A TTL too large to represent never expires.
        let expires_at = Instant::now().checked_add(ttl);
        let mut data = self.data.write();
        data.insert(key, Entry { value: Bytes::from(value), expires_at });
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        self.cas(key, expected, new_value, None)
    }

    async fn compare_and_set_with_ttl(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Duration,
    ) -> StorageResult<()> {
        self.cas(key, expected, new_value, Some(ttl))
    }

    async fn compare_and_delete(&self, key: &[u8], expected: &[u8]) -> StorageResult<()> {
        validate_key_size(key, &self.limits)?;
        let mut data = self.data.write();
        match Self::live_value(&data, key, Instant::now()) {
            Some(current) if current.as_ref() == expected => {
                data.remove(key);
                Ok(())
            },
            _ => Err(StorageError::Conflict),
        }
    }

    #[tracing::instrument(skip(self, key), fields(key_len = key.len()))]
    async fn take(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        validate_key_size(key, &self.limits)?;
        let now = Instant::now();
        let mut data = self.data.write();
        Ok(data.remove(key).filter(|entry| entry.is_live(now)).map(|entry| entry.value))
    }

    #[tracing::instrument(skip(self, key), fields(key_len = key.len()))]
    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        validate_key_size(key, &self.limits)?;
        let mut data = self.data.write();
        data.remove(key);
        Ok(())
    }

    async fn get_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<KeyValue>> {
        let now = Instant::now();
        let data = self.data.read();
        let upper = prefix_upper_bound(prefix);
        let end = match &upper {
            Some(end) => Bound::Excluded(end.as_slice()),
            None => Bound::Unbounded,
        };

        let results = data
            .range::<[u8], _>((Bound::Included(prefix), end))
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(k, entry)| KeyValue::new(Bytes::copy_from_slice(k), entry.value.clone()))
            .collect();

        Ok(results)
    }

    async fn clear_prefix(&self, prefix: &[u8]) -> StorageResult<()> {
        let mut data = self.data.write();
        data.retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }

    async fn health_check(&self) -> StorageResult<()> {
        // Acquiring the read lock proves the table is not deadlocked.
        let _unused = self.data.read();
        Ok(())
    }
}

impl MemoryBackend {
    fn cas(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        validate_sizes(key, &new_value, &self.limits)?;
        let now = Instant::now();
        let mut data = self.data.write();

        let current = Self::live_value(&data, key, now);
        let matches = match (expected, &current) {
            (None, None) => true,
            (Some(exp), Some(cur)) => exp == &cur[..],
            _ => false,
        };

        if !matches {
            return Err(StorageError::Conflict);
        }

        let expires_at = ttl.and_then(|ttl| now.checked_add(ttl));
        data.insert(key.to_vec(), Entry { value: Bytes::from(new_value), expires_at });
        Ok(())
    }
}
