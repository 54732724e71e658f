//! Shared-directory storage backend.
//!
//! [`FsBackend`] keeps one file per key inside a directory that every broker
//! node mounts (NFS, SMB, a shared volume). It is the medium behind
//! high-availability mode: a transaction started on one node can be served
//! by another because both see the same files.
//!
//! # Layout
//!
//! | File | Purpose |
//! |------|---------|
//! | `<hex key>.val` | 8-byte big-endian expiry (epoch millis, `0` = none), then the value |
//! | `<hex key>.lock` | Exclusive per-key lock holding its owner's random token |
//! | `.tmp-<random>` | Staging file, renamed over the entry on write |
//! | `.tmp-break-<token>` | Claims the breaking of one abandoned lock |
//!
//! # Atomicity
//!
//! Readers never take the lock: an entry is replaced by `rename`, so a
//! reader sees either the old file or the new one. Every mutation
//! (set, compare-and-set, compare-and-delete, take, delete) holds the
//! key's lock file, which gives the single-writer guarantee across
//! processes. A lock is created by hard-linking a staged token file to the
//! lock path, which fails if the lock exists.
//!
//! A lock file older than `stale_lock_after` is assumed to belong to a
//! crashed node and is broken. Breaking never deletes the lock path blindly:
//! one contender per abandoned token claims a break marker, renames the lock
//! away, and puts it back if what it moved was not the abandoned token. A
//! holder only removes a lock file that still carries its own token.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use bytes::Bytes;
use fail::fail_point;
use tokio::{
    io::AsyncReadExt,
    select,
    sync::watch,
    time::{Instant, sleep},
};

use crate::{
    backend::StorageBackend,
    error::{ConfigError, StorageError, StorageResult},
    shutdown::ShutdownGuard,
    size_limits::{SizeLimits, validate_key_size, validate_sizes},
    types::KeyValue,
};

/// Default time a mutation waits for a contended key lock.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);

/// Default age after which a lock file is considered abandoned.
pub const DEFAULT_STALE_LOCK_AFTER: Duration = Duration::from_secs(30);

/// Default interval between expired-entry sweeps.
pub const DEFAULT_FS_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

const ENTRY_SUFFIX: &str = ".val";
const LOCK_SUFFIX: &str = ".lock";
const TMP_PREFIX: &str = ".tmp-";
const HEADER_LEN: usize = 8;

/// Configuration for [`FsBackend`].
///
/// # Validation
///
/// - `root` must not be empty
/// - `lock_wait` and `sweep_interval` must be non-zero
/// - `stale_lock_after` must exceed `lock_wait`
#[derive(Debug, Clone)]
pub struct FsConfig {
    root: PathBuf,
    lock_wait: Duration,
    stale_lock_after: Duration,
    sweep_interval: Duration,
    limits: SizeLimits,
}

#[bon::bon]
impl FsConfig {
    /// Creates a new shared-directory configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a field violates the rules above.
    #[builder]
    pub fn new(
        #[builder(into)] root: PathBuf,
        #[builder(default = DEFAULT_LOCK_WAIT)] lock_wait: Duration,
        #[builder(default = DEFAULT_STALE_LOCK_AFTER)] stale_lock_after: Duration,
        #[builder(default = DEFAULT_FS_SWEEP_INTERVAL)] sweep_interval: Duration,
        #[builder(default = SizeLimits::for_filesystem())] limits: SizeLimits,
    ) -> Result<Self, ConfigError> {
        if root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid { field: "root", reason: "path is empty".into() });
        }
        if lock_wait.is_zero() {
            return Err(ConfigError::BelowMinimum {
                field: "lock_wait",
                min: "1ms".into(),
                value: "0s".into(),
            });
        }
        if sweep_interval.is_zero() {
            return Err(ConfigError::BelowMinimum {
                field: "sweep_interval",
                min: "1ms".into(),
                value: "0s".into(),
            });
        }
        if stale_lock_after <= lock_wait {
            return Err(ConfigError::BelowMinimum {
                field: "stale_lock_after",
                min: format!("{lock_wait:?}"),
                value: format!("{stale_lock_after:?}"),
            });
        }
        Ok(Self { root, lock_wait, stale_lock_after, sweep_interval, limits })
    }

    /// Directory holding the entries.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

struct FsInner {
    config: FsConfig,
}

/// Storage backend persisting entries as files in a shared directory.
///
/// Cheaply cloneable; all clones share the background sweep, which stops
/// when the last clone is dropped.
#[derive(Clone)]
pub struct FsBackend {
    inner: Arc<FsInner>,
    shutdown_guard: Arc<ShutdownGuard>,
}

impl std::fmt::Debug for FsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsBackend").field("root", &self.inner.config.root).finish()
    }
}

/// Exclusive hold on one key. Dropping it removes the lock file if the file
/// still carries this holder's token.
struct KeyLock {
    path: PathBuf,
    token: String,
}

impl Drop for KeyLock {
    // Drop cannot await, so release uses blocking calls on the current
    // worker: one small read and one unlink per mutation.
    fn drop(&mut self) {
        match std::fs::read_to_string(&self.path) {
            Ok(current) if current == self.token => {
                if let Err(err) = std::fs::remove_file(&self.path)
                    && err.kind() != ErrorKind::NotFound
                {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %err,
                        "failed to release key lock"
                    );
                }
            },
            Ok(_) => {
                tracing::warn!(path = %self.path.display(), "key lock was broken while held");
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {},
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "failed to read key lock"
                );
            },
        }
    }
}

impl FsBackend {
    /// Opens (creating if needed) the shared directory and starts the
    /// expired-entry sweep.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Connection`] if the directory cannot be
    /// created or is not accessible.
    pub async fn open(config: FsConfig) -> StorageResult<Self> {
        tokio::fs::create_dir_all(&config.root).await.map_err(|err| {
            StorageError::connection_with_source(
                format!("cannot open shared directory {}", config.root.display()),
                err,
            )
        })?;

        let (shutdown_guard, shutdown_rx) = ShutdownGuard::new();
        let inner = Arc::new(FsInner { config });
        let sweeper = Arc::clone(&inner);
        tokio::spawn(async move {
            sweeper.sweep_loop(shutdown_rx).await;
        });

        Ok(Self { inner, shutdown_guard: Arc::new(shutdown_guard) })
    }

    /// Explicitly signals the background sweep to stop.
    pub fn shutdown(&self) {
        self.shutdown_guard.signal();
    }

    /// Removes expired entries and abandoned staging files once.
    ///
    /// Returns the number of entries removed.
    pub async fn sweep_expired(&self) -> StorageResult<usize> {
        self.inner.sweep_once().await
    }
}

fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

fn expiry_after(ttl: Duration) -> u64 {
    let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    now_millis().saturating_add(ttl_ms).max(1)
}

fn encode_entry(value: &[u8], expires_at: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + value.len());
    buf.extend_from_slice(&expires_at.to_be_bytes());
    buf.extend_from_slice(value);
    buf
}

/// Decoded entry: expiry in epoch millis (`0` = none) and value.
struct StoredEntry {
    expires_at: u64,
    value: Bytes,
}

impl StoredEntry {
    fn decode(raw: Vec<u8>) -> StorageResult<Self> {
        if raw.len() < HEADER_LEN {
            return Err(StorageError::serialization(format!(
                "entry shorter than its {HEADER_LEN}-byte header"
            )));
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&raw[..HEADER_LEN]);
        let value = Bytes::from(raw).slice(HEADER_LEN..);
        Ok(Self { expires_at: u64::from_be_bytes(header), value })
    }

    fn is_live(&self, now: u64) -> bool {
        self.expires_at == 0 || self.expires_at > now
    }
}

impl FsInner {
    fn entry_path(&self, key: &[u8]) -> PathBuf {
        self.config.root.join(format!("{}{ENTRY_SUFFIX}", hex::encode(key)))
    }

    fn lock_path(&self, key: &[u8]) -> PathBuf {
        self.config.root.join(format!("{}{LOCK_SUFFIX}", hex::encode(key)))
    }

    async fn read_entry(&self, path: &Path) -> StorageResult<Option<StoredEntry>> {
        match tokio::fs::read(path).await {
            Ok(raw) => StoredEntry::decode(raw).map(Some),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_live(&self, path: &Path) -> StorageResult<Option<Bytes>> {
        let now = now_millis();
        Ok(self.read_entry(path).await?.filter(|entry| entry.is_live(now)).map(|e| e.value))
    }

    async fn write_entry(&self, path: &Path, value: &[u8], expires_at: u64) -> StorageResult<()> {
        fail_point!("fs-backend-write", |_| {
            Err(StorageError::internal("injected shared storage write failure"))
        });

        let tmp = self.config.root.join(format!("{TMP_PREFIX}{:016x}", rand::random::<u64>()));
        tokio::fs::write(&tmp, encode_entry(value, expires_at)).await?;
        if let Err(err) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn remove_entry(&self, path: &Path) -> StorageResult<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn lock(&self, key: &[u8]) -> StorageResult<KeyLock> {
        let path = self.lock_path(key);
        let deadline = Instant::now() + self.config.lock_wait;
        let mut backoff = Duration::from_millis(2);

        loop {
            let token = format!("{:016x}", rand::random::<u64>());
            if self.try_create_lock(&path, &token).await? {
                return Ok(KeyLock { path, token });
            }
            if let Some(abandoned) = self.stale_token(&path).await
                && self.break_stale(&path, &abandoned).await?
            {
                continue;
            }
            if Instant::now() >= deadline {
                return Err(StorageError::timeout());
            }
            sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_millis(50));
        }
    }

    /// Creates the lock at `path` holding `token`; `false` if it is held.
    async fn try_create_lock(&self, path: &Path, token: &str) -> StorageResult<bool> {
        let staged = self.config.root.join(format!("{TMP_PREFIX}lock-{token}"));
        tokio::fs::write(&staged, token).await?;
        let linked = tokio::fs::hard_link(&staged, path).await;
        let _ = tokio::fs::remove_file(&staged).await;
        match linked {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Returns the token of the lock at `path` if that lock is abandoned.
    ///
    /// Age and token are read through one handle, so both describe the same file.
    async fn stale_token(&self, path: &Path) -> Option<String> {
        let mut file = tokio::fs::File::open(path).await.ok()?;
        let modified = file.metadata().await.ok()?.modified().ok()?;
        let age = SystemTime::now().duration_since(modified).ok()?;
        if age <= self.config.stale_lock_after {
            return None;
        }
        let mut token = String::new();
        file.read_to_string(&mut token).await.ok()?;
        Some(token)
    }

    /// Breaks the abandoned lock carrying `token`; `true` if this call broke it.
    async fn break_stale(&self, path: &Path, token: &str) -> StorageResult<bool> {
        let marker = self.config.root.join(format!("{TMP_PREFIX}break-{token}"));
        match tokio::fs::OpenOptions::new().write(true).create_new(true).open(&marker).await {
            Ok(_) => {},
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => return Err(err.into()),
        }

        let tombstone = self.config.root.join(format!("{TMP_PREFIX}broken-{token}"));
        match tokio::fs::rename(path, &tombstone).await {
            Ok(()) => {},
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        }

        let moved = tokio::fs::read_to_string(&tombstone).await.unwrap_or_default();
        if moved != token {
            // A live lock replaced the abandoned one before the rename.
            if let Err(err) = tokio::fs::hard_link(&tombstone, path).await {
                tracing::error!(path = %path.display(), error = %err, "failed to restore key lock");
            }
            let _ = tokio::fs::remove_file(&tombstone).await;
            return Ok(false);
        }
        let _ = tokio::fs::remove_file(&tombstone).await;
        tracing::warn!(path = %path.display(), "broke abandoned key lock");
        Ok(true)
    }

    async fn is_stale(&self, path: &Path) -> bool {
        let Ok(metadata) = tokio::fs::metadata(path).await else {
            return false;
        };
        metadata
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age > self.config.stale_lock_after)
    }

    async fn cas(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        expires_at: u64,
    ) -> StorageResult<()> {
        validate_sizes(key, &new_value, &self.config.limits)?;
        let _lock = self.lock(key).await?;
        let path = self.entry_path(key);
        let current = self.read_live(&path).await?;

        let matches = match (expected, &current) {
            (None, None) => true,
            (Some(exp), Some(cur)) => exp == &cur[..],
            _ => false,
        };
        if !matches {
            return Err(StorageError::Conflict);
        }

        self.write_entry(&path, &new_value, expires_at).await
    }

    /// Lists `(key, path)` for every entry file whose key starts with `prefix`.
    async fn list(&self, prefix: &[u8]) -> StorageResult<Vec<(Vec<u8>, PathBuf)>> {
        let mut dir = tokio::fs::read_dir(&self.config.root).await?;
        let mut found = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(ENTRY_SUFFIX)) else {
                continue;
            };
            let Ok(key) = hex::decode(stem) else {
                continue;
            };
            if key.starts_with(prefix) {
                found.push((key, item.path()));
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }

    async fn sweep_once(&self) -> StorageResult<usize> {
        let now = now_millis();
        let mut removed = 0;
        for (key, path) in self.list(b"").await? {
            let entry = self.read_entry(&path).await;
            let expired = matches!(entry, Ok(Some(entry)) if !entry.is_live(now));
            if !expired {
                continue;
            }
            let _lock = self.lock(&key).await?;
            // Re-check under the lock: a writer may have refreshed it.
            if let Some(entry) = self.read_entry(&path).await?
                && !entry.is_live(now_millis())
            {
                self.remove_entry(&path).await?;
                removed += 1;
            }
        }
        self.remove_abandoned_staging_files().await?;
        Ok(removed)
    }

    async fn remove_abandoned_staging_files(&self) -> StorageResult<()> {
        let mut dir = tokio::fs::read_dir(&self.config.root).await?;
        while let Some(item) = dir.next_entry().await? {
            let is_staging = item.file_name().to_str().is_some_and(|n| n.starts_with(TMP_PREFIX));
            if is_staging && self.is_stale(&item.path()).await {
                let _ = tokio::fs::remove_file(item.path()).await;
            }
        }
        Ok(())
    }

    async fn sweep_loop(&self, mut shutdown_rx: watch::Receiver<()>) {
        loop {
            select! {
                _ = sleep(self.config.sweep_interval) => {}
                _ = shutdown_rx.changed() => {
                    return;
                }
            }

            match self.sweep_once().await {
                Ok(0) => {},
                Ok(removed) => tracing::debug!(removed, "swept expired shared entries"),
                Err(err) => tracing::warn!(error = %err, "shared storage sweep failed"),
            }
        }
    }
}

#[async_trait]
impl StorageBackend for FsBackend {
    #[tracing::instrument(skip(self, key), fields(key_len = key.len()))]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        validate_key_size(key, &self.inner.config.limits)?;
        self.inner.read_live(&self.inner.entry_path(key)).await
    }

    #[tracing::instrument(
        skip(self, key, value),
        fields(key_len = key.len(), value_len = value.len())
    )]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        validate_sizes(&key, &value, &self.inner.config.limits)?;
        let _lock = self.inner.lock(&key).await?;
        self.inner.write_entry(&self.inner.entry_path(&key), &value, 0).await
    }

    #[tracing::instrument(
        skip(self, key, value),
        fields(key_len = key.len(), value_len = value.len())
    )]
    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        validate_sizes(&key, &value, &self.inner.config.limits)?;
        let _lock = self.inner.lock(&key).await?;
        self.inner.write_entry(&self.inner.entry_path(&key), &value, expiry_after(ttl)).await
    }

    #[tracing::instrument(skip_all)]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        self.inner.cas(key, expected, new_value, 0).await
    }

    #[tracing::instrument(skip_all)]
    async fn compare_and_set_with_ttl(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Duration,
    ) -> StorageResult<()> {
        self.inner.cas(key, expected, new_value, expiry_after(ttl)).await
    }

    #[tracing::instrument(skip_all)]
    async fn compare_and_delete(&self, key: &[u8], expected: &[u8]) -> StorageResult<()> {
        validate_key_size(key, &self.inner.config.limits)?;
        let _lock = self.inner.lock(key).await?;
        let path = self.inner.entry_path(key);
        match self.inner.read_live(&path).await? {
            Some(current) if current.as_ref() == expected => self.inner.remove_entry(&path).await,
            _ => Err(StorageError::Conflict),
        }
    }

    #[tracing::instrument(skip(self, key), fields(key_len = key.len()))]
    async fn take(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        validate_key_size(key, &self.inner.config.limits)?;
        let _lock = self.inner.lock(key).await?;
        let path = self.inner.entry_path(key);
        let value = self.inner.read_live(&path).await?;
        self.inner.remove_entry(&path).await?;
        Ok(value)
    }

    #[tracing::instrument(skip(self, key), fields(key_len = key.len()))]
    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        validate_key_size(key, &self.inner.config.limits)?;
        let _lock = self.inner.lock(key).await?;
        self.inner.remove_entry(&self.inner.entry_path(key)).await
    }

    #[tracing::instrument(skip(self, prefix), fields(prefix_len = prefix.len()))]
    async fn get_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<KeyValue>> {
        let now = now_millis();
        let mut results = Vec::new();
        for (key, path) in self.inner.list(prefix).await? {
            // Entries may disappear between listing and reading.
            if let Some(entry) = self.inner.read_entry(&path).await?
                && entry.is_live(now)
            {
                results.push(KeyValue::new(Bytes::from(key), entry.value));
            }
        }
        Ok(results)
    }

    #[tracing::instrument(skip(self, prefix), fields(prefix_len = prefix.len()))]
    async fn clear_prefix(&self, prefix: &[u8]) -> StorageResult<()> {
        for (key, path) in self.inner.list(prefix).await? {
            let _lock = self.inner.lock(&key).await?;
            self.inner.remove_entry(&path).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> StorageResult<()> {
        let metadata = tokio::fs::metadata(&self.inner.config.root).await.map_err(|err| {
            StorageError::connection_with_source("shared directory unavailable", err)
        })?;
        if !metadata.is_dir() {
            return Err(StorageError::connection("shared storage root is not a directory"));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn backend(dir: &tempfile::TempDir) -> FsBackend {
        let config = FsConfig::builder().root(dir.path()).build().expect("config");
        FsBackend::open(config).await.expect("open")
    }

    #[test]
    fn config_rejects_stale_window_shorter_than_wait() {
        let err = FsConfig::builder()
            .root("/tmp/x")
            .lock_wait(Duration::from_secs(10))
            .stale_lock_after(Duration::from_secs(5))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { field: "stale_lock_after", .. }));
    }

    #[test]
    fn config_rejects_empty_root() {
        let err = FsConfig::builder().root("").build().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "root", .. }));
    }

    #[tokio::test]
    async fn set_get_writes_framed_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir).await;

        backend.set(b"doc/1".to_vec(), b"payload".to_vec()).await.unwrap();
        assert_eq!(backend.get(b"doc/1").await.unwrap(), Some(Bytes::from("payload")));

        let raw = std::fs::read(dir.path().join(format!("{}.val", hex::encode("doc/1")))).unwrap();
        assert_eq!(&raw[..HEADER_LEN], &0u64.to_be_bytes());
        assert_eq!(&raw[HEADER_LEN..], b"payload");
    }

    #[tokio::test]
    async fn lock_released_after_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir).await;

        backend.set(b"k".to_vec(), b"v".to_vec()).await.unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(LOCK_SUFFIX))
            .collect();
        assert!(leftovers.is_empty(), "lock file should be removed after set");
    }

    #[tokio::test]
    async fn held_lock_times_out_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let config = FsConfig::builder()
            .root(dir.path())
            .lock_wait(Duration::from_millis(50))
            .build()
            .unwrap();
        let backend = FsBackend::open(config).await.unwrap();

        std::fs::write(dir.path().join(format!("{}.lock", hex::encode("busy"))), b"").unwrap();
        let result = backend.set(b"busy".to_vec(), b"v".to_vec()).await;
        assert!(matches!(result, Err(StorageError::Timeout)));
    }

    fn abandon(path: &Path, token: &str) {
        std::fs::write(path, token).unwrap();
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(3600)).unwrap();
    }

    #[tokio::test]
    async fn late_breaker_leaves_fresh_lock_alone() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir).await;
        let inner = &backend.inner;
        let path = inner.lock_path(b"k");
        abandon(&path, "dead");

        // Two contenders observe the same abandoned lock; the first breaks it.
        assert_eq!(inner.stale_token(&path).await.as_deref(), Some("dead"));
        let held = inner.lock(b"k").await.unwrap();

        assert!(!inner.break_stale(&path, "dead").await.unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), held.token);
        drop(held);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn breaking_a_replaced_lock_restores_it() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir).await;
        let inner = &backend.inner;
        let path = inner.lock_path(b"k");
        std::fs::write(&path, "live").unwrap();

        assert!(!inner.break_stale(&path, "dead").await.unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "live");
    }

    #[tokio::test]
    async fn broken_holder_does_not_release_successor() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir).await;
        let inner = &backend.inner;
        let path = inner.lock_path(b"k");

        let slow = inner.lock(b"k").await.unwrap();
        std::fs::write(&path, "successor").unwrap();
        drop(slow);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "successor");
    }

    #[tokio::test]
    async fn contenders_on_abandoned_lock_take_once() {
        let dir = tempfile::tempdir().unwrap();
        let node_a = backend(&dir).await;
        let node_b = backend(&dir).await;
        node_a.set(b"doc".to_vec(), b"v".to_vec()).await.unwrap();
        abandon(&node_a.inner.lock_path(b"doc"), "dead");

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..8 {
            let node = if i % 2 == 0 { node_a.clone() } else { node_b.clone() };
            tasks.spawn(async move { node.take(b"doc").await.unwrap() });
        }
        let mut served = 0;
        while let Some(taken) = tasks.join_next().await {
            if taken.unwrap().is_some() {
                served += 1;
            }
        }
        assert_eq!(served, 1);
    }

    #[tokio::test]
    async fn corrupt_entry_is_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir).await;

        std::fs::write(dir.path().join(format!("{}.val", hex::encode("bad"))), b"abc").unwrap();
        let result = backend.get(b"bad").await;
        assert!(matches!(result, Err(StorageError::Serialization { .. })));
    }

    #[tokio::test]
    async fn expired_entry_is_swept() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir).await;

        backend
            .set_with_ttl(b"t".to_vec(), b"v".to_vec(), Duration::from_millis(10))
            .await
            .unwrap();
        backend.set(b"keep".to_vec(), b"v".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(backend.get(b"t").await.unwrap(), None);
        assert_eq!(backend.sweep_expired().await.unwrap(), 1);
        assert_eq!(backend.get(b"keep").await.unwrap(), Some(Bytes::from("v")));
    }

    #[tokio::test]
    async fn two_handles_share_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let node_a = backend(&dir).await;
        let node_b = backend(&dir).await;

        node_a.set(b"shared".to_vec(), b"from-a".to_vec()).await.unwrap();
        assert_eq!(node_b.take(b"shared").await.unwrap(), Some(Bytes::from("from-a")));
        assert_eq!(node_a.get(b"shared").await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_root_fails_health_check() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir).await;
        let root = dir.path().to_path_buf();
        drop(dir);

        assert!(!root.exists());
        let result = backend.health_check().await;
        assert!(matches!(result, Err(StorageError::Connection { .. })));
    }
}
