//! Persistent session store with obfuscated lookup, expiry and locking.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::Utc;
use sigbroker_storage::StorageBackend;
use tokio::{
    select,
    sync::watch,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};

use super::{
    FireSession, SessionHandle,
    locks::{KeyedLocks, SessionLock, SharedLease},
};
use crate::{
    error::{BrokerError, BrokerResult},
    ids,
};

const SESSION_PREFIX: &str = "session/";
const LEASE_PREFIX: &str = "session-lock/";

/// Multiple of the inactivity interval after which the backend drops a session on its own.
const BACKSTOP_TTL_FACTOR: u32 = 4;

/// Lease settings used when the backend is shared between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseSettings {
    /// Lease lifetime; renewed while held.
    pub lease: Duration,
    /// Maximum wait for a lease held elsewhere.
    pub wait: Duration,
}

/// Store of in-flight transaction sessions.
///
/// Sessions are serialized as JSON under `session/{transaction_id}` in a
/// [`StorageBackend`]: a `MemoryBackend` on a single node, or the shared
/// backend in high-availability mode. Every lookup requires the obfuscation
/// key issued at creation; a wrong or missing key is indistinguishable from
/// an unknown transaction.
///
/// Updates are serialized per transaction: [`get`](Self::get) with
/// `lock_for_update` takes a process-local lock and, when `leases` is set, a
/// lease in the shared backend that excludes other nodes.
pub struct SessionStore {
    backend: Arc<dyn StorageBackend>,
    locks: KeyedLocks,
    max_inactive: Duration,
    leases: Option<LeaseSettings>,
}

impl SessionStore {
    /// Creates a store over `backend`.
    ///
    /// Pass `leases` when `backend` is shared with other processes.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        max_inactive: Duration,
        leases: Option<LeaseSettings>,
    ) -> Self {
        Self { backend, locks: KeyedLocks::new(), max_inactive, leases }
    }

    /// Inactivity interval after which sessions expire.
    #[must_use]
    pub fn max_inactive(&self) -> Duration {
        self.max_inactive
    }

    /// Creates a locked session for `transaction_id`, returning it with the
    /// obfuscation key the client must present on every later request.
    ///
    /// The session is not persisted until it is committed.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Internal`] if `transaction_id` is malformed or
    /// already in use, or a storage error.
    #[tracing::instrument(skip(self, app_id))]
    pub async fn create(
        &self,
        transaction_id: &str,
        app_id: &str,
    ) -> BrokerResult<(SessionHandle, String)> {
        if !ids::is_well_formed(transaction_id) {
            return Err(BrokerError::internal("malformed transaction id"));
        }
        let lock = self.lock(transaction_id).await?;
        if self.backend.get(&session_key(transaction_id)).await?.is_some() {
            return Err(BrokerError::internal("transaction id already in use"));
        }
        let subject_ref = ids::new_subject_ref();
        let session =
            FireSession::new(transaction_id, app_id, ids::subject_digest(&subject_ref));
        Ok((SessionHandle::new(session, Some(lock)), subject_ref))
    }

    /// Loads a session.
    ///
    /// Returns `Ok(None)` when the transaction is unknown, expired, or
    /// `subject_ref` is absent or wrong. With `create_if_missing`, an unknown
    /// transaction is created bound to `subject_ref`; an existing session is
    /// never rebound. With `lock_for_update` the returned handle holds the
    /// transaction lock.
    ///
    /// # Errors
    ///
    /// Returns a storage error, including [`StorageError::Timeout`] when the
    /// shared lease is held elsewhere for longer than the configured wait.
    ///
    /// [`StorageError::Timeout`]: sigbroker_storage::StorageError::Timeout
    #[tracing::instrument(skip(self, subject_ref))]
    pub async fn get(
        &self,
        transaction_id: &str,
        subject_ref: Option<&str>,
        create_if_missing: bool,
        lock_for_update: bool,
    ) -> BrokerResult<Option<SessionHandle>> {
        if !ids::is_well_formed(transaction_id) {
            return Ok(None);
        }
        let lock =
            if lock_for_update { Some(self.lock(transaction_id).await?) } else { None };

        match self.load(transaction_id).await? {
            Some(session) => {
                let presented = subject_ref.map(ids::subject_digest).unwrap_or_default();
                if !ids::digests_match(&session.subject_digest, &presented) {
                    tracing::debug!("obfuscation key mismatch");
                    return Ok(None);
                }
                Ok(Some(SessionHandle::new(session, lock)))
            },
            None if create_if_missing => {
                let Some(subject_ref) = subject_ref else {
                    return Ok(None);
                };
                let session =
                    FireSession::new(transaction_id, "", ids::subject_digest(subject_ref));
                Ok(Some(SessionHandle::new(session, lock)))
            },
            None => Ok(None),
        }
    }

    /// Persists the session, refreshing its inactivity clock, and releases its lock.
    ///
    /// # Errors
    ///
    /// Returns a storage or codec error; the lock is released either way.
    #[tracing::instrument(skip(self, handle), fields(transaction_id = %handle.transaction_id))]
    pub async fn commit(&self, mut handle: SessionHandle) -> BrokerResult<()> {
        handle.touch();
        let result = self.save(&handle).await;
        if let Some(lock) = handle.take_lock() {
            lock.release().await;
        }
        result
    }

    /// Releases the handle's lock without persisting changes.
    pub async fn release(&self, mut handle: SessionHandle) {
        if let Some(lock) = handle.take_lock() {
            lock.release().await;
        }
    }

    /// Removes a session by id.
    ///
    /// Does not take the transaction lock; use
    /// [`remove_locked`](Self::remove_locked) while holding a handle.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    #[tracing::instrument(skip(self))]
    pub async fn remove(&self, transaction_id: &str) -> BrokerResult<()> {
        self.backend.delete(&session_key(transaction_id)).await?;
        Ok(())
    }

    /// Removes the session behind `handle` and releases its lock.
    ///
    /// # Errors
    ///
    /// Returns a storage error; the lock is released either way.
    #[tracing::instrument(skip(self, handle), fields(transaction_id = %handle.transaction_id))]
    pub async fn remove_locked(&self, mut handle: SessionHandle) -> BrokerResult<()> {
        let result = self.remove(&handle.transaction_id).await;
        if let Some(lock) = handle.take_lock() {
            lock.release().await;
        }
        result
    }

    /// Removes every session whose last access exceeds the inactivity interval.
    ///
    /// A session committed concurrently with the sweep survives: removal is
    /// conditional on the stored bytes being the ones that were judged expired.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the sessions cannot be listed.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self) -> BrokerResult<usize> {
        let now = Utc::now();
        let mut removed = 0;
        for entry in self.backend.get_prefix(SESSION_PREFIX.as_bytes()).await? {
            let expired = match serde_json::from_slice::<FireSession>(&entry.value) {
                Ok(session) => session.is_expired(now, self.max_inactive),
                Err(err) => {
                    tracing::warn!(error = %err, "removing undecodable session entry");
                    true
                },
            };
            if !expired {
                continue;
            }
            match self.backend.compare_and_delete(&entry.key, &entry.value).await {
                Ok(()) => removed += 1,
                Err(err) => tracing::debug!(error = %err, "expired session changed during sweep"),
            }
        }
        Ok(removed)
    }

    /// Spawns the periodic expiry sweep.
    ///
    /// The task ends when `shutdown` fires or its sender is dropped, or when
    /// the store itself is dropped. Sweep failures are logged and dropped.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<()>,
    ) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        return;
                    }
                }
                let Some(store) = store.upgrade() else {
                    return;
                };
                match store.sweep().await {
                    Ok(0) => {},
                    Ok(removed) => tracing::debug!(removed, "swept expired sessions"),
                    Err(err) => tracing::warn!(error = %err, "session sweep failed"),
                }
            }
        })
    }

    async fn lock(&self, transaction_id: &str) -> BrokerResult<SessionLock> {
        let local = self.locks.lock(transaction_id).await;
        let shared = match self.leases {
            Some(settings) => Some(
                SharedLease::acquire(
                    Arc::clone(&self.backend),
                    lease_key(transaction_id),
                    settings.lease,
                    settings.wait,
                )
                .await?,
            ),
            None => None,
        };
        Ok(SessionLock::new(local, shared))
    }

    async fn load(&self, transaction_id: &str) -> BrokerResult<Option<FireSession>> {
        let Some(raw) = self.backend.get(&session_key(transaction_id)).await? else {
            return Ok(None);
        };
        let session: FireSession = serde_json::from_slice(&raw)?;
        if session.is_expired(Utc::now(), self.max_inactive) {
            tracing::debug!("session expired");
            return Ok(None);
        }
        Ok(Some(session))
    }

    async fn save(&self, session: &FireSession) -> BrokerResult<()> {
        let value = serde_json::to_vec(session)?;
        // The backend TTL is a backstop; the sweep is the primary remover.
        self.backend
            .set_with_ttl(
                session_key(&session.transaction_id),
                value,
                self.max_inactive.saturating_mul(BACKSTOP_TTL_FACTOR),
            )
            .await?;
        Ok(())
    }
}

fn session_key(transaction_id: &str) -> Vec<u8> {
    format!("{SESSION_PREFIX}{transaction_id}").into_bytes()
}

fn lease_key(transaction_id: &str) -> Vec<u8> {
    format!("{LEASE_PREFIX}{transaction_id}").into_bytes()
}
