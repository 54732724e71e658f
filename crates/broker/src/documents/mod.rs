//! Two-tier temporary document store.
//!
//! Documents live in a node-local [`moka`] cache. In high-availability mode
//! every write is mirrored to the shared backend so that another node can
//! pick the transaction up. The shared copy is a hand-off medium only: as soon
//! as a node has read a document, the shared copy is purged in the background
//! through the [`PurgeQueue`] and the local copy is dropped, so a served
//! document leaves both tiers.
//!
//! ```text
//! store ──► local cache ──(HA)──► shared backend  doc/{id}
//!
//! retrieve ──► local hit ──(mirrored, shared present)──► evict, enqueue purge
//!          └─► local miss ──(HA)──► shared hit ──► enqueue purge
//!
//! retrieve_and_delete ──► local remove ──(mirrored)──► shared take must win
//!                     └─► local miss ──(HA)──► shared take
//! ```

mod purge;

use std::{sync::Arc, time::Duration};

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use sigbroker_storage::{StorageBackend, StorageError};

pub use self::purge::{PurgeQueue, PurgeStats};
use crate::{error::BrokerResult, ids, session::KeyedLocks};

const DOCUMENT_PREFIX: &str = "doc/";

/// Length of the big-endian header length that frames shared entries.
const FRAME_LEN: usize = 4;

/// Where a cached document's authoritative copy lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Only in this node's cache.
    Local,
    /// Also mirrored in the shared backend.
    Shared,
}

/// A temporary document held by the store.
#[derive(Debug, Clone)]
pub struct TempDocument {
    /// Document id.
    pub id: String,
    /// Transaction that owns the document.
    pub owner: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Tier of the cached entry.
    pub tier: Tier,
    /// Payload.
    pub data: Bytes,
}

#[derive(Serialize, Deserialize)]
struct SharedHeader {
    id: String,
    owner: String,
    created_at: DateTime<Utc>,
}

/// Store of temporary documents keyed by opaque ids.
pub struct TempDocumentStore {
    local: Cache<String, TempDocument>,
    shared: Option<Arc<dyn StorageBackend>>,
    purge: Option<PurgeQueue>,
    locks: KeyedLocks,
    ttl: Duration,
}

impl TempDocumentStore {
    /// Creates a node-local store.
    pub fn local(capacity: u64, ttl: Duration) -> Self {
        Self {
            local: build_cache(capacity, ttl),
            shared: None,
            purge: None,
            locks: KeyedLocks::new(),
            ttl,
        }
    }

    /// Creates a store mirroring writes to `shared`.
    ///
    /// Spawns the purge worker; must be called from within a Tokio runtime.
    pub fn with_shared(
        capacity: u64,
        ttl: Duration,
        shared: Arc<dyn StorageBackend>,
        purge_capacity: usize,
    ) -> Self {
        let purge = PurgeQueue::spawn(Arc::clone(&shared), purge_capacity);
        Self {
            local: build_cache(capacity, ttl),
            shared: Some(shared),
            purge: Some(purge),
            locks: KeyedLocks::new(),
            ttl,
        }
    }

    /// Returns `true` if writes are mirrored to a shared backend.
    #[must_use]
    pub fn is_ha(&self) -> bool {
        self.shared.is_some()
    }

    /// Purge queue counters; all zero when not in HA mode.
    #[must_use]
    pub fn purge_stats(&self) -> PurgeStats {
        self.purge.as_ref().map(PurgeQueue::stats).unwrap_or_default()
    }

    /// Waits for background purges to drain.
    pub async fn wait_purged(&self, timeout: Duration) -> bool {
        match &self.purge {
            Some(purge) => purge.wait_idle(timeout).await,
            None => true,
        }
    }

    /// Stores `data` on behalf of transaction `owner` and returns its id.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the shared mirror cannot be written; the
    /// document is then not stored at all.
    #[tracing::instrument(skip(self, data), fields(size = data.len()))]
    pub async fn store(&self, owner: &str, data: Bytes) -> BrokerResult<String> {
        let id = ids::new_document_id();
        let mut document = TempDocument {
            id: id.clone(),
            owner: owner.to_owned(),
            created_at: Utc::now(),
            tier: Tier::Local,
            data,
        };
        if let Some(shared) = &self.shared {
            let framed = encode_shared(&document)?;
            shared.set_with_ttl(document_key(&id), framed, self.ttl).await?;
            document.tier = Tier::Shared;
        }
        self.local.insert(id.clone(), document).await;
        Ok(id)
    }

    /// Reads a document.
    ///
    /// Without a shared backend the document stays cached until deleted or
    /// expired. In HA mode a read hands the document off: the local copy is
    /// evicted and the shared copy purged in the background. A mirrored copy
    /// whose shared entry was already consumed by another node is not served.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the shared backend fails.
    #[tracing::instrument(skip(self))]
    pub async fn retrieve(&self, id: &str) -> BrokerResult<Option<Bytes>> {
        if !ids::is_well_formed(id) {
            return Ok(None);
        }
        let _guard = self.locks.lock(id).await;

        let Some(shared) = &self.shared else {
            return Ok(self.local.get(id).await.map(|document| document.data));
        };

        if let Some(document) = self.local.get(id).await {
            self.local.invalidate(id).await;
            if document.tier == Tier::Shared && !self.exists_shared(id).await? {
                tracing::debug!("document already consumed on another node");
                return Ok(None);
            }
            self.enqueue_purge(id);
            return Ok(Some(document.data));
        }

        let Some(raw) = shared.get(&document_key(id)).await? else {
            return Ok(None);
        };
        let document = decode_shared(raw)?;
        self.enqueue_purge(id);
        tracing::debug!("document served from shared store");
        Ok(Some(document.data))
    }

    /// Reads and removes a document.
    ///
    /// Of several callers racing on one id, on this node or across nodes, at
    /// most one receives the data.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the shared backend fails.
    #[tracing::instrument(skip(self))]
    pub async fn retrieve_and_delete(&self, id: &str) -> BrokerResult<Option<Bytes>> {
        if !ids::is_well_formed(id) {
            return Ok(None);
        }
        let _guard = self.locks.lock(id).await;

        match self.local.remove(id).await {
            Some(document) if document.tier == Tier::Shared => {
                // Another node may already have consumed the mirror.
                let Some(shared) = &self.shared else {
                    return Ok(Some(document.data));
                };
                let taken = shared.take(&document_key(id)).await?;
                Ok(taken.map(|_| document.data))
            },
            Some(document) => Ok(Some(document.data)),
            None => {
                let Some(shared) = &self.shared else {
                    return Ok(None);
                };
                match shared.take(&document_key(id)).await? {
                    Some(raw) => Ok(Some(decode_shared(raw)?.data)),
                    None => Ok(None),
                }
            },
        }
    }

    /// Returns `true` if the document is present in either tier.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the shared backend fails.
    pub async fn exists(&self, id: &str) -> BrokerResult<bool> {
        match (self.local.get(id).await, &self.shared) {
            (Some(document), Some(_)) if document.tier == Tier::Shared => {
                if self.exists_shared(id).await? {
                    return Ok(true);
                }
                self.local.invalidate(id).await;
                Ok(false)
            },
            (Some(_), _) => Ok(true),
            (None, _) => self.exists_shared(id).await,
        }
    }

    /// Returns `true` if the document is in this node's cache.
    #[must_use]
    pub fn exists_local(&self, id: &str) -> bool {
        self.local.contains_key(id)
    }

    /// Returns `true` if the document has a shared copy.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the shared backend fails.
    pub async fn exists_shared(&self, id: &str) -> BrokerResult<bool> {
        match &self.shared {
            Some(shared) if ids::is_well_formed(id) => {
                Ok(shared.get(&document_key(id)).await?.is_some())
            },
            _ => Ok(false),
        }
    }

    /// Removes a document from both tiers.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the shared copy cannot be removed.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> BrokerResult<()> {
        if !ids::is_well_formed(id) {
            return Ok(());
        }
        let _guard = self.locks.lock(id).await;
        self.local.invalidate(id).await;
        if let Some(shared) = &self.shared {
            shared.delete(&document_key(id)).await?;
        }
        Ok(())
    }

    /// Removes a document, logging instead of failing.
    pub async fn discard(&self, id: &str) {
        if let Err(err) = self.delete(id).await {
            tracing::warn!(document_id = %id, error = %err, "failed to discard temporary document");
        }
    }

    fn enqueue_purge(&self, id: &str) {
        if let Some(purge) = &self.purge {
            purge.enqueue(document_key(id));
        }
    }
}

fn build_cache(capacity: u64, ttl: Duration) -> Cache<String, TempDocument> {
    Cache::builder().max_capacity(capacity).time_to_live(ttl).build()
}

fn document_key(id: &str) -> Vec<u8> {
    format!("{DOCUMENT_PREFIX}{id}").into_bytes()
}

/// Frames a document as `[header length: u32 BE][JSON header][payload]`.
fn encode_shared(document: &TempDocument) -> BrokerResult<Vec<u8>> {
    let header = serde_json::to_vec(&SharedHeader {
        id: document.id.clone(),
        owner: document.owner.clone(),
        created_at: document.created_at,
    })?;
    let header_len = u32::try_from(header.len())
        .map_err(|_| StorageError::serialization("document header too large"))?;
    let mut buf = BytesMut::with_capacity(FRAME_LEN + header.len() + document.data.len());
    buf.put_u32(header_len);
    buf.put_slice(&header);
    buf.put_slice(&document.data);
    Ok(buf.to_vec())
}

fn decode_shared(raw: Bytes) -> BrokerResult<TempDocument> {
    let truncated = || StorageError::serialization("truncated shared document");
    let len_bytes: [u8; FRAME_LEN] =
        raw.get(..FRAME_LEN).and_then(|b| b.try_into().ok()).ok_or_else(truncated)?;
    let header_len = u32::from_be_bytes(len_bytes) as usize;
    let header_end = FRAME_LEN.checked_add(header_len).ok_or_else(truncated)?;
    let header_bytes = raw.get(FRAME_LEN..header_end).ok_or_else(truncated)?;
    let header: SharedHeader = serde_json::from_slice(header_bytes)?;
    Ok(TempDocument {
        id: header.id,
        owner: header.owner,
        created_at: header.created_at,
        tier: Tier::Shared,
        data: raw.slice(header_end..),
    })
}
