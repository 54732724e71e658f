//! Transaction sessions.
//!
//! A [`FireSession`] holds the mutable state of one transaction across the
//! HTTP round-trips that make it up. Sessions are persisted by the
//! [`SessionStore`] and handed out wrapped in a [`SessionHandle`] which, when
//! obtained for update, holds the transaction's lock until it is committed,
//! removed or dropped.

mod locks;
mod store;

use std::{
    collections::BTreeMap,
    ops::{Deref, DerefMut},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

pub(crate) use self::locks::KeyedLocks;
pub use self::store::{LeaseSettings, SessionStore};
use self::locks::SessionLock;
use crate::{batch::Batch, operation::Operation};

/// Well-known session attribute names.
pub mod attr {
    /// Cryptographic operation requested by the client.
    pub const CRYPTO_OPERATION: &str = "cop";
    /// Signature algorithm.
    pub const ALGORITHM: &str = "algorithm";
    /// Signature format.
    pub const FORMAT: &str = "format";
    /// Upgrade format, if any.
    pub const UPGRADE: &str = "upgrade";
    /// Size in bytes of the document being signed.
    pub const DOCUMENT_SIZE: &str = "document_size";
    /// Provider chosen by the user.
    pub const PROVIDER: &str = "provider";
    /// Provider imposed by the application.
    pub const PROVIDER_FORCED: &str = "provider_forced";
    /// Providers offered to the user.
    pub const PROVIDERS: &str = "providers";
    /// Browser family of the user.
    pub const BROWSER: &str = "browser";
    /// Temporary document id of the document to sign.
    pub const DOCUMENT_ID: &str = "document_id";
    /// Temporary document id of a base signature awaiting upgrade.
    pub const SIGNATURE_ID: &str = "signature_id";
    /// Code of the last recorded error.
    pub const ERROR_CODE: &str = "error_code";
    /// Message of the last recorded error.
    pub const ERROR_MESSAGE: &str = "error_message";
}

/// A typed session attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    Text(String),
    Integer(i64),
    Flag(bool),
    List(Vec<String>),
}

/// Protocol state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Normal state.
    #[default]
    Open,
    /// A base signature was returned and its upgrade is pending.
    PendingUpgrade,
}

/// Provider resolved from the session attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderChoice {
    /// Provider name.
    pub name: String,
    /// `true` when the user had no choice.
    pub mandatory: bool,
}

/// State of one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireSession {
    /// Transaction id.
    pub transaction_id: String,
    /// SHA-256 digest of the obfuscation key; the key itself is never stored.
    pub(crate) subject_digest: String,
    /// Application that started the transaction.
    pub app_id: String,
    /// Resolved application name, when application checks are enabled.
    pub app_name: Option<String>,
    /// Operation that created or last defined the transaction.
    pub operation: Operation,
    /// Protocol state.
    pub state: SessionState,
    /// Free-form attributes.
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Batch owned by this transaction, if it is a batch transaction.
    pub batch: Option<Batch>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last time the session was committed.
    pub last_access: DateTime<Utc>,
}

impl FireSession {
    pub(crate) fn new(
        transaction_id: impl Into<String>,
        app_id: impl Into<String>,
        subject_digest: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            transaction_id: transaction_id.into(),
            subject_digest,
            app_id: app_id.into(),
            app_name: None,
            operation: Operation::Other,
            state: SessionState::Open,
            attributes: BTreeMap::new(),
            batch: None,
            created_at: now,
            last_access: now,
        }
    }

    /// Returns `true` if the session was last accessed more than `max_inactive` before `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, max_inactive: Duration) -> bool {
        let limit = TimeDelta::from_std(max_inactive).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(self.last_access) > limit
    }

    pub(crate) fn touch(&mut self) {
        self.last_access = Utc::now();
    }

    /// Text attribute, if present and non-empty.
    #[must_use]
    pub fn text(&self, key: &str) -> Option<&str> {
        match self.attributes.get(key) {
            Some(AttributeValue::Text(value)) if !value.is_empty() => Some(value),
            _ => None,
        }
    }

    /// Integer attribute, if present.
    #[must_use]
    pub fn integer(&self, key: &str) -> Option<i64> {
        match self.attributes.get(key) {
            Some(AttributeValue::Integer(value)) => Some(*value),
            _ => None,
        }
    }

    /// Flag attribute; absent flags read as `false`.
    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.attributes.get(key), Some(AttributeValue::Flag(true)))
    }

    /// List attribute; absent lists read as empty.
    #[must_use]
    pub fn list(&self, key: &str) -> &[String] {
        match self.attributes.get(key) {
            Some(AttributeValue::List(values)) => values,
            _ => &[],
        }
    }

    pub fn set_text(&mut self, key: &str, value: impl Into<String>) {
        self.attributes.insert(key.to_owned(), AttributeValue::Text(value.into()));
    }

    pub fn set_integer(&mut self, key: &str, value: i64) {
        self.attributes.insert(key.to_owned(), AttributeValue::Integer(value));
    }

    pub fn set_flag(&mut self, key: &str, value: bool) {
        self.attributes.insert(key.to_owned(), AttributeValue::Flag(value));
    }

    pub fn set_list(&mut self, key: &str, values: Vec<String>) {
        self.attributes.insert(key.to_owned(), AttributeValue::List(values));
    }

    pub fn remove_attribute(&mut self, key: &str) -> Option<AttributeValue> {
        self.attributes.remove(key)
    }

    /// Records an error for later retrieval through RECOVER_ERROR.
    pub fn record_error(&mut self, code: impl Into<String>, message: impl Into<String>) {
        self.set_text(attr::ERROR_CODE, code);
        self.set_text(attr::ERROR_MESSAGE, message);
    }

    /// Resolves the provider from the session attributes.
    ///
    /// Precedence: a forced provider (mandatory), then the provider chosen by
    /// the user, then the only provider offered (mandatory).
    #[must_use]
    pub fn resolved_provider(&self) -> Option<ProviderChoice> {
        if let Some(forced) = self.text(attr::PROVIDER_FORCED) {
            return Some(ProviderChoice { name: forced.to_owned(), mandatory: true });
        }
        if let Some(chosen) = self.text(attr::PROVIDER) {
            return Some(ProviderChoice { name: chosen.to_owned(), mandatory: false });
        }
        match self.list(attr::PROVIDERS) {
            [only] => Some(ProviderChoice { name: only.clone(), mandatory: true }),
            _ => None,
        }
    }
}

/// A session loaded from the [`SessionStore`].
///
/// Dereferences to [`FireSession`]. A handle obtained for update holds the
/// transaction lock; the lock is released by [`SessionStore::commit`],
/// [`SessionStore::remove_locked`], [`SessionStore::release`] or on drop.
#[derive(Debug)]
pub struct SessionHandle {
    session: FireSession,
    lock: Option<SessionLock>,
}

impl SessionHandle {
    pub(crate) fn new(session: FireSession, lock: Option<SessionLock>) -> Self {
        Self { session, lock }
    }

    /// Returns `true` if this handle holds the transaction lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Detaches the session, releasing any lock.
    #[must_use]
    pub fn into_inner(self) -> FireSession {
        self.session
    }

    pub(crate) fn take_lock(&mut self) -> Option<SessionLock> {
        self.lock.take()
    }
}

impl Deref for SessionHandle {
    type Target = FireSession;

    fn deref(&self) -> &FireSession {
        &self.session
    }
}

impl DerefMut for SessionHandle {
    fn deref_mut(&mut self) -> &mut FireSession {
        &mut self.session
    }
}
