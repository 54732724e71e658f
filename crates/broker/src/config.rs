//! Broker configuration.
//!
//! [`BrokerConfig`] is deserializable from JSON (durations in humantime form,
//! e.g. `"15m"`) and can be built programmatically through its builder, which
//! validates every field.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use sigbroker::config::{BrokerConfig, HaConfig};
//!
//! let config = BrokerConfig::builder()
//!     .check_application(true)
//!     .session_max_inactive(Duration::from_secs(600))
//!     .ha(HaConfig::builder().shared_dir("/mnt/broker").build())
//!     .build()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::{collections::HashSet, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use sigbroker_storage::ConfigError;

/// Default inactivity interval after which a session expires (15 minutes).
pub const DEFAULT_SESSION_MAX_INACTIVE: Duration = Duration::from_secs(15 * 60);

/// Default lifetime of temporary documents (15 minutes).
pub const DEFAULT_DOCUMENT_TTL: Duration = Duration::from_secs(15 * 60);

/// Default number of documents kept in the node-local cache.
pub const DEFAULT_LOCAL_CACHE_CAPACITY: u64 = 10_000;

/// Default maximum number of documents in one batch.
pub const DEFAULT_BATCH_MAX_DOCUMENTS: usize = 100;

/// Default maximum size of a single document (8 MiB).
pub const DEFAULT_MAX_DOCUMENT_SIZE: usize = 8 * 1024 * 1024;

/// Default capacity of the background purge queue.
pub const DEFAULT_PURGE_QUEUE_CAPACITY: usize = 1024;

/// Default interval between session expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default lease held on a session while it is being mutated.
pub const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(30);

/// Default time spent waiting for a session lease.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);

/// Default public base URL used to build redirect URLs.
pub const DEFAULT_PUBLIC_URL: &str = "http://localhost:8080";

/// High-availability settings.
///
/// When present, sessions and documents are mirrored to a directory shared by
/// every node of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HaConfig {
    /// Directory shared by every node.
    #[builder(into)]
    pub shared_dir: PathBuf,

    /// How long a node may hold a session lease before it lapses.
    #[serde(with = "humantime_serde", default = "default_lock_lease")]
    #[builder(default = DEFAULT_LOCK_LEASE)]
    pub lock_lease: Duration,

    /// How long a request waits for a session lease held elsewhere.
    #[serde(with = "humantime_serde", default = "default_lock_wait")]
    #[builder(default = DEFAULT_LOCK_WAIT)]
    pub lock_wait: Duration,
}

fn default_lock_lease() -> Duration {
    DEFAULT_LOCK_LEASE
}

fn default_lock_wait() -> Duration {
    DEFAULT_LOCK_WAIT
}

/// Audit recording policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    /// Master switch; when `false` the recorder is inert.
    #[serde(default)]
    #[builder(default)]
    pub enabled: bool,

    /// Directory receiving daily audit files.
    #[serde(default)]
    #[builder(into)]
    pub dir: Option<PathBuf>,

    /// Also write records to the database sink supplied at startup.
    #[serde(default)]
    #[builder(default)]
    pub database: bool,
}

/// A client application known to the static registry.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplicationConfig {
    /// Application id sent as `appId`.
    #[builder(into)]
    pub id: String,

    /// Display name recorded in audit records.
    #[builder(into)]
    pub name: String,

    /// Disabled applications are rejected as unauthorized.
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub enabled: bool,

    /// SHA-256 fingerprints (hex, optionally colon separated) of trusted client certificates.
    #[serde(default)]
    #[builder(default)]
    pub certificates: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Configuration of the broker core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    #[serde(default)]
    pub(crate) check_application: bool,

    #[serde(default)]
    pub(crate) check_certificate: bool,

    #[serde(with = "humantime_serde", default = "default_session_max_inactive")]
    pub(crate) session_max_inactive: Duration,

    #[serde(with = "humantime_serde", default = "default_document_ttl")]
    pub(crate) document_ttl: Duration,

    #[serde(default = "default_local_cache_capacity")]
    pub(crate) local_cache_capacity: u64,

    #[serde(default)]
    pub(crate) ha: Option<HaConfig>,

    #[serde(default)]
    pub(crate) audit: AuditConfig,

    #[serde(default = "default_batch_max_documents")]
    pub(crate) batch_max_documents: usize,

    #[serde(default = "default_max_document_size")]
    pub(crate) max_document_size: usize,

    #[serde(default = "default_purge_queue_capacity")]
    pub(crate) purge_queue_capacity: usize,

    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub(crate) sweep_interval: Duration,

    #[serde(default)]
    pub(crate) node_name: Option<String>,

    #[serde(default = "default_public_url")]
    pub(crate) public_url: String,

    #[serde(default)]
    pub(crate) applications: Vec<ApplicationConfig>,
}

fn default_session_max_inactive() -> Duration {
    DEFAULT_SESSION_MAX_INACTIVE
}

fn default_document_ttl() -> Duration {
    DEFAULT_DOCUMENT_TTL
}

fn default_local_cache_capacity() -> u64 {
    DEFAULT_LOCAL_CACHE_CAPACITY
}

fn default_batch_max_documents() -> usize {
    DEFAULT_BATCH_MAX_DOCUMENTS
}

fn default_max_document_size() -> usize {
    DEFAULT_MAX_DOCUMENT_SIZE
}

fn default_purge_queue_capacity() -> usize {
    DEFAULT_PURGE_QUEUE_CAPACITY
}

fn default_sweep_interval() -> Duration {
    DEFAULT_SWEEP_INTERVAL
}

fn default_public_url() -> String {
    DEFAULT_PUBLIC_URL.to_owned()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            check_application: false,
            check_certificate: false,
            session_max_inactive: DEFAULT_SESSION_MAX_INACTIVE,
            document_ttl: DEFAULT_DOCUMENT_TTL,
            local_cache_capacity: DEFAULT_LOCAL_CACHE_CAPACITY,
            ha: None,
            audit: AuditConfig::default(),
            batch_max_documents: DEFAULT_BATCH_MAX_DOCUMENTS,
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
            purge_queue_capacity: DEFAULT_PURGE_QUEUE_CAPACITY,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            node_name: None,
            public_url: DEFAULT_PUBLIC_URL.to_owned(),
            applications: Vec::new(),
        }
    }
}

#[bon::bon]
impl BrokerConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] for zero durations or capacities and
    /// [`ConfigError::Invalid`] for structurally invalid settings.
    #[builder]
    pub fn new(
        #[builder(default)] check_application: bool,
        #[builder(default)] check_certificate: bool,
        #[builder(default = DEFAULT_SESSION_MAX_INACTIVE)] session_max_inactive: Duration,
        #[builder(default = DEFAULT_DOCUMENT_TTL)] document_ttl: Duration,
        #[builder(default = DEFAULT_LOCAL_CACHE_CAPACITY)] local_cache_capacity: u64,
        ha: Option<HaConfig>,
        #[builder(default)] audit: AuditConfig,
        #[builder(default = DEFAULT_BATCH_MAX_DOCUMENTS)] batch_max_documents: usize,
        #[builder(default = DEFAULT_MAX_DOCUMENT_SIZE)] max_document_size: usize,
        #[builder(default = DEFAULT_PURGE_QUEUE_CAPACITY)] purge_queue_capacity: usize,
        #[builder(default = DEFAULT_SWEEP_INTERVAL)] sweep_interval: Duration,
        #[builder(into)] node_name: Option<String>,
        #[builder(into, default = DEFAULT_PUBLIC_URL.to_owned())] public_url: String,
        #[builder(default)] applications: Vec<ApplicationConfig>,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            check_application,
            check_certificate,
            session_max_inactive,
            document_ttl,
            local_cache_capacity,
            ha,
            audit,
            batch_max_documents,
            max_document_size,
            purge_queue_capacity,
            sweep_interval,
            node_name,
            public_url,
            applications,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the document does not parse, or any
    /// error [`validate`](Self::validate) reports.
    pub fn from_json(json: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_slice(json)
            .map_err(|e| ConfigError::Invalid { field: "config", reason: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every field against its constraints.
    ///
    /// Deserialized configurations bypass the builder, so callers loading one
    /// by other means must call this before use.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero_duration("session_max_inactive", self.session_max_inactive)?;
        non_zero_duration("document_ttl", self.document_ttl)?;
        non_zero_duration("sweep_interval", self.sweep_interval)?;
        at_least_one("local_cache_capacity", self.local_cache_capacity as usize)?;
        at_least_one("batch_max_documents", self.batch_max_documents)?;
        at_least_one("max_document_size", self.max_document_size)?;
        at_least_one("purge_queue_capacity", self.purge_queue_capacity)?;

        if self.public_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "public_url",
                reason: "must not be empty".into(),
            });
        }

        if let Some(ha) = &self.ha {
            if ha.shared_dir.as_os_str().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "ha.shared_dir",
                    reason: "path is empty".into(),
                });
            }
            non_zero_duration("ha.lock_wait", ha.lock_wait)?;
            if ha.lock_lease <= ha.lock_wait {
                return Err(ConfigError::BelowMinimum {
                    field: "ha.lock_lease",
                    min: format!("{:?}", ha.lock_wait),
                    value: format!("{:?}", ha.lock_lease),
                });
            }
        }

        if self.audit.enabled && self.audit.dir.is_none() && !self.audit.database {
            return Err(ConfigError::Invalid {
                field: "audit",
                reason: "enabled without a directory or database sink".into(),
            });
        }

        let mut seen = HashSet::new();
        for app in &self.applications {
            if app.id.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "applications",
                    reason: "application id is empty".into(),
                });
            }
            if !seen.insert(app.id.as_str()) {
                return Err(ConfigError::Invalid {
                    field: "applications",
                    reason: format!("duplicate application id {}", app.id),
                });
            }
        }

        Ok(())
    }

    /// Whether incoming application ids are validated against the registry.
    #[must_use]
    pub fn check_application(&self) -> bool {
        self.check_application
    }

    /// Whether client certificates are validated against the registry.
    #[must_use]
    pub fn check_certificate(&self) -> bool {
        self.check_certificate
    }

    /// Inactivity interval after which a session expires.
    #[must_use]
    pub fn session_max_inactive(&self) -> Duration {
        self.session_max_inactive
    }

    /// Lifetime of temporary documents.
    #[must_use]
    pub fn document_ttl(&self) -> Duration {
        self.document_ttl
    }

    /// Capacity of the node-local document cache.
    #[must_use]
    pub fn local_cache_capacity(&self) -> u64 {
        self.local_cache_capacity
    }

    /// High-availability settings, if enabled.
    #[must_use]
    pub fn ha(&self) -> Option<&HaConfig> {
        self.ha.as_ref()
    }

    /// Whether high-availability mode is enabled.
    #[must_use]
    pub fn is_ha(&self) -> bool {
        self.ha.is_some()
    }

    /// Audit policy.
    #[must_use]
    pub fn audit(&self) -> &AuditConfig {
        &self.audit
    }

    /// Maximum number of documents in one batch.
    #[must_use]
    pub fn batch_max_documents(&self) -> usize {
        self.batch_max_documents
    }

    /// Maximum size of one document in bytes.
    #[must_use]
    pub fn max_document_size(&self) -> usize {
        self.max_document_size
    }

    /// Capacity of the background purge queue.
    #[must_use]
    pub fn purge_queue_capacity(&self) -> usize {
        self.purge_queue_capacity
    }

    /// Interval between session expiry sweeps.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Configured node name, if any.
    #[must_use]
    pub fn node_name(&self) -> Option<&str> {
        self.node_name.as_deref()
    }

    /// Public base URL of this service.
    #[must_use]
    pub fn public_url(&self) -> &str {
        self.public_url.trim_end_matches('/')
    }

    /// Statically registered applications.
    #[must_use]
    pub fn applications(&self) -> &[ApplicationConfig] {
        &self.applications
    }
}

fn non_zero_duration(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::BelowMinimum { field, min: "1ms".into(), value: "0s".into() });
    }
    Ok(())
}

fn at_least_one(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::BelowMinimum { field, min: "1".into(), value: "0".into() });
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = BrokerConfig::builder().build().unwrap();
        assert_eq!(config.session_max_inactive(), DEFAULT_SESSION_MAX_INACTIVE);
        assert_eq!(config.batch_max_documents(), DEFAULT_BATCH_MAX_DOCUMENTS);
        assert!(!config.is_ha());
        assert!(!config.audit().enabled);
    }

    #[test]
    fn zero_session_interval_is_rejected() {
        let err = BrokerConfig::builder().session_max_inactive(Duration::ZERO).build().unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { field: "session_max_inactive", .. }));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = BrokerConfig::builder().batch_max_documents(0).build().unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { field: "batch_max_documents", .. }));
    }

    #[test]
    fn lease_must_exceed_wait() {
        let ha = HaConfig::builder()
            .shared_dir("/tmp/shared")
            .lock_lease(Duration::from_secs(1))
            .lock_wait(Duration::from_secs(2))
            .build();
        let err = BrokerConfig::builder().ha(ha).build().unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { field: "ha.lock_lease", .. }));
    }

    #[test]
    fn audit_without_sink_is_rejected() {
        let audit = AuditConfig::builder().enabled(true).build();
        let err = BrokerConfig::builder().audit(audit).build().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "audit", .. }));
    }

    #[test]
    fn duplicate_application_is_rejected() {
        let app = ApplicationConfig::builder().id("APP1").name("One").build();
        let err =
            BrokerConfig::builder().applications(vec![app.clone(), app]).build().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "applications", .. }));
    }

    #[test]
    fn parses_json_with_humantime_durations() {
        let json = br#"{
            "check_application": true,
            "session_max_inactive": "10m",
            "ha": { "shared_dir": "/mnt/broker", "lock_wait": "2s" },
            "audit": { "enabled": true, "dir": "/var/log/broker" },
            "applications": [
                { "id": "APP1", "name": "Portal", "certificates": ["AB:CD"] }
            ]
        }"#;
        let config = BrokerConfig::from_json(json).unwrap();
        assert!(config.check_application());
        assert_eq!(config.session_max_inactive(), Duration::from_secs(600));
        let ha = config.ha().unwrap();
        assert_eq!(ha.lock_wait, Duration::from_secs(2));
        assert_eq!(ha.lock_lease, DEFAULT_LOCK_LEASE);
        assert!(config.applications()[0].enabled);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = BrokerConfig::from_json(br#"{ "check_aplication": true }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "config", .. }));
    }

    #[test]
    fn public_url_trailing_slash_is_trimmed() {
        let config = BrokerConfig::builder().public_url("https://broker.example/").build().unwrap();
        assert_eq!(config.public_url(), "https://broker.example");
    }
}
