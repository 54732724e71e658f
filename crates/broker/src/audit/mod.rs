//! Audit recording of completed transactions.
//!
//! Each transaction produces exactly one [`AuditRecord`] at its terminal
//! point. The [`AuditRecorder`] projects the record out of the session and
//! hands it to the configured sinks: a daily file when an audit directory is
//! configured, plus a database sink. Without a database sink supplied by the
//! embedding service, database records are emitted as structured `tracing`
//! events through [`TracingAuditSink`].
//!
//! Recording never fails the request that triggered it: sink errors are
//! logged and swallowed.
//!
//! # Usage
//!
//! ```
//! use sigbroker::audit::{AuditRecord, AuditRecorder};
//! use sigbroker::operation::Operation;
//!
//! let recorder = AuditRecorder::disabled();
//! assert!(!recorder.is_enabled());
//!
//! let record = AuditRecord::builder()
//!     .transaction_id("0")
//!     .result(false)
//!     .app_id("APP1")
//!     .operation(Operation::Sign)
//!     .node("node-1")
//!     .build();
//! assert!(record.to_string().contains(";APP1;"));
//! ```

mod sink;

use std::{fmt, sync::Arc};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

pub use self::sink::{AuditSink, AuditSinkError, FileAuditSink, TracingAuditSink};
use crate::{
    config::AuditConfig,
    operation::Operation,
    session::{FireSession, attr},
};

/// Transaction id recorded when the session carries none.
pub const UNKNOWN_TRANSACTION: &str = "0";

/// Node name recorded when neither configuration nor `HOSTNAME` provide one.
pub const UNKNOWN_NODE: &str = "unknown";

/// Immutable summary of one transaction.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder, Serialize)]
pub struct AuditRecord {
    /// When the record was produced.
    #[builder(default = Utc::now())]
    pub timestamp: DateTime<Utc>,
    #[builder(into)]
    pub transaction_id: String,
    /// Transaction-level result.
    pub result: bool,
    #[builder(into)]
    pub app_id: String,
    #[builder(into)]
    pub app_name: Option<String>,
    pub operation: Operation,
    #[builder(into)]
    pub crypto_operation: Option<String>,
    /// Size in bytes of the signed data.
    #[builder(default)]
    pub document_size: u64,
    #[builder(into)]
    pub format: Option<String>,
    #[builder(into)]
    pub upgrade: Option<String>,
    #[builder(into)]
    pub algorithm: Option<String>,
    #[builder(into)]
    pub provider: Option<String>,
    /// `true` when the provider was imposed rather than chosen.
    #[builder(default)]
    pub mandatory_provider: bool,
    #[builder(into)]
    pub browser: Option<String>,
    /// Present only when `result` is `false`.
    #[builder(into)]
    pub error_detail: Option<String>,
    /// Node that produced the record.
    #[builder(into)]
    pub node: String,
}

impl fmt::Display for AuditRecord {
    /// One `;` separated line; `;` inside values is replaced by `,`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let opt = |value: &Option<String>| value.as_deref().map(sanitize).unwrap_or_default();
        let fields = [
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            sanitize(&self.transaction_id),
            u8::from(self.result).to_string(),
            sanitize(&self.app_id),
            opt(&self.app_name),
            self.operation.to_string(),
            opt(&self.crypto_operation),
            self.document_size.to_string(),
            opt(&self.format),
            opt(&self.upgrade),
            opt(&self.algorithm),
            opt(&self.provider),
            u8::from(self.mandatory_provider).to_string(),
            opt(&self.browser),
            opt(&self.error_detail),
            sanitize(&self.node),
        ];
        f.write_str(&fields.join(";"))
    }
}

fn sanitize(value: &str) -> String {
    value.replace([';', '\n', '\r'], ",")
}

/// Builds audit records and writes them to the configured sinks.
pub struct AuditRecorder {
    enabled: bool,
    node: String,
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl AuditRecorder {
    /// A recorder that records nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self { enabled: false, node: resolve_node(None), sinks: Vec::new() }
    }

    /// Creates a recorder from configuration.
    ///
    /// `database` is used only when `config.database` is set, and defaults to
    /// [`TracingAuditSink`]. A file sink whose directory cannot be opened is
    /// skipped with a warning.
    pub fn new(
        config: &AuditConfig,
        node_name: Option<&str>,
        database: Option<Arc<dyn AuditSink>>,
    ) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        let mut sinks: Vec<Arc<dyn AuditSink>> = Vec::new();
        if let Some(dir) = &config.dir {
            match FileAuditSink::open(dir) {
                Ok(sink) => sinks.push(Arc::new(sink)),
                Err(err) => {
                    tracing::warn!(
                        dir = %dir.display(),
                        error = %err,
                        "audit file sink unavailable"
                    );
                },
            }
        }
        if config.database {
            sinks.push(database.unwrap_or_else(|| Arc::new(TracingAuditSink)));
        }
        Self::with_sinks(node_name, sinks)
    }

    /// Creates an enabled recorder writing to `sinks`.
    pub fn with_sinks(node_name: Option<&str>, sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { enabled: true, node: resolve_node(node_name), sinks }
    }

    /// Returns `true` if records are produced.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Number of sinks records are written to.
    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Node name written into records.
    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Records the outcome of the session's transaction.
    ///
    /// A failure carries the error message recorded in the session, if any.
    pub fn register(&self, session: &FireSession, result: bool) {
        self.register_inner(session, result, session.text(attr::ERROR_MESSAGE));
    }

    /// Records the outcome of the session's transaction with an error detail.
    ///
    /// The detail is kept only when `result` is `false`.
    pub fn register_with_error(&self, session: &FireSession, result: bool, error: &str) {
        self.register_inner(session, result, Some(error));
    }

    fn register_inner(&self, session: &FireSession, result: bool, error: Option<&str>) {
        if !self.enabled {
            return;
        }
        let record = self.build_record(session, result, error);
        for sink in &self.sinks {
            if let Err(err) = sink.write(&record) {
                tracing::warn!(
                    transaction_id = %record.transaction_id,
                    error = %err,
                    "failed to write audit record"
                );
            }
        }
    }

    /// Projects the audit record of `session`.
    #[must_use]
    pub fn build_record(
        &self,
        session: &FireSession,
        result: bool,
        error: Option<&str>,
    ) -> AuditRecord {
        let transaction_id = if session.transaction_id.is_empty() {
            UNKNOWN_TRANSACTION
        } else {
            session.transaction_id.as_str()
        };
        let document_size = session
            .integer(attr::DOCUMENT_SIZE)
            .and_then(|size| u64::try_from(size).ok())
            .or_else(|| session.batch.as_ref().map(|batch| batch.total_size()))
            .unwrap_or(0);
        let provider = session.resolved_provider();
        let text = |key| session.text(key).map(str::to_owned);

        AuditRecord {
            timestamp: Utc::now(),
            transaction_id: transaction_id.to_owned(),
            result,
            app_id: session.app_id.clone(),
            app_name: session.app_name.clone(),
            operation: session.operation,
            crypto_operation: text(attr::CRYPTO_OPERATION),
            document_size,
            format: text(attr::FORMAT),
            upgrade: text(attr::UPGRADE),
            algorithm: text(attr::ALGORITHM),
            mandatory_provider: provider.as_ref().is_some_and(|p| p.mandatory),
            provider: provider.map(|p| p.name),
            browser: text(attr::BROWSER),
            error_detail: if result { None } else { error.map(str::to_owned) },
            node: self.node.clone(),
        }
    }
}

fn resolve_node(configured: Option<&str>) -> String {
    configured
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|name| !name.is_empty()))
        .unwrap_or_else(|| UNKNOWN_NODE.to_owned())
}
