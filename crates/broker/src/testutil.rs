//! Test doubles and a fully wired broker for tests.
//!
//! Feature-gated behind `testutil` so it never leaks into production builds.
//!
//! ```toml
//! [dev-dependencies]
//! sigbroker = { workspace = true, features = ["testutil"] }
//! ```

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    alarms::{Alarm, AlarmNotifier},
    audit::{AuditRecord, AuditSink, AuditSinkError},
    config::{AuditConfig, BrokerConfig, HaConfig},
    context::BrokerContext,
    dispatcher::Dispatcher,
    error::FireError,
    origin::OriginChosen,
    request::{InboundRequest, RequestParameters, params},
    response::FireResponse,
    signer::{SignParameters, SigningBackend, SigningFailure, UPGRADE_OPERATION},
};

/// Failure code returned by [`ScriptedSigner`] for scripted failures.
pub const SCRIPTED_FAILURE_CODE: &str = "SCRIPTED_FAILURE";

/// Deterministic signing backend.
///
/// Signing `x` yields `SIGNED(x)`; an upgrade call yields `UPGRADED(x)`.
/// Documents whose content was registered with [`failing`](Self::failing)
/// fail with [`SCRIPTED_FAILURE_CODE`].
#[derive(Debug, Default)]
pub struct ScriptedSigner {
    failing: HashSet<Vec<u8>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedSigner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A signer that fails for every document equal to one of `documents`.
    #[must_use]
    pub fn failing<I, D>(documents: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: AsRef<[u8]>,
    {
        Self {
            failing: documents.into_iter().map(|d| d.as_ref().to_vec()).collect(),
            ..Self::default()
        }
    }

    /// Sleeps for `delay` before answering each call.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of calls received so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SigningBackend for ScriptedSigner {
    async fn sign(
        &self,
        document: Bytes,
        params: &SignParameters,
    ) -> Result<Bytes, SigningFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.contains(&document[..]) {
            return Err(SigningFailure::new(SCRIPTED_FAILURE_CODE, "scripted failure"));
        }
        let tag: &[u8] =
            if params.crypto_operation == UPGRADE_OPERATION { b"UPGRADED(" } else { b"SIGNED(" };
        let mut out = Vec::with_capacity(tag.len() + document.len() + 1);
        out.extend_from_slice(tag);
        out.extend_from_slice(&document);
        out.push(b')');
        Ok(Bytes::from(out))
    }
}

/// Alarm notifier that keeps every alarm in memory.
#[derive(Debug, Default)]
pub struct MemoryAlarmNotifier {
    raised: Mutex<Vec<(Alarm, String)>>,
}

impl MemoryAlarmNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Alarms raised so far, oldest first.
    #[must_use]
    pub fn raised(&self) -> Vec<(Alarm, String)> {
        self.raised.lock().clone()
    }
}

impl AlarmNotifier for MemoryAlarmNotifier {
    fn notify(&self, alarm: Alarm, detail: &str) {
        self.raised.lock().push((alarm, detail.to_owned()));
    }
}

/// Audit sink that keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records written so far, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn write(&self, record: &AuditRecord) -> Result<(), AuditSinkError> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// A broker node wired with test doubles.
///
/// Audit records go to [`audit`](Self::audit) and alarms to
/// [`alarms`](Self::alarms) whatever the supplied configuration says.
pub struct TestBroker {
    pub dispatcher: Dispatcher,
    pub signer: Arc<ScriptedSigner>,
    pub audit: Arc<MemoryAuditSink>,
    pub alarms: Arc<MemoryAlarmNotifier>,
}

impl TestBroker {
    /// A single node with the default configuration.
    ///
    /// # Panics
    ///
    /// Panics if the context cannot be built.
    pub async fn start() -> Self {
        let config =
            BrokerConfig::builder().public_url("http://broker.test").build().expect("config");
        Self::with_config(config, ScriptedSigner::new()).await
    }

    /// A node with `config` and `signer`.
    ///
    /// # Panics
    ///
    /// Panics if the context cannot be built.
    pub async fn with_config(mut config: BrokerConfig, signer: ScriptedSigner) -> Self {
        config.audit = AuditConfig::builder().enabled(true).database(true).build();
        let signer = Arc::new(signer);
        let audit = Arc::new(MemoryAuditSink::new());
        let alarms = Arc::new(MemoryAlarmNotifier::new());
        let context = BrokerContext::builder()
            .config(config)
            .signer(signer.clone())
            .alarms(alarms.clone())
            .audit_database(audit.clone())
            .build()
            .await
            .expect("build broker context");
        Self { dispatcher: Dispatcher::new(Arc::new(context)), signer, audit, alarms }
    }

    /// Two nodes sharing one high-availability directory, each with its own signer.
    ///
    /// The returned [`tempfile::TempDir`] must outlive both nodes.
    ///
    /// # Panics
    ///
    /// Panics if the directory or either context cannot be created.
    pub async fn ha_pair() -> (tempfile::TempDir, Self, Self) {
        let dir = tempfile::tempdir().expect("create shared dir");
        let node = |name: &str| {
            BrokerConfig::builder()
                .node_name(name)
                .ha(HaConfig::builder()
                    .shared_dir(dir.path())
                    .lock_lease(Duration::from_secs(5))
                    .lock_wait(Duration::from_secs(2))
                    .build())
                .build()
                .expect("ha config")
        };
        let a = Self::with_config(node("node-a"), ScriptedSigner::new()).await;
        let b = Self::with_config(node("node-b"), ScriptedSigner::new()).await;
        (dir, a, b)
    }

    /// The node's broker context.
    pub async fn context(&self) -> &Arc<BrokerContext> {
        self.dispatcher.context().await.expect("context supplied at construction")
    }

    /// Dispatches a request made of `pairs` for application `APP1`.
    pub async fn call(&self, pairs: &[(&str, &str)]) -> Result<FireResponse, FireError> {
        let mut params: RequestParameters = pairs.iter().copied().collect();
        if params.get(params::APP_ID).is_none() {
            params.insert(params::APP_ID, "APP1");
        }
        self.dispatcher.dispatch(InboundRequest::new(params)).await
    }

    /// Runs the choose-origin step for a transaction.
    pub async fn choose_origin(
        &self,
        transaction_id: &str,
        subject_ref: &str,
        origin: Option<&str>,
    ) -> Result<OriginChosen, FireError> {
        let mut params: RequestParameters =
            [(params::TRANSACTION_ID, transaction_id), (params::SUBJECT_REF, subject_ref)]
                .into_iter()
                .collect();
        if let Some(origin) = origin {
            params.insert(params::ORIGIN, origin);
        }
        self.dispatcher.choose_origin(InboundRequest::new(params)).await
    }
}
