//! Wiring of the broker components.
//!
//! A [`BrokerContext`] is built once at startup from a [`BrokerConfig`] and
//! shared by every request. It selects the storage medium: in
//! high-availability mode sessions and documents go through the shared
//! directory backend, otherwise sessions live in an in-process
//! [`MemoryBackend`] and documents only in the local cache.

use std::{sync::Arc, time::Duration};

use sigbroker_storage::{
    FsBackend, FsConfig, MemoryBackend, StorageBackend, fs::DEFAULT_STALE_LOCK_AFTER,
};
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    alarms::{AlarmNotifier, TracingAlarmNotifier},
    audit::{AuditRecorder, AuditSink},
    batch::BatchOrchestrator,
    config::{BrokerConfig, DEFAULT_LOCK_LEASE, DEFAULT_LOCK_WAIT},
    documents::TempDocumentStore,
    error::BrokerResult,
    session::{LeaseSettings, SessionStore},
    signer::SigningBackend,
    validation::{ApplicationRegistry, CertificateValidator, StaticApplicationRegistry},
};

/// Shared state of a running broker.
pub struct BrokerContext {
    config: BrokerConfig,
    sessions: Arc<SessionStore>,
    documents: Arc<TempDocumentStore>,
    batches: BatchOrchestrator,
    signer: Arc<dyn SigningBackend>,
    audit: AuditRecorder,
    alarms: Arc<dyn AlarmNotifier>,
    applications: Arc<dyn ApplicationRegistry>,
    certificates: Arc<dyn CertificateValidator>,
    shared: Option<Arc<dyn StorageBackend>>,
    shutdown_tx: watch::Sender<()>,
    sweeper: JoinHandle<()>,
}

#[bon::bon]
impl BrokerContext {
    /// Builds the context and starts the background session sweep.
    ///
    /// `applications` and `certificates` default to a registry built from
    /// `config.applications`. `shared` replaces the shared directory backend
    /// and enables high-availability mode on its own. `audit_database`
    /// receives audit records when database auditing is enabled.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a configuration or storage error if the shared directory
    /// cannot be opened.
    #[builder]
    pub async fn new(
        config: BrokerConfig,
        signer: Arc<dyn SigningBackend>,
        #[builder(default = Arc::new(TracingAlarmNotifier) as Arc<dyn AlarmNotifier>)]
        alarms: Arc<dyn AlarmNotifier>,
        audit_database: Option<Arc<dyn AuditSink>>,
        applications: Option<Arc<dyn ApplicationRegistry>>,
        certificates: Option<Arc<dyn CertificateValidator>>,
        shared: Option<Arc<dyn StorageBackend>>,
    ) -> BrokerResult<Self> {
        let shared = match (shared, config.ha()) {
            (Some(shared), _) => Some(shared),
            (None, Some(ha)) => {
                let fs_config = FsConfig::builder()
                    .root(ha.shared_dir.clone())
                    .lock_wait(ha.lock_wait)
                    .stale_lock_after(DEFAULT_STALE_LOCK_AFTER.max(ha.lock_wait * 2))
                    .build()?;
                let backend: Arc<dyn StorageBackend> = Arc::new(FsBackend::open(fs_config).await?);
                tracing::info!(
                    shared_dir = %ha.shared_dir.display(),
                    "high-availability mode enabled"
                );
                Some(backend)
            },
            (None, None) => None,
        };

        let leases = LeaseSettings {
            lease: config.ha().map_or(DEFAULT_LOCK_LEASE, |ha| ha.lock_lease),
            wait: config.ha().map_or(DEFAULT_LOCK_WAIT, |ha| ha.lock_wait),
        };
        let sessions = Arc::new(match &shared {
            Some(shared) => {
                SessionStore::new(Arc::clone(shared), config.session_max_inactive(), Some(leases))
            },
            None => SessionStore::new(
                Arc::new(MemoryBackend::new()),
                config.session_max_inactive(),
                None,
            ),
        });
        let documents = Arc::new(match &shared {
            Some(shared) => TempDocumentStore::with_shared(
                config.local_cache_capacity(),
                config.document_ttl(),
                Arc::clone(shared),
                config.purge_queue_capacity(),
            ),
            None => TempDocumentStore::local(config.local_cache_capacity(), config.document_ttl()),
        });
        let batches = BatchOrchestrator::new(
            Arc::clone(&documents),
            Arc::clone(&signer),
            config.batch_max_documents(),
        );
        let audit = AuditRecorder::new(config.audit(), config.node_name(), audit_database);
        if audit.is_enabled() {
            tracing::info!(node = %audit.node(), sinks = audit.sink_count(), "auditing enabled");
        }

        let registry = Arc::new(StaticApplicationRegistry::new(config.applications()));
        let applications =
            applications.unwrap_or_else(|| Arc::clone(&registry) as Arc<dyn ApplicationRegistry>);
        let certificates =
            certificates.unwrap_or_else(|| registry as Arc<dyn CertificateValidator>);

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let sweeper = sessions.spawn_sweeper(config.sweep_interval(), shutdown_rx);

        Ok(Self {
            config,
            sessions,
            documents,
            batches,
            signer,
            audit,
            alarms,
            applications,
            certificates,
            shared,
            shutdown_tx,
            sweeper,
        })
    }
}

impl BrokerContext {
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn documents(&self) -> &Arc<TempDocumentStore> {
        &self.documents
    }

    pub fn batches(&self) -> &BatchOrchestrator {
        &self.batches
    }

    pub fn signer(&self) -> &Arc<dyn SigningBackend> {
        &self.signer
    }

    pub fn audit(&self) -> &AuditRecorder {
        &self.audit
    }

    pub fn alarms(&self) -> &Arc<dyn AlarmNotifier> {
        &self.alarms
    }

    pub fn applications(&self) -> &Arc<dyn ApplicationRegistry> {
        &self.applications
    }

    pub fn certificates(&self) -> &Arc<dyn CertificateValidator> {
        &self.certificates
    }

    /// Returns `true` when state is mirrored to a shared backend.
    #[must_use]
    pub fn is_ha(&self) -> bool {
        self.shared.is_some()
    }

    /// Checks the shared backend, if any.
    ///
    /// # Errors
    ///
    /// Returns the backend's health check error.
    pub async fn health_check(&self) -> BrokerResult<()> {
        if let Some(shared) = &self.shared {
            shared.health_check().await?;
        }
        Ok(())
    }

    /// Stops the session sweep and waits up to `grace` for it to exit.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.shutdown_tx.send(());
        let _ = tokio::time::timeout(grace, async {
            while !self.sweeper.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        self.documents.wait_purged(grace).await;
    }
}

impl Drop for BrokerContext {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{config::HaConfig, testutil::ScriptedSigner};

    #[tokio::test]
    async fn single_node_context_is_not_ha() {
        let context = BrokerContext::builder()
            .config(BrokerConfig::builder().build().unwrap())
            .signer(Arc::new(ScriptedSigner::new()))
            .build()
            .await
            .unwrap();
        assert!(!context.is_ha());
        assert!(!context.documents().is_ha());
        context.health_check().await.unwrap();
        context.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn ha_config_opens_shared_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig::builder()
            .ha(HaConfig::builder().shared_dir(dir.path()).build())
            .build()
            .unwrap();
        let context = BrokerContext::builder()
            .config(config)
            .signer(Arc::new(ScriptedSigner::new()))
            .build()
            .await
            .unwrap();
        assert!(context.is_ha());
        assert!(context.documents().is_ha());
        context.health_check().await.unwrap();
    }
}
