//! Batch signing.
//!
//! A [`Batch`] lives inside the [`FireSession`] of its transaction, so it is
//! persisted, locked and expired together with the session. The
//! [`BatchOrchestrator`] mutates it: documents are added while the batch is
//! open, signed one by one by [`BatchOrchestrator::sign_batch`], and their
//! results recovered individually afterwards.
//!
//! Each document moves from `Pending` to either `Signed` or `Error` exactly
//! once. One failed document never aborts the batch; the transaction counts
//! as successful as soon as a single document was signed.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    documents::TempDocumentStore,
    error::{BrokerResult, FireError},
    session::FireSession,
    signer::{SignParameters, SigningBackend},
};

/// Per-document error code used when the source document is gone.
pub const SOURCE_MISSING_CODE: &str = "DOCUMENT_NOT_FOUND";

/// Per-document error code used when a document could not be stored or read.
pub const STORE_FAILURE_CODE: &str = "STORE_FAILURE";

/// Lifecycle state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchState {
    /// Documents may still be added.
    #[default]
    Open,
    /// The batch was signed.
    Executed,
}

/// Signing status of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Pending,
    Signed,
    Error { code: String, message: String },
}

impl DocumentStatus {
    fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error { code: code.into(), message: message.into() }
    }
}

/// One document of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDocument {
    /// Client-assigned document id, unique within the batch.
    pub id: String,
    /// Temp store id of the source document while it is pending.
    pub source_ref: Option<String>,
    /// Signing status.
    pub status: DocumentStatus,
    /// Temp store id of the signed result.
    pub result_ref: Option<String>,
    /// Size in bytes of the source document.
    pub size: u64,
    /// `true` once the signed result was handed to the client.
    pub recovered: bool,
}

/// The documents of a batch transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Lifecycle state.
    pub state: BatchState,
    /// Documents in insertion order.
    pub documents: Vec<BatchDocument>,
}

impl Batch {
    /// Number of documents in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Number of signed documents.
    #[must_use]
    pub fn signed_count(&self) -> usize {
        self.documents.iter().filter(|d| d.status == DocumentStatus::Signed).count()
    }

    /// Fraction of documents that are no longer pending; `1.0` for an executed empty batch.
    #[must_use]
    pub fn progress(&self) -> f64 {
        if self.documents.is_empty() {
            return if self.state == BatchState::Executed { 1.0 } else { 0.0 };
        }
        let done =
            self.documents.iter().filter(|d| d.status != DocumentStatus::Pending).count();
        done as f64 / self.documents.len() as f64
    }

    /// Transaction-level result: `true` iff at least one document was signed.
    #[must_use]
    pub fn result(&self) -> bool {
        self.signed_count() > 0
    }

    /// Total size of the batch documents.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.documents.iter().map(|d| d.size).sum()
    }

    /// Returns `true` once every signed document has been recovered.
    #[must_use]
    pub fn all_recovered(&self) -> bool {
        self.documents
            .iter()
            .filter(|d| d.status == DocumentStatus::Signed)
            .all(|d| d.recovered)
    }

    /// Status snapshot for clients.
    #[must_use]
    pub fn report(&self) -> BatchReport {
        BatchReport {
            result: self.state == BatchState::Executed && self.result(),
            progress: self.progress(),
            documents: self
                .documents
                .iter()
                .map(|d| DocumentReport {
                    id: d.id.clone(),
                    status: d.status.clone(),
                    recovered: d.recovered,
                })
                .collect(),
        }
    }

    fn document_mut(&mut self, id: &str) -> Option<&mut BatchDocument> {
        self.documents.iter_mut().find(|d| d.id == id)
    }
}

/// Client-facing snapshot of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    /// Transaction-level result; `false` until the batch is executed.
    pub result: bool,
    /// Fraction of documents no longer pending.
    pub progress: f64,
    /// Per-document status.
    pub documents: Vec<DocumentReport>,
}

/// Client-facing status of one batch document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentReport {
    pub id: String,
    #[serde(flatten)]
    pub status: DocumentStatus,
    pub recovered: bool,
}

/// Counts produced by one [`BatchOrchestrator::sign_batch`] run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Documents signed.
    pub signed: usize,
    /// Documents that ended in error.
    pub failed: usize,
    /// Transaction-level result.
    pub result: bool,
}

/// Drives the batch state machine of a session.
pub struct BatchOrchestrator {
    documents: Arc<TempDocumentStore>,
    signer: Arc<dyn SigningBackend>,
    max_documents: usize,
}

impl BatchOrchestrator {
    /// Creates an orchestrator storing documents in `documents` and signing with `signer`.
    pub fn new(
        documents: Arc<TempDocumentStore>,
        signer: Arc<dyn SigningBackend>,
        max_documents: usize,
    ) -> Self {
        Self { documents, signer, max_documents }
    }

    /// Attaches an empty batch to `session`.
    ///
    /// # Errors
    ///
    /// Returns [`FireError::InvalidTransactionState`] if the session already has a batch.
    pub fn create_batch(&self, session: &mut FireSession) -> BrokerResult<()> {
        if session.batch.is_some() {
            return Err(FireError::InvalidTransactionState.into());
        }
        session.batch = Some(Batch::default());
        Ok(())
    }

    /// Adds a document to the batch and returns the new batch size.
    ///
    /// # Errors
    ///
    /// Returns [`FireError::BatchSigned`] once the batch was executed,
    /// [`FireError::BatchDuplicateDocument`] for a repeated id,
    /// [`FireError::BatchNumDocumentsExceeded`] when the batch is full, or a
    /// storage error if the document cannot be stored.
    #[tracing::instrument(skip(self, session, data), fields(size = data.len()))]
    pub async fn add_document(
        &self,
        session: &mut FireSession,
        doc_id: &str,
        data: Bytes,
    ) -> BrokerResult<usize> {
        let owner = session.transaction_id.clone();
        let batch = batch_mut(session)?;
        if batch.state == BatchState::Executed {
            return Err(FireError::BatchSigned.into());
        }
        if batch.documents.iter().any(|d| d.id == doc_id) {
            return Err(FireError::BatchDuplicateDocument.into());
        }
        if batch.documents.len() >= self.max_documents {
            return Err(FireError::BatchNumDocumentsExceeded.into());
        }

        let size = data.len() as u64;
        let source_ref = self.documents.store(&owner, data).await?;
        batch.documents.push(BatchDocument {
            id: doc_id.to_owned(),
            source_ref: Some(source_ref),
            status: DocumentStatus::Pending,
            result_ref: None,
            size,
            recovered: false,
        });
        Ok(batch.documents.len())
    }

    /// Signs every pending document.
    ///
    /// Documents are signed one after another and each outcome is recorded on
    /// its own entry; nothing here fails the batch as a whole. When `params`
    /// carries an upgrade format, each signature is upgraded before it is
    /// stored. Source documents are consumed.
    ///
    /// # Errors
    ///
    /// Returns [`FireError::BatchSigned`] if the batch was already executed.
    #[tracing::instrument(
        skip(self, session, params),
        fields(transaction_id = %session.transaction_id)
    )]
    pub async fn sign_batch(
        &self,
        session: &mut FireSession,
        params: &SignParameters,
    ) -> BrokerResult<BatchOutcome> {
        let owner = session.transaction_id.clone();
        let batch = batch_mut(session)?;
        if batch.state == BatchState::Executed {
            return Err(FireError::BatchSigned.into());
        }

        for document in &mut batch.documents {
            if document.status != DocumentStatus::Pending {
                continue;
            }
            document.status = self.sign_document(&owner, document, params).await;
        }
        batch.state = BatchState::Executed;

        let signed = batch.signed_count();
        let outcome =
            BatchOutcome { signed, failed: batch.len() - signed, result: batch.result() };
        tracing::info!(signed = outcome.signed, failed = outcome.failed, "batch signed");
        Ok(outcome)
    }

    async fn sign_document(
        &self,
        owner: &str,
        document: &mut BatchDocument,
        params: &SignParameters,
    ) -> DocumentStatus {
        let Some(source_ref) = document.source_ref.take() else {
            return DocumentStatus::error(SOURCE_MISSING_CODE, "source document missing");
        };
        let source = match self.documents.retrieve_and_delete(&source_ref).await {
            Ok(Some(source)) => source,
            Ok(None) => {
                return DocumentStatus::error(SOURCE_MISSING_CODE, "source document expired");
            },
            Err(err) => {
                tracing::warn!(
                    document_id = %document.id,
                    error = %err,
                    "failed to read source document"
                );
                return DocumentStatus::error(STORE_FAILURE_CODE, "source document unavailable");
            },
        };

        let signed = match sign_with_upgrade(&*self.signer, source, params).await {
            Ok(signed) => signed,
            Err(failure) => {
                tracing::debug!(
                    document_id = %document.id,
                    code = %failure.code,
                    "document failed to sign"
                );
                return DocumentStatus::error(failure.code, failure.message);
            },
        };

        match self.documents.store(owner, signed).await {
            Ok(result_ref) => {
                document.result_ref = Some(result_ref);
                DocumentStatus::Signed
            },
            Err(err) => {
                tracing::warn!(
                    document_id = %document.id,
                    error = %err,
                    "failed to store signed document"
                );
                DocumentStatus::error(STORE_FAILURE_CODE, "signed document could not be stored")
            },
        }
    }

    /// Status snapshot of the batch, valid at any time.
    ///
    /// # Errors
    ///
    /// Returns [`FireError::InvalidTransactionState`] if the session has no batch.
    pub fn recover_state(&self, session: &FireSession) -> BrokerResult<BatchReport> {
        Ok(batch_ref(session)?.report())
    }

    /// Final results of an executed batch.
    ///
    /// # Errors
    ///
    /// Returns [`FireError::BatchNotSigned`] before execution.
    pub fn recover_result(&self, session: &FireSession) -> BrokerResult<BatchReport> {
        let batch = batch_ref(session)?;
        if batch.state != BatchState::Executed {
            return Err(FireError::BatchNotSigned.into());
        }
        Ok(batch.report())
    }

    /// Hands out the signed result of one document. Each result is handed out once.
    ///
    /// # Errors
    ///
    /// Returns [`FireError::BatchNotSigned`] before execution,
    /// [`FireError::BatchInvalidDocument`] for an unknown or already recovered
    /// document, [`FireError::BatchDocumentNotSigned`] for a document that
    /// failed, or a storage error.
    #[tracing::instrument(skip(self, session), fields(transaction_id = %session.transaction_id))]
    pub async fn recover_signature(
        &self,
        session: &mut FireSession,
        doc_id: &str,
    ) -> BrokerResult<Bytes> {
        let batch = batch_mut(session)?;
        if batch.state != BatchState::Executed {
            return Err(FireError::BatchNotSigned.into());
        }
        let document = batch.document_mut(doc_id).ok_or(FireError::BatchInvalidDocument)?;
        if document.status != DocumentStatus::Signed {
            return Err(FireError::BatchDocumentNotSigned.into());
        }
        if document.recovered {
            return Err(FireError::BatchInvalidDocument.into());
        }
        let result_ref = document.result_ref.clone().ok_or(FireError::BatchInvalidDocument)?;
        let signature = self
            .documents
            .retrieve_and_delete(&result_ref)
            .await?
            .ok_or(FireError::BatchInvalidDocument)?;
        document.recovered = true;
        Ok(signature)
    }

    /// Discards every document still held for the batch. Failures are logged.
    pub async fn release_documents(&self, session: &FireSession) {
        let Some(batch) = &session.batch else {
            return;
        };
        for document in &batch.documents {
            if let Some(source_ref) = &document.source_ref {
                self.documents.discard(source_ref).await;
            }
            if let Some(result_ref) = &document.result_ref
                && !document.recovered
            {
                self.documents.discard(result_ref).await;
            }
        }
    }
}

/// Signs `document`, then upgrades the signature when `params` asks for it.
pub(crate) async fn sign_with_upgrade(
    signer: &dyn SigningBackend,
    document: Bytes,
    params: &SignParameters,
) -> Result<Bytes, crate::signer::SigningFailure> {
    let signature = signer.sign(document, &params.without_upgrade()).await?;
    match params.upgrade_parameters() {
        Some(upgrade) => signer.sign(signature, &upgrade).await,
        None => Ok(signature),
    }
}

fn batch_ref(session: &FireSession) -> BrokerResult<&Batch> {
    session.batch.as_ref().ok_or_else(|| FireError::InvalidTransactionState.into())
}

fn batch_mut(session: &mut FireSession) -> BrokerResult<&mut Batch> {
    session.batch.as_mut().ok_or_else(|| FireError::InvalidTransactionState.into())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{error::BrokerError, testutil::ScriptedSigner};

    fn orchestrator(
        signer: ScriptedSigner,
        max: usize,
    ) -> (BatchOrchestrator, Arc<TempDocumentStore>) {
        let documents = Arc::new(TempDocumentStore::local(100, Duration::from_secs(60)));
        (BatchOrchestrator::new(Arc::clone(&documents), Arc::new(signer), max), documents)
    }

    fn session() -> FireSession {
        FireSession::new(crate::ids::new_transaction_id(), "APP1", String::new())
    }

    fn params() -> SignParameters {
        SignParameters::builder()
            .provider("local")
            .crypto_operation("sign")
            .algorithm("SHA256withRSA")
            .format("CAdES")
            .build()
    }

    fn fire(err: BrokerError) -> FireError {
        err.to_fire()
    }

    #[tokio::test]
    async fn partial_failure_keeps_batch_successful() {
        let (orch, _docs) = orchestrator(ScriptedSigner::failing(["doc2"]), 10);
        let mut s = session();
        orch.create_batch(&mut s).unwrap();
        orch.add_document(&mut s, "doc1", Bytes::from_static(b"doc1")).await.unwrap();
        orch.add_document(&mut s, "doc2", Bytes::from_static(b"doc2")).await.unwrap();

        let outcome = orch.sign_batch(&mut s, &params()).await.unwrap();
        assert_eq!(outcome, BatchOutcome { signed: 1, failed: 1, result: true });

        let report = orch.recover_state(&s).unwrap();
        assert_eq!(report.progress, 1.0);
        assert_eq!(report.documents[0].status, DocumentStatus::Signed);
        assert!(matches!(report.documents[1].status, DocumentStatus::Error { .. }));
    }

    #[tokio::test]
    async fn empty_batch_fails_without_error() {
        let (orch, _docs) = orchestrator(ScriptedSigner::new(), 10);
        let mut s = session();
        orch.create_batch(&mut s).unwrap();
        let outcome = orch.sign_batch(&mut s, &params()).await.unwrap();
        assert!(!outcome.result);
        assert_eq!(orch.recover_result(&s).unwrap().documents.len(), 0);
    }

    #[tokio::test]
    async fn add_document_rules() {
        let (orch, _docs) = orchestrator(ScriptedSigner::new(), 2);
        let mut s = session();
        assert_eq!(
            fire(orch.add_document(&mut s, "a", Bytes::new()).await.unwrap_err()),
            FireError::InvalidTransactionState
        );
        orch.create_batch(&mut s).unwrap();
        assert_eq!(orch.add_document(&mut s, "a", Bytes::from_static(b"a")).await.unwrap(), 1);
        assert_eq!(
            fire(orch.add_document(&mut s, "a", Bytes::from_static(b"a")).await.unwrap_err()),
            FireError::BatchDuplicateDocument
        );
        orch.add_document(&mut s, "b", Bytes::from_static(b"b")).await.unwrap();
        assert_eq!(
            fire(orch.add_document(&mut s, "c", Bytes::from_static(b"c")).await.unwrap_err()),
            FireError::BatchNumDocumentsExceeded
        );

        orch.sign_batch(&mut s, &params()).await.unwrap();
        assert_eq!(
            fire(orch.add_document(&mut s, "d", Bytes::from_static(b"d")).await.unwrap_err()),
            FireError::BatchSigned
        );
        let err = orch.sign_batch(&mut s, &params()).await.unwrap_err();
        assert_eq!(fire(err), FireError::BatchSigned);
    }

    #[tokio::test]
    async fn sources_are_consumed_and_results_recovered_once() {
        let (orch, docs) = orchestrator(ScriptedSigner::failing(["bad"]), 10);
        let mut s = session();
        orch.create_batch(&mut s).unwrap();
        orch.add_document(&mut s, "good", Bytes::from_static(b"good")).await.unwrap();
        orch.add_document(&mut s, "bad", Bytes::from_static(b"bad")).await.unwrap();
        let source_ref = s.batch.as_ref().unwrap().documents[0].source_ref.clone().unwrap();

        assert_eq!(fire(orch.recover_result(&s).unwrap_err()), FireError::BatchNotSigned);
        orch.sign_batch(&mut s, &params()).await.unwrap();
        assert!(!docs.exists(&source_ref).await.unwrap());

        let signature = orch.recover_signature(&mut s, "good").await.unwrap();
        assert_eq!(signature, Bytes::from_static(b"SIGNED(good)"));
        assert_eq!(
            fire(orch.recover_signature(&mut s, "good").await.unwrap_err()),
            FireError::BatchInvalidDocument
        );
        assert_eq!(
            fire(orch.recover_signature(&mut s, "bad").await.unwrap_err()),
            FireError::BatchDocumentNotSigned
        );
        assert_eq!(
            fire(orch.recover_signature(&mut s, "missing").await.unwrap_err()),
            FireError::BatchInvalidDocument
        );
        assert!(s.batch.as_ref().unwrap().all_recovered());
    }

    #[tokio::test]
    async fn upgrade_is_applied_to_each_document() {
        let (orch, _docs) = orchestrator(ScriptedSigner::new(), 10);
        let mut s = session();
        orch.create_batch(&mut s).unwrap();
        orch.add_document(&mut s, "a", Bytes::from_static(b"a")).await.unwrap();
        let params = SignParameters { upgrade: Some("T".into()), ..params() };
        orch.sign_batch(&mut s, &params).await.unwrap();
        let signature = orch.recover_signature(&mut s, "a").await.unwrap();
        assert_eq!(signature, Bytes::from_static(b"UPGRADED(SIGNED(a))"));
    }

    #[tokio::test]
    async fn expired_source_is_a_document_error() {
        let (orch, docs) = orchestrator(ScriptedSigner::new(), 10);
        let mut s = session();
        orch.create_batch(&mut s).unwrap();
        orch.add_document(&mut s, "a", Bytes::from_static(b"a")).await.unwrap();
        orch.add_document(&mut s, "b", Bytes::from_static(b"b")).await.unwrap();
        let source_ref = s.batch.as_ref().unwrap().documents[0].source_ref.clone().unwrap();
        docs.delete(&source_ref).await.unwrap();

        let outcome = orch.sign_batch(&mut s, &params()).await.unwrap();
        assert_eq!(outcome, BatchOutcome { signed: 1, failed: 1, result: true });
        assert_eq!(
            s.batch.as_ref().unwrap().documents[0].status,
            DocumentStatus::Error {
                code: SOURCE_MISSING_CODE.into(),
                message: "source document expired".into()
            }
        );
    }

    #[tokio::test]
    async fn release_discards_held_documents() {
        let (orch, docs) = orchestrator(ScriptedSigner::new(), 10);
        let mut s = session();
        orch.create_batch(&mut s).unwrap();
        orch.add_document(&mut s, "a", Bytes::from_static(b"a")).await.unwrap();
        let source_ref = s.batch.as_ref().unwrap().documents[0].source_ref.clone().unwrap();
        orch.release_documents(&s).await;
        assert!(!docs.exists(&source_ref).await.unwrap());
    }

    #[test]
    fn report_serializes_flat_status() {
        let batch = Batch {
            state: BatchState::Executed,
            documents: vec![BatchDocument {
                id: "a".into(),
                source_ref: None,
                status: DocumentStatus::error("TIMEOUT", "late"),
                result_ref: None,
                size: 1,
                recovered: false,
            }],
        };
        let json = serde_json::to_value(batch.report()).unwrap();
        assert_eq!(json["documents"][0]["status"], "ERROR");
        assert_eq!(json["documents"][0]["code"], "TIMEOUT");
        assert_eq!(json["result"], false);
    }
}
