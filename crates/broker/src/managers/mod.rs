//! Operation managers.
//!
//! One function per protocol operation. Managers report domain failures as
//! [`FireError`] values inside
//! [`BrokerError::Fire`](crate::error::BrokerError::Fire); anything else
//! they return is classified by the dispatcher.
//!
//! Every mutating manager loads its session with `lock_for_update`, so two
//! requests for the same transaction run one after the other while requests
//! for different transactions never wait on each other.

mod batch;
mod sign;

use std::sync::Arc;

use bytes::Bytes;

use crate::{
    context::BrokerContext,
    error::{BrokerResult, FireError},
    operation::Operation,
    request::{InboundRequest, RequestParameters, decode_document, params},
    response::{FireResponse, TransactionCreated},
    session::{FireSession, SessionHandle, attr},
    signer::SignParameters,
};

/// Application on whose behalf a request runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub app_id: String,
    /// Resolved name, when application checks are enabled.
    pub app_name: Option<String>,
}

/// Runs the manager for `operation`.
pub(crate) async fn run(
    context: Arc<BrokerContext>,
    operation: Operation,
    caller: Caller,
    request: InboundRequest,
) -> BrokerResult<FireResponse> {
    let context = &*context;
    let params = &request.params;
    match operation {
        Operation::Sign => sign::sign(context, &caller, params).await,
        Operation::RecoverSign => sign::recover_sign(context, &caller, params).await,
        Operation::RecoverUpdatedSign => sign::recover_updated_sign(context, &caller, params).await,
        Operation::RecoverError => sign::recover_error(context, &caller, params).await,
        Operation::CreateBatch => batch::create_batch(context, &caller, params).await,
        Operation::AddDocumentToBatch => batch::add_document(context, &caller, params).await,
        Operation::SignBatch => batch::sign_batch(context, &caller, params).await,
        Operation::RecoverBatch => batch::recover_batch(context, &caller, params).await,
        Operation::RecoverBatchState => batch::recover_batch_state(context, &caller, params).await,
        Operation::RecoverSignBatch => batch::recover_sign_batch(context, &caller, params).await,
        Operation::Other => Err(FireError::ParameterOperationNotSupported.into()),
    }
}

/// Loads the caller's session for `transactionId` and `subjectRef`.
///
/// A missing key, a wrong key, an unknown or expired transaction and a
/// transaction of another application are all the same error.
pub(crate) async fn load_session(
    context: &BrokerContext,
    caller: &Caller,
    params: &RequestParameters,
    lock_for_update: bool,
) -> BrokerResult<SessionHandle> {
    let transaction_id =
        params.require(params::TRANSACTION_ID, FireError::ParameterTransactionIdNeeded)?;
    let Some(subject_ref) = params.get(params::SUBJECT_REF) else {
        return Err(FireError::InvalidTransaction.into());
    };
    let handle = context
        .sessions()
        .get(transaction_id, Some(subject_ref), false, lock_for_update)
        .await?
        .ok_or(FireError::InvalidTransaction)?;
    if handle.app_id != caller.app_id {
        tracing::warn!("transaction belongs to another application");
        context.sessions().release(handle).await;
        return Err(FireError::InvalidTransaction.into());
    }
    Ok(handle)
}

/// Signature settings shared by SIGN and CREATE_BATCH.
#[derive(Debug, Clone)]
struct TransactionSettings {
    crypto_operation: String,
    algorithm: String,
    format: String,
    upgrade: Option<String>,
    providers: Vec<String>,
    provider_forced: Option<String>,
}

impl TransactionSettings {
    fn from_params(params: &RequestParameters) -> Result<Self, FireError> {
        Ok(Self {
            crypto_operation: params
                .require(params::CRYPTO_OPERATION, FireError::ParameterCryptoOperationNeeded)?
                .to_owned(),
            algorithm: params
                .require(params::ALGORITHM, FireError::ParameterAlgorithmNeeded)?
                .to_owned(),
            format: params.require(params::FORMAT, FireError::ParameterFormatNeeded)?.to_owned(),
            upgrade: params.get(params::UPGRADE).map(str::to_owned),
            providers: params.list(params::PROVIDERS),
            provider_forced: params.get(params::PROVIDER_FORCED).map(str::to_owned),
        })
    }

    fn apply(self, session: &mut FireSession) {
        session.set_text(attr::CRYPTO_OPERATION, self.crypto_operation);
        session.set_text(attr::ALGORITHM, self.algorithm);
        session.set_text(attr::FORMAT, self.format);
        if let Some(upgrade) = self.upgrade {
            session.set_text(attr::UPGRADE, upgrade);
        }
        session.set_list(attr::PROVIDERS, self.providers);
        if let Some(forced) = self.provider_forced {
            session.set_text(attr::PROVIDER_FORCED, forced);
        }
    }
}

/// Decodes `dat` and enforces the size limit.
fn read_document(context: &BrokerContext, params: &RequestParameters) -> Result<Bytes, FireError> {
    let encoded = params.require(params::DATA, FireError::ParameterDataNeeded)?;
    let data = decode_document(encoded)?;
    if data.len() > context.config().max_document_size() {
        return Err(FireError::ParameterDocumentTooLarge);
    }
    Ok(data)
}

/// Signing parameters recorded in the session, for the resolved provider.
fn sign_parameters(session: &FireSession) -> Result<SignParameters, FireError> {
    let provider = session.resolved_provider().ok_or(FireError::InvalidTransactionState)?;
    let text = |key| session.text(key).map(str::to_owned).ok_or(FireError::InvalidTransactionState);
    Ok(SignParameters {
        provider: provider.name,
        crypto_operation: text(attr::CRYPTO_OPERATION)?,
        algorithm: text(attr::ALGORITHM)?,
        format: text(attr::FORMAT)?,
        upgrade: session.text(attr::UPGRADE).map(str::to_owned),
    })
}

/// Opens a new locked session for `caller` and returns it with its creation response.
async fn open_transaction(
    context: &BrokerContext,
    caller: &Caller,
    operation: Operation,
) -> BrokerResult<(SessionHandle, TransactionCreated)> {
    let transaction_id = crate::ids::new_transaction_id();
    let (mut handle, subject_ref) =
        context.sessions().create(&transaction_id, &caller.app_id).await?;
    handle.operation = operation;
    handle.app_name = caller.app_name.clone();
    tracing::info!(transaction_id = %transaction_id, "transaction created");

    let redirect_url = format!(
        "{}/chooseOrigin?{}={transaction_id}&{}={subject_ref}",
        context.config().public_url(),
        params::TRANSACTION_ID,
        params::SUBJECT_REF,
    );
    Ok((handle, TransactionCreated { transaction_id, subject_ref, redirect_url }))
}

/// Discards every temporary document referenced by the session.
async fn release_session_documents(context: &BrokerContext, session: &FireSession) {
    for key in [attr::DOCUMENT_ID, attr::SIGNATURE_ID] {
        if let Some(id) = session.text(key) {
            context.documents().discard(id).await;
        }
    }
    context.batches().release_documents(session).await;
}
