//! Batch operations.

use super::{
    Caller, TransactionSettings, load_session, open_transaction, read_document,
    release_session_documents, sign_parameters,
};
use crate::{
    context::BrokerContext,
    error::{BrokerResult, FireError},
    operation::Operation,
    request::{RequestParameters, params},
    response::FireResponse,
};

/// Audit detail of a batch in which nothing was signed.
const NOTHING_SIGNED: &str = "no document of the batch was signed";

/// CREATE_BATCH: opens a batch transaction.
pub(super) async fn create_batch(
    context: &BrokerContext,
    caller: &Caller,
    params: &RequestParameters,
) -> BrokerResult<FireResponse> {
    let settings = TransactionSettings::from_params(params)?;
    let (mut handle, created) = open_transaction(context, caller, Operation::CreateBatch).await?;
    settings.apply(&mut handle);
    context.batches().create_batch(&mut handle)?;
    context.sessions().commit(handle).await?;
    Ok(FireResponse::Created(created))
}

/// ADD_DOCUMENT_TO_BATCH.
pub(super) async fn add_document(
    context: &BrokerContext,
    caller: &Caller,
    params: &RequestParameters,
) -> BrokerResult<FireResponse> {
    let doc_id =
        params.require(params::DOCUMENT_ID, FireError::ParameterDocumentIdNeeded)?.to_owned();
    let data = read_document(context, params)?;

    let mut handle = load_session(context, caller, params, true).await?;
    let batch_size = context.batches().add_document(&mut handle, &doc_id, data).await?;
    context.sessions().commit(handle).await?;
    tracing::debug!(doc_id = %doc_id, batch_size, "document added to batch");
    Ok(FireResponse::DocumentAdded { doc_id, batch_size })
}

/// SIGN_BATCH: signs every document and audits the transaction result.
pub(super) async fn sign_batch(
    context: &BrokerContext,
    caller: &Caller,
    params: &RequestParameters,
) -> BrokerResult<FireResponse> {
    let mut handle = load_session(context, caller, params, true).await?;
    if handle.batch.is_none() {
        return Err(FireError::InvalidTransactionState.into());
    }
    let sign_params = sign_parameters(&handle)?;
    let outcome = context.batches().sign_batch(&mut handle, &sign_params).await?;

    handle.operation = Operation::SignBatch;
    if outcome.result {
        context.audit().register(&handle, true);
    } else {
        context.audit().register_with_error(&handle, false, NOTHING_SIGNED);
    }
    let report = context.batches().recover_state(&handle)?;
    context.sessions().commit(handle).await?;
    Ok(FireResponse::BatchSigned(report))
}

/// RECOVER_BATCH: final per-document results.
pub(super) async fn recover_batch(
    context: &BrokerContext,
    caller: &Caller,
    params: &RequestParameters,
) -> BrokerResult<FireResponse> {
    let handle = load_session(context, caller, params, false).await?;
    Ok(FireResponse::BatchResult(context.batches().recover_result(&handle)?))
}

/// RECOVER_BATCH_STATE: progress snapshot.
pub(super) async fn recover_batch_state(
    context: &BrokerContext,
    caller: &Caller,
    params: &RequestParameters,
) -> BrokerResult<FireResponse> {
    let handle = load_session(context, caller, params, false).await?;
    Ok(FireResponse::BatchState(context.batches().recover_state(&handle)?))
}

/// RECOVER_SIGN_BATCH: hands out one signed document.
///
/// The transaction is closed once every signed document has been recovered.
pub(super) async fn recover_sign_batch(
    context: &BrokerContext,
    caller: &Caller,
    params: &RequestParameters,
) -> BrokerResult<FireResponse> {
    let doc_id = params.require(params::DOCUMENT_ID, FireError::ParameterDocumentIdNeeded)?;
    let mut handle = load_session(context, caller, params, true).await?;
    let signature = context.batches().recover_signature(&mut handle, doc_id).await?;

    let finished = handle.batch.as_ref().is_some_and(|batch| batch.all_recovered());
    if finished {
        release_session_documents(context, &handle).await;
        context.sessions().remove_locked(handle).await?;
        tracing::info!("batch transaction completed");
    } else {
        context.sessions().commit(handle).await?;
    }
    Ok(FireResponse::Signature(signature))
}
