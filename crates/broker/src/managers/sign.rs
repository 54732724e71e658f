//! Single-signature operations.

use super::{
    Caller, TransactionSettings, load_session, open_transaction, read_document,
    release_session_documents, sign_parameters,
};
use crate::{
    context::BrokerContext,
    error::{BrokerResult, FireError},
    operation::Operation,
    request::RequestParameters,
    response::{FireResponse, NO_ERROR_RECORDED},
    session::{SessionHandle, SessionState, attr},
    signer::SigningFailure,
};

/// Error code recorded when a document vanished from the temp store.
const DOCUMENT_MISSING_CODE: &str = "DOCUMENT_NOT_FOUND";

/// SIGN: stores the document and opens the transaction.
pub(super) async fn sign(
    context: &BrokerContext,
    caller: &Caller,
    params: &RequestParameters,
) -> BrokerResult<FireResponse> {
    let settings = TransactionSettings::from_params(params)?;
    let data = read_document(context, params)?;

    let (mut handle, created) = open_transaction(context, caller, Operation::Sign).await?;
    let size = i64::try_from(data.len()).unwrap_or(i64::MAX);
    let document_id = context.documents().store(&created.transaction_id, data).await?;
    settings.apply(&mut handle);
    handle.set_integer(attr::DOCUMENT_SIZE, size);
    handle.set_text(attr::DOCUMENT_ID, document_id.clone());

    if let Err(err) = context.sessions().commit(handle).await {
        context.documents().discard(&document_id).await;
        return Err(err);
    }
    Ok(FireResponse::Created(created))
}

/// RECOVER_SIGN: signs the stored document.
///
/// Without an upgrade format the transaction completes here. With one, the
/// base signature is returned and kept for RECOVER_UPDATED_SIGN.
pub(super) async fn recover_sign(
    context: &BrokerContext,
    caller: &Caller,
    params: &RequestParameters,
) -> BrokerResult<FireResponse> {
    let mut handle = load_session(context, caller, params, true).await?;
    if handle.state != SessionState::Open || handle.batch.is_some() {
        return Err(FireError::InvalidTransactionState.into());
    }
    let sign_params = sign_parameters(&handle)?;
    let document_id =
        handle
            .text(attr::DOCUMENT_ID)
            .map(str::to_owned)
            .ok_or(FireError::InvalidTransactionState)?;
    handle.operation = Operation::Sign;

    let Some(document) = context.documents().retrieve(&document_id).await? else {
        return fail(context, handle, SigningFailure::new(DOCUMENT_MISSING_CODE, "document expired"))
            .await;
    };
    let signature = match context.signer().sign(document, &sign_params.without_upgrade()).await {
        Ok(signature) => signature,
        Err(failure) => return fail(context, handle, failure).await,
    };
    context.documents().discard(&document_id).await;
    handle.remove_attribute(attr::DOCUMENT_ID);

    if sign_params.upgrade.is_none() {
        context.audit().register(&handle, true);
        context.sessions().remove_locked(handle).await?;
        tracing::info!("transaction completed");
        return Ok(FireResponse::Signature(signature));
    }

    let signature_id =
        context.documents().store(&handle.transaction_id, signature.clone()).await?;
    handle.set_text(attr::SIGNATURE_ID, signature_id.clone());
    handle.state = SessionState::PendingUpgrade;
    if let Err(err) = context.sessions().commit(handle).await {
        context.documents().discard(&signature_id).await;
        return Err(err);
    }
    tracing::info!("base signature issued, upgrade pending");
    Ok(FireResponse::Signature(signature))
}

/// RECOVER_UPDATED_SIGN: upgrades the base signature and completes the transaction.
pub(super) async fn recover_updated_sign(
    context: &BrokerContext,
    caller: &Caller,
    params: &RequestParameters,
) -> BrokerResult<FireResponse> {
    let mut handle = load_session(context, caller, params, true).await?;
    if handle.state != SessionState::PendingUpgrade {
        return Err(FireError::InvalidTransactionState.into());
    }
    let upgrade_params =
        sign_parameters(&handle)?.upgrade_parameters().ok_or(FireError::InvalidTransactionState)?;
    let signature_id = handle
        .text(attr::SIGNATURE_ID)
        .map(str::to_owned)
        .ok_or(FireError::InvalidTransactionState)?;
    handle.operation = Operation::RecoverUpdatedSign;

    let Some(base) = context.documents().retrieve(&signature_id).await? else {
        let failure = SigningFailure::new(DOCUMENT_MISSING_CODE, "signature expired");
        return fail(context, handle, failure)
            .await;
    };
    let upgraded = match context.signer().sign(base, &upgrade_params).await {
        Ok(upgraded) => upgraded,
        Err(failure) => return fail(context, handle, failure).await,
    };

    context.audit().register(&handle, true);
    context.documents().discard(&signature_id).await;
    context.sessions().remove_locked(handle).await?;
    tracing::info!("transaction completed with upgraded signature");
    Ok(FireResponse::Signature(upgraded))
}

/// RECOVER_ERROR: reports the recorded error and closes the transaction.
pub(super) async fn recover_error(
    context: &BrokerContext,
    caller: &Caller,
    params: &RequestParameters,
) -> BrokerResult<FireResponse> {
    let handle = load_session(context, caller, params, true).await?;
    let code = handle.text(attr::ERROR_CODE).unwrap_or(NO_ERROR_RECORDED).to_owned();
    let message = handle.text(attr::ERROR_MESSAGE).unwrap_or_default().to_owned();

    let detail = if message.is_empty() { code.as_str() } else { message.as_str() };
    context.audit().register_with_error(&handle, false, detail);
    release_session_documents(context, &handle).await;
    context.sessions().remove_locked(handle).await?;
    Ok(FireResponse::RecoveredError { code, message })
}

/// Records a signing failure in the session for RECOVER_ERROR.
async fn fail(
    context: &BrokerContext,
    mut handle: SessionHandle,
    failure: SigningFailure,
) -> BrokerResult<FireResponse> {
    tracing::warn!(code = %failure.code, message = %failure.message, "signing failed");
    handle.record_error(failure.code, failure.message);
    context.sessions().commit(handle).await?;
    Err(FireError::SigningFailed.into())
}
