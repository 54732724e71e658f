//! The choose-origin step.
//!
//! Between transaction creation and RECOVER_SIGN the user's browser is
//! redirected here. The step records which browser the user is on and, when
//! the user picks one, which certificate provider will sign.

use serde::Serialize;

use crate::{
    browser::Browser,
    context::BrokerContext,
    error::{BrokerResult, FireError},
    request::{InboundRequest, params},
    session::attr,
};

/// Outcome of the choose-origin step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginChosen {
    pub transaction_id: String,
    pub browser: &'static str,
    /// Provider that will sign, if already decided.
    pub provider: Option<String>,
}

/// Records the browser and the chosen certificate origin on the session.
///
/// # Errors
///
/// Returns [`FireError::InvalidTransaction`] for a missing or unknown
/// transaction or a wrong obfuscation key, and
/// [`FireError::ParameterCertOriginNotAllowed`] for an origin the transaction
/// does not offer.
pub(crate) async fn choose_origin(
    context: &BrokerContext,
    request: &InboundRequest,
) -> BrokerResult<OriginChosen> {
    let params = &request.params;
    let (Some(transaction_id), Some(subject_ref)) =
        (params.get(params::TRANSACTION_ID), params.get(params::SUBJECT_REF))
    else {
        return Err(FireError::InvalidTransaction.into());
    };
    let mut handle = context
        .sessions()
        .get(transaction_id, Some(subject_ref), false, true)
        .await?
        .ok_or(FireError::InvalidTransaction)?;

    let browser = Browser::identify(request.user_agent.as_deref());
    handle.set_text(attr::BROWSER, browser.name());

    if let Some(origin) = params.get(params::ORIGIN) {
        let forced = handle.text(attr::PROVIDER_FORCED);
        let offered = handle.list(attr::PROVIDERS);
        let allowed = match forced {
            Some(forced) => forced == origin,
            None => offered.is_empty() || offered.iter().any(|p| p == origin),
        };
        if !allowed {
            tracing::warn!(origin = %origin, "certificate origin not offered");
            context.sessions().release(handle).await;
            return Err(FireError::ParameterCertOriginNotAllowed.into());
        }
        handle.set_text(attr::PROVIDER, origin);
    }

    let chosen = OriginChosen {
        transaction_id: handle.transaction_id.clone(),
        browser: browser.name(),
        provider: handle.resolved_provider().map(|choice| choice.name),
    };
    context.sessions().commit(handle).await?;
    tracing::debug!(browser = %browser, "origin chosen");
    Ok(chosen)
}
