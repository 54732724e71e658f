//! Boundary to the signing backend.
//!
//! The broker never computes signatures itself. It hands a document and a set
//! of [`SignParameters`] to a [`SigningBackend`] and records whatever comes
//! back. A [`SigningFailure`] is a value, not an infrastructure error: it ends
//! up on the affected document or transaction and is never retried here.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crypto operation name used for signature upgrades.
pub const UPGRADE_OPERATION: &str = "upgrade";

/// Failure code used when the backend did not answer in time.
pub const TIMEOUT_CODE: &str = "TIMEOUT";

/// Parameters of one signing call.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
pub struct SignParameters {
    /// Certificate provider performing the signature.
    #[builder(into)]
    pub provider: String,
    /// Cryptographic operation (`sign`, `cosign`, `countersign`, `upgrade`).
    #[builder(into)]
    pub crypto_operation: String,
    /// Signature algorithm.
    #[builder(into)]
    pub algorithm: String,
    /// Signature format.
    #[builder(into)]
    pub format: String,
    /// Upgrade format applied after signing, if any.
    #[builder(into)]
    pub upgrade: Option<String>,
}

impl SignParameters {
    /// Parameters of the follow-up call that upgrades a base signature.
    ///
    /// Returns `None` when no upgrade format is configured.
    #[must_use]
    pub fn upgrade_parameters(&self) -> Option<SignParameters> {
        let upgrade = self.upgrade.as_ref()?;
        Some(SignParameters {
            provider: self.provider.clone(),
            crypto_operation: UPGRADE_OPERATION.to_owned(),
            algorithm: self.algorithm.clone(),
            format: upgrade.clone(),
            upgrade: None,
        })
    }

    /// The same parameters without the upgrade step.
    #[must_use]
    pub fn without_upgrade(&self) -> SignParameters {
        SignParameters { upgrade: None, ..self.clone() }
    }
}

/// A signing call that did not produce a signature.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct SigningFailure {
    /// Backend-specific failure code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

impl SigningFailure {
    /// Creates a failure with the given code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into() }
    }
}

/// Opaque signing capability.
#[async_trait]
pub trait SigningBackend: Send + Sync {
    /// Signs `document`, returning the signed document.
    async fn sign(
        &self,
        document: Bytes,
        params: &SignParameters,
    ) -> Result<Bytes, SigningFailure>;
}

#[async_trait]
impl<S: SigningBackend + ?Sized> SigningBackend for Arc<S> {
    async fn sign(
        &self,
        document: Bytes,
        params: &SignParameters,
    ) -> Result<Bytes, SigningFailure> {
        (**self).sign(document, params).await
    }
}
