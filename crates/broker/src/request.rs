//! Inbound request envelope.

use std::collections::HashMap;

use base64::{
    Engine,
    engine::general_purpose::{STANDARD, URL_SAFE},
};
use bytes::Bytes;

use crate::{error::FireError, validation::ValidationError};

/// Request parameter names.
pub mod params {
    pub const APP_ID: &str = "appId";
    pub const OPERATION: &str = "operation";
    pub const TRANSACTION_ID: &str = "transactionId";
    pub const SUBJECT_REF: &str = "subjectRef";
    pub const CRYPTO_OPERATION: &str = "cop";
    pub const ALGORITHM: &str = "algorithm";
    pub const FORMAT: &str = "format";
    pub const UPGRADE: &str = "upgrade";
    pub const DATA: &str = "dat";
    /// Comma separated list of providers offered to the user.
    pub const PROVIDERS: &str = "providers";
    pub const PROVIDER_FORCED: &str = "providerForced";
    pub const DOCUMENT_ID: &str = "docId";
    /// Provider chosen on the choose-origin step.
    pub const ORIGIN: &str = "origin";

    // Document retrieval sub-protocol.
    pub const RETRIEVE_OP: &str = "op";
    pub const RETRIEVE_VERSION: &str = "v";
    pub const RETRIEVE_ID: &str = "id";
}

/// Form or query parameters of a request. Empty values read as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParameters {
    values: HashMap<String, String>,
}

impl RequestParameters {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    /// Value of `name`, if present and non-empty.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str).filter(|value| !value.is_empty())
    }

    /// Value of `name`, or `error` if absent.
    ///
    /// # Errors
    ///
    /// Returns `error` when the parameter is missing or empty.
    pub fn require(&self, name: &str, error: FireError) -> Result<&str, FireError> {
        self.get(name).ok_or(error)
    }

    /// Comma separated list parameter; absent lists read as empty.
    #[must_use]
    pub fn list(&self, name: &str) -> Vec<String> {
        self.get(name)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RequestParameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A request to the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    /// Form and query parameters.
    pub params: RequestParameters,
    /// Client certificates as presented by the caller: base64 DER, possibly
    /// several comma separated per value. Decoded only when checked.
    pub certificates: Vec<String>,
    /// `User-Agent` header.
    pub user_agent: Option<String>,
}

impl InboundRequest {
    pub fn new(params: RequestParameters) -> Self {
        Self { params, ..Self::default() }
    }

    #[must_use]
    pub fn with_certificate(mut self, encoded: impl Into<String>) -> Self {
        self.certificates.push(encoded.into());
        self
    }

    /// Decodes the presented certificates to DER.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::CertificateInvalid`] if any value is not base64.
    pub fn decode_certificates(&self) -> Result<Vec<Vec<u8>>, ValidationError> {
        self.certificates
            .iter()
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|encoded| !encoded.is_empty())
            .map(|encoded| {
                STANDARD.decode(encoded).map_err(|e| ValidationError::CertificateInvalid {
                    reason: format!("certificate is not base64: {e}"),
                })
            })
            .collect()
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// Decodes a base64 document, accepting the standard and URL-safe alphabets.
///
/// # Errors
///
/// Returns [`FireError::ParameterDataInvalid`] if `encoded` is neither.
pub fn decode_document(encoded: &str) -> Result<Bytes, FireError> {
    let trimmed = encoded.trim();
    STANDARD
        .decode(trimmed)
        .or_else(|_| URL_SAFE.decode(trimmed))
        .map(Bytes::from)
        .map_err(|_| FireError::ParameterDataInvalid)
}
