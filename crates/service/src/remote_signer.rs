//! HTTP client for the signing gateway.
//!
//! The gateway fronts the certificate providers. One call signs one document:
//!
//! ```text
//! POST {url}/sign
//! { "provider": "...", "operation": "sign", "algorithm": "...",
//!   "format": "...", "upgrade": null, "document": "<base64>" }
//!
//! 200 { "signature": "<base64>" }
//! 4xx/5xx { "code": "...", "message": "..." }
//! ```

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sigbroker::{SignParameters, SigningBackend, SigningFailure, signer::TIMEOUT_CODE};

use crate::{config::SignerConfig, error::ServiceError};

/// Failure code for transport errors other than timeouts.
pub const CONNECTION_CODE: &str = "CONNECTION";

/// Failure code for answers that cannot be decoded.
pub const INVALID_RESPONSE_CODE: &str = "INVALID_RESPONSE";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignRequest<'a> {
    provider: &'a str,
    operation: &'a str,
    algorithm: &'a str,
    format: &'a str,
    upgrade: Option<&'a str>,
    document: String, // base64 encoded
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignResponse {
    signature: String, // base64 encoded
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    code: String,
    #[serde(default)]
    message: String,
}

/// [`SigningBackend`] that delegates to a remote signing gateway.
#[derive(Debug, Clone)]
pub struct RemoteSigningBackend {
    client: Client,
    base_url: String,
}

impl RemoteSigningBackend {
    /// Creates a client for the gateway described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Client`] if the HTTP client cannot be built.
    pub fn new(config: &SignerConfig) -> Result<Self, ServiceError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, base_url: config.url.trim_end_matches('/').to_string() })
    }

    fn transport_failure(err: &reqwest::Error) -> SigningFailure {
        if err.is_timeout() {
            SigningFailure::new(TIMEOUT_CODE, "signing gateway did not answer in time")
        } else {
            SigningFailure::new(CONNECTION_CODE, format!("signing gateway request failed: {err}"))
        }
    }
}

#[async_trait]
impl SigningBackend for RemoteSigningBackend {
    #[tracing::instrument(
        skip(self, document),
        fields(provider = %params.provider, size = document.len())
    )]
    async fn sign(
        &self,
        document: Bytes,
        params: &SignParameters,
    ) -> Result<Bytes, SigningFailure> {
        let url = format!("{}/sign", self.base_url);
        let request = SignRequest {
            provider: &params.provider,
            operation: &params.crypto_operation,
            algorithm: &params.algorithm,
            format: &params.format,
            upgrade: params.upgrade.as_deref(),
            document: STANDARD.encode(&document),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Self::transport_failure(&e))?;

        let status = response.status();
        if !status.is_success() {
            let failure = match response.json::<ErrorResponse>().await {
                Ok(error) => SigningFailure::new(error.code, error.message),
                Err(_) => SigningFailure::new(
                    format!("HTTP_{}", status.as_u16()),
                    format!("signing gateway answered {status}"),
                ),
            };
            tracing::debug!(code = %failure.code, "signing gateway rejected the document");
            return Err(failure);
        }

        let resp: SignResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                Self::transport_failure(&e)
            } else {
                SigningFailure::new(INVALID_RESPONSE_CODE, format!("failed to parse response: {e}"))
            }
        })?;

        STANDARD.decode(resp.signature.as_bytes()).map(Bytes::from).map_err(|e| {
            SigningFailure::new(INVALID_RESPONSE_CODE, format!("invalid signature encoding: {e}"))
        })
    }
}
