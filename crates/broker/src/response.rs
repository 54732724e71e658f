//! Successful dispatcher responses.

use bytes::Bytes;
use serde::Serialize;

use crate::batch::BatchReport;

/// Error code returned by RECOVER_ERROR when the session holds no error.
pub const NO_ERROR_RECORDED: &str = "NO_ERROR_RECORDED";

/// Answer to a transaction-creating operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionCreated {
    pub transaction_id: String,
    /// Obfuscation key that must accompany the transaction id on later calls.
    pub subject_ref: String,
    /// Where the user continues the transaction.
    pub redirect_url: String,
}

/// Payload of a successful operation.
#[derive(Debug, Clone, PartialEq)]
pub enum FireResponse {
    /// SIGN or CREATE_BATCH opened a transaction.
    Created(TransactionCreated),
    /// A signature, returned as raw bytes.
    Signature(Bytes),
    /// ADD_DOCUMENT_TO_BATCH stored a document.
    DocumentAdded { doc_id: String, batch_size: usize },
    /// SIGN_BATCH finished.
    BatchSigned(BatchReport),
    /// RECOVER_BATCH_STATE snapshot.
    BatchState(BatchReport),
    /// RECOVER_BATCH results.
    BatchResult(BatchReport),
    /// RECOVER_ERROR answer.
    RecoveredError { code: String, message: String },
}

/// JSON shape of the non-binary responses.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase", untagged)]
pub enum JsonResponse<'a> {
    Created(&'a TransactionCreated),
    #[serde(rename_all = "camelCase")]
    DocumentAdded { doc_id: &'a str, batch_size: usize },
    Batch(&'a BatchReport),
    RecoveredError { code: &'a str, message: &'a str },
}

impl FireResponse {
    /// JSON body of the response; `None` for binary payloads.
    #[must_use]
    pub fn json(&self) -> Option<JsonResponse<'_>> {
        Some(match self {
            Self::Signature(_) => return None,
            Self::Created(created) => JsonResponse::Created(created),
            Self::DocumentAdded { doc_id, batch_size } => {
                JsonResponse::DocumentAdded { doc_id, batch_size: *batch_size }
            },
            Self::BatchSigned(report) | Self::BatchState(report) | Self::BatchResult(report) => {
                JsonResponse::Batch(report)
            },
            Self::RecoveredError { code, message } => {
                JsonResponse::RecoveredError { code, message }
            },
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn document_added_uses_camel_case() {
        let response = FireResponse::DocumentAdded { doc_id: "d1".into(), batch_size: 2 };
        let json = serde_json::to_value(response.json().unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({ "docId": "d1", "batchSize": 2 }));
    }

    #[test]
    fn signatures_have_no_json_body() {
        assert!(FireResponse::Signature(Bytes::from_static(b"sig")).json().is_none());
    }
}
