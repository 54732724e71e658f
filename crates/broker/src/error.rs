//! Error taxonomy for the broker core.
//!
//! Two layers live here:
//!
//! - [`FireError`]: the protocol-level error returned to clients. Every variant carries a stable
//!   numeric code, a symbolic name and a human-readable message.
//! - [`BrokerError`]: the internal error type flowing through stores, the batch orchestrator and
//!   the operation managers. Each value is tagged with an [`ErrorKind`] that the dispatcher uses
//!   to pick the log severity, raise operational alarms and map to a [`FireError`] exactly once.
//!
//! # Example
//!
//! ```
//! use sigbroker::error::{BrokerError, ErrorKind, FireError};
//!
//! let err = BrokerError::from(FireError::BatchDuplicateDocument);
//! assert_eq!(err.kind(), ErrorKind::Request);
//! assert_eq!(err.to_fire(), FireError::BatchDuplicateDocument);
//! ```

use serde::Serialize;
use sigbroker_storage::{ConfigError, StorageError};
use thiserror::Error;

use crate::alarms::Alarm;

/// Result type alias for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Protocol error reported to client applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[non_exhaustive]
pub enum FireError {
    /// The request parameters could not be read.
    #[error("Error reading the request parameters")]
    ReadingParameters,
    /// `appId` was not supplied.
    #[error("The application id was not provided")]
    ParameterAppIdNeeded,
    /// `operation` was not supplied.
    #[error("The operation was not provided")]
    ParameterOperationNeeded,
    /// `operation` does not name a supported operation.
    #[error("The requested operation is not supported")]
    ParameterOperationNotSupported,
    /// `transactionId` was not supplied.
    #[error("The transaction id was not provided")]
    ParameterTransactionIdNeeded,
    /// `cop` was not supplied.
    #[error("The cryptographic operation was not provided")]
    ParameterCryptoOperationNeeded,
    /// `algorithm` was not supplied.
    #[error("The signature algorithm was not provided")]
    ParameterAlgorithmNeeded,
    /// `format` was not supplied.
    #[error("The signature format was not provided")]
    ParameterFormatNeeded,
    /// `dat` was not supplied.
    #[error("The document data was not provided")]
    ParameterDataNeeded,
    /// `dat` is not valid base64.
    #[error("The document data is not correctly encoded")]
    ParameterDataInvalid,
    /// `docId` was not supplied.
    #[error("The document id was not provided")]
    ParameterDocumentIdNeeded,
    /// The document exceeds the configured maximum size.
    #[error("The document exceeds the maximum allowed size")]
    ParameterDocumentTooLarge,
    /// The chosen certificate origin is not among the allowed ones.
    #[error("The selected certificate origin is not allowed")]
    ParameterCertOriginNotAllowed,
    /// The application is unknown, disabled or not authorized.
    #[error("The application is not authorized")]
    Unauthorized,
    /// Certificate validation is enabled and no client certificate was presented.
    #[error("A client certificate is required")]
    CertificateNeeded,
    /// The presented client certificate could not be decoded.
    #[error("The client certificate is not valid")]
    CertificateInvalid,
    /// The presented client certificate is not registered for the application.
    #[error("The client certificate is not trusted for this application")]
    CertificateNotTrusted,
    /// The transaction does not exist, expired, or the obfuscation key did not match.
    #[error("The transaction is not valid or has expired")]
    InvalidTransaction,
    /// The operation is not allowed in the current transaction state.
    #[error("The operation is not allowed in the current transaction state")]
    InvalidTransactionState,
    /// A document with the same id is already part of the batch.
    #[error("A document with this id was already added to the batch")]
    BatchDuplicateDocument,
    /// The batch already holds the maximum number of documents.
    #[error("The batch has reached the maximum number of documents")]
    BatchNumDocumentsExceeded,
    /// The batch was already signed and cannot be modified.
    #[error("The batch has already been signed")]
    BatchSigned,
    /// The batch has not been signed yet.
    #[error("The batch has not been signed yet")]
    BatchNotSigned,
    /// The requested document is not part of the batch or was already recovered.
    #[error("The document is not part of the batch or was already recovered")]
    BatchInvalidDocument,
    /// The requested document failed to sign.
    #[error("The requested document was not signed")]
    BatchDocumentNotSigned,
    /// The signing backend rejected the operation; details are available through RECOVER_ERROR.
    #[error("The signature could not be generated")]
    SigningFailed,
    /// An error that cannot be classified.
    #[error("Unknown error")]
    UnknownError,
    /// Generic internal failure; no further detail is exposed.
    #[error("Internal error")]
    InternalError,
}

impl FireError {
    /// Stable numeric code sent to clients.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::ReadingParameters => 1,
            Self::ParameterAppIdNeeded => 2,
            Self::ParameterOperationNeeded => 3,
            Self::ParameterOperationNotSupported => 4,
            Self::ParameterTransactionIdNeeded => 5,
            Self::ParameterCryptoOperationNeeded => 6,
            Self::ParameterAlgorithmNeeded => 7,
            Self::ParameterFormatNeeded => 8,
            Self::ParameterDataNeeded => 9,
            Self::ParameterDataInvalid => 10,
            Self::ParameterDocumentIdNeeded => 11,
            Self::ParameterDocumentTooLarge => 12,
            Self::ParameterCertOriginNotAllowed => 13,
            Self::Unauthorized => 20,
            Self::CertificateNeeded => 21,
            Self::CertificateInvalid => 22,
            Self::CertificateNotTrusted => 23,
            Self::InvalidTransaction => 30,
            Self::InvalidTransactionState => 31,
            Self::BatchDuplicateDocument => 40,
            Self::BatchNumDocumentsExceeded => 41,
            Self::BatchSigned => 42,
            Self::BatchNotSigned => 43,
            Self::BatchInvalidDocument => 44,
            Self::BatchDocumentNotSigned => 45,
            Self::SigningFailed => 50,
            Self::UnknownError => 98,
            Self::InternalError => 99,
        }
    }

    /// Stable symbolic name sent to clients.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadingParameters => "READING_PARAMETERS",
            Self::ParameterAppIdNeeded => "PARAMETER_APP_ID_NEEDED",
            Self::ParameterOperationNeeded => "PARAMETER_OPERATION_NEEDED",
            Self::ParameterOperationNotSupported => "PARAMETER_OPERATION_NOT_SUPPORTED",
            Self::ParameterTransactionIdNeeded => "PARAMETER_TRANSACTION_ID_NEEDED",
            Self::ParameterCryptoOperationNeeded => "PARAMETER_CRYPTO_OPERATION_NEEDED",
            Self::ParameterAlgorithmNeeded => "PARAMETER_ALGORITHM_NEEDED",
            Self::ParameterFormatNeeded => "PARAMETER_FORMAT_NEEDED",
            Self::ParameterDataNeeded => "PARAMETER_DATA_NEEDED",
            Self::ParameterDataInvalid => "PARAMETER_DATA_INVALID",
            Self::ParameterDocumentIdNeeded => "PARAMETER_DOCUMENT_ID_NEEDED",
            Self::ParameterDocumentTooLarge => "PARAMETER_DOCUMENT_TOO_LARGE",
            Self::ParameterCertOriginNotAllowed => "PARAMETER_CERT_ORIGIN_NOT_ALLOWED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::CertificateNeeded => "CERTIFICATE_NEEDED",
            Self::CertificateInvalid => "CERTIFICATE_INVALID",
            Self::CertificateNotTrusted => "CERTIFICATE_NOT_TRUSTED",
            Self::InvalidTransaction => "INVALID_TRANSACTION",
            Self::InvalidTransactionState => "INVALID_TRANSACTION_STATE",
            Self::BatchDuplicateDocument => "BATCH_DUPLICATE_DOCUMENT",
            Self::BatchNumDocumentsExceeded => "BATCH_NUM_DOCUMENTS_EXCEEDED",
            Self::BatchSigned => "BATCH_SIGNED",
            Self::BatchNotSigned => "BATCH_NOT_SIGNED",
            Self::BatchInvalidDocument => "BATCH_INVALID_DOCUMENT",
            Self::BatchDocumentNotSigned => "BATCH_DOCUMENT_NOT_SIGNED",
            Self::SigningFailed => "SIGNING_FAILED",
            Self::UnknownError => "UNKNOWN_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Classification used for logging and alarm decisions.
    #[must_use]
    pub fn kind(self) -> ErrorKind {
        match self {
            Self::Unauthorized
            | Self::CertificateNeeded
            | Self::CertificateInvalid
            | Self::CertificateNotTrusted => ErrorKind::Authorization,
            Self::UnknownError | Self::InternalError => ErrorKind::Internal,
            _ => ErrorKind::Request,
        }
    }

    /// Serializable payload for the error.
    #[must_use]
    pub fn body(self) -> ErrorBody {
        ErrorBody { code: self.code(), name: self.name(), message: self.to_string() }
    }
}

/// Wire representation of a [`FireError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    /// Numeric code.
    pub code: u16,
    /// Symbolic name.
    pub name: &'static str,
    /// Human-readable message.
    pub message: String,
}

/// Error classification decided once at the dispatcher boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or missing parameters, unsupported operation, protocol misuse.
    Request,
    /// Unknown application or untrusted certificate.
    Authorization,
    /// A datastore or shared store could not be reached.
    Infrastructure,
    /// Anything else; surfaced only as [`FireError::InternalError`].
    Internal,
}

/// Internal error type of the broker core.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BrokerError {
    /// A protocol error to be reported as-is.
    #[error(transparent)]
    Fire(#[from] FireError),

    /// The session or document backend failed.
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    /// Stored state could not be encoded or decoded.
    #[error("codec failure: {0}")]
    Codec(#[from] serde_json::Error),

    /// Configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An unexpected internal condition.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Creates an [`Internal`](Self::Internal) error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns the classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fire(err) => err.kind(),
            Self::Storage(err) if err.is_infrastructure() => ErrorKind::Infrastructure,
            Self::Config(_) => ErrorKind::Infrastructure,
            Self::Storage(_) | Self::Codec(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Operational alarm this error should raise, if any.
    #[must_use]
    pub fn alarm(&self) -> Option<Alarm> {
        match self {
            Self::Storage(err) if err.is_infrastructure() => Some(Alarm::SharedStore),
            Self::Config(_) => Some(Alarm::ResourceConfig),
            _ => None,
        }
    }

    /// Maps this error to the protocol error returned to the client.
    ///
    /// Only [`Fire`](Self::Fire) errors keep their identity; everything else
    /// collapses into [`FireError::InternalError`].
    #[must_use]
    pub fn to_fire(&self) -> FireError {
        match self {
            Self::Fire(err) => *err,
            _ => FireError::InternalError,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashSet;

    use rstest::rstest;

    use super::*;

    const ALL: [FireError; 28] = [
        FireError::ReadingParameters,
        FireError::ParameterAppIdNeeded,
        FireError::ParameterOperationNeeded,
        FireError::ParameterOperationNotSupported,
        FireError::ParameterTransactionIdNeeded,
        FireError::ParameterCryptoOperationNeeded,
        FireError::ParameterAlgorithmNeeded,
        FireError::ParameterFormatNeeded,
        FireError::ParameterDataNeeded,
        FireError::ParameterDataInvalid,
        FireError::ParameterDocumentIdNeeded,
        FireError::ParameterDocumentTooLarge,
        FireError::ParameterCertOriginNotAllowed,
        FireError::Unauthorized,
        FireError::CertificateNeeded,
        FireError::CertificateInvalid,
        FireError::CertificateNotTrusted,
        FireError::InvalidTransaction,
        FireError::InvalidTransactionState,
        FireError::BatchDuplicateDocument,
        FireError::BatchNumDocumentsExceeded,
        FireError::BatchSigned,
        FireError::BatchNotSigned,
        FireError::BatchInvalidDocument,
        FireError::BatchDocumentNotSigned,
        FireError::SigningFailed,
        FireError::UnknownError,
        FireError::InternalError,
    ];

    #[test]
    fn codes_and_names_are_unique() {
        let codes: HashSet<_> = ALL.iter().map(|e| e.code()).collect();
        let names: HashSet<_> = ALL.iter().map(|e| e.name()).collect();
        assert_eq!(codes.len(), ALL.len());
        assert_eq!(names.len(), ALL.len());
    }

    #[rstest]
    #[case(FireError::ParameterAppIdNeeded, ErrorKind::Request)]
    #[case(FireError::Unauthorized, ErrorKind::Authorization)]
    #[case(FireError::CertificateNotTrusted, ErrorKind::Authorization)]
    #[case(FireError::InternalError, ErrorKind::Internal)]
    #[case(FireError::BatchSigned, ErrorKind::Request)]
    fn fire_error_kind(#[case] err: FireError, #[case] expected: ErrorKind) {
        assert_eq!(err.kind(), expected);
    }

    #[test]
    fn infrastructure_storage_error_raises_alarm() {
        let err = BrokerError::from(StorageError::connection("share unmounted"));
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert_eq!(err.alarm(), Some(Alarm::SharedStore));
        assert_eq!(err.to_fire(), FireError::InternalError);
    }

    #[test]
    fn conflict_is_internal_without_alarm() {
        let err = BrokerError::from(StorageError::conflict());
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.alarm(), None);
    }

    #[test]
    fn internal_detail_never_reaches_the_body() {
        let err = BrokerError::internal("stack trace with secrets");
        let body = err.to_fire().body();
        assert_eq!(body.code, 99);
        assert_eq!(body.name, "INTERNAL_ERROR");
        assert!(!body.message.contains("secrets"));
    }
}
