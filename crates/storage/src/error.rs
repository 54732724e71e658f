//! Storage error types and result alias.
//!
//! Every backend maps its internal failures to [`StorageError`] so that the
//! broker can classify them without knowing which medium sits underneath.
//!
//! # Error Types
//!
//! - [`StorageError::NotFound`] - Key does not exist in the storage backend
//! - [`StorageError::Conflict`] - A compare-and-set precondition did not hold
//! - [`StorageError::Connection`] - The backing medium could not be reached
//! - [`StorageError::Serialization`] - Stored bytes could not be decoded
//! - [`StorageError::Internal`] - Backend-specific internal errors
//! - [`StorageError::Timeout`] - A lock or operation exceeded its time limit
//! - [`StorageError::SizeLimitExceeded`] - Key or value larger than allowed
//!
//! # Example
//!
//! ```
//! use sigbroker_storage::{StorageError, StorageResult};
//!
//! fn lookup(key: &str) -> StorageResult<Vec<u8>> {
//!     Err(StorageError::not_found(key))
//! }
//! ```

use std::sync::Arc;

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// Errors preserve their source chain via the `#[source]` attribute.
///
/// # Non-exhaustive
///
/// New variants may be added without a semver-breaking change. Downstream
/// match expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The requested key was not found in the storage backend.
    #[error("Key not found: {key}")]
    NotFound {
        /// The key that was not found.
        key: String,
    },

    /// Compare-and-set conflict.
    ///
    /// The stored value did not match the expected value. Callers holding a
    /// lease or lock should back off and retry.
    #[error("Compare-and-set conflict")]
    Conflict,

    /// The backing medium could not be reached.
    ///
    /// For the shared-directory backend this covers an unmounted or
    /// unreadable directory.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
        /// The underlying error that caused this connection failure.
        #[source]
        source: Option<BoxError>,
    },

    /// Serialization or deserialization error.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error that caused serialization to fail.
        #[source]
        source: Option<BoxError>,
    },

    /// Internal storage backend error.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error that caused this internal failure.
        #[source]
        source: Option<BoxError>,
    },

    /// Operation timed out.
    ///
    /// Raised when a backend lock cannot be acquired within its wait budget.
    #[error("Operation timeout")]
    Timeout,

    /// A key or value exceeded the configured size limit.
    #[error("{kind} size {actual} exceeds limit of {limit} bytes")]
    SizeLimitExceeded {
        /// Which part of the entry was too large (`"key"` or `"value"`).
        kind: &'static str,
        /// The actual size in bytes.
        actual: usize,
        /// The configured limit in bytes.
        limit: usize,
    },
}

impl StorageError {
    /// Creates a new `NotFound` error for the given key.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates a new `Conflict` error.
    #[must_use]
    pub fn conflict() -> Self {
        Self::Conflict
    }

    /// Creates a new `Connection` error with the given message.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Connection` error with a message and source error.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with a message and source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Creates a new `SizeLimitExceeded` error.
    #[must_use]
    pub fn size_limit_exceeded(kind: &'static str, actual: usize, limit: usize) -> Self {
        Self::SizeLimitExceeded { kind, actual, limit }
    }

    /// Returns `true` if the error reflects an unavailable backing medium
    /// rather than a caller mistake or a lost race.
    ///
    /// The broker raises an operational alarm for these.
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Internal { .. } | Self::Timeout)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound
            | std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::ConnectionRefused => {
                Self::connection_with_source("shared storage unavailable", err)
            },
            std::io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::internal_with_source("storage I/O failure", err),
        }
    }
}

/// Errors raised when validating storage configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric or duration setting is below its allowed minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Name of the offending field.
        field: &'static str,
        /// Minimum allowed value, rendered for display.
        min: String,
        /// Value that was supplied, rendered for display.
        value: String,
    },

    /// A setting is structurally invalid.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn io_not_found_maps_to_connection() {
        let err: StorageError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert!(matches!(err, StorageError::Connection { .. }));
        assert!(err.is_infrastructure());
    }

    #[test]
    fn conflict_is_not_infrastructure() {
        assert!(!StorageError::conflict().is_infrastructure());
        assert!(!StorageError::not_found("k").is_infrastructure());
        assert!(!StorageError::size_limit_exceeded("key", 10, 5).is_infrastructure());
    }

    #[test]
    fn source_chain_is_preserved() {
        let io = std::io::Error::other("disk gone");
        let err = StorageError::internal_with_source("write failed", io);
        let source = std::error::Error::source(&err).expect("source");
        assert_eq!(source.to_string(), "disk gone");
    }

    #[test]
    fn config_error_names_field() {
        let err = ConfigError::BelowMinimum {
            field: "lock_wait",
            min: "1ms".into(),
            value: "0ns".into(),
        };
        assert_eq!(err.to_string(), "lock_wait must be at least 1ms, got 0ns");
    }
}
