//! Temporary document retrieval sub-protocol.
//!
//! Browser and native clients poll this endpoint for a document left in the
//! temporary store. A document is handed out once: a successful retrieval
//! removes it from every tier. Failures are answered with a single text line
//! `ERR-NN:=message`.

use bytes::Bytes;
use thiserror::Error;

use crate::{
    documents::TempDocumentStore,
    request::{RequestParameters, params},
};

/// Only supported value of the `op` parameter.
pub const GET_OPERATION: &str = "get";

/// Failure of a retrieval request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetrieveError {
    #[error("ERR-01:=No operation code was given")]
    OperationNeeded,
    #[error("ERR-02:=Unsupported operation code")]
    UnsupportedOperation,
    #[error("ERR-03:=No syntax version was given")]
    VersionNeeded,
    #[error("ERR-04:=No document id was given")]
    IdNeeded,
    #[error("ERR-05:=The document {0} does not exist or has expired")]
    NotFound(String),
    #[error("ERR-06:=The document data is not valid")]
    InvalidData,
}

impl RetrieveError {
    /// Numeric part of the error line.
    #[must_use]
    pub fn code(&self) -> u8 {
        match self {
            Self::OperationNeeded => 1,
            Self::UnsupportedOperation => 2,
            Self::VersionNeeded => 3,
            Self::IdNeeded => 4,
            Self::NotFound(_) => 5,
            Self::InvalidData => 6,
        }
    }
}

/// Hands out the document named by `id`, removing it.
///
/// # Errors
///
/// Returns the [`RetrieveError`] for the first parameter check that fails,
/// [`RetrieveError::NotFound`] for an unknown or already retrieved document,
/// and [`RetrieveError::InvalidData`] when the store cannot be read.
#[tracing::instrument(skip_all, fields(id = params.get(params::RETRIEVE_ID).unwrap_or("-")))]
pub async fn retrieve(
    documents: &TempDocumentStore,
    params: &RequestParameters,
) -> Result<Bytes, RetrieveError> {
    let operation = params.get(params::RETRIEVE_OP).ok_or(RetrieveError::OperationNeeded)?;
    params.get(params::RETRIEVE_VERSION).ok_or(RetrieveError::VersionNeeded)?;
    let id = params.get(params::RETRIEVE_ID).ok_or(RetrieveError::IdNeeded)?;
    if !operation.eq_ignore_ascii_case(GET_OPERATION) {
        return Err(RetrieveError::UnsupportedOperation);
    }

    match documents.retrieve_and_delete(id).await {
        Ok(Some(data)) => {
            tracing::debug!(size = data.len(), "document retrieved");
            Ok(data)
        },
        Ok(None) => {
            tracing::warn!("document not found");
            Err(RetrieveError::NotFound(id.to_owned()))
        },
        Err(err) => {
            tracing::error!(error = %err, "document could not be read");
            Err(RetrieveError::InvalidData)
        },
    }
}
