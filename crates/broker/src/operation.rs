//! Protocol operation codes.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operation requested through the dispatcher, also recorded on the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// Start a single-document signature.
    Sign,
    /// Execute a single-document signature and return it.
    RecoverSign,
    /// Start a batch transaction.
    CreateBatch,
    /// Add a document to an open batch.
    AddDocumentToBatch,
    /// Sign every pending document of a batch.
    SignBatch,
    /// Per-document results of an executed batch.
    RecoverBatch,
    /// Per-document status snapshot of a batch.
    RecoverBatchState,
    /// Retrieve one signed document of a batch.
    RecoverSignBatch,
    /// Retrieve the error recorded for a failed transaction.
    RecoverError,
    /// Retrieve the upgraded form of a signature.
    RecoverUpdatedSign,
    /// Fallback for sessions without a recorded operation; never accepted on the wire.
    #[default]
    Other,
}

impl Operation {
    /// Operations accepted by the dispatcher.
    pub const WIRE: [Operation; 10] = [
        Operation::Sign,
        Operation::RecoverSign,
        Operation::CreateBatch,
        Operation::AddDocumentToBatch,
        Operation::SignBatch,
        Operation::RecoverBatch,
        Operation::RecoverBatchState,
        Operation::RecoverSignBatch,
        Operation::RecoverError,
        Operation::RecoverUpdatedSign,
    ];

    /// Symbolic wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sign => "sign",
            Self::RecoverSign => "recover_sign",
            Self::CreateBatch => "create_batch",
            Self::AddDocumentToBatch => "add_document_to_batch",
            Self::SignBatch => "sign_batch",
            Self::RecoverBatch => "recover_batch",
            Self::RecoverBatchState => "recover_batch_state",
            Self::RecoverSignBatch => "recover_sign_batch",
            Self::RecoverError => "recover_error",
            Self::RecoverUpdatedSign => "recover_updated_sign",
            Self::Other => "other",
        }
    }

    /// Returns `true` for operations that act on a batch.
    #[must_use]
    pub fn is_batch(self) -> bool {
        matches!(
            self,
            Self::CreateBatch
                | Self::AddDocumentToBatch
                | Self::SignBatch
                | Self::RecoverBatch
                | Self::RecoverBatchState
                | Self::RecoverSignBatch
        )
    }

    /// Returns `true` for operations that start a new transaction.
    #[must_use]
    pub fn starts_transaction(self) -> bool {
        matches!(self, Self::Sign | Self::CreateBatch)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_ascii_uppercase())
    }
}

/// The operation code is not one of [`Operation::WIRE`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported operation: {0}")]
pub struct UnknownOperation(pub String);

impl FromStr for Operation {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::WIRE
            .into_iter()
            .find(|op| op.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownOperation(s.to_owned()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("sign", Operation::Sign)]
    #[case("SIGN", Operation::Sign)]
    #[case("Create_Batch", Operation::CreateBatch)]
    #[case(" recover_batch_state ", Operation::RecoverBatchState)]
    #[case("recover_updated_sign", Operation::RecoverUpdatedSign)]
    fn parses_case_insensitively(#[case] input: &str, #[case] expected: Operation) {
        assert_eq!(input.parse::<Operation>().unwrap(), expected);
    }

    #[rstest]
    #[case("other")]
    #[case("")]
    #[case("sign-batch")]
    #[case("7")]
    fn rejects_unknown_codes(#[case] input: &str) {
        assert!(input.parse::<Operation>().is_err());
    }

    #[test]
    fn display_is_upper_case() {
        assert_eq!(Operation::AddDocumentToBatch.to_string(), "ADD_DOCUMENT_TO_BATCH");
        assert_eq!(Operation::Other.to_string(), "OTHER");
    }

    #[test]
    fn wire_names_round_trip() {
        for op in Operation::WIRE {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
        }
    }
}
