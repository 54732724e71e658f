//! Identifier generation and obfuscation-key handling.
//!
//! Transaction and document ids are 128-bit random tokens rendered as lowercase
//! hex. The obfuscation key (`subjectRef`) handed to the client is a 256-bit
//! random token; only its SHA-256 digest is persisted, and lookups compare
//! digests in constant time.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Length of transaction and document ids in characters.
pub const ID_LEN: usize = 32;

/// Length of a subject reference in characters.
pub const SUBJECT_REF_LEN: usize = 64;

/// Generates a fresh transaction id.
#[must_use]
pub fn new_transaction_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Generates a fresh temporary document id.
#[must_use]
pub fn new_document_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Generates a fresh obfuscation key.
#[must_use]
pub fn new_subject_ref() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

/// SHA-256 digest of a subject reference, hex encoded.
#[must_use]
pub fn subject_digest(subject_ref: &str) -> String {
    hex::encode(Sha256::digest(subject_ref.as_bytes()))
}

/// Compares two digests without short-circuiting on the first differing byte.
#[must_use]
pub fn digests_match(stored: &str, presented: &str) -> bool {
    stored.as_bytes().ct_eq(presented.as_bytes()).into()
}

/// Returns `true` if `id` has the shape of a generated id.
///
/// Ids that fail this check are rejected before any storage access.
#[must_use]
pub fn is_well_formed(id: &str) -> bool {
    id.len() == ID_LEN && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
