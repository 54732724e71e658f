//! Key-value storage backends for the signature broker.
//!
//! The broker keeps two kinds of short-lived state: transaction sessions and
//! temporary documents. Both sit on the [`StorageBackend`] trait defined
//! here, so a deployment chooses its medium once at startup.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Dispatcher / Operation managers              │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │        SessionStore          │      TempDocumentStore       │
//! │  (obfuscated lookup, leases) │  (local cache + shared tier) │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │                    sigbroker-storage                         │
//! │                  StorageBackend trait                        │
//! │   (get, set, set_with_ttl, compare_and_set, take, delete)    │
//! ├──────────────┬───────────────────────────────────────────────┤
//! │ MemoryBackend│              FsBackend                        │
//! │ (single node)│   (shared directory, high availability)       │
//! └──────────────┴───────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use sigbroker_storage::{MemoryBackend, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = MemoryBackend::new();
//!
//!     backend.set(b"doc/abc".to_vec(), b"%PDF-1.7".to_vec()).await?;
//!     let value = backend.take(b"doc/abc").await?;
//!     assert_eq!(value.map(|b| b.to_vec()), Some(b"%PDF-1.7".to_vec()));
//!     assert!(backend.get(b"doc/abc").await?.is_none());
//!
//!     Ok(())
//! }
//! ```
//!
//! # Available Backends
//!
//! | Backend | Use Case | Shared between nodes |
//! |---------|----------|----------------------|
//! | [`MemoryBackend`] | Single node, tests | No |
//! | [`FsBackend`] | High-availability mode | Yes |
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` and `conformance` modules with shared test helpers.
//! - **`failpoints`**: Activates `fail` injection points in the shared-directory write path.

#![deny(unsafe_code)]

pub mod backend;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod conformance;
pub mod error;
pub mod fs;
pub mod memory;
mod shutdown;
pub mod size_limits;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod testutil;
pub mod types;

pub use backend::StorageBackend;
pub use error::{BoxError, ConfigError, StorageError, StorageResult};
pub use fs::{FsBackend, FsConfig};
pub use memory::MemoryBackend;
pub use size_limits::{
    DEFAULT_MAX_KEY_SIZE, DEFAULT_MAX_VALUE_SIZE, FS_MAX_KEY_SIZE, SizeLimits, validate_key_size,
    validate_sizes,
};
pub use types::KeyValue;
