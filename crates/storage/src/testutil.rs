//! Shared test utilities for storage backend testing.
//!
//! Feature-gated behind `testutil` so it never leaks into production builds.
//!
//! ```toml
//! [dev-dependencies]
//! sigbroker-storage = { workspace = true, features = ["testutil"] }
//! ```

use std::time::Duration;

use crate::fs::{FsBackend, FsConfig};

/// Create a deterministic test key from a prefix and index.
///
/// Produces keys like `"prefix:000042"`. Zero-padding keeps lexicographic
/// order equal to numeric order.
#[must_use]
pub fn make_key(prefix: &str, idx: usize) -> Vec<u8> {
    format!("{prefix}:{idx:06}").into_bytes()
}

/// Create a test value tagged with a task ID and sequence number, such as
/// `"task3-val42"`.
#[must_use]
pub fn make_tagged_value(task: usize, seq: usize) -> Vec<u8> {
    format!("task{task}-val{seq}").into_bytes()
}

/// Open an [`FsBackend`] over a fresh temporary directory.
///
/// The returned [`tempfile::TempDir`] must outlive the backend.
///
/// # Panics
///
/// Panics if the directory or backend cannot be created.
pub async fn temp_fs_backend() -> (tempfile::TempDir, FsBackend) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = FsConfig::builder()
        .root(dir.path())
        .lock_wait(Duration::from_secs(2))
        .sweep_interval(Duration::from_millis(200))
        .build()
        .expect("fs config");
    let backend = FsBackend::open(config).await.expect("open fs backend");
    (dir, backend)
}

/// Assert that a [`StorageResult`] is an error of the named variant.
///
/// ```no_run
/// use sigbroker_storage::assert_storage_error;
/// use sigbroker_storage::error::{StorageError, StorageResult};
///
/// let result: StorageResult<()> = Err(StorageError::Timeout);
/// assert_storage_error!(result, Timeout, "lock wait should expire");
/// ```
#[macro_export]
macro_rules! assert_storage_error {
    ($result:expr, $variant:ident) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::$variant { .. })),
            "expected StorageError::{}, got: {:?}",
            stringify!($variant),
            $result,
        );
    };
    ($result:expr, $variant:ident, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::StorageError::$variant { .. })),
            "{}: expected StorageError::{}, got: {:?}",
            $msg,
            stringify!($variant),
            $result,
        );
    };
}
