//! Runs the shared backend contract against every backend.

#![allow(clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use sigbroker_storage::{MemoryBackend, conformance, testutil::temp_fs_backend};

#[tokio::test]
async fn memory_backend_conformance() {
    conformance::run_all(Arc::new(MemoryBackend::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fs_backend_conformance() {
    let (_dir, backend) = temp_fs_backend().await;
    conformance::run_all(Arc::new(backend)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fs_backend_concurrent_take_across_handles() {
    let (dir, node_a) = temp_fs_backend().await;
    let config = sigbroker_storage::FsConfig::builder().root(dir.path()).build().expect("config");
    let node_b = sigbroker_storage::FsBackend::open(config).await.expect("open second handle");

    // Two handles on one directory behave like two broker nodes.
    conformance::concurrent_take_exactly_once(Arc::new(node_a)).await;
    conformance::take_returns_value_once(&node_b).await;
}
