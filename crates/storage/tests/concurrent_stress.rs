//! Concurrent access stress tests.
//!
//! Exercises both backends under multi-task workloads to detect lost
//! updates and double reads of take-once values.
//!
//! ```bash
//! cargo test -p sigbroker-storage --test concurrent_stress -- --ignored
//! ```

#![allow(clippy::expect_used, clippy::panic)]

use std::{collections::HashSet, sync::Arc};

use sigbroker_storage::{
    MemoryBackend, StorageBackend,
    error::StorageError,
    testutil::{make_key, make_tagged_value, temp_fs_backend},
};
use tokio::task::JoinSet;

const CONCURRENCY: usize = 16;

const OPS_PER_TASK: usize = 50;

/// Every task increments a shared counter through a CAS retry loop. The
/// final value equals the total number of increments.
async fn cas_counter_never_loses_updates<B: StorageBackend + 'static>(backend: Arc<B>) {
    let mut set = JoinSet::new();
    for _ in 0..CONCURRENCY {
        let backend = Arc::clone(&backend);
        set.spawn(async move {
            for _ in 0..OPS_PER_TASK {
                loop {
                    let current = backend.get(b"counter").await.expect("get");
                    let next = current
                        .as_ref()
                        .map(|b| String::from_utf8_lossy(b).parse::<usize>().expect("number"))
                        .unwrap_or(0)
                        + 1;
                    match backend
                        .compare_and_set(
                            b"counter",
                            current.as_deref(),
                            next.to_string().into_bytes(),
                        )
                        .await
                    {
                        Ok(()) => break,
                        Err(StorageError::Conflict) => continue,
                        Err(e) => panic!("unexpected error: {e:?}"),
                    }
                }
            }
        });
    }
    while let Some(result) = set.join_next().await {
        result.expect("task join");
    }

    let value = backend.get(b"counter").await.expect("get").expect("counter present");
    assert_eq!(String::from_utf8_lossy(&value), (CONCURRENCY * OPS_PER_TASK).to_string());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn memory_cas_counter_never_loses_updates() {
    cas_counter_never_loses_updates(Arc::new(MemoryBackend::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn fs_cas_counter_never_loses_updates() {
    let (_dir, backend) = temp_fs_backend().await;
    cas_counter_never_loses_updates(Arc::new(backend)).await;
}

/// Many producers store documents while consumers take them. Each
/// document is observed by exactly one consumer.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn take_hands_each_value_to_one_consumer() {
    let backend = MemoryBackend::new();
    let total = CONCURRENCY * OPS_PER_TASK;
    for i in 0..total {
        backend.set(make_key("doc", i), make_tagged_value(0, i)).await.expect("set");
    }

    let mut set = JoinSet::new();
    for _ in 0..CONCURRENCY {
        let backend = backend.clone();
        set.spawn(async move {
            let mut taken = Vec::new();
            for i in 0..total {
                if let Some(value) = backend.take(&make_key("doc", i)).await.expect("take") {
                    taken.push(value);
                }
            }
            taken
        });
    }

    let mut seen = HashSet::new();
    while let Some(result) = set.join_next().await {
        for value in result.expect("task join") {
            assert!(seen.insert(value), "a document was taken twice");
        }
    }
    assert_eq!(seen.len(), total);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disjoint_keys_do_not_interfere() {
    let (_dir, backend) = temp_fs_backend().await;
    let backend = Arc::new(backend);

    let mut set = JoinSet::new();
    for task in 0..CONCURRENCY {
        let backend = Arc::clone(&backend);
        set.spawn(async move {
            for i in 0..5 {
                let key = make_key(&format!("t{task}"), i);
                backend.set(key, make_tagged_value(task, i)).await.expect("set");
            }
        });
    }
    while let Some(result) = set.join_next().await {
        result.expect("task join");
    }

    for task in 0..CONCURRENCY {
        let entries = backend.get_prefix(format!("t{task}:").as_bytes()).await.expect("prefix");
        assert_eq!(entries.len(), 5, "task {task} lost writes");
    }
}
