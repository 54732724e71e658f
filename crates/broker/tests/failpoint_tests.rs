#![allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)]
//! Integration tests for fail-point injection.
//!
//! These tests require the `failpoints` feature:
//! ```bash
//! cargo test -p sigbroker --features failpoints --test failpoint_tests
//! ```

use std::{sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use sigbroker::{
    AuditRecord, AuditSink, FileAuditSink, FireError, FireResponse, Operation,
    audit::AuditSinkError, documents::TempDocumentStore, testutil::TestBroker,
};
use sigbroker_storage::MemoryBackend;

fn record() -> AuditRecord {
    AuditRecord::builder()
        .transaction_id("0123456789abcdef0123456789abcdef")
        .result(true)
        .app_id("APP1")
        .operation(Operation::Sign)
        .node("node-1")
        .build()
}

#[test]
fn audit_file_failure_is_reported_and_recovers() {
    let scenario = fail::FailScenario::setup();
    let dir = tempfile::tempdir().expect("tempdir");
    let sink = FileAuditSink::open(dir.path()).expect("open sink");
    let record = record();

    fail::cfg("audit-file-write", "return").expect("failed to configure fail point");
    assert!(matches!(sink.write(&record), Err(AuditSinkError::Rejected(_))));

    fail::remove("audit-file-write");
    sink.write(&record).expect("write after recovery");
    let written =
        std::fs::read_to_string(sink.file_for(record.timestamp.date_naive())).expect("read file");
    assert_eq!(written.lines().count(), 1);

    scenario.teardown();
}

#[tokio::test]
async fn failed_purge_is_counted_and_not_retried() {
    let scenario = fail::FailScenario::setup();
    let shared = Arc::new(MemoryBackend::new());
    let documents =
        TempDocumentStore::with_shared(16, Duration::from_secs(60), shared.clone(), 16);
    let id = documents.store("owner", Bytes::from_static(b"data")).await.unwrap();

    fail::cfg("purge-delete", "return").expect("failed to configure fail point");
    assert_eq!(documents.retrieve(&id).await.unwrap(), Some(Bytes::from_static(b"data")));
    assert!(documents.wait_purged(Duration::from_secs(2)).await);
    fail::remove("purge-delete");

    let stats = documents.purge_stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 0);
    // The redundant copy lingers until its TTL; it is never retried.
    assert!(documents.exists_shared(&id).await.unwrap());

    scenario.teardown();
}

#[tokio::test]
async fn shared_write_failure_leaves_the_batch_untouched() {
    let scenario = fail::FailScenario::setup();
    let (_dir, a, b) = TestBroker::ha_pair().await;
    let FireResponse::Created(tx) = a
        .call(&[
            ("operation", "create_batch"),
            ("cop", "sign"),
            ("algorithm", "SHA256withRSA"),
            ("format", "CAdES"),
        ])
        .await
        .unwrap()
    else {
        panic!("expected created transaction");
    };
    let data = STANDARD.encode(b"doc");
    let add = [
        ("operation", "add_document_to_batch"),
        ("transactionId", tx.transaction_id.as_str()),
        ("subjectRef", tx.subject_ref.as_str()),
        ("docId", "doc"),
        ("dat", data.as_str()),
    ];

    fail::cfg("fs-backend-write", "return").expect("failed to configure fail point");
    assert_eq!(a.call(&add).await.unwrap_err(), FireError::InternalError);
    fail::remove("fs-backend-write");

    let FireResponse::BatchState(state) = b
        .call(&[
            ("operation", "recover_batch_state"),
            ("transactionId", tx.transaction_id.as_str()),
            ("subjectRef", tx.subject_ref.as_str()),
        ])
        .await
        .unwrap()
    else {
        panic!("expected batch state");
    };
    assert!(state.documents.is_empty());

    // The same document can be added once the share is writable again.
    b.call(&add).await.expect("add after recovery");

    scenario.teardown();
}
