#![allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)]
//! Two broker nodes sharing one high-availability directory.
//!
//! Every step of a transaction may land on either node; the shared directory
//! is the only thing they have in common.

use std::{sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use sigbroker::{
    FireError, FireResponse, RequestParameters, response::TransactionCreated, testutil::TestBroker,
};
use tokio::task::JoinSet;

fn created(response: FireResponse) -> TransactionCreated {
    match response {
        FireResponse::Created(created) => created,
        other => panic!("expected a created transaction, got {other:?}"),
    }
}

async fn call_in(
    broker: &TestBroker,
    tx: &TransactionCreated,
    operation: &str,
    extra: &[(&str, &str)],
) -> Result<FireResponse, FireError> {
    let mut pairs = vec![
        ("operation", operation),
        ("transactionId", tx.transaction_id.as_str()),
        ("subjectRef", tx.subject_ref.as_str()),
    ];
    pairs.extend_from_slice(extra);
    broker.call(&pairs).await
}

async fn create_batch(broker: &TestBroker) -> TransactionCreated {
    let response = broker
        .call(&[
            ("operation", "create_batch"),
            ("cop", "sign"),
            ("algorithm", "SHA256withRSA"),
            ("format", "PAdES"),
            ("providerForced", "local"),
        ])
        .await
        .expect("create batch");
    created(response)
}

#[tokio::test]
async fn single_signature_started_on_one_node_completes_on_the_other() {
    let (_dir, a, b) = TestBroker::ha_pair().await;
    let data = STANDARD.encode(b"lease agreement");
    let tx = created(
        a.call(&[
            ("operation", "sign"),
            ("cop", "sign"),
            ("algorithm", "SHA256withRSA"),
            ("format", "PAdES"),
            ("providers", "local"),
            ("dat", data.as_str()),
        ])
        .await
        .unwrap(),
    );

    let FireResponse::Signature(signed) = call_in(&b, &tx, "recover_sign", &[]).await.unwrap()
    else {
        panic!("expected signature");
    };
    assert_eq!(signed, Bytes::from_static(b"SIGNED(lease agreement)"));
    assert_eq!(a.signer.calls(), 0);
    assert_eq!(b.signer.calls(), 1);

    // The transaction is closed for both nodes.
    assert_eq!(
        call_in(&a, &tx, "recover_sign", &[]).await.unwrap_err(),
        FireError::InvalidTransaction
    );
    assert_eq!(b.audit.records()[0].node, "node-b");
}

#[tokio::test]
async fn batch_hops_between_nodes() {
    let (_dir, a, b) = TestBroker::ha_pair().await;
    let tx = create_batch(&a).await;

    for (node, doc) in [(&a, "one"), (&b, "two"), (&a, "three")] {
        let data = STANDARD.encode(doc);
        call_in(node, &tx, "add_document_to_batch", &[("docId", doc), ("dat", data.as_str())])
            .await
            .unwrap();
    }

    let FireResponse::BatchSigned(report) = call_in(&b, &tx, "sign_batch", &[]).await.unwrap()
    else {
        panic!("expected batch report");
    };
    assert!(report.result);
    assert_eq!(report.documents.len(), 3);
    assert_eq!(b.signer.calls(), 3);

    let FireResponse::BatchState(state) =
        call_in(&a, &tx, "recover_batch_state", &[]).await.unwrap()
    else {
        panic!("expected batch state");
    };
    assert_eq!(state, report);

    for (node, doc) in [(&a, "one"), (&b, "two"), (&a, "three")] {
        let FireResponse::Signature(signed) =
            call_in(node, &tx, "recover_sign_batch", &[("docId", doc)]).await.unwrap()
        else {
            panic!("expected signature");
        };
        assert_eq!(signed, Bytes::from(format!("SIGNED({doc})")));
    }
    assert_eq!(
        call_in(&b, &tx, "recover_batch", &[]).await.unwrap_err(),
        FireError::InvalidTransaction
    );
}

#[tokio::test]
async fn concurrent_additions_are_all_kept() {
    let (_dir, a, b) = TestBroker::ha_pair().await;
    let tx = create_batch(&a).await;
    let nodes = [Arc::new(a), Arc::new(b)];

    let mut tasks = JoinSet::new();
    for i in 0..8 {
        let node = Arc::clone(&nodes[i % 2]);
        let tx = tx.clone();
        tasks.spawn(async move {
            let doc_id = format!("doc{i}");
            let data = STANDARD.encode(&doc_id);
            call_in(&node, &tx, "add_document_to_batch", &[
                ("docId", doc_id.as_str()),
                ("dat", data.as_str()),
            ])
            .await
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.expect("task").expect("add document");
    }

    let FireResponse::BatchState(state) =
        call_in(&nodes[0], &tx, "recover_batch_state", &[]).await.unwrap()
    else {
        panic!("expected batch state");
    };
    let mut ids: Vec<_> = state.documents.iter().map(|d| d.id.clone()).collect();
    ids.sort();
    assert_eq!(ids, (0..8).map(|i| format!("doc{i}")).collect::<Vec<_>>());
}

#[tokio::test]
async fn retrieval_hands_out_a_document_once_across_nodes() {
    let (_dir, a, b) = TestBroker::ha_pair().await;
    let id = a
        .context()
        .await
        .documents()
        .store("0123456789abcdef0123456789abcdef", Bytes::from_static(b"payload"))
        .await
        .unwrap();
    let params: RequestParameters =
        [("op", "get"), ("v", "1"), ("id", id.as_str())].into_iter().collect();

    assert_eq!(b.dispatcher.retrieve(&params).await.unwrap(), Bytes::from_static(b"payload"));
    assert!(a.dispatcher.retrieve(&params).await.is_err());
    assert!(b.dispatcher.retrieve(&params).await.is_err());
}

#[tokio::test]
async fn read_on_other_node_purges_the_shared_copy() {
    let (_dir, a, b) = TestBroker::ha_pair().await;
    let documents_a = Arc::clone(a.context().await.documents());
    let documents_b = Arc::clone(b.context().await.documents());
    let id = documents_a.store("owner", Bytes::from_static(b"data")).await.unwrap();
    assert!(documents_b.exists_shared(&id).await.unwrap());

    assert_eq!(documents_b.retrieve(&id).await.unwrap(), Some(Bytes::from_static(b"data")));
    assert!(documents_b.wait_purged(Duration::from_secs(5)).await);
    assert!(!documents_b.exists_shared(&id).await.unwrap());
    assert!(!documents_b.exists(&id).await.unwrap());
    assert!(!documents_a.exists(&id).await.unwrap());
}
