#![allow(clippy::expect_used, clippy::panic, clippy::unwrap_used)]
//! Property tests for batch results and obfuscated session lookup.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use proptest::prelude::*;
use sigbroker::{
    SignParameters,
    batch::{BatchOrchestrator, DocumentStatus},
    documents::TempDocumentStore,
    ids,
    session::SessionStore,
    testutil::ScriptedSigner,
};
use sigbroker_storage::MemoryBackend;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().expect("runtime")
}

fn sessions() -> SessionStore {
    SessionStore::new(Arc::new(MemoryBackend::new()), Duration::from_secs(60), None)
}

fn params() -> SignParameters {
    SignParameters::builder()
        .provider("local")
        .crypto_operation("sign")
        .algorithm("SHA256withRSA")
        .format("XAdES")
        .build()
}

proptest! {
    /// The batch succeeds iff at least one document signs, and every document
    /// ends up either signed or failed.
    #[test]
    fn batch_result_follows_signed_documents(
        failing in proptest::collection::vec(any::<bool>(), 0..12),
    ) {
        runtime().block_on(async {
            let failing_docs: Vec<String> = failing
                .iter()
                .enumerate()
                .filter(|(_, fails)| **fails)
                .map(|(i, _)| format!("doc{i}"))
                .collect();
            let documents = Arc::new(TempDocumentStore::local(64, Duration::from_secs(60)));
            let orchestrator = BatchOrchestrator::new(
                Arc::clone(&documents),
                Arc::new(ScriptedSigner::failing(&failing_docs)),
                64,
            );
            let sessions = sessions();
            let (handle, _) = sessions.create(&ids::new_transaction_id(), "APP1").await.unwrap();
            let mut session = handle.into_inner();

            orchestrator.create_batch(&mut session).unwrap();
            for i in 0..failing.len() {
                let doc = format!("doc{i}");
                let data = Bytes::from(doc.clone());
                orchestrator.add_document(&mut session, &doc, data).await.unwrap();
            }
            let outcome = orchestrator.sign_batch(&mut session, &params()).await.unwrap();

            let expected_signed = failing.iter().filter(|fails| !**fails).count();
            prop_assert_eq!(outcome.signed, expected_signed);
            prop_assert_eq!(outcome.failed, failing.len() - expected_signed);
            prop_assert_eq!(outcome.result, expected_signed > 0);

            let report = orchestrator.recover_result(&session).unwrap();
            prop_assert!((report.progress - 1.0).abs() < f64::EPSILON);
            for (doc, fails) in report.documents.iter().zip(&failing) {
                if *fails {
                    let is_error = matches!(doc.status, DocumentStatus::Error { .. });
                    prop_assert!(is_error);
                } else {
                    prop_assert_eq!(&doc.status, &DocumentStatus::Signed);
                }
            }
            Ok(())
        })?;
    }

    /// Only the exact obfuscation key handed out at creation finds the session.
    #[test]
    fn session_lookup_requires_exact_key(wrong in "[0-9a-f]{0,80}") {
        runtime().block_on(async {
            let sessions = sessions();
            let tr = ids::new_transaction_id();
            let (handle, key) = sessions.create(&tr, "APP1").await.unwrap();
            sessions.commit(handle).await.unwrap();

            let found = sessions.get(&tr, Some(&key), false, false).await.unwrap();
            prop_assert!(found.is_some());
            if wrong != key {
                let found = sessions.get(&tr, Some(&wrong), false, false).await.unwrap();
                prop_assert!(found.is_none());
            }
            prop_assert!(sessions.get(&tr, None, false, false).await.unwrap().is_none());
            Ok(())
        })?;
    }
}
