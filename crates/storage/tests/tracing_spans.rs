//! Verifies that `#[instrument]` annotations produce the expected spans on
//! backend operations.

#![allow(clippy::expect_used)]

use std::sync::{Arc, Mutex};

use sigbroker_storage::{MemoryBackend, StorageBackend, testutil::temp_fs_backend};
use tracing::Subscriber;
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};

#[derive(Clone, Default)]
struct SpanCollector {
    spans: Arc<Mutex<Vec<String>>>,
}

impl<S> tracing_subscriber::Layer<S> for SpanCollector
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        _attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            self.spans.lock().expect("lock poisoned").push(span.name().to_owned());
        }
    }
}

fn collect() -> (Arc<Mutex<Vec<String>>>, tracing::subscriber::DefaultGuard) {
    let collector = SpanCollector::default();
    let spans = Arc::clone(&collector.spans);
    let subscriber = tracing_subscriber::registry().with(collector);
    (spans, tracing::subscriber::set_default(subscriber))
}

#[tokio::test]
async fn memory_backend_operations_create_spans() {
    let (spans, _guard) = collect();

    let backend = MemoryBackend::new();
    backend.set(b"key-1".to_vec(), b"value-1".to_vec()).await.expect("set");
    let _ = backend.get(b"key-1").await;
    let _ = backend.take(b"key-1").await;

    let recorded = spans.lock().expect("lock poisoned");
    for name in ["set", "get", "take"] {
        assert!(recorded.iter().any(|s| s == name), "expected a '{name}' span, got: {recorded:?}");
    }
}

#[tokio::test]
async fn fs_backend_operations_create_spans() {
    let (spans, _guard) = collect();

    let (_dir, backend) = temp_fs_backend().await;
    backend.set(b"key-1".to_vec(), b"value-1".to_vec()).await.expect("set");
    backend.compare_and_set(b"key-1", Some(b"value-1"), b"v2".to_vec()).await.expect("cas");
    backend.delete(b"key-1").await.expect("delete");

    let recorded = spans.lock().expect("lock poisoned");
    for name in ["set", "compare_and_set", "delete"] {
        assert!(recorded.iter().any(|s| s == name), "expected a '{name}' span, got: {recorded:?}");
    }
}
