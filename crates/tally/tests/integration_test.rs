//! Integration tests for tally

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use tally::config::{QueueConfig, TallyConfig};
use tally::dlq::{DeadLetterCoordinator, QueueUrls};
use tally::error::StoreError;
use tally::processor::{BatchProcessor, BatchSettings};
use tally::queue::{InMemoryQueue, QueueClient, ReceiveOptions};
use tally::store::{AggregateStats, AggregateStore, InMemoryStore};

const VISIBILITY_TIMEOUT: u32 = 30;
const MAX_RECEIVE_COUNT: u32 = 3;

fn queue_config() -> QueueConfig {
    QueueConfig {
        name: "events".to_string(),
        visibility_timeout_secs: VISIBILITY_TIMEOUT,
        max_receive_count: MAX_RECEIVE_COUNT,
        wait_time_secs: 0,
        ..QueueConfig::default()
    }
}

fn batch_settings() -> BatchSettings {
    BatchSettings {
        receive: ReceiveOptions {
            max_messages: 10,
            wait_time_secs: 0,
            visibility_timeout_secs: VISIBILITY_TIMEOUT,
        },
        max_receive_count: MAX_RECEIVE_COUNT,
        visibility_extension_threshold: 1,
        dlq_check_interval: None,
    }
}

async fn provision(queue: &Arc<InMemoryQueue>) -> QueueUrls {
    DeadLetterCoordinator::new(queue.clone(), queue_config())
        .provision()
        .await
        .unwrap()
}

/// Store wrapper that fails increments on demand and can cancel a token
/// after a number of successful increments.
struct FlakyStore {
    inner: InMemoryStore,
    failures_left: AtomicU32,
    increments: AtomicU32,
    cancel_after: Option<(u32, CancellationToken)>,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: InMemoryStore::new(),
            failures_left: AtomicU32::new(0),
            increments: AtomicU32::new(0),
            cancel_after: None,
        }
    }

    fn failing(times: u32) -> Self {
        let store = Self::new();
        store.failures_left.store(times, Ordering::SeqCst);
        store
    }

    fn cancelling_after(count: u32, token: CancellationToken) -> Self {
        Self {
            cancel_after: Some((count, token)),
            ..Self::new()
        }
    }
}

#[async_trait]
impl AggregateStore for FlakyStore {
    async fn ping(&self) -> bool {
        self.inner.ping().await
    }

    async fn increment(&self, event_type: &str, value: f64) -> Result<(), StoreError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable {
                message: "connection reset".to_string(),
            });
        }

        self.inner.increment(event_type, value).await?;
        let done = self.increments.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((count, token)) = &self.cancel_after {
            if done == *count {
                token.cancel();
            }
        }
        Ok(())
    }

    async fn get(&self, event_type: &str) -> Result<Option<AggregateStats>, StoreError> {
        self.inner.get(event_type).await
    }

    async fn list_types(&self) -> Result<BTreeSet<String>, StoreError> {
        self.inner.list_types().await
    }

    async fn reset_all(&self) -> Result<(), StoreError> {
        self.inner.reset_all().await
    }
}

mod processing_tests {
    use super::*;

    #[tokio::test]
    async fn test_mixed_batch() {
        let queue = Arc::new(InMemoryQueue::new());
        let store = Arc::new(InMemoryStore::new());
        let urls = provision(&queue).await;

        for body in [
            r#"{"type":"signup","value":25.5}"#,
            "not-json",
            r#"{"type":"login","value":10}"#,
            r#"{"invalid":"schema"}"#,
            r#"{"type":"view","value":1}"#,
        ] {
            queue.send(&urls.queue_url, body).unwrap();
        }

        let mut processor = BatchProcessor::new(
            queue.clone(),
            store.clone(),
            urls.clone(),
            batch_settings(),
            CancellationToken::new(),
        );
        let outcome = processor.run_batch().await.unwrap();

        assert_eq!(outcome.received, 5);
        assert_eq!(outcome.processed, 3);
        assert_eq!(outcome.discarded, 2);
        assert!(queue.is_empty(&urls.queue_url));

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all["signup"], AggregateStats { count: 1.0, sum: 25.5 });
        assert_eq!(all["login"], AggregateStats { count: 1.0, sum: 10.0 });
        assert_eq!(all["view"], AggregateStats { count: 1.0, sum: 1.0 });
    }

    #[tokio::test]
    async fn test_numeric_string_values_accumulate() {
        let queue = Arc::new(InMemoryQueue::new());
        let store = Arc::new(InMemoryStore::new());
        let urls = provision(&queue).await;

        for body in [
            r#"{"type":"purchase","value":"12.5"}"#,
            r#"{"type":"purchase","value":7.5}"#,
            r#"{"type":"purchase","value":"10","source":"web"}"#,
        ] {
            queue.send(&urls.queue_url, body).unwrap();
        }

        let mut processor = BatchProcessor::new(
            queue.clone(),
            store.clone(),
            urls,
            batch_settings(),
            CancellationToken::new(),
        );
        assert_eq!(processor.run_batch().await.unwrap().processed, 3);

        let stats = store.get("purchase").await.unwrap().unwrap();
        assert_eq!(stats.count, 3.0);
        assert_eq!(stats.sum, 30.0);
        assert_eq!(stats.average(), stats.sum / stats.count);
    }

    #[tokio::test]
    async fn test_shutdown_mid_batch() {
        let queue = Arc::new(InMemoryQueue::new());
        let urls = provision(&queue).await;
        let shutdown = CancellationToken::new();
        let store = Arc::new(FlakyStore::cancelling_after(1, shutdown.clone()));

        queue.send(&urls.queue_url, r#"{"type":"a","value":1}"#).unwrap();
        queue.send(&urls.queue_url, r#"{"type":"b","value":2}"#).unwrap();

        let mut processor = BatchProcessor::new(
            queue.clone(),
            store.clone(),
            urls.clone(),
            batch_settings(),
            shutdown,
        );
        let outcome = processor.run_batch().await.unwrap();

        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.interrupted, 1);
        assert_eq!(queue.len(&urls.queue_url), 1);
        assert!(
            queue
                .bodies(&urls.queue_url)
                .iter()
                .all(|b| &b[..] == br#"{"type":"b","value":2}"#)
        );
        assert!(store.get("b").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_after_failed_increment_counts_once() {
        let queue = Arc::new(InMemoryQueue::new());
        let urls = provision(&queue).await;
        let store = Arc::new(FlakyStore::failing(1));
        queue
            .send(&urls.queue_url, r#"{"type":"signup","value":5}"#)
            .unwrap();

        let mut processor = BatchProcessor::new(
            queue.clone(),
            store.clone(),
            urls.clone(),
            batch_settings(),
            CancellationToken::new(),
        );

        let first = processor.run_batch().await.unwrap();
        assert_eq!(first.processed, 0);
        assert_eq!(first.retained, 1);
        assert_eq!(queue.len(&urls.queue_url), 1);
        assert!(store.get("signup").await.unwrap().is_none());

        // Hidden until the visibility timeout lapses.
        assert_eq!(processor.run_batch().await.unwrap().received, 0);
        tokio::time::advance(Duration::from_secs(u64::from(VISIBILITY_TIMEOUT) + 1)).await;

        let second = processor.run_batch().await.unwrap();
        assert_eq!(second.processed, 1);
        assert!(queue.is_empty(&urls.queue_url));

        let stats = store.get("signup").await.unwrap().unwrap();
        assert_eq!(stats, AggregateStats { count: 1.0, sum: 5.0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_message_near_max_receive_count_is_flagged_and_kept() {
        let queue = Arc::new(InMemoryQueue::new());
        let urls = provision(&queue).await;
        let store = Arc::new(FlakyStore::failing(u32::MAX));
        queue.send(&urls.queue_url, r#"{"type":"a","value":1}"#).unwrap();

        let mut processor = BatchProcessor::new(
            queue.clone(),
            store,
            urls.clone(),
            batch_settings(),
            CancellationToken::new(),
        );

        let first = processor.run_batch().await.unwrap();
        assert_eq!(first.nearing_dlq, 0);

        tokio::time::advance(Duration::from_secs(u64::from(VISIBILITY_TIMEOUT) + 1)).await;

        // receive_count == MAX_RECEIVE_COUNT - 1
        let second = processor.run_batch().await.unwrap();
        assert_eq!(second.received, 1);
        assert_eq!(second.nearing_dlq, 1);
        assert_eq!(second.processed, 0);
        assert_eq!(queue.len(&urls.queue_url), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_message_lands_in_dlq() {
        let queue = Arc::new(InMemoryQueue::new());
        let urls = provision(&queue).await;
        let dlq_url = urls.dlq_url.clone().unwrap();
        let store = Arc::new(FlakyStore::failing(u32::MAX));
        queue.send(&urls.queue_url, r#"{"type":"a","value":1}"#).unwrap();

        let mut processor = BatchProcessor::new(
            queue.clone(),
            store,
            urls.clone(),
            batch_settings(),
            CancellationToken::new(),
        );

        for _ in 0..MAX_RECEIVE_COUNT {
            assert_eq!(processor.run_batch().await.unwrap().retained, 1);
            tokio::time::advance(Duration::from_secs(u64::from(VISIBILITY_TIMEOUT) + 1)).await;
        }

        assert_eq!(processor.run_batch().await.unwrap().received, 0);
        assert!(queue.is_empty(&urls.queue_url));
        assert_eq!(queue.len(&dlq_url), 1);
    }

    #[tokio::test]
    async fn test_receive_failure_is_an_error() {
        let queue = Arc::new(InMemoryQueue::new());
        let urls = provision(&queue).await;
        queue.set_failing(tally::metrics::QueueOperation::Receive, true);

        let mut processor = BatchProcessor::new(
            queue.clone(),
            Arc::new(InMemoryStore::new()),
            urls,
            batch_settings(),
            CancellationToken::new(),
        );
        assert!(processor.run_batch().await.is_err());
    }
}

mod store_tests {
    use super::*;

    #[tokio::test]
    async fn test_reset_clears_registry_and_records() {
        let store = InMemoryStore::new();
        for (event_type, value) in [("signup", 1.0), ("login", 2.0), ("", 3.0)] {
            store.increment(event_type, value).await.unwrap();
        }
        assert_eq!(store.list_types().await.unwrap().len(), 3);

        store.reset_all().await.unwrap();

        assert!(store.list_types().await.unwrap().is_empty());
        for event_type in ["signup", "login", ""] {
            assert!(store.get(event_type).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_average_invariant() {
        let store = InMemoryStore::new();
        for value in [1.0, 2.5, -0.5, 10.0] {
            store.increment("t", value).await.unwrap();
        }

        let stats = store.get("t").await.unwrap().unwrap();
        assert!(stats.count > 0.0);
        assert_eq!(stats.average(), stats.sum / stats.count);
        assert_eq!(AggregateStats::default().average(), 0.0);
    }
}

mod engine_tests {
    use super::*;
    use tally::error::StartupError;
    use tally::{Engine, Lifecycle};

    fn config() -> TallyConfig {
        let mut config = TallyConfig::default();
        config.queue = QueueConfig {
            wait_time_secs: 1,
            ..queue_config()
        };
        config.processor.idle_sleep_secs = 0;
        config.processor.dlq_check_interval_secs = 0;
        config.store.connect_attempts = 3;
        config.store.backoff_base_ms = 1;
        config.store.backoff_max_ms = 5;
        config
    }

    async fn wait_for(
        lifecycle: &mut tokio::sync::watch::Receiver<Lifecycle>,
        state: Lifecycle,
    ) {
        tokio::time::timeout(Duration::from_secs(5), lifecycle.wait_for(|s| *s == state))
            .await
            .expect("lifecycle state not reached")
            .expect("engine dropped");
    }

    #[tokio::test]
    async fn test_engine_processes_until_shutdown() {
        let queue = Arc::new(InMemoryQueue::new());
        let store = Arc::new(InMemoryStore::new());
        let shutdown = CancellationToken::new();

        let engine = Engine::new(queue.clone(), store.clone(), &config(), shutdown.clone());
        let mut lifecycle = engine.subscribe();
        let handle = tokio::spawn(engine.run());

        wait_for(&mut lifecycle, Lifecycle::Running).await;
        let url = queue.get_queue_url("events").await.unwrap().unwrap();
        queue.send(&url, r#"{"type":"signup","value":2}"#).unwrap();
        queue.send(&url, r#"{"type":"signup","value":3}"#).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !queue.is_empty(&url) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("messages were not processed");

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(*lifecycle.borrow(), Lifecycle::Stopped);

        let stats = store.get("signup").await.unwrap().unwrap();
        assert_eq!(stats, AggregateStats { count: 2.0, sum: 5.0 });
    }

    #[tokio::test]
    async fn test_engine_fails_when_store_never_answers() {
        let queue = Arc::new(InMemoryQueue::new());
        let store = Arc::new(InMemoryStore::new());
        store.set_online(false);

        let engine = Engine::new(queue.clone(), store, &config(), CancellationToken::new());
        let lifecycle = engine.subscribe();

        let err = engine.run().await.unwrap_err();

        assert!(matches!(err, StartupError::StoreUnavailable { attempts: 3 }));
        assert_eq!(*lifecycle.borrow(), Lifecycle::Stopped);
        // The queue is never touched without a store.
        assert_eq!(queue.get_queue_url("events").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_engine_stops_cleanly_when_cancelled_before_start() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let engine = Engine::new(
            Arc::new(InMemoryQueue::new()),
            Arc::new(InMemoryStore::new()),
            &config(),
            shutdown,
        );
        let lifecycle = engine.subscribe();

        engine.run().await.unwrap();
        assert_eq!(*lifecycle.borrow(), Lifecycle::Stopped);
    }
}

mod api_tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tally::api::router;
    use tally::store::StoreRef;
    use tower::ServiceExt;

    async fn get(store: StoreRef, uri: &str) -> (StatusCode, Value) {
        let response = router(store)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_index() {
        let (status, body) = get(Arc::new(InMemoryStore::new()), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn test_health_reflects_store() {
        let store = Arc::new(InMemoryStore::new());

        let (status, body) = get(store.clone(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "healthy", "store": "healthy"}));

        store.set_online(false);
        let (status, body) = get(store, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");
    }

    #[tokio::test]
    async fn test_stats_listing_and_lookup() {
        let store = Arc::new(InMemoryStore::new());
        store.increment("login", 10.0).await.unwrap();
        store.increment("signup", 20.0).await.unwrap();
        store.increment("signup", 30.0).await.unwrap();

        let (status, body) = get(store.clone(), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!([
                {"event_type": "login", "count": 1.0, "sum": 10.0, "average": 10.0},
                {"event_type": "signup", "count": 2.0, "sum": 50.0, "average": 25.0},
            ])
        );

        let (status, body) = get(store.clone(), "/stats/signup").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["average"], 25.0);

        let (status, body) = get(store, "/stats/unknown").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"event_type": "unknown", "count": 0.0, "sum": 0.0, "average": 0.0})
        );
    }

    #[tokio::test]
    async fn test_store_failure_is_server_error() {
        let store = Arc::new(InMemoryStore::new());
        store.set_online(false);

        let (status, body) = get(store, "/stats").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["detail"], "Internal server error");
    }
}
