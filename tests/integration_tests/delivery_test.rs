//! Delivery client and dispatcher integration tests

use std::sync::Arc;
use std::time::{Duration, Instant};
use wiremock::matchers::{header, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ripple::delivery::{
    DeliveryClient, DeliveryError, DeliveryProfile, Dispatcher, RetryPolicy, IDEMPOTENCY_HEADER,
};
use ripple::models::{Batch, ChangeId, ChangeRecord};
use ripple::storage::{MemoryStore, MetricsStore, WebhookRegistry};

fn client(profile: DeliveryProfile, store: &Arc<MemoryStore>) -> DeliveryClient {
    DeliveryClient::new(
        profile,
        Duration::from_millis(300),
        RetryPolicy::with_delays(3, 10, 40),
        Arc::clone(store) as Arc<dyn MetricsStore>,
        "ripple-test",
    )
    .unwrap()
}

fn batch(n: u64) -> Batch {
    Batch::new(
        (1..=n)
            .map(|i| ChangeRecord::new(ChangeId::new(1_000 + i, 0), serde_json::json!({ "i": i })))
            .collect(),
    )
}

#[tokio::test]
async fn test_client_error_makes_exactly_one_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let outcome = client(DeliveryProfile::PrimaryApi, &store)
        .send(&server.uri(), &batch(2))
        .await;

    assert!(!outcome.is_delivered());
    assert_eq!(outcome.attempts(), 1);
    assert!(matches!(
        outcome.error(),
        Some(DeliveryError::Rejected { status: 400, .. })
    ));

    let metrics = store.snapshot().await.unwrap();
    assert_eq!(metrics.failed_api_calls, 1);
    assert_eq!(metrics.retry_attempts, 0);
}

#[tokio::test]
async fn test_rate_limited_request_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let outcome = client(DeliveryProfile::PrimaryApi, &store)
        .send(&server.uri(), &batch(1))
        .await;

    assert!(outcome.is_delivered());
    assert_eq!(outcome.attempts(), 2);

    let metrics = store.snapshot().await.unwrap();
    assert_eq!(metrics.failed_api_calls, 1);
    assert_eq!(metrics.retry_attempts, 1);
    assert_eq!(metrics.successful_api_calls, 1);
}

#[tokio::test]
async fn test_slow_endpoint_times_out_and_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let outcome = client(DeliveryProfile::PrimaryApi, &store)
        .send(&server.uri(), &batch(1))
        .await;

    assert_eq!(outcome.attempts(), 3);
    assert!(matches!(outcome.error(), Some(DeliveryError::Timeout { .. })));
}

#[tokio::test]
async fn test_idempotency_key_matches_batch_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header(IDEMPOTENCY_HEADER, "1001-0..1003-0"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let outcome = client(DeliveryProfile::PrimaryApi, &store)
        .send(&server.uri(), &batch(3))
        .await;

    assert!(outcome.is_delivered());
}

#[tokio::test]
async fn test_fanout_isolates_one_failing_endpoint() {
    let store = Arc::new(MemoryStore::new());

    let mut healthy = Vec::new();
    for _ in 0..3 {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        store.add(&server.uri()).await.unwrap();
        healthy.push(server);
    }

    let failing = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&failing)
        .await;
    store.add(&failing.uri()).await.unwrap();

    let dispatcher = Dispatcher::new(
        client(DeliveryProfile::Webhook, &store),
        store.clone(),
        store.clone(),
    );
    let report = dispatcher.notify_all(&batch(2)).await;

    assert_eq!(report.endpoints.len(), 4);
    assert_eq!(report.succeeded(), 3);
    assert_eq!(report.failed(), 1);
    for server in &healthy {
        assert!(report.outcome_for(&server.uri()).unwrap().is_delivered());
    }
    assert_eq!(report.outcome_for(&failing.uri()).unwrap().attempts(), 3);

    let metrics = store.snapshot().await.unwrap();
    assert_eq!(metrics.failed_api_calls, 1);
    assert_eq!(metrics.failed_webhook_calls, 1);
    assert_eq!(metrics.successful_webhook_calls, 3);
}

#[tokio::test]
async fn test_fanout_sends_concurrently() {
    let store = Arc::new(MemoryStore::new());

    let mut servers = Vec::new();
    for _ in 0..4 {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(150)))
            .mount(&server)
            .await;
        store.add(&server.uri()).await.unwrap();
        servers.push(server);
    }

    let dispatcher = Dispatcher::new(
        client(DeliveryProfile::Webhook, &store),
        store.clone(),
        store.clone(),
    );

    let started = Instant::now();
    let report = dispatcher.notify_all(&batch(1)).await;

    assert_eq!(report.succeeded(), 4);
    // Sequential sends would take at least 600ms
    assert!(started.elapsed() < Duration::from_millis(500));
}
