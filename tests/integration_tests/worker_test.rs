//! Polling cycle integration tests

use std::time::Duration;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use ripple::models::WorkerStatus;
use ripple::worker::{CycleOutcome, CycleState};

use crate::common::{append_changes, build_worker, memory_stores, test_config, wait_for};

fn request_body(request: &wiremock::Request) -> serde_json::Value {
    serde_json::from_slice(&request.body).unwrap()
}

#[tokio::test]
async fn test_null_checkpoint_delivers_everything_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (store, stores) = memory_stores();
    let ids = append_changes(store.as_ref(), 3).await;
    let worker = build_worker(&test_config(&server.uri()), stores.clone());

    let outcome = worker.run_cycle().await;
    assert_eq!(
        outcome,
        CycleOutcome::Delivered {
            count: 3,
            checkpoint: ids[2],
            webhooks_failed: 0,
        }
    );

    let requests = server.received_requests().await.unwrap();
    let body = request_body(&requests[0]);
    let delivered: Vec<String> = body["changes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["id"].as_str().unwrap().to_string())
        .collect();
    let expected: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    assert_eq!(delivered, expected);
    assert_eq!(body["changes"][0]["payload"]["n"], 0);

    assert_eq!(stores.checkpoints.load().await.unwrap(), Some(ids[2]));
}

#[tokio::test]
async fn test_failed_batch_is_redelivered_next_cycle() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (store, stores) = memory_stores();
    let first = append_changes(store.as_ref(), 2).await;
    let worker = build_worker(&test_config(&server.uri()), stores.clone());

    let outcome = worker.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::DeliveryFailed { count: 2, .. }));
    assert_eq!(stores.checkpoints.load().await.unwrap(), None);

    let newer = append_changes(store.as_ref(), 1).await;
    let outcome = worker.run_cycle().await;
    assert_eq!(outcome.delivered_count(), 3);
    assert_eq!(stores.checkpoints.load().await.unwrap(), Some(newer[0]));

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 4);

    // Every failed attempt carried the same batch
    let failed_id = format!("{}..{}", first[0], first[1]);
    for request in &requests[..3] {
        assert_eq!(request_body(request)["batchId"], failed_id.as_str());
    }

    // The retry cycle starts from the same first record and includes the newer one
    let retried = request_body(&requests[3]);
    assert_eq!(retried["changes"][0]["id"], first[0].to_string());
    assert_eq!(retried["changes"].as_array().unwrap().len(), 3);

    let metrics = stores.metrics.snapshot().await.unwrap();
    assert_eq!(metrics.failed_api_calls, 3);
    assert_eq!(metrics.retry_attempts, 2);
    assert_eq!(metrics.successful_api_calls, 1);
    assert_eq!(metrics.total_changes_detected, 5);
    assert_eq!(metrics.total_changes_sent, 3);
    assert_eq!(metrics.status, WorkerStatus::Idle);
}

#[tokio::test]
async fn test_cycles_without_changes_only_touch_timing_metrics() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (store, stores) = memory_stores();
    append_changes(store.as_ref(), 2).await;
    let worker = build_worker(&test_config(&server.uri()), stores.clone());

    assert_eq!(worker.run_cycle().await.delivered_count(), 2);
    let checkpoint = stores.checkpoints.load().await.unwrap();
    let before = stores.metrics.snapshot().await.unwrap();

    assert_eq!(worker.run_cycle().await, CycleOutcome::Empty);
    assert_eq!(worker.run_cycle().await, CycleOutcome::Empty);

    assert_eq!(stores.checkpoints.load().await.unwrap(), checkpoint);
    let after = stores.metrics.snapshot().await.unwrap();
    assert_eq!(after.processed_batches, before.processed_batches + 2);
    assert_eq!(after.total_changes_detected, before.total_changes_detected);
    assert_eq!(after.total_changes_sent, before.total_changes_sent);
    assert_eq!(after.successful_api_calls, before.successful_api_calls);
    assert_eq!(after.failed_api_calls, before.failed_api_calls);
    assert_eq!(after.retry_attempts, before.retry_attempts);
}

#[tokio::test]
async fn test_batch_size_caps_each_cycle() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&server)
        .await;

    let (store, stores) = memory_stores();
    let ids = append_changes(store.as_ref(), 5).await;

    let mut config = test_config(&server.uri());
    config.poller.batch_size = 2;
    let worker = build_worker(&config, stores.clone());

    let counts = [
        worker.run_cycle().await.delivered_count(),
        worker.run_cycle().await.delivered_count(),
        worker.run_cycle().await.delivered_count(),
    ];
    assert_eq!(counts, [2, 2, 1]);
    assert_eq!(stores.checkpoints.load().await.unwrap(), Some(ids[4]));
    assert_eq!(worker.run_cycle().await, CycleOutcome::Empty);
}

#[tokio::test]
async fn test_concurrent_workers_only_one_reads() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
        .expect(1)
        .mount(&server)
        .await;

    let (store, stores) = memory_stores();
    append_changes(store.as_ref(), 3).await;

    let mut config_a = test_config(&server.uri());
    config_a.poller.instance_id = "worker-a".to_string();
    let mut config_b = test_config(&server.uri());
    config_b.poller.instance_id = "worker-b".to_string();

    let worker_a = build_worker(&config_a, stores.clone());
    let worker_b = build_worker(&config_b, stores.clone());

    let (a, b) = tokio::join!(worker_a.run_cycle(), worker_b.run_cycle());
    let outcomes = [a, b];

    let delivered = outcomes
        .iter()
        .filter(|o| matches!(o, CycleOutcome::Delivered { .. }))
        .count();
    let skipped = outcomes
        .iter()
        .filter(|o| **o == CycleOutcome::LeaseHeld)
        .count();
    assert_eq!(delivered, 1);
    assert_eq!(skipped, 1);

    let metrics = stores.metrics.snapshot().await.unwrap();
    assert_eq!(metrics.total_changes_detected, 3);
    assert_eq!(metrics.processed_batches, 1);
}

#[tokio::test]
async fn test_webhooks_receive_delivered_batch() {
    let api = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&api)
        .await;

    let hook_a = MockServer::start().await;
    let hook_b = MockServer::start().await;
    for hook in [&hook_a, &hook_b] {
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(hook)
            .await;
    }

    let (store, stores) = memory_stores();
    append_changes(store.as_ref(), 2).await;
    stores.webhooks.add(&hook_a.uri()).await.unwrap();
    stores.webhooks.add(&hook_b.uri()).await.unwrap();

    let worker = build_worker(&test_config(&api.uri()), stores.clone());
    let outcome = worker.run_cycle().await;
    assert!(matches!(
        outcome,
        CycleOutcome::Delivered {
            count: 2,
            webhooks_failed: 0,
            ..
        }
    ));

    let api_body = request_body(&api.received_requests().await.unwrap()[0]);
    let hook_body = request_body(&hook_a.received_requests().await.unwrap()[0]);
    assert_eq!(api_body, hook_body);

    let metrics = stores.metrics.snapshot().await.unwrap();
    assert_eq!(metrics.successful_webhook_calls, 2);
    assert_eq!(metrics.successful_api_calls, 1);
}

#[tokio::test]
async fn test_webhook_failure_does_not_block_commit() {
    let api = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&api)
        .await;

    let hook = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&hook)
        .await;

    let (store, stores) = memory_stores();
    let ids = append_changes(store.as_ref(), 1).await;
    stores.webhooks.add(&hook.uri()).await.unwrap();

    let worker = build_worker(&test_config(&api.uri()), stores.clone());
    let outcome = worker.run_cycle().await;

    assert_eq!(
        outcome,
        CycleOutcome::Delivered {
            count: 1,
            checkpoint: ids[0],
            webhooks_failed: 1,
        }
    );
    assert_eq!(stores.checkpoints.load().await.unwrap(), Some(ids[0]));

    let metrics = stores.metrics.snapshot().await.unwrap();
    assert_eq!(metrics.failed_webhook_calls, 1);
    assert_eq!(metrics.webhook_retry_attempts, 2);
    assert_eq!(metrics.failed_api_calls, 1);
    assert_eq!(metrics.status, WorkerStatus::Idle);
}

#[tokio::test]
async fn test_stop_prevents_further_ticks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (_store, stores) = memory_stores();
    let worker = build_worker(&test_config(&server.uri()), stores.clone());

    assert!(worker.start().await);
    let ticked = wait_for(Duration::from_secs(2), || {
        let stores = stores.clone();
        async move {
            stores
                .metrics
                .snapshot()
                .await
                .map(|m| m.processed_batches >= 2)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(ticked, "loop should run repeatedly");

    worker.shutdown().await;
    assert!(!worker.is_running().await);
    assert_eq!(worker.state(), CycleState::Idle);

    let stopped_at = stores.metrics.snapshot().await.unwrap().processed_batches;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        stores.metrics.snapshot().await.unwrap().processed_batches,
        stopped_at
    );

    // Restart after stop is allowed
    assert!(worker.start().await);
    worker.shutdown().await;
}

#[tokio::test]
async fn test_start_initializes_metrics() {
    let (_store, stores) = memory_stores();
    let worker = build_worker(&test_config("http://127.0.0.1:9"), stores.clone());

    assert!(worker.start().await);
    worker.shutdown().await;

    let metrics = worker.metrics().await;
    assert!(!metrics.is_running);
    assert_ne!(metrics.status, WorkerStatus::Processing);
}
