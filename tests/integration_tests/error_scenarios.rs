//! Error scenario integration tests
//!
//! 1. Change log unavailable
//! 2. Panic inside a cycle
//! 3. Metrics store outage
//! 4. Webhook registry outage
//! 5. Lease store outage

use std::sync::Arc;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use ripple::models::WorkerStatus;
use ripple::storage::{LeaseCoordinator, StoreHandles};
use ripple::worker::CycleOutcome;

use crate::common::{
    append_changes, build_worker, memory_stores, test_config, PanickingChangeLog,
    SwitchableMetrics, UnavailableChangeLog, UnavailableLeases, UnavailableRegistry,
};

const LEASE_KEY: &str = "test:processing";

#[tokio::test]
async fn test_change_log_failure_aborts_cycle() {
    let (store, stores) = memory_stores();
    let stores = StoreHandles {
        changes: Arc::new(UnavailableChangeLog),
        ..stores
    };

    let worker = build_worker(&test_config("http://127.0.0.1:9"), stores.clone());
    let outcome = worker.run_cycle().await;

    match outcome {
        CycleOutcome::Aborted { error } => assert!(error.contains("offline"), "{error}"),
        other => panic!("expected abort, got {other:?}"),
    }

    let metrics = stores.metrics.snapshot().await.unwrap();
    assert_eq!(metrics.status, WorkerStatus::Error);
    assert!(metrics.last_error.contains("read changes"));
    assert_eq!(metrics.processed_batches, 1);
    assert!(store.current(LEASE_KEY).await.unwrap().is_none());
}

#[tokio::test]
async fn test_panic_in_cycle_still_releases_lease() {
    let (store, stores) = memory_stores();
    let stores = StoreHandles {
        changes: Arc::new(PanickingChangeLog),
        ..stores
    };

    let worker = build_worker(&test_config("http://127.0.0.1:9"), stores.clone());

    for _ in 0..2 {
        let outcome = worker.run_cycle().await;
        match outcome {
            CycleOutcome::Aborted { error } => {
                assert!(error.contains("corrupted change log"), "{error}")
            }
            other => panic!("expected abort, got {other:?}"),
        }
        assert!(store.current(LEASE_KEY).await.unwrap().is_none());
    }

    let metrics = stores.metrics.snapshot().await.unwrap();
    assert_eq!(metrics.status, WorkerStatus::Error);
    assert_eq!(metrics.processed_batches, 2);
}

#[tokio::test]
async fn test_metrics_outage_returns_last_known_values() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (store, stores) = memory_stores();
    let metrics = Arc::new(SwitchableMetrics::new(Arc::clone(&store)));
    let stores = StoreHandles {
        metrics: metrics.clone(),
        ..stores
    };
    append_changes(store.as_ref(), 2).await;

    let worker = build_worker(&test_config(&server.uri()), stores.clone());
    assert_eq!(worker.run_cycle().await.delivered_count(), 2);

    let known = worker.metrics().await;
    assert_eq!(known.total_changes_sent, 2);

    metrics.set_offline(true);

    let fallback = worker.metrics().await;
    assert_eq!(fallback, known);

    // Delivery keeps working while metrics cannot be written
    let ids = append_changes(store.as_ref(), 1).await;
    assert_eq!(worker.run_cycle().await.delivered_count(), 1);
    assert_eq!(stores.checkpoints.load().await.unwrap(), Some(ids[0]));
    assert!(metrics.rejected() > 0);

    metrics.set_offline(false);
    assert_eq!(worker.metrics().await.total_changes_sent, 2);
}

#[tokio::test]
async fn test_registry_outage_yields_no_webhooks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (store, stores) = memory_stores();
    let stores = StoreHandles {
        webhooks: Arc::new(UnavailableRegistry),
        ..stores
    };
    append_changes(store.as_ref(), 1).await;

    let worker = build_worker(&test_config(&server.uri()), stores);
    assert!(worker.webhooks().await.is_empty());

    let outcome = worker.run_cycle().await;
    assert!(matches!(
        outcome,
        CycleOutcome::Delivered {
            webhooks_failed: 0,
            ..
        }
    ));
}

#[tokio::test]
async fn test_lease_store_failure_records_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (store, stores) = memory_stores();
    let stores = StoreHandles {
        leases: Arc::new(UnavailableLeases),
        ..stores
    };
    append_changes(store.as_ref(), 2).await;

    let worker = build_worker(&test_config(&server.uri()), stores.clone());
    let outcome = worker.run_cycle().await;

    match outcome {
        CycleOutcome::Aborted { error } => {
            assert!(error.contains("lease store offline"), "{error}")
        }
        other => panic!("expected abort, got {other:?}"),
    }

    let metrics = stores.metrics.snapshot().await.unwrap();
    assert_eq!(metrics.status, WorkerStatus::Error);
    assert!(metrics.last_error.contains("test:processing"), "{}", metrics.last_error);
    // No lease was held, so no cycle is counted
    assert_eq!(metrics.processed_batches, 0);
    assert_eq!(metrics.total_changes_detected, 0);
    assert_eq!(stores.checkpoints.load().await.unwrap(), None);
}
