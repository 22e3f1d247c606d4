//! Common test utilities

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ripple::config::{Config, StoreBackend};
use ripple::models::{ChangeId, ChangeRecord, Counter, Gauge, Lease, Metrics};
use ripple::storage::{
    ChangeLog, LeaseCoordinator, MemoryStore, MetricsStore, MetricsUpdate, StoreError,
    StoreHandles, StoreResult, WebhookRegistry,
};
use ripple::worker::PollingWorker;

/// Config with short timeouts and delays, pointing at `api_endpoint`
pub fn test_config(api_endpoint: &str) -> Config {
    let mut config = Config::default();
    config.store.backend = StoreBackend::Memory;
    config.store.key_prefix = "test".to_string();
    config.poller.interval_ms = 50;
    config.poller.lease_ttl_ms = 30_000;
    config.poller.batch_size = 100;
    config.delivery.api_endpoint = api_endpoint.to_string();
    config.delivery.api_timeout_ms = 1_000;
    config.delivery.webhook_timeout_ms = 500;
    config.delivery.max_attempts = 3;
    config.delivery.base_delay_ms = 10;
    config.delivery.max_delay_ms = 40;
    config
}

/// Memory store plus handles that all point at it
pub fn memory_stores() -> (Arc<MemoryStore>, StoreHandles) {
    let store = Arc::new(MemoryStore::new());
    let handles = StoreHandles::from_shared(Arc::clone(&store));
    (store, handles)
}

pub fn build_worker(config: &Config, stores: StoreHandles) -> PollingWorker {
    PollingWorker::new(config, stores).expect("worker should build")
}

/// Append `n` payloads `{"n": i}` and return their ids
pub async fn append_changes(log: &dyn ChangeLog, n: usize) -> Vec<ChangeId> {
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        ids.push(log.append(&serde_json::json!({ "n": i })).await.unwrap());
    }
    ids
}

pub fn unavailable(what: &str) -> StoreError {
    StoreError::Unavailable(format!("{what} offline"))
}

// ============================================================================
// Failure-injecting stores
// ============================================================================

/// Change log whose reads always fail
pub struct UnavailableChangeLog;

#[async_trait]
impl ChangeLog for UnavailableChangeLog {
    async fn append(&self, _payload: &serde_json::Value) -> StoreResult<ChangeId> {
        Err(unavailable("change log"))
    }

    async fn read_since(
        &self,
        _checkpoint: Option<ChangeId>,
        _limit: Option<usize>,
    ) -> StoreResult<Vec<ChangeRecord>> {
        Err(unavailable("change log"))
    }
}

/// Change log that panics while reading
pub struct PanickingChangeLog;

#[async_trait]
impl ChangeLog for PanickingChangeLog {
    async fn append(&self, _payload: &serde_json::Value) -> StoreResult<ChangeId> {
        Ok(ChangeId::new(1, 0))
    }

    async fn read_since(
        &self,
        _checkpoint: Option<ChangeId>,
        _limit: Option<usize>,
    ) -> StoreResult<Vec<ChangeRecord>> {
        panic!("corrupted change log");
    }
}

/// Lease store that cannot be reached
pub struct UnavailableLeases;

#[async_trait]
impl LeaseCoordinator for UnavailableLeases {
    async fn try_acquire(&self, _key: &str, _owner_token: &str, _ttl: Duration) -> StoreResult<bool> {
        Err(unavailable("lease store"))
    }

    async fn release(&self, _key: &str, _owner_token: &str) -> StoreResult<bool> {
        Err(unavailable("lease store"))
    }

    async fn current(&self, _key: &str) -> StoreResult<Option<Lease>> {
        Err(unavailable("lease store"))
    }
}

/// Webhook registry that cannot be read
pub struct UnavailableRegistry;

#[async_trait]
impl WebhookRegistry for UnavailableRegistry {
    async fn add(&self, _url: &str) -> StoreResult<bool> {
        Err(unavailable("registry"))
    }

    async fn remove(&self, _url: &str) -> StoreResult<bool> {
        Err(unavailable("registry"))
    }

    async fn list(&self) -> StoreResult<Vec<String>> {
        Err(unavailable("registry"))
    }
}

/// Metrics store that can be taken offline
pub struct SwitchableMetrics {
    inner: Arc<MemoryStore>,
    offline: AtomicBool,
    rejected: AtomicUsize,
}

impl SwitchableMetrics {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            offline: AtomicBool::new(false),
            rejected: AtomicUsize::new(0),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of calls refused while offline
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    fn check(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            Err(unavailable("metrics"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MetricsStore for SwitchableMetrics {
    async fn initialize(&self) -> StoreResult<()> {
        self.check()?;
        self.inner.initialize().await
    }

    async fn increment(&self, counter: Counter, by: i64) -> StoreResult<i64> {
        self.check()?;
        self.inner.increment(counter, by).await
    }

    async fn set(&self, gauge: Gauge, value: &str) -> StoreResult<()> {
        self.check()?;
        self.inner.set(gauge, value).await
    }

    async fn apply(&self, update: &MetricsUpdate) -> StoreResult<()> {
        self.check()?;
        self.inner.apply(update).await
    }

    async fn snapshot(&self) -> StoreResult<Metrics> {
        self.check()?;
        self.inner.snapshot().await
    }

    async fn reset(&self) -> StoreResult<()> {
        self.check()?;
        self.inner.reset().await
    }
}

/// Wait until `condition` holds, polling every 10ms for up to `timeout`
pub async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition().await
}
