//! Shared store abstractions
//!
//! Everything the worker persists lives behind the traits in this module:
//!
//! - [`ChangeLog`] - ordered append-only log of change records
//! - [`CheckpointStore`] - the delivery cursor
//! - [`MetricsStore`] - flat counter/scalar map with atomic increments
//! - [`LeaseCoordinator`] - cross-replica mutual exclusion for polling cycles
//! - [`WebhookRegistry`] - set of subscriber URLs
//!
//! Two backends implement all of them: [`RedisStore`] for replicated
//! deployments and [`MemoryStore`] for a single process and for tests.
//!
//! # Persisted layout (Redis)
//!
//! | Key | Type | Contents |
//! |-----|------|----------|
//! | `{prefix}:changes` | stream | change records, field `data` holds JSON |
//! | `{prefix}:lastCheckTime` | string | checkpoint id |
//! | `{prefix}:metrics` | hash | metric fields |
//! | `{prefix}:webhooks` | set | webhook URLs |
//! | `{prefix}:processing` | string + PX | lease owner token |

pub mod error;
pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{StoreBackend, StoreConfig};
use crate::models::{ChangeId, ChangeRecord, Counter, Gauge, Lease, Metrics, WorkerStatus};

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

// ============================================================================
// Store Traits
// ============================================================================

/// Ordered, append-only sequence of change records
#[async_trait]
pub trait ChangeLog: Send + Sync {
    /// Append a payload and return its newly assigned id
    async fn append(&self, payload: &serde_json::Value) -> StoreResult<ChangeId>;

    /// Records with id strictly greater than `checkpoint`, ascending
    ///
    /// `None` reads from the beginning of the log. `limit` caps the number of
    /// records returned; the oldest ones are returned first.
    async fn read_since(
        &self,
        checkpoint: Option<ChangeId>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<ChangeRecord>>;
}

/// Persistence for the last delivered change id
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self) -> StoreResult<Option<ChangeId>>;

    async fn save(&self, id: ChangeId) -> StoreResult<()>;
}

/// Durable counter/scalar map
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Write default values for every field that is not present yet
    async fn initialize(&self) -> StoreResult<()>;

    /// Atomic fetch-and-add, returns the new value
    async fn increment(&self, counter: Counter, by: i64) -> StoreResult<i64>;

    /// Overwrite a scalar
    async fn set(&self, gauge: Gauge, value: &str) -> StoreResult<()>;

    /// Apply several increments and overwrites in one round trip
    async fn apply(&self, update: &MetricsUpdate) -> StoreResult<()>;

    async fn snapshot(&self) -> StoreResult<Metrics>;

    /// Restore every field to its default value
    async fn reset(&self) -> StoreResult<()>;
}

/// Time-bounded exclusive ownership of a key
#[async_trait]
pub trait LeaseCoordinator: Send + Sync {
    /// Take the lease if no valid lease exists (atomic check-and-set)
    async fn try_acquire(&self, key: &str, owner_token: &str, ttl: Duration)
        -> StoreResult<bool>;

    /// Delete the lease only if it is still held by `owner_token`
    ///
    /// Returns whether a lease was deleted. Comparison and deletion happen
    /// atomically in the backend.
    async fn release(&self, key: &str, owner_token: &str) -> StoreResult<bool>;

    /// Currently valid lease under `key`, if any
    async fn current(&self, key: &str) -> StoreResult<Option<Lease>>;
}

/// Set of webhook subscriber URLs
#[async_trait]
pub trait WebhookRegistry: Send + Sync {
    /// Register a URL, returns false if it was already present
    async fn add(&self, url: &str) -> StoreResult<bool>;

    /// Unregister a URL, returns false if it was not present
    async fn remove(&self, url: &str) -> StoreResult<bool>;

    async fn list(&self) -> StoreResult<Vec<String>>;
}

// ============================================================================
// Metrics Update
// ============================================================================

/// Batched set of metric mutations
///
/// Increments are applied with fetch-and-add, overwrites replace the value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsUpdate {
    increments: Vec<(Counter, i64)>,
    overwrites: Vec<(Gauge, String)>,
}

impl MetricsUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(mut self, counter: Counter, by: i64) -> Self {
        self.increments.push((counter, by));
        self
    }

    pub fn set(mut self, gauge: Gauge, value: impl Into<String>) -> Self {
        self.overwrites.push((gauge, value.into()));
        self
    }

    pub fn status(self, status: WorkerStatus) -> Self {
        self.set(Gauge::Status, status.as_str())
    }

    pub fn increments(&self) -> &[(Counter, i64)] {
        &self.increments
    }

    pub fn overwrites(&self) -> &[(Gauge, String)] {
        &self.overwrites
    }

    pub fn is_empty(&self) -> bool {
        self.increments.is_empty() && self.overwrites.is_empty()
    }
}

// ============================================================================
// Store Handles
// ============================================================================

/// The set of store services a worker talks to
///
/// Each service is a separate trait object so a deployment (or a test) can
/// back them with different implementations.
#[derive(Clone)]
pub struct StoreHandles {
    pub changes: Arc<dyn ChangeLog>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub metrics: Arc<dyn MetricsStore>,
    pub leases: Arc<dyn LeaseCoordinator>,
    pub webhooks: Arc<dyn WebhookRegistry>,
}

impl StoreHandles {
    /// Use one backend for every service
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: ChangeLog
            + CheckpointStore
            + MetricsStore
            + LeaseCoordinator
            + WebhookRegistry
            + 'static,
    {
        Self {
            changes: store.clone(),
            checkpoints: store.clone(),
            metrics: store.clone(),
            leases: store.clone(),
            webhooks: store,
        }
    }
}

/// Open the backend selected by `config`
pub async fn connect(config: &StoreConfig) -> StoreResult<StoreHandles> {
    match config.backend {
        StoreBackend::Redis => {
            let store = RedisStore::connect(config).await?;
            Ok(StoreHandles::from_shared(Arc::new(store)))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store; state is lost on exit and not shared between replicas");
            Ok(StoreHandles::from_shared(Arc::new(MemoryStore::new())))
        }
    }
}

/// Check that a webhook URL is an absolute http(s) URL
pub fn validate_webhook_url(raw: &str) -> StoreResult<String> {
    let trimmed = raw.trim();
    let parsed =
        url::Url::parse(trimmed).map_err(|e| StoreError::invalid_url(trimmed, e.to_string()))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(StoreError::invalid_url(
                trimmed,
                format!("unsupported scheme '{other}'"),
            ))
        }
    }

    if parsed.host_str().is_none() {
        return Err(StoreError::invalid_url(trimmed, "missing host"));
    }

    Ok(trimmed.to_string())
}
