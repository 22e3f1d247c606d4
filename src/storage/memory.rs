//! In-process store backend
//!
//! Implements every store trait over a single mutex-guarded state. Suitable
//! for one process (`store.backend = "memory"`) and for tests; it offers no
//! durability across restarts.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{
    validate_webhook_url, ChangeLog, CheckpointStore, LeaseCoordinator, MetricsStore,
    MetricsUpdate, StoreResult, WebhookRegistry,
};
use crate::models::{default_metric_fields, ChangeId, ChangeRecord, Counter, Gauge, Lease, Metrics};

#[derive(Debug)]
struct HeldLease {
    owner_token: String,
    deadline: Instant,
    expires_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    changes: Vec<ChangeRecord>,
    checkpoint: Option<ChangeId>,
    metrics: HashMap<String, String>,
    webhooks: BTreeSet<String>,
    leases: HashMap<String, HeldLease>,
}

impl MemoryState {
    fn incr(&mut self, field: &str, by: i64) -> i64 {
        let current = self
            .metrics
            .get(field)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + by;
        self.metrics.insert(field.to_string(), next.to_string());
        next
    }

    fn live_lease(&mut self, key: &str) -> Option<&HeldLease> {
        let expired = self
            .leases
            .get(key)
            .is_some_and(|lease| Instant::now() >= lease.deadline);
        if expired {
            self.leases.remove(key);
        }
        self.leases.get(key)
    }
}

/// Store backend holding all state in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChangeLog for MemoryStore {
    async fn append(&self, payload: &serde_json::Value) -> StoreResult<ChangeId> {
        let mut state = self.state.lock().await;
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        let id = match state.changes.last() {
            Some(last) => last.id.successor(now_ms),
            None => ChangeId::new(now_ms, 0),
        };

        state.changes.push(ChangeRecord::new(id, payload.clone()));
        Ok(id)
    }

    async fn read_since(
        &self,
        checkpoint: Option<ChangeId>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<ChangeRecord>> {
        let state = self.state.lock().await;
        // Ids are appended in ascending order, so the tail after the
        // checkpoint is already sorted.
        let start = match checkpoint {
            Some(id) => state.changes.partition_point(|c| c.id <= id),
            None => 0,
        };

        let tail = &state.changes[start..];
        let take = limit.unwrap_or(tail.len()).min(tail.len());
        Ok(tail[..take].to_vec())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn load(&self) -> StoreResult<Option<ChangeId>> {
        Ok(self.state.lock().await.checkpoint)
    }

    async fn save(&self, id: ChangeId) -> StoreResult<()> {
        self.state.lock().await.checkpoint = Some(id);
        Ok(())
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn initialize(&self) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        for (field, value) in default_metric_fields() {
            state.metrics.entry(field.to_string()).or_insert(value);
        }
        Ok(())
    }

    async fn increment(&self, counter: Counter, by: i64) -> StoreResult<i64> {
        Ok(self.state.lock().await.incr(counter.as_str(), by))
    }

    async fn set(&self, gauge: Gauge, value: &str) -> StoreResult<()> {
        self.state
            .lock()
            .await
            .metrics
            .insert(gauge.as_str().to_string(), value.to_string());
        Ok(())
    }

    async fn apply(&self, update: &MetricsUpdate) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        for (counter, by) in update.increments() {
            state.incr(counter.as_str(), *by);
        }
        for (gauge, value) in update.overwrites() {
            state
                .metrics
                .insert(gauge.as_str().to_string(), value.clone());
        }
        Ok(())
    }

    async fn snapshot(&self) -> StoreResult<Metrics> {
        Ok(Metrics::from_fields(&self.state.lock().await.metrics))
    }

    async fn reset(&self) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.metrics = default_metric_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Ok(())
    }
}

#[async_trait]
impl LeaseCoordinator for MemoryStore {
    async fn try_acquire(
        &self,
        key: &str,
        owner_token: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state.live_lease(key).is_some() {
            return Ok(false);
        }

        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        state.leases.insert(
            key.to_string(),
            HeldLease {
                owner_token: owner_token.to_string(),
                deadline: Instant::now() + ttl,
                expires_at,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, owner_token: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let owned = state
            .live_lease(key)
            .is_some_and(|lease| lease.owner_token == owner_token);
        if owned {
            state.leases.remove(key);
        }
        Ok(owned)
    }

    async fn current(&self, key: &str) -> StoreResult<Option<Lease>> {
        let mut state = self.state.lock().await;
        Ok(state.live_lease(key).map(|held| Lease {
            key: key.to_string(),
            owner_token: held.owner_token.clone(),
            expires_at: held.expires_at,
        }))
    }
}

#[async_trait]
impl WebhookRegistry for MemoryStore {
    async fn add(&self, url: &str) -> StoreResult<bool> {
        let url = validate_webhook_url(url)?;
        Ok(self.state.lock().await.webhooks.insert(url))
    }

    async fn remove(&self, url: &str) -> StoreResult<bool> {
        Ok(self.state.lock().await.webhooks.remove(url.trim()))
    }

    async fn list(&self) -> StoreResult<Vec<String>> {
        Ok(self.state.lock().await.webhooks.iter().cloned().collect())
    }
}
