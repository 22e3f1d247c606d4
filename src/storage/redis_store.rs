//! Redis store backend
//!
//! Shared state for replicated workers. The change log is a Redis stream,
//! metrics a hash, webhooks a set and the lease a string key written with
//! `SET NX PX`. Every round trip is bounded by the configured operation
//! timeout.
//!
//! # Example
//!
//! ```rust,ignore
//! use ripple::config::StoreConfig;
//! use ripple::storage::RedisStore;
//!
//! let store = RedisStore::connect(&StoreConfig::default()).await?;
//! let id = store.append(&serde_json::json!({"table": "users"})).await?;
//! ```

use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use redis::streams::{StreamId, StreamRangeReply};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use super::{
    validate_webhook_url, ChangeLog, CheckpointStore, LeaseCoordinator, MetricsStore,
    MetricsUpdate, StoreError, StoreResult, WebhookRegistry,
};
use crate::config::StoreConfig;
use crate::models::{default_metric_fields, ChangeId, ChangeRecord, Counter, Gauge, Lease, Metrics};

/// Deletes the lease only while it still carries the caller's token
const RELEASE_LEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Stream field holding the JSON payload
const PAYLOAD_FIELD: &str = "data";

const CHANGE_ADDED_CHANNEL: &str = "change:added";
const WEBHOOK_ADDED_CHANNEL: &str = "webhook:added";
const WEBHOOK_REMOVED_CHANNEL: &str = "webhook:removed";

/// Key names derived from the configured prefix
#[derive(Debug, Clone)]
pub struct StoreKeys {
    pub changes: String,
    pub checkpoint: String,
    pub metrics: String,
    pub webhooks: String,
}

impl StoreKeys {
    pub fn new(prefix: &str) -> Self {
        Self {
            changes: format!("{prefix}:changes"),
            checkpoint: format!("{prefix}:lastCheckTime"),
            metrics: format!("{prefix}:metrics"),
            webhooks: format!("{prefix}:webhooks"),
        }
    }
}

/// Redis-backed implementation of every store trait
pub struct RedisStore {
    pool: Pool,
    keys: StoreKeys,
    op_timeout: Duration,
    release_script: redis::Script,
}

impl RedisStore {
    /// Create the connection pool and verify the server answers `PING`
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        let pool = PoolConfig::from_url(&config.redis_url)
            .builder()
            .map_err(|e| StoreError::Pool(format!("Failed to create pool builder: {e}")))?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| StoreError::Pool(format!("Failed to create Redis pool: {e}")))?;

        let store = Self {
            pool,
            keys: StoreKeys::new(&config.key_prefix),
            op_timeout: config.op_timeout(),
            release_script: redis::Script::new(RELEASE_LEASE_SCRIPT),
        };

        store
            .bounded("ping", async {
                let mut conn = store.conn().await?;
                let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
                Ok(())
            })
            .await?;

        tracing::info!(url = %config.redis_url, prefix = %config.key_prefix, "Connected to Redis");

        Ok(store)
    }

    pub fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    async fn conn(&self) -> StoreResult<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }

    /// Run one store round trip under the operation timeout
    async fn bounded<T, F>(&self, operation: &str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::timeout(
                operation,
                self.op_timeout.as_millis() as u64,
            )),
        }
    }

    /// Best-effort pub/sub notification; failures are only logged
    async fn publish(&self, channel: &str, message: &str) {
        let result = self
            .bounded("publish", async {
                let mut conn = self.conn().await?;
                let _: i64 = conn.publish(channel, message).await?;
                Ok(())
            })
            .await;

        if let Err(e) = result {
            tracing::warn!(channel = %channel, error = %e, "Failed to publish notification");
        }
    }
}

fn decode_entry(entry: StreamId) -> StoreResult<ChangeRecord> {
    let id: ChangeId = entry.id.parse()?;
    let data: String = entry
        .get(PAYLOAD_FIELD)
        .ok_or_else(|| StoreError::MalformedEntry(entry.id.clone()))?;
    let payload = serde_json::from_str(&data)?;

    Ok(ChangeRecord::new(id, payload))
}

#[async_trait]
impl ChangeLog for RedisStore {
    async fn append(&self, payload: &serde_json::Value) -> StoreResult<ChangeId> {
        let data = serde_json::to_string(payload)?;

        let id = self
            .bounded("append", async {
                let mut conn = self.conn().await?;
                let id: String = conn
                    .xadd(&self.keys.changes, "*", &[(PAYLOAD_FIELD, data.as_str())])
                    .await?;
                Ok(id.parse::<ChangeId>()?)
            })
            .await?;

        self.publish(CHANGE_ADDED_CHANNEL, &data).await;
        Ok(id)
    }

    async fn read_since(
        &self,
        checkpoint: Option<ChangeId>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<ChangeRecord>> {
        // "(" makes the start bound exclusive
        let start = match checkpoint {
            Some(id) => format!("({id}"),
            None => String::from("-"),
        };

        self.bounded("read_since", async {
            let mut conn = self.conn().await?;
            let reply: StreamRangeReply = match limit {
                Some(count) => {
                    conn.xrange_count(&self.keys.changes, &start, "+", count)
                        .await?
                }
                None => conn.xrange(&self.keys.changes, &start, "+").await?,
            };

            reply.ids.into_iter().map(decode_entry).collect()
        })
        .await
    }
}

#[async_trait]
impl CheckpointStore for RedisStore {
    async fn load(&self) -> StoreResult<Option<ChangeId>> {
        self.bounded("load_checkpoint", async {
            let mut conn = self.conn().await?;
            let raw: Option<String> = conn.get(&self.keys.checkpoint).await?;
            match raw {
                Some(raw) => Ok(Some(raw.parse()?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn save(&self, id: ChangeId) -> StoreResult<()> {
        self.bounded("save_checkpoint", async {
            let mut conn = self.conn().await?;
            let _: () = conn.set(&self.keys.checkpoint, id.to_string()).await?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl MetricsStore for RedisStore {
    async fn initialize(&self) -> StoreResult<()> {
        self.bounded("initialize_metrics", async {
            let mut conn = self.conn().await?;
            let mut pipe = redis::pipe();
            pipe.atomic();
            for (field, value) in default_metric_fields() {
                pipe.hset_nx(&self.keys.metrics, field, value).ignore();
            }
            let _: () = pipe.query_async(&mut *conn).await?;
            Ok(())
        })
        .await
    }

    async fn increment(&self, counter: Counter, by: i64) -> StoreResult<i64> {
        self.bounded("increment_metric", async {
            let mut conn = self.conn().await?;
            let value: i64 = conn.hincr(&self.keys.metrics, counter.as_str(), by).await?;
            Ok(value)
        })
        .await
    }

    async fn set(&self, gauge: Gauge, value: &str) -> StoreResult<()> {
        self.bounded("set_metric", async {
            let mut conn = self.conn().await?;
            let _: () = conn.hset(&self.keys.metrics, gauge.as_str(), value).await?;
            Ok(())
        })
        .await
    }

    async fn apply(&self, update: &MetricsUpdate) -> StoreResult<()> {
        if update.is_empty() {
            return Ok(());
        }

        self.bounded("apply_metrics", async {
            let mut conn = self.conn().await?;
            let mut pipe = redis::pipe();
            pipe.atomic();
            for (counter, by) in update.increments() {
                pipe.hincr(&self.keys.metrics, counter.as_str(), *by).ignore();
            }
            for (gauge, value) in update.overwrites() {
                pipe.hset(&self.keys.metrics, gauge.as_str(), value).ignore();
            }
            let _: () = pipe.query_async(&mut *conn).await?;
            Ok(())
        })
        .await
    }

    async fn snapshot(&self) -> StoreResult<Metrics> {
        self.bounded("snapshot_metrics", async {
            let mut conn = self.conn().await?;
            let fields: HashMap<String, String> = conn.hgetall(&self.keys.metrics).await?;
            Ok(Metrics::from_fields(&fields))
        })
        .await
    }

    async fn reset(&self) -> StoreResult<()> {
        self.bounded("reset_metrics", async {
            let mut conn = self.conn().await?;
            let fields = default_metric_fields();
            let _: () = redis::pipe()
                .atomic()
                .del(&self.keys.metrics)
                .ignore()
                .hset_multiple(&self.keys.metrics, fields.as_slice())
                .ignore()
                .query_async(&mut *conn)
                .await?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl LeaseCoordinator for RedisStore {
    async fn try_acquire(
        &self,
        key: &str,
        owner_token: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.bounded("acquire_lease", async {
            let mut conn = self.conn().await?;
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(owner_token)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut *conn)
                .await?;
            Ok(reply.is_some())
        })
        .await
    }

    async fn release(&self, key: &str, owner_token: &str) -> StoreResult<bool> {
        self.bounded("release_lease", async {
            let mut conn = self.conn().await?;
            let deleted: i64 = self
                .release_script
                .key(key)
                .arg(owner_token)
                .invoke_async(&mut *conn)
                .await?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn current(&self, key: &str) -> StoreResult<Option<Lease>> {
        self.bounded("current_lease", async {
            let mut conn = self.conn().await?;
            let (owner, pttl): (Option<String>, i64) = redis::pipe()
                .get(key)
                .pttl(key)
                .query_async(&mut *conn)
                .await?;

            Ok(owner.map(|owner_token| Lease {
                key: key.to_string(),
                owner_token,
                expires_at: Utc::now() + chrono::Duration::milliseconds(pttl.max(0)),
            }))
        })
        .await
    }
}

#[async_trait]
impl WebhookRegistry for RedisStore {
    async fn add(&self, url: &str) -> StoreResult<bool> {
        let url = validate_webhook_url(url)?;

        let added = self
            .bounded("add_webhook", async {
                let mut conn = self.conn().await?;
                let added: i64 = conn.sadd(&self.keys.webhooks, &url).await?;
                Ok(added > 0)
            })
            .await?;

        self.publish(WEBHOOK_ADDED_CHANNEL, &url).await;
        Ok(added)
    }

    async fn remove(&self, url: &str) -> StoreResult<bool> {
        let url = url.trim();

        let removed = self
            .bounded("remove_webhook", async {
                let mut conn = self.conn().await?;
                let removed: i64 = conn.srem(&self.keys.webhooks, url).await?;
                Ok(removed > 0)
            })
            .await?;

        self.publish(WEBHOOK_REMOVED_CHANNEL, url).await;
        Ok(removed)
    }

    async fn list(&self) -> StoreResult<Vec<String>> {
        self.bounded("list_webhooks", async {
            let mut conn = self.conn().await?;
            let urls: Vec<String> = conn.smembers(&self.keys.webhooks).await?;
            Ok(urls)
        })
        .await
    }
}
