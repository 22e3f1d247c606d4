//! Configuration management for the ripple worker
//!
//! This module handles loading and validating configuration from environment
//! variables and TOML files.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Field has an unusable value
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// Required field has no value
    #[error("Missing required setting '{0}'")]
    Missing(String),

    /// File could not be read
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// File is not valid TOML for [`Config`]
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Shared store configuration
    pub store: StoreConfig,

    /// Polling loop configuration
    pub poller: PollerConfig,

    /// Downstream delivery configuration
    pub delivery: DeliveryConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Which store backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    Memory,
}

impl StoreBackend {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "redis" => Some(Self::Redis),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

/// Shared store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend implementation
    pub backend: StoreBackend,

    /// Redis URL (e.g., redis://localhost:6379)
    pub redis_url: String,

    /// Connection pool size
    pub pool_size: usize,

    /// Key prefix for namespacing
    pub key_prefix: String,

    /// Deadline for a single store round trip in milliseconds
    pub op_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            redis_url: String::from("redis://localhost:6379"),
            pool_size: 8,
            key_prefix: String::from("monitor"),
            op_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    /// Key the polling lease lives under
    pub fn lease_key(&self) -> String {
        format!("{}:processing", self.key_prefix)
    }
}

/// Polling loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Pause between the end of one cycle and the start of the next
    pub interval_ms: u64,

    /// Lifetime of the polling lease
    pub lease_ttl_ms: u64,

    /// Maximum number of changes read in one cycle
    pub batch_size: usize,

    /// Identifier of this replica, prefixed to lease tokens
    pub instance_id: String,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            lease_ttl_ms: 180_000,
            batch_size: 1_000,
            instance_id: default_instance_id(),
        }
    }
}

impl PollerConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }
}

fn default_instance_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..8])
}

/// Downstream delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Primary API endpoint receiving every batch
    pub api_endpoint: String,

    /// Per-request timeout for the primary API
    pub api_timeout_ms: u64,

    /// Per-request timeout for webhook notifications
    pub webhook_timeout_ms: u64,

    /// Total attempts per delivery, including the first
    pub max_attempts: u32,

    /// Delay before the first retry
    pub base_delay_ms: u64,

    /// Upper bound for any retry delay
    pub max_delay_ms: u64,

    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,

    /// User agent sent with every request
    pub user_agent: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            api_endpoint: String::new(),
            api_timeout_ms: 30_000,
            webhook_timeout_ms: 5_000,
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            user_agent: format!("ripple/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl DeliveryConfig {
    #[must_use]
    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }

    #[must_use]
    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_millis(self.webhook_timeout_ms)
    }

    /// Sum of all backoff delays for one fully retried delivery
    fn total_backoff_ms(&self) -> u64 {
        (1..self.max_attempts)
            .map(|retry| {
                let delay =
                    self.base_delay_ms as f64 * self.backoff_multiplier.powi(retry as i32 - 1);
                (delay as u64).min(self.max_delay_ms)
            })
            .sum()
    }

    /// Longest a cycle can spend delivering: the primary API and then the
    /// webhook fan-out, both exhausting every attempt
    pub fn worst_case_cycle(&self) -> Duration {
        let attempts = u64::from(self.max_attempts);
        let primary = self.api_timeout_ms * attempts + self.total_backoff_ms();
        let webhooks = self.webhook_timeout_ms * attempts + self.total_backoff_ms();
        Duration::from_millis(primary + webhooks)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

/// Parse `key` when set; a value that does not parse is rejected
fn env_parse<T>(key: &str, field: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            ConfigError::invalid(field, format!("{key}='{raw}' is not valid: {e}"))
        }),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Unset variables keep their default values; malformed ones are rejected.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Override fields with any environment variables that are set
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(backend) = std::env::var("RIPPLE_STORE") {
            self.store.backend = StoreBackend::parse(&backend).ok_or_else(|| {
                ConfigError::invalid("store.backend", format!("unknown backend '{backend}'"))
            })?;
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.store.redis_url = url;
        }
        if let Some(size) = env_parse("RIPPLE_REDIS_POOL_SIZE", "store.pool_size")? {
            self.store.pool_size = size;
        }
        if let Ok(prefix) = std::env::var("RIPPLE_KEY_PREFIX") {
            self.store.key_prefix = prefix;
        }
        if let Some(ms) = env_parse("RIPPLE_STORE_TIMEOUT_MS", "store.op_timeout_ms")? {
            self.store.op_timeout_ms = ms;
        }

        if let Some(ms) = env_parse("RIPPLE_POLL_INTERVAL_MS", "poller.interval_ms")? {
            self.poller.interval_ms = ms;
        }
        if let Some(ms) = env_parse("RIPPLE_LEASE_TTL_MS", "poller.lease_ttl_ms")? {
            self.poller.lease_ttl_ms = ms;
        }
        if let Some(size) = env_parse("RIPPLE_BATCH_SIZE", "poller.batch_size")? {
            self.poller.batch_size = size;
        }
        if let Ok(id) = std::env::var("RIPPLE_INSTANCE_ID") {
            self.poller.instance_id = id;
        }

        if let Ok(endpoint) = std::env::var("API_ENDPOINT") {
            self.delivery.api_endpoint = endpoint;
        }
        if let Some(ms) = env_parse("RIPPLE_API_TIMEOUT_MS", "delivery.api_timeout_ms")? {
            self.delivery.api_timeout_ms = ms;
        }
        if let Some(ms) = env_parse("RIPPLE_WEBHOOK_TIMEOUT_MS", "delivery.webhook_timeout_ms")? {
            self.delivery.webhook_timeout_ms = ms;
        }
        if let Some(n) = env_parse("RIPPLE_MAX_ATTEMPTS", "delivery.max_attempts")? {
            self.delivery.max_attempts = n;
        }
        if let Some(ms) = env_parse("RIPPLE_BASE_DELAY_MS", "delivery.base_delay_ms")? {
            self.delivery.base_delay_ms = ms;
        }
        if let Some(ms) = env_parse("RIPPLE_MAX_DELAY_MS", "delivery.max_delay_ms")? {
            self.delivery.max_delay_ms = ms;
        }
        if let Some(f) = env_parse("RIPPLE_BACKOFF_MULTIPLIER", "delivery.backoff_multiplier")? {
            self.delivery.backoff_multiplier = f;
        }

        if let Ok(level) = std::env::var("RIPPLE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("RIPPLE_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.pool_size == 0 {
            return Err(ConfigError::invalid("store.pool_size", "must be greater than 0"));
        }
        if self.store.key_prefix.is_empty() {
            return Err(ConfigError::invalid("store.key_prefix", "cannot be empty"));
        }
        if self.store.op_timeout_ms == 0 {
            return Err(ConfigError::invalid("store.op_timeout_ms", "must be greater than 0"));
        }

        if self.poller.interval_ms == 0 {
            return Err(ConfigError::invalid("poller.interval_ms", "must be greater than 0"));
        }
        if self.poller.lease_ttl_ms == 0 {
            return Err(ConfigError::invalid("poller.lease_ttl_ms", "must be greater than 0"));
        }
        if self.poller.batch_size == 0 {
            return Err(ConfigError::invalid("poller.batch_size", "must be greater than 0"));
        }
        if self.poller.instance_id.is_empty() {
            return Err(ConfigError::invalid("poller.instance_id", "cannot be empty"));
        }

        let endpoint = &self.delivery.api_endpoint;
        if endpoint.is_empty() {
            return Err(ConfigError::Missing("delivery.api_endpoint".to_string()));
        }
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(ConfigError::invalid(
                "delivery.api_endpoint",
                "must start with http:// or https://",
            ));
        }
        if self.delivery.max_attempts == 0 {
            return Err(ConfigError::invalid("delivery.max_attempts", "must be at least 1"));
        }
        if self.delivery.api_timeout_ms == 0 || self.delivery.webhook_timeout_ms == 0 {
            return Err(ConfigError::invalid("delivery timeouts", "must be greater than 0"));
        }
        if self.delivery.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "delivery.backoff_multiplier",
                "must be at least 1.0",
            ));
        }
        if self.delivery.base_delay_ms > self.delivery.max_delay_ms {
            return Err(ConfigError::invalid(
                "delivery.base_delay_ms",
                "cannot exceed max_delay_ms",
            ));
        }

        let worst_case = self.delivery.worst_case_cycle();
        if self.poller.lease_ttl() < worst_case {
            tracing::warn!(
                lease_ttl_ms = self.poller.lease_ttl_ms,
                worst_case_ms = worst_case.as_millis() as u64,
                "Lease TTL is shorter than the worst-case cycle; a slow cycle may outlive its lease"
            );
        }

        Ok(())
    }
}
