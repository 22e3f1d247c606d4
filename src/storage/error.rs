//! Error types for the shared store

use thiserror::Error;

use crate::models::InvalidChangeId;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by store backends
#[derive(Error, Debug)]
pub enum StoreError {
    /// Redis command failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// No connection could be taken from the pool
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// Store round trip exceeded its deadline
    #[error("Store operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored id is not a valid change identifier
    #[error(transparent)]
    InvalidChangeId(#[from] InvalidChangeId),

    /// Change log entry is missing its payload field
    #[error("Malformed change log entry: {0}")]
    MalformedEntry(String),

    /// Webhook URL rejected on registration
    #[error("Invalid webhook URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Backend cannot serve requests right now
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Redis(e) => !matches!(
                e.kind(),
                redis::ErrorKind::TypeError | redis::ErrorKind::InvalidClientConfig
            ),
            Self::Pool(_) | Self::Timeout { .. } | Self::Unavailable(_) => true,
            Self::Serialization(_)
            | Self::InvalidChangeId(_)
            | Self::MalformedEntry(_)
            | Self::InvalidUrl { .. } => false,
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }
}
