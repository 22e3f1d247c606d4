// Core data structures for the ripple worker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Change Identifiers
// ============================================================================

/// Position of a record in the change log
///
/// Identifiers have the shape `<millis>-<seq>` (the Redis stream id format)
/// and are totally ordered: first by the millisecond part, then by sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChangeId {
    millis: u64,
    seq: u64,
}

impl ChangeId {
    /// Create an identifier from its two components
    pub const fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Next identifier strictly greater than `self` for a clock reading of `now_ms`
    ///
    /// A clock that went backwards keeps the previous millisecond and bumps the sequence.
    pub fn successor(&self, now_ms: u64) -> Self {
        if now_ms > self.millis {
            Self::new(now_ms, 0)
        } else {
            Self::new(self.millis, self.seq + 1)
        }
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

/// Error returned when a change identifier cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid change id: {0}")]
pub struct InvalidChangeId(pub String);

impl FromStr for ChangeId {
    type Err = InvalidChangeId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidChangeId(s.to_string());
        let (millis, seq) = match s.split_once('-') {
            Some((millis, seq)) => (millis, seq),
            None => (s, "0"),
        };

        let millis = millis.parse::<u64>().map_err(|_| invalid())?;
        let seq = seq.parse::<u64>().map_err(|_| invalid())?;

        Ok(Self::new(millis, seq))
    }
}

impl TryFrom<String> for ChangeId {
    type Error = InvalidChangeId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChangeId> for String {
    fn from(id: ChangeId) -> Self {
        id.to_string()
    }
}

// ============================================================================
// Change Records and Batches
// ============================================================================

/// A single entry of the change log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Stream position, never reused
    pub id: ChangeId,

    /// Producer-defined JSON payload
    pub payload: serde_json::Value,
}

impl ChangeRecord {
    pub fn new(id: ChangeId, payload: serde_json::Value) -> Self {
        Self { id, payload }
    }
}

/// Ordered set of changes read in one polling cycle
///
/// Serialized as the delivery envelope `{"batchId": ..., "changes": [...]}`.
/// The batch id depends only on the first and last change ids, so a batch that
/// is re-read after a failed delivery carries the same identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub batch_id: String,
    pub changes: Vec<ChangeRecord>,
}

impl Batch {
    /// Build a batch from changes in ascending id order
    pub fn new(changes: Vec<ChangeRecord>) -> Self {
        let batch_id = match (changes.first(), changes.last()) {
            (Some(first), Some(last)) => format!("{}..{}", first.id, last.id),
            _ => String::from("empty"),
        };

        Self { batch_id, changes }
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Id of the newest change, the checkpoint to commit after delivery
    pub fn last_id(&self) -> Option<ChangeId> {
        self.changes.last().map(|c| c.id)
    }
}

// ============================================================================
// Lease
// ============================================================================

/// Time-bounded exclusive right to run a polling cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Shared key the lease lives under
    pub key: String,

    /// Token identifying one polling attempt
    pub owner_token: String,

    /// Absolute expiry
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// ============================================================================
// Worker Status
// ============================================================================

/// Status scalar stored in the metrics map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    #[default]
    Initialized,
    Idle,
    Processing,
    Error,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Idle => "idle",
            Self::Processing => "processing",
            Self::Error => "error",
        }
    }

    /// Parse from the stored string (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "initialized" => Some(Self::Initialized),
            "idle" => Some(Self::Idle),
            "processing" => Some(Self::Processing),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Metric Fields
// ============================================================================

/// Monotonic counters in the metrics map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    TotalChangesDetected,
    TotalChangesSent,
    FailedApiCalls,
    SuccessfulApiCalls,
    RetryAttempts,
    TotalProcessingTime,
    ProcessedBatches,
    SuccessfulWebhookCalls,
    FailedWebhookCalls,
    WebhookRetryAttempts,
}

impl Counter {
    pub const ALL: [Counter; 10] = [
        Self::TotalChangesDetected,
        Self::TotalChangesSent,
        Self::FailedApiCalls,
        Self::SuccessfulApiCalls,
        Self::RetryAttempts,
        Self::TotalProcessingTime,
        Self::ProcessedBatches,
        Self::SuccessfulWebhookCalls,
        Self::FailedWebhookCalls,
        Self::WebhookRetryAttempts,
    ];

    /// Field name in the persisted map
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TotalChangesDetected => "totalChangesDetected",
            Self::TotalChangesSent => "totalChangesSent",
            Self::FailedApiCalls => "failedApiCalls",
            Self::SuccessfulApiCalls => "successfulApiCalls",
            Self::RetryAttempts => "retryAttempts",
            Self::TotalProcessingTime => "totalProcessingTime",
            Self::ProcessedBatches => "processedBatches",
            Self::SuccessfulWebhookCalls => "successfulWebhookCalls",
            Self::FailedWebhookCalls => "failedWebhookCalls",
            Self::WebhookRetryAttempts => "webhookRetryAttempts",
        }
    }
}

/// Overwritten scalars in the metrics map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gauge {
    Status,
    LastError,
    LastProcessingTime,
    LastCycleAt,
}

impl Gauge {
    pub const ALL: [Gauge; 4] = [
        Self::Status,
        Self::LastError,
        Self::LastProcessingTime,
        Self::LastCycleAt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::LastError => "lastError",
            Self::LastProcessingTime => "lastProcessingTime",
            Self::LastCycleAt => "lastCycleAt",
        }
    }

    /// Value written on initialization and reset
    pub fn default_value(&self) -> String {
        match self {
            Self::Status => WorkerStatus::Initialized.as_str().to_string(),
            Self::LastProcessingTime => String::from("0"),
            Self::LastError | Self::LastCycleAt => String::new(),
        }
    }
}

/// Default field set written when the metrics map is created or reset
pub fn default_metric_fields() -> Vec<(&'static str, String)> {
    let mut fields: Vec<(&'static str, String)> = Counter::ALL
        .iter()
        .map(|c| (c.as_str(), String::from("0")))
        .collect();
    fields.extend(Gauge::ALL.iter().map(|g| (g.as_str(), g.default_value())));
    fields
}

// ============================================================================
// Metrics Snapshot
// ============================================================================

/// Point-in-time view of the operational metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub total_changes_detected: u64,
    pub total_changes_sent: u64,
    pub failed_api_calls: u64,
    pub successful_api_calls: u64,
    pub retry_attempts: u64,
    pub successful_webhook_calls: u64,
    pub failed_webhook_calls: u64,
    pub webhook_retry_attempts: u64,
    pub processed_batches: u64,
    /// Sum of cycle durations in milliseconds
    pub total_processing_time: u64,
    /// Duration of the latest cycle in milliseconds
    pub last_processing_time: u64,
    /// `total_processing_time / processed_batches`
    pub average_processing_time: u64,
    pub last_error: String,
    pub status: WorkerStatus,
    pub last_cycle_at: Option<DateTime<Utc>>,
    /// Whether this process's polling loop is running (not persisted)
    pub is_running: bool,
}

impl Metrics {
    /// Build a snapshot from the persisted flat field map
    ///
    /// Missing or malformed fields fall back to their defaults.
    pub fn from_fields(fields: &HashMap<String, String>) -> Self {
        let counter = |c: Counter| -> u64 {
            fields
                .get(c.as_str())
                .and_then(|v| v.parse::<i64>().ok())
                .map(|v| v.max(0) as u64)
                .unwrap_or(0)
        };
        let gauge = |g: Gauge| fields.get(g.as_str()).cloned().unwrap_or_default();

        let processed_batches = counter(Counter::ProcessedBatches);
        let total_processing_time = counter(Counter::TotalProcessingTime);
        let average_processing_time = if processed_batches == 0 {
            0
        } else {
            total_processing_time / processed_batches
        };

        Self {
            total_changes_detected: counter(Counter::TotalChangesDetected),
            total_changes_sent: counter(Counter::TotalChangesSent),
            failed_api_calls: counter(Counter::FailedApiCalls),
            successful_api_calls: counter(Counter::SuccessfulApiCalls),
            retry_attempts: counter(Counter::RetryAttempts),
            successful_webhook_calls: counter(Counter::SuccessfulWebhookCalls),
            failed_webhook_calls: counter(Counter::FailedWebhookCalls),
            webhook_retry_attempts: counter(Counter::WebhookRetryAttempts),
            processed_batches,
            total_processing_time,
            last_processing_time: gauge(Gauge::LastProcessingTime).parse().unwrap_or(0),
            average_processing_time,
            last_error: gauge(Gauge::LastError),
            status: WorkerStatus::parse(&gauge(Gauge::Status)).unwrap_or_default(),
            last_cycle_at: DateTime::parse_from_rfc3339(&gauge(Gauge::LastCycleAt))
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            is_running: false,
        }
    }
}
