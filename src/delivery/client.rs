//! Retrying HTTP delivery to a single endpoint
//!
//! A [`DeliveryClient`] POSTs a [`Batch`] as JSON:
//!
//! ```json
//! {
//!   "batchId": "1700000000000-0..1700000000042-1",
//!   "changes": [
//!     { "id": "1700000000000-0", "payload": { "table": "orders", "op": "insert" } }
//!   ]
//! }
//! ```
//!
//! The batch id is also sent as the `Idempotency-Key` header so consumers can
//! discard re-deliveries. Every attempt feeds the metrics store according to
//! the client's [`DeliveryProfile`].

use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use super::error::{DeliveryError, DeliveryResult};
use super::retry::{run_with_policy, Attempt, RetryPolicy};
use crate::config::DeliveryConfig;
use crate::models::{Batch, Counter, Gauge};
use crate::storage::{MetricsStore, MetricsUpdate};

/// Header carrying the batch id
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Which metric fields a client's attempts are counted under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryProfile {
    /// The downstream API that gates the checkpoint
    PrimaryApi,
    /// Advisory webhook subscribers
    Webhook,
}

impl DeliveryProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrimaryApi => "api",
            Self::Webhook => "webhook",
        }
    }

    fn success_counter(&self) -> Counter {
        match self {
            Self::PrimaryApi => Counter::SuccessfulApiCalls,
            Self::Webhook => Counter::SuccessfulWebhookCalls,
        }
    }

    fn retry_counter(&self) -> Counter {
        match self {
            Self::PrimaryApi => Counter::RetryAttempts,
            Self::Webhook => Counter::WebhookRetryAttempts,
        }
    }

    /// Update for one failed attempt
    ///
    /// Webhook failures are counted once per endpoint by the dispatcher, not
    /// per attempt.
    fn failed_attempt(&self, error: &DeliveryError, will_retry: bool) -> MetricsUpdate {
        let mut update = MetricsUpdate::new();
        if *self == Self::PrimaryApi {
            update = update
                .incr(Counter::FailedApiCalls, 1)
                .set(Gauge::LastError, error.to_string());
        }
        if will_retry {
            update = update.incr(self.retry_counter(), 1);
        }
        update
    }
}

/// Final result of one `send`
#[derive(Debug)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    Failed { attempts: u32, error: DeliveryError },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Delivered { attempts } | Self::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn error(&self) -> Option<&DeliveryError> {
        match self {
            Self::Delivered { .. } => None,
            Self::Failed { error, .. } => Some(error),
        }
    }
}

/// Retrying HTTP client for batch delivery
pub struct DeliveryClient {
    client: Client,
    policy: RetryPolicy,
    timeout: Duration,
    profile: DeliveryProfile,
    metrics: Arc<dyn MetricsStore>,
}

impl DeliveryClient {
    /// Create a client with an explicit per-request timeout and retry policy
    pub fn new(
        profile: DeliveryProfile,
        timeout: Duration,
        policy: RetryPolicy,
        metrics: Arc<dyn MetricsStore>,
        user_agent: &str,
    ) -> DeliveryResult<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| DeliveryError::Client(e.to_string()))?;

        Ok(Self {
            client,
            policy,
            timeout,
            profile,
            metrics,
        })
    }

    /// Client for the primary downstream API
    pub fn primary(config: &DeliveryConfig, metrics: Arc<dyn MetricsStore>) -> DeliveryResult<Self> {
        Self::new(
            DeliveryProfile::PrimaryApi,
            config.api_timeout(),
            RetryPolicy::from_config(config),
            metrics,
            &config.user_agent,
        )
    }

    /// Client for webhook notifications
    pub fn webhook(config: &DeliveryConfig, metrics: Arc<dyn MetricsStore>) -> DeliveryResult<Self> {
        Self::new(
            DeliveryProfile::Webhook,
            config.webhook_timeout(),
            RetryPolicy::from_config(config),
            metrics,
            &config.user_agent,
        )
    }

    /// Deliver `batch` to `endpoint`, retrying transient failures
    ///
    /// Never returns an error: exhausted retries and rejected batches come
    /// back as [`DeliveryOutcome::Failed`].
    pub async fn send(&self, endpoint: &str, batch: &Batch) -> DeliveryOutcome {
        let retried = run_with_policy(&self.policy, |attempt| {
            self.attempt(endpoint, batch, attempt)
        })
        .await;

        match retried.result {
            Ok(()) => {
                tracing::debug!(
                    target_kind = self.profile.as_str(),
                    endpoint = endpoint,
                    batch_id = %batch.batch_id,
                    attempts = retried.attempts,
                    "Batch delivered"
                );
                DeliveryOutcome::Delivered {
                    attempts: retried.attempts,
                }
            }
            Err(error) => {
                tracing::error!(
                    target_kind = self.profile.as_str(),
                    endpoint = endpoint,
                    batch_id = %batch.batch_id,
                    attempts = retried.attempts,
                    error = %error,
                    "Batch delivery failed"
                );
                DeliveryOutcome::Failed {
                    attempts: retried.attempts,
                    error,
                }
            }
        }
    }

    async fn attempt(&self, endpoint: &str, batch: &Batch, attempt: u32) -> Attempt<(), DeliveryError> {
        match self.post(endpoint, batch).await {
            Ok(()) => {
                self.record(MetricsUpdate::new().incr(self.profile.success_counter(), 1))
                    .await;
                Attempt::Success(())
            }
            Err(error) => {
                let retryable = error.is_recoverable();
                let will_retry = retryable && self.policy.allows_retry_after(attempt);

                tracing::warn!(
                    target_kind = self.profile.as_str(),
                    endpoint = endpoint,
                    attempt = attempt,
                    max_attempts = self.policy.max_attempts,
                    will_retry = will_retry,
                    error = %error,
                    "Delivery attempt failed"
                );
                self.record(self.profile.failed_attempt(&error, will_retry))
                    .await;

                if retryable {
                    Attempt::Retry(error)
                } else {
                    Attempt::Bail(error)
                }
            }
        }
    }

    async fn post(&self, endpoint: &str, batch: &Batch) -> DeliveryResult<()> {
        let response = self
            .client
            .post(endpoint)
            .timeout(self.timeout)
            .header(IDEMPOTENCY_HEADER, &batch.batch_id)
            .json(batch)
            .send()
            .await
            .map_err(|e| self.transport_error(endpoint, e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::from_status(endpoint, status))
        }
    }

    fn transport_error(&self, endpoint: &str, error: reqwest::Error) -> DeliveryError {
        if error.is_timeout() {
            DeliveryError::Timeout {
                endpoint: endpoint.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else if error.is_builder() {
            DeliveryError::InvalidEndpoint(endpoint.to_string())
        } else {
            DeliveryError::Request {
                endpoint: endpoint.to_string(),
                source: error,
            }
        }
    }

    /// Metrics writes never fail a delivery
    async fn record(&self, update: MetricsUpdate) {
        if update.is_empty() {
            return;
        }
        if let Err(e) = self.metrics.apply(&update).await {
            tracing::warn!(error = %e, "Failed to record delivery metrics");
        }
    }
}
