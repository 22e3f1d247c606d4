//! Retry policy with exponential backoff
//!
//! Operations report each attempt as an [`Attempt`]: success, a failure worth
//! retrying, or a failure that ends the retry loop immediately (bail).

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::DeliveryConfig;

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first
    pub max_attempts: u32,

    /// Base delay in milliseconds for exponential backoff
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds (caps exponential growth)
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with custom max attempts and default delays
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Create a policy with custom delays
    pub fn with_delays(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
            backoff_multiplier: 2.0,
        }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            backoff_multiplier: config.backoff_multiplier,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay_ms = if attempt == 0 {
            0
        } else {
            let exponential =
                self.base_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);
            (exponential as u64).min(self.max_delay_ms)
        };

        Duration::from_millis(delay_ms)
    }

    /// Whether a retryable failure on `attempt` is followed by another attempt
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

/// Result of a single attempt
#[derive(Debug)]
pub enum Attempt<T, E> {
    Success(T),
    /// Transient failure, try again if attempts remain
    Retry(E),
    /// Permanent failure, stop now
    Bail(E),
}

/// Final result of a retried operation
#[derive(Debug)]
pub struct Retried<T, E> {
    pub result: Result<T, E>,
    /// Number of attempts made, at least 1
    pub attempts: u32,
}

/// Execute an operation under a retry policy
///
/// `operation` receives the 1-based attempt number. Backoff sleeps happen
/// between attempts only, never after the last one.
pub async fn run_with_policy<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> Retried<T, E>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
    E: Display,
{
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Attempt::Success(value) => {
                if attempt > 1 {
                    debug!(attempt = attempt, "Operation succeeded after retry");
                }
                return Retried {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Attempt::Bail(e) => {
                warn!(attempt = attempt, error = %e, "Non-retryable error encountered");
                return Retried {
                    result: Err(e),
                    attempts: attempt,
                };
            }
            Attempt::Retry(e) => {
                if !policy.allows_retry_after(attempt) {
                    warn!(attempts = attempt, error = %e, "Retries exhausted");
                    return Retried {
                        result: Err(e),
                        attempts: attempt,
                    };
                }

                let delay = policy.calculate_delay(attempt);
                debug!(
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying operation after delay"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
