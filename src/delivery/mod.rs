//! Batch delivery over HTTP
//!
//! - [`DeliveryClient`] - retrying POST of one batch to one endpoint
//! - [`Dispatcher`] - concurrent fan-out of a batch to every webhook
//! - [`retry`] - backoff policy and the attempt runner both build on

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod retry;

pub use client::{DeliveryClient, DeliveryOutcome, DeliveryProfile, IDEMPOTENCY_HEADER};
pub use dispatcher::{Dispatcher, EndpointReport, FanoutReport};
pub use error::{DeliveryError, DeliveryResult};
pub use retry::{run_with_policy, Attempt, Retried, RetryPolicy};
