//! Webhook fan-out
//!
//! The [`Dispatcher`] sends one batch to every registered webhook at once and
//! waits for all of them to settle. Webhooks are advisory: a failing endpoint
//! is logged and counted, never reported to the caller as an error.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;

use super::client::{DeliveryClient, DeliveryOutcome};
use super::error::DeliveryError;
use crate::models::{Batch, Counter};
use crate::storage::{MetricsStore, MetricsUpdate, WebhookRegistry};

/// Outcome for a single webhook endpoint
#[derive(Debug)]
pub struct EndpointReport {
    pub endpoint: String,
    pub outcome: DeliveryOutcome,
}

/// Per-endpoint results of one fan-out, sorted by endpoint
#[derive(Debug, Default)]
pub struct FanoutReport {
    pub endpoints: Vec<EndpointReport>,
}

impl FanoutReport {
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.endpoints
            .iter()
            .filter(|r| r.outcome.is_delivered())
            .count()
    }

    pub fn failed(&self) -> usize {
        self.endpoints.len() - self.succeeded()
    }

    pub fn outcome_for(&self, endpoint: &str) -> Option<&DeliveryOutcome> {
        self.endpoints
            .iter()
            .find(|r| r.endpoint == endpoint)
            .map(|r| &r.outcome)
    }
}

/// Concurrent, failure-isolated webhook notifier
pub struct Dispatcher {
    client: Arc<DeliveryClient>,
    registry: Arc<dyn WebhookRegistry>,
    metrics: Arc<dyn MetricsStore>,
}

impl Dispatcher {
    pub fn new(
        client: DeliveryClient,
        registry: Arc<dyn WebhookRegistry>,
        metrics: Arc<dyn MetricsStore>,
    ) -> Self {
        Self {
            client: Arc::new(client),
            registry,
            metrics,
        }
    }

    /// Registered webhook URLs, empty when the registry cannot be read
    pub async fn webhooks(&self) -> Vec<String> {
        match self.registry.list().await {
            Ok(urls) => urls,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read webhook registry");
                Vec::new()
            }
        }
    }

    /// Deliver `batch` to every registered webhook concurrently
    pub async fn notify_all(&self, batch: &Batch) -> FanoutReport {
        let endpoints = self.webhooks().await;
        if endpoints.is_empty() {
            tracing::debug!(batch_id = %batch.batch_id, "No webhooks registered");
            return FanoutReport::default();
        }

        let batch = Arc::new(batch.clone());
        let mut tasks = JoinSet::new();

        for endpoint in endpoints {
            let client = Arc::clone(&self.client);
            let batch = Arc::clone(&batch);

            tasks.spawn(async move {
                let outcome = AssertUnwindSafe(client.send(&endpoint, &batch))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| DeliveryOutcome::Failed {
                        attempts: 0,
                        error: DeliveryError::Aborted {
                            endpoint: endpoint.clone(),
                            reason: "delivery task panicked".to_string(),
                        },
                    });
                EndpointReport { endpoint, outcome }
            });
        }

        let mut report = FanoutReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(endpoint_report) => {
                    if !endpoint_report.outcome.is_delivered() {
                        self.record_failure().await;
                    }
                    report.endpoints.push(endpoint_report);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Webhook delivery task failed to complete");
                    self.record_failure().await;
                }
            }
        }

        report.endpoints.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));

        tracing::info!(
            batch_id = %batch.batch_id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Webhook fan-out complete"
        );

        report
    }

    async fn record_failure(&self) {
        let update = MetricsUpdate::new()
            .incr(Counter::FailedApiCalls, 1)
            .incr(Counter::FailedWebhookCalls, 1);

        if let Err(e) = self.metrics.apply(&update).await {
            tracing::warn!(error = %e, "Failed to record webhook failure");
        }
    }
}
