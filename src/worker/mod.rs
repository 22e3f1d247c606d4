//! Change-polling worker
//!
//! A [`PollingWorker`] runs one polling loop per process. Each tick runs a
//! cycle through these states:
//!
//! ```text
//! Idle -> Acquiring -> Reading -> Delivering -> Notifying -> Committing -> Releasing -> Idle
//! ```
//!
//! - **Acquiring**: take the shared lease with a fresh owner token. If another
//!   replica holds it, the tick is skipped.
//! - **Reading**: load the checkpoint and read the changes after it.
//! - **Delivering**: POST the batch to the primary API. On failure the
//!   checkpoint is left alone so the batch is read again next tick.
//! - **Notifying**: fan the batch out to webhooks (advisory).
//! - **Committing**: save the last change id as the new checkpoint.
//! - **Releasing**: record processing time and release the lease. This runs
//!   on every path once the lease was taken, including panics.
//!
//! The next tick starts one interval after the previous cycle finished.
//! `stop()` is only observed between cycles.

pub mod state;

use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::delivery::{DeliveryClient, DeliveryOutcome, Dispatcher};
use crate::error::{Error, Result, RippleErrorTrait};
use crate::models::{Batch, Counter, Gauge, Metrics, WorkerStatus};
use crate::storage::{MetricsUpdate, StoreError, StoreHandles};

pub use state::{CycleOutcome, CycleState};

/// Static parameters of a worker
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub api_endpoint: String,
    pub lease_key: String,
    pub lease_ttl: Duration,
    pub interval: Duration,
    pub batch_size: usize,
    pub instance_id: String,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            api_endpoint: config.delivery.api_endpoint.clone(),
            lease_key: config.store.lease_key(),
            lease_ttl: config.poller.lease_ttl(),
            interval: config.poller.interval(),
            batch_size: config.poller.batch_size,
            instance_id: config.poller.instance_id.clone(),
        }
    }
}

struct LoopHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Scheduler {
    active: Option<LoopHandle>,
    /// Loops told to stop that may still be finishing a cycle
    stopping: Vec<JoinHandle<()>>,
}

struct WorkerInner {
    settings: WorkerSettings,
    stores: StoreHandles,
    primary: DeliveryClient,
    dispatcher: Dispatcher,
    state: watch::Sender<CycleState>,
    scheduler: Mutex<Scheduler>,
    last_metrics: RwLock<Metrics>,
}

/// Orchestrates lease, change log, delivery, fan-out and checkpoint
#[derive(Clone)]
pub struct PollingWorker {
    inner: Arc<WorkerInner>,
}

impl PollingWorker {
    /// Build a worker with HTTP clients configured from `config`
    pub fn new(config: &Config, stores: StoreHandles) -> Result<Self> {
        let primary = DeliveryClient::primary(&config.delivery, Arc::clone(&stores.metrics))?;
        let webhook_client =
            DeliveryClient::webhook(&config.delivery, Arc::clone(&stores.metrics))?;
        let dispatcher = Dispatcher::new(
            webhook_client,
            Arc::clone(&stores.webhooks),
            Arc::clone(&stores.metrics),
        );

        Ok(Self::from_parts(
            WorkerSettings::from_config(config),
            stores,
            primary,
            dispatcher,
        ))
    }

    /// Build a worker from already constructed collaborators
    pub fn from_parts(
        settings: WorkerSettings,
        stores: StoreHandles,
        primary: DeliveryClient,
        dispatcher: Dispatcher,
    ) -> Self {
        let (state, _) = watch::channel(CycleState::Idle);

        Self {
            inner: Arc::new(WorkerInner {
                settings,
                stores,
                primary,
                dispatcher,
                state,
                scheduler: Mutex::new(Scheduler::default()),
                last_metrics: RwLock::new(Metrics::default()),
            }),
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.inner.settings
    }

    pub fn stores(&self) -> &StoreHandles {
        &self.inner.stores
    }

    /// State of the cycle currently executing in this process
    pub fn state(&self) -> CycleState {
        *self.inner.state.borrow()
    }

    // ------------------------------------------------------------------------
    // Start / stop
    // ------------------------------------------------------------------------

    /// Start the polling loop
    ///
    /// The first cycle runs immediately. Returns false, with a warning, when
    /// the loop is already running.
    pub async fn start(&self) -> bool {
        let mut scheduler = self.inner.scheduler.lock().await;

        if scheduler
            .active
            .as_ref()
            .is_some_and(|active| !active.handle.is_finished())
        {
            warn!("Polling worker is already running");
            return false;
        }

        if let Err(e) = self.inner.stores.metrics.initialize().await {
            warn!(error = %e, "Failed to initialize metrics");
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = self.clone();
        let handle = tokio::spawn(async move { worker.run_loop(shutdown_rx).await });

        scheduler.active = Some(LoopHandle { shutdown, handle });

        info!(
            instance_id = %self.inner.settings.instance_id,
            interval_ms = self.inner.settings.interval.as_millis() as u64,
            "Polling worker started"
        );
        true
    }

    /// Stop scheduling new cycles
    ///
    /// A cycle already in flight runs to completion. Returns false when the
    /// loop was not running.
    pub async fn stop(&self) -> bool {
        let mut scheduler = self.inner.scheduler.lock().await;

        match scheduler.active.take() {
            Some(LoopHandle { shutdown, handle }) => {
                let _ = shutdown.send(true);
                scheduler.stopping.retain(|handle| !handle.is_finished());
                scheduler.stopping.push(handle);
                info!("Polling worker stopping");
                true
            }
            None => {
                debug!("Polling worker is not running");
                false
            }
        }
    }

    /// Stop and wait for any in-flight cycle to finish
    pub async fn shutdown(&self) {
        self.stop().await;

        let handles = std::mem::take(&mut self.inner.scheduler.lock().await.stopping);
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Polling loop terminated abnormally");
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner
            .scheduler
            .lock()
            .await
            .active
            .as_ref()
            .is_some_and(|active| !active.handle.is_finished())
    }

    async fn run_loop(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            let outcome = self.run_cycle().await;
            debug!(outcome = ?outcome, "Polling cycle finished");

            tokio::select! {
                _ = tokio::time::sleep(self.inner.settings.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Polling loop stopped");
    }

    // ------------------------------------------------------------------------
    // Read-only views
    // ------------------------------------------------------------------------

    /// Current metrics with `is_running` filled in
    ///
    /// Falls back to the last successfully read values when the store is
    /// unavailable.
    pub async fn metrics(&self) -> Metrics {
        let mut metrics = match self.inner.stores.metrics.snapshot().await {
            Ok(metrics) => {
                *self.inner.last_metrics.write().await = metrics.clone();
                metrics
            }
            Err(e) => {
                warn!(error = %e, "Metrics store unavailable, returning last known values");
                self.inner.last_metrics.read().await.clone()
            }
        };

        metrics.is_running = self.is_running().await;
        metrics
    }

    /// Registered webhook URLs, empty when the registry is unavailable
    pub async fn webhooks(&self) -> Vec<String> {
        self.inner.dispatcher.webhooks().await
    }

    // ------------------------------------------------------------------------
    // Cycle
    // ------------------------------------------------------------------------

    /// Run one polling cycle
    pub async fn run_cycle(&self) -> CycleOutcome {
        let settings = &self.inner.settings;
        let leases = &self.inner.stores.leases;

        self.enter(CycleState::Acquiring);
        let owner_token = format!("{}:{}", settings.instance_id, uuid::Uuid::new_v4());

        match leases
            .try_acquire(&settings.lease_key, &owner_token, settings.lease_ttl)
            .await
        {
            Ok(true) => {
                debug!(lease_key = %settings.lease_key, owner_token = %owner_token, "Lease acquired");
            }
            Ok(false) => {
                info!(lease_key = %settings.lease_key, "Another worker holds the lease, skipping tick");
                self.enter(CycleState::Idle);
                return CycleOutcome::LeaseHeld;
            }
            Err(e) => {
                let err = Error::lease(settings.lease_key.as_str(), e);
                error!(
                    error = %err,
                    category = err.category().as_str(),
                    recoverable = err.is_recoverable(),
                    "Failed to acquire lease, skipping tick"
                );
                self.record(
                    MetricsUpdate::new()
                        .status(WorkerStatus::Error)
                        .set(Gauge::LastError, err.to_string()),
                )
                .await;
                self.enter(CycleState::Idle);
                return CycleOutcome::Aborted {
                    error: err.to_string(),
                };
            }
        }

        let started = Instant::now();
        let outcome = match AssertUnwindSafe(self.process()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(&*panic);
                error!(error = %message, "Polling cycle panicked");
                self.record(
                    MetricsUpdate::new()
                        .status(WorkerStatus::Error)
                        .set(Gauge::LastError, message.clone()),
                )
                .await;
                CycleOutcome::Aborted { error: message }
            }
        };

        self.enter(CycleState::Releasing);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.record(
            MetricsUpdate::new()
                .set(Gauge::LastProcessingTime, elapsed_ms.to_string())
                .set(Gauge::LastCycleAt, Utc::now().to_rfc3339())
                .incr(Counter::TotalProcessingTime, elapsed_ms as i64)
                .incr(Counter::ProcessedBatches, 1),
        )
        .await;

        match leases.release(&settings.lease_key, &owner_token).await {
            Ok(true) => debug!(lease_key = %settings.lease_key, "Lease released"),
            Ok(false) => warn!(
                lease_key = %settings.lease_key,
                elapsed_ms = elapsed_ms,
                "Lease expired or was taken over before release"
            ),
            Err(e) => error!(
                error = %Error::lease(settings.lease_key.as_str(), e),
                "Failed to release lease"
            ),
        }

        self.enter(CycleState::Idle);
        outcome
    }

    /// Reading through Committing, run while holding the lease
    async fn process(&self) -> CycleOutcome {
        let inner = &self.inner;

        self.enter(CycleState::Reading);
        let checkpoint = match inner.stores.checkpoints.load().await {
            Ok(checkpoint) => checkpoint,
            Err(e) => return self.abort("load checkpoint", e).await,
        };

        let changes = match inner
            .stores
            .changes
            .read_since(checkpoint, Some(inner.settings.batch_size))
            .await
        {
            Ok(changes) => changes,
            Err(e) => return self.abort("read changes", e).await,
        };

        let Some(last_id) = changes.last().map(|change| change.id) else {
            debug!(checkpoint = ?checkpoint.map(|c| c.to_string()), "No new changes");
            return CycleOutcome::Empty;
        };

        let batch = Batch::new(changes);
        let count = batch.len();
        info!(count = count, batch_id = %batch.batch_id, "Found changes");
        self.record(
            MetricsUpdate::new()
                .incr(Counter::TotalChangesDetected, count as i64)
                .status(WorkerStatus::Processing),
        )
        .await;

        self.enter(CycleState::Delivering);
        if let DeliveryOutcome::Failed { error, attempts } =
            inner.primary.send(&inner.settings.api_endpoint, &batch).await
        {
            error!(
                batch_id = %batch.batch_id,
                attempts = attempts,
                error = %error,
                "Primary delivery failed, checkpoint not advanced"
            );
            self.record(
                MetricsUpdate::new()
                    .status(WorkerStatus::Error)
                    .set(Gauge::LastError, error.to_string()),
            )
            .await;
            return CycleOutcome::DeliveryFailed {
                count,
                error: error.to_string(),
            };
        }
        self.record(MetricsUpdate::new().incr(Counter::TotalChangesSent, count as i64))
            .await;

        self.enter(CycleState::Notifying);
        let fanout = inner.dispatcher.notify_all(&batch).await;

        self.enter(CycleState::Committing);
        if let Err(e) = inner.stores.checkpoints.save(last_id).await {
            return self.abort("save checkpoint", e).await;
        }
        self.record(MetricsUpdate::new().status(WorkerStatus::Idle))
            .await;

        info!(count = count, checkpoint = %last_id, "Batch committed");
        CycleOutcome::Delivered {
            count,
            checkpoint: last_id,
            webhooks_failed: fanout.failed(),
        }
    }

    async fn abort(&self, stage: &str, e: StoreError) -> CycleOutcome {
        let message = format!("{stage}: {e}");
        error!(stage = stage, error = %e, "Polling cycle aborted");
        self.record(
            MetricsUpdate::new()
                .status(WorkerStatus::Error)
                .set(Gauge::LastError, message.clone()),
        )
        .await;
        CycleOutcome::Aborted { error: message }
    }

    fn enter(&self, state: CycleState) {
        self.inner.state.send_replace(state);
    }

    /// Metrics writes never fail a cycle
    async fn record(&self, update: MetricsUpdate) {
        if let Err(e) = self.inner.stores.metrics.apply(&update).await {
            warn!(error = %e, "Failed to record metrics");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("polling cycle panicked")
    }
}
