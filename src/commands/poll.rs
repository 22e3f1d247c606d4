use anyhow::{Context, Result};

use ripple::config::Config;
use ripple::storage;
use ripple::worker::{CycleOutcome, PollingWorker};

async fn build_worker(config: &Config) -> Result<PollingWorker> {
    config.validate().context("Invalid configuration")?;

    let stores = storage::connect(&config.store)
        .await
        .context("Failed to connect to store")?;

    Ok(PollingWorker::new(config, stores)?)
}

/// Run the polling loop until Ctrl+C, then let the in-flight cycle finish
pub async fn run(config: Config) -> Result<()> {
    let worker = build_worker(&config).await?;
    worker.start().await;

    println!(
        "Polling for changes every {}ms, delivering to {} (Ctrl+C to stop)",
        config.poller.interval_ms, config.delivery.api_endpoint
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Shutdown signal received");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to wait for Ctrl+C");
        }
    }

    worker.shutdown().await;

    let metrics = worker.metrics().await;
    println!(
        "Stopped. {} changes sent in {} cycles.",
        metrics.total_changes_sent, metrics.processed_batches
    );
    Ok(())
}

/// Run exactly one polling cycle
pub async fn once(config: Config) -> Result<()> {
    let worker = build_worker(&config).await?;
    worker
        .stores()
        .metrics
        .initialize()
        .await
        .context("Failed to initialize metrics")?;

    match worker.run_cycle().await {
        CycleOutcome::LeaseHeld => println!("Another worker holds the lease; nothing done."),
        CycleOutcome::Empty => println!("No new changes."),
        CycleOutcome::Delivered {
            count,
            checkpoint,
            webhooks_failed,
        } => {
            println!("Delivered {count} changes, checkpoint now {checkpoint}.");
            if webhooks_failed > 0 {
                println!("{webhooks_failed} webhook(s) failed.");
            }
        }
        CycleOutcome::DeliveryFailed { count, error } => {
            anyhow::bail!("Delivery of {count} changes failed: {error}");
        }
        CycleOutcome::Aborted { error } => {
            anyhow::bail!("Cycle aborted: {error}");
        }
    }

    Ok(())
}
