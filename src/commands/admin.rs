use anyhow::{Context, Result};

use ripple::config::Config;
use ripple::storage::{self, StoreHandles};

async fn open(config: &Config) -> Result<StoreHandles> {
    storage::connect(&config.store)
        .await
        .context("Failed to connect to store")
}

/// Producer side: append one change record
pub async fn append(config: Config, payload: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(payload).context("Payload is not valid JSON")?;

    let stores = open(&config).await?;
    let id = stores.changes.append(&value).await?;

    println!("{id}");
    Ok(())
}

pub async fn status(config: Config, json: bool) -> Result<()> {
    let stores = open(&config).await?;
    let metrics = stores.metrics.snapshot().await?;
    let lease = stores.leases.current(&config.store.lease_key()).await?;
    let checkpoint = stores.checkpoints.load().await?;

    if json {
        let output = serde_json::json!({
            "metrics": metrics,
            "checkpoint": checkpoint,
            "lease": lease,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Worker Status");
    println!("=============");
    println!("  Status:               {}", metrics.status);
    println!(
        "  Checkpoint:           {}",
        checkpoint.map_or_else(|| "-".to_string(), |c| c.to_string())
    );
    match lease {
        Some(lease) => println!(
            "  Lease:                {} (expires {})",
            lease.owner_token,
            lease.expires_at.to_rfc3339()
        ),
        None => println!("  Lease:                free"),
    }
    println!();
    println!("  Changes detected:     {}", metrics.total_changes_detected);
    println!("  Changes sent:         {}", metrics.total_changes_sent);
    println!("  Successful API calls: {}", metrics.successful_api_calls);
    println!("  Failed API calls:     {}", metrics.failed_api_calls);
    println!("  Retry attempts:       {}", metrics.retry_attempts);
    println!("  Webhook successes:    {}", metrics.successful_webhook_calls);
    println!("  Webhook failures:     {}", metrics.failed_webhook_calls);
    println!("  Processed batches:    {}", metrics.processed_batches);
    println!("  Last processing time: {}ms", metrics.last_processing_time);
    println!("  Avg processing time:  {}ms", metrics.average_processing_time);
    if !metrics.last_error.is_empty() {
        println!("  Last error:           {}", metrics.last_error);
    }

    Ok(())
}

pub async fn add_webhook(config: Config, url: &str) -> Result<()> {
    let stores = open(&config).await?;
    if stores.webhooks.add(url).await? {
        println!("Added webhook {url}");
    } else {
        println!("Webhook {url} is already registered");
    }
    Ok(())
}

pub async fn remove_webhook(config: Config, url: &str) -> Result<()> {
    let stores = open(&config).await?;
    if stores.webhooks.remove(url).await? {
        println!("Removed webhook {url}");
    } else {
        println!("Webhook {url} was not registered");
    }
    Ok(())
}

pub async fn list_webhooks(config: Config) -> Result<()> {
    let stores = open(&config).await?;
    let urls = stores.webhooks.list().await?;

    if urls.is_empty() {
        println!("No webhooks registered");
    }
    for url in urls {
        println!("{url}");
    }
    Ok(())
}

pub async fn reset_metrics(config: Config) -> Result<()> {
    let stores = open(&config).await?;
    stores.metrics.reset().await?;
    println!("Metrics reset");
    Ok(())
}
