use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use ripple::config::{Config, StoreBackend};
use ripple::logging::setup_tracing;

mod commands;

#[derive(Parser)]
#[command(
    name = "ripple",
    version,
    about = "Replicated change-polling worker with retrying delivery and webhook fan-out",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file (environment variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use the in-memory store instead of Redis
    #[arg(long, global = true)]
    memory: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, pretty, json)
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the polling loop until Ctrl+C
    Run,

    /// Run a single polling cycle and exit
    Once,

    /// Append a change record (JSON payload) to the change log
    Append {
        /// JSON payload, e.g. '{"table":"users","op":"insert"}'
        payload: String,
    },

    /// Show worker metrics
    Status {
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage webhook subscribers
    Webhooks {
        #[command(subcommand)]
        action: WebhookAction,
    },

    /// Restore every metric to its default value
    ResetMetrics,
}

#[derive(Subcommand)]
enum WebhookAction {
    /// Register a webhook URL
    Add { url: String },
    /// Unregister a webhook URL
    Remove { url: String },
    /// List registered webhook URLs
    List,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env().context("Invalid environment configuration")?;

    if cli.memory {
        config.store.backend = StoreBackend::Memory;
    }
    if let Some(format) = &cli.log_format {
        config.logging.format = format.clone();
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    setup_tracing(&config.logging, cli.verbose)?;

    match cli.command {
        Commands::Run => {
            tracing::info!(instance_id = %config.poller.instance_id, "Starting polling worker");
            commands::run(config).await?;
        }
        Commands::Once => {
            commands::once(config).await?;
        }
        Commands::Append { payload } => {
            commands::append(config, &payload).await?;
        }
        Commands::Status { json } => {
            commands::status(config, json).await?;
        }
        Commands::Webhooks { action } => match action {
            WebhookAction::Add { url } => commands::add_webhook(config, &url).await?,
            WebhookAction::Remove { url } => commands::remove_webhook(config, &url).await?,
            WebhookAction::List => commands::list_webhooks(config).await?,
        },
        Commands::ResetMetrics => {
            commands::reset_metrics(config).await?;
        }
    }

    Ok(())
}
