// Tracing subscriber setup

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Build the filter: `RUST_LOG` wins, otherwise the configured level for
/// this crate and `warn` for dependencies
pub fn env_filter(config: &LoggingConfig, verbose: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let level = if verbose { "debug" } else { config.level.as_str() };
    EnvFilter::try_new(format!("ripple={level},warn"))
        .unwrap_or_else(|_| EnvFilter::new("ripple=info,warn"))
}

/// Install the global subscriber, `json` or human-readable text
pub fn setup_tracing(config: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let filter = env_filter(config, verbose);

    match config.format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?,
        "pretty" => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()?,
        _ => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()?,
    }

    Ok(())
}
