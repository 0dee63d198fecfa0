//! Logging initialization for the terminology server
//!
//! Sets up tracing with an environment filter and either human-readable or
//! JSON output, driven by [`crate::config::LoggingConfig`]. `RUST_LOG`
//! overrides the configured level.

use crate::config::LoggingConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.json {
        registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()?;
    } else {
        registry.with(fmt::layer()).try_init()?;
    }

    tracing::info!(level = %config.level, json = config.json, "Logging initialized");
    Ok(())
}
