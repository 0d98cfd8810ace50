//! Logging initialization.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::settings::LoggingConfig;

/// Install the global subscriber. `RUST_LOG` takes precedence over `logging.level`.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("Invalid log level '{}'", config.level))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(config.enable_target)
        .with_thread_ids(config.enable_thread_ids);

    let fmt_layer = match config.format.as_str() {
        "json" => fmt_layer.json().boxed(),
        _ => fmt_layer.boxed(),
    };

    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)
        .context("A global tracing subscriber is already installed")?;

    tracing::debug!("Logging initialized ({} format)", config.format);
    Ok(())
}
