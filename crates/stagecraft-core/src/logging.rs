//! Tracing setup

use crate::config::PipelineConfig;
use crate::error::ConfigError;
use tracing_subscriber::EnvFilter;

/// Install the global `fmt` subscriber
///
/// `RUST_LOG` overrides `config.log_filter` when set.
///
/// # Errors
/// `Invalid` if the filter does not parse or a subscriber is already set
pub fn init_tracing(config: &PipelineConfig) -> Result<(), ConfigError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_filter)
            .map_err(|e| ConfigError::Invalid(format!("log_filter: {e}")))?,
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let installed = if config.log_json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| ConfigError::Invalid(format!("tracing subscriber: {e}")))?;
    tracing::debug!(filter = %config.log_filter, json = config.log_json, "tracing initialized");
    Ok(())
}
