//! Tracing initialization.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use super::settings::Settings;

/// Initialize the global tracing subscriber from settings. `RUST_LOG`
/// still wins over the configured level when set.
pub fn init(settings: &Settings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone()));

    match settings.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_current_span(false)
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to init logging: {}", e))?;
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to init logging: {}", e))?;
        }
    }
    Ok(())
}
