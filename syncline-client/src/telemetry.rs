//! Tracing subscriber bootstrap.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ConfigError;

const DEFAULT_FILTER: &str = "syncline_client=debug,syncline_storage=info,info";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the default filter. With `json` set, events are
/// emitted as one JSON object per line.
pub fn init_tracing(json: bool) -> Result<(), ConfigError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
    };
    result.map_err(|e| ConfigError::Telemetry(e.to_string()))?;

    tracing::info!(json, "Tracing initialized");
    Ok(())
}
