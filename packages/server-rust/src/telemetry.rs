//! Tracing subscriber setup for service binaries.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Tracing configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// Service name
    pub service_name: String,

    /// Filter directive used when `RUST_LOG` is unset
    pub log_level: String,

    /// JSON log format
    pub json_logs: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "brokerline".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Builds the level filter: `RUST_LOG` wins over the configured level.
fn env_filter(config: &TracingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(config: &TracingConfig) -> Result<()> {
    let subscriber = tracing_subscriber::registry().with(env_filter(config));

    if config.json_logs {
        let fmt_layer = fmt::layer().json().with_current_span(true).with_target(true);
        subscriber.with(fmt_layer).try_init()?;
    } else {
        let fmt_layer = fmt::layer().pretty().with_target(true);
        subscriber.with(fmt_layer).try_init()?;
    }

    info!(
        service = %config.service_name,
        log_level = %config.log_level,
        json_logs = config.json_logs,
        "tracing initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = TracingConfig::default();
        assert_eq!(config.log_level, "info");
        assert!(!config.json_logs);
    }

    #[test]
    fn second_init_is_an_error() {
        let config = TracingConfig::default();
        // Whichever call comes first in this process may succeed; a later
        // one must fail instead of panicking.
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}
