//! Structured logging setup.

use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a global
/// subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let level = config.log_level.to_string().to_lowercase();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(config.with_thread_ids),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(config.with_thread_ids),
            )
            .try_init()
    };

    installed.map_err(|e| ProtocolError::ConfigError(format!("Failed to install logger: {e}")))?;

    info!(app = %config.app_name, level = %level, "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error() {
        let config = LoggingConfig::default();
        // The first call may lose to another test in this binary
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}
