//! Structured logging setup.
//!
//! Installs a global `tracing-subscriber` formatter. `RUST_LOG` takes
//! precedence over the configured level when it is set.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

/// Install the global subscriber described by `config`.
///
/// A second call fails with [`ProtocolError::ConfigError`] and leaves the
/// first subscriber in place.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_ascii_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| ProtocolError::ConfigError(format!("Failed to install logger: {e}")))?;

    tracing::info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error_not_a_panic() {
        let config = LoggingConfig::default();
        let first = init_logging(&config);
        let second = init_logging(&config);
        // another test may have installed a subscriber first
        assert!(first.is_err() || second.is_err());
    }
}
