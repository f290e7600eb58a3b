//! Log output setup.
//!
//! Logs go to stderr. `RUST_LOG` overrides the configured filter.

use std::io;

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::config::{ConfigError, LogFormat, LoggingConfig};
use crate::error::RefitError;

/// Filter from `RUST_LOG`, falling back to the configured level.
pub fn filter(config: &LoggingConfig) -> Result<EnvFilter, ConfigError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| ConfigError::LogFilter {
        filter: config.level.clone(),
        message: e.to_string(),
    })
}

/// Install the global subscriber.
///
/// Fails if a subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<(), RefitError> {
    let filter = filter(config)?;
    let installed = match config.format {
        LogFormat::Human => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_span_events(FmtSpan::CLOSE)
            .with_target(false)
            .with_writer(io::stderr)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .with_writer(io::stderr)
            .try_init(),
    };
    installed.map_err(|e| RefitError::internal(format!("failed to install log subscriber: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_level_is_a_config_error() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            level: "refit=loud".to_string(),
            format: LogFormat::Human,
        };
        assert!(matches!(filter(&config), Err(ConfigError::LogFilter { .. })));
    }

    #[test]
    fn default_level_parses() {
        assert!(filter(&LoggingConfig::default()).is_ok());
    }
}
