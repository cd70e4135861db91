//! Logging setup for applications embedding sqlkeep.
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the application. `init_logging` is a convenience that honors
//! [`LoggingConfig`].

use sqlkeep_config::{ConfigError, LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber configured from `config`.
///
/// `RUST_LOG`, when set, takes precedence over `config.level`. Fails if the
/// level is invalid or a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), crate::DatabaseError> {
    config.validate()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    installed.map_err(|e| ConfigError::Subscriber(e.to_string()).into())
}
