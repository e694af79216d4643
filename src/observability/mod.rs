//! Observability
//!
//! Structured logging through `tracing`; the binary installs the subscriber
//! once at startup.

pub mod config;

pub use config::{LogConfig, LogFormat};

use tracing_subscriber::EnvFilter;

/// Install the global subscriber
///
/// `RUST_LOG` overrides `config.level`. Fails if a subscriber is already set.
pub fn init_tracing(config: &LogConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.format {
        LogFormat::Json => builder.json().with_current_span(false).try_init()?,
        LogFormat::Text => builder.with_target(true).try_init()?,
    }
    Ok(())
}
