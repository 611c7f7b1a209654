//! Structured logging initialization.
//!
//! The RUST_LOG environment variable takes precedence over the
//! configuration file level.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the logging subsystem. Call once at process start; repeated
/// initialization is reported by the subscriber and ignored.
pub fn init(config: &LoggingConfig) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.level.as_str())
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_thread_names(config.thread_names),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_thread_names(config.thread_names),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_thread_names(config.thread_names))
            .try_init(),
    };

    if let Err(e) = result {
        tracing::debug!("logging already initialized: {}", e);
    }
}
