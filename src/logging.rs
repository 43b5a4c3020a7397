//! Tracing setup for applications embedding the inspector.
//!
//! The library only emits `tracing` events. Installing a subscriber is left to
//! the application, which can use [`init_tracing`] for the usual setup.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Install a global subscriber. `RUST_LOG` takes precedence over `level`.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_tracing(level: &str, format: LogFormat) {
    if let Err(e) = try_init_tracing(level, format) {
        panic!("failed to install tracing subscriber: {e}");
    }
}

/// Like [`init_tracing`] but reports an already-installed subscriber as an error.
pub fn try_init_tracing(
    level: &str,
    format: LogFormat,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_thread_names(true))
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_thread_names(true))
            .try_init(),
    }
}
