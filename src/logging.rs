//! Structured logging for the `hrobot` binary.
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the binary.

use std::env;
use std::io;

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "HROBOT_LOG";

/// Filter used when neither `HROBOT_LOG` nor `RUST_LOG` is set.
pub const DEFAULT_FILTER: &str = "info";

/// Builds the filter from `HROBOT_LOG`, then `RUST_LOG`, then
/// [`DEFAULT_FILTER`]. An unparsable directive falls back to the default.
#[must_use]
pub fn env_filter() -> EnvFilter {
    let directives = env::var(LOG_ENV)
        .or_else(|_| env::var(EnvFilter::DEFAULT_ENV))
        .unwrap_or_else(|_| String::from(DEFAULT_FILTER));
    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs a formatting subscriber that writes to stderr.
///
/// Calling this more than once keeps the first subscriber.
pub fn init_logging() {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
    if installed.is_err() {
        tracing::debug!("logging already initialised");
    }
}
