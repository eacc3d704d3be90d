//! `tracing` subscriber setup for binaries. Library code only emits events.

use tracing_subscriber::EnvFilter;
use crate::config::LogConfig;

/// Builds the filter from `RUST_LOG` when set, otherwise from the configured
/// level. An unparsable level falls back to `info`.
pub fn filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs a fmt subscriber. Returns `false` if one was already installed.
pub fn init(config: &LogConfig) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter(config))
        .with_target(false)
        .try_init()
        .is_ok()
}
