//! Tracing subscriber setup.
//!
//! Host applications usually install their own subscriber; this helper is
//! for standalone use. `RUST_LOG` takes precedence over the configured level.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install a fmt subscriber at `level`. Returns false if a global subscriber
/// was already set.
pub fn init(level: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(build_filter(level))
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Install a fmt subscriber from the logging section of the configuration.
pub fn init_from_config(config: &LoggingConfig) -> bool {
    init(&config.level)
}
