//! Logging initialization for Murmur processes.
//!
//! The filter comes from `RUST_LOG` when it is set and from
//! [`LoggingConfig::level`] otherwise. Library crates only emit `tracing`
//! events; installing a subscriber is left to the binary.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the process-wide subscriber described by `config`.
///
/// # Example
/// ```no_run
/// use murmur_core::{logging, LoggingConfig};
///
/// logging::init_with(&LoggingConfig {
///     level: "info,murmur_session=debug".to_string(),
///     json: true,
/// });
/// tracing::info!(component = "registry", "sweeper started");
/// ```
pub fn init_with(config: &LoggingConfig) {
    let registry = tracing_subscriber::registry().with(filter(&config.level));
    if config.json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
    tracing::debug!(level = %config.level, json = config.json, "logging initialized");
}

/// Human-readable output at `info` unless `RUST_LOG` says otherwise.
pub fn init() {
    init_with(&LoggingConfig::default());
}

/// JSON output for field deployments.
pub fn init_json() {
    init_with(&LoggingConfig {
        json: true,
        ..LoggingConfig::default()
    });
}

/// Install a test-writer subscriber, ignoring repeated calls.
///
/// Tests across crates call this freely; only the first call in a process
/// takes effect.
pub fn init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("debug"))
        .with(fmt::layer().with_test_writer())
        .try_init();
}
