//! Tracing/logging initialization.
//!
//! `edgelink-daemon` calls [`init_tracing`] once at startup, after the config
//! layers and CLI flags have settled the log level and output format.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Build the filter directive for the daemon from a bare level.
///
/// `"debug"` becomes `"edgelink_daemon=debug,edgelink_core=debug"`; anything
/// that already looks like a directive list is passed through untouched.
pub fn default_filter(level: &str) -> String {
    if level.contains('=') || level.contains(',') {
        level.to_string()
    } else {
        format!("edgelink_daemon={level},edgelink_core={level}")
    }
}

/// Initialise the global tracing subscriber.
///
/// Installs a global default, so call it at most once per process.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"edgelink_daemon=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
