// Tracing initialization with a configurable and reloadable log level.
use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

use crate::config::{LogFormat, LoggingConfig};

static LOG_RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, tracing_subscriber::Registry>> =
    OnceLock::new();

pub fn init_tracing() {
    init_tracing_with_level("info");
}

pub fn init_tracing_with_level(level: &str) {
    init_tracing_with(&LoggingConfig {
        level: level.to_string(),
        format: LogFormat::Text,
    });
}

/// Install the global subscriber. Later calls only change the level.
pub fn init_tracing_with(logging: &LoggingConfig) {
    if apply_logging_level(&logging.level) {
        return;
    }

    // Prefer RUST_LOG from env, otherwise use the configured level string.
    let base_filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(&logging.level));

    let (reload_layer, handle) = reload::Layer::new(base_filter);
    let _ = LOG_RELOAD_HANDLE.set(handle);

    let registry = tracing_subscriber::registry().with(reload_layer);
    let _ = match logging.format {
        LogFormat::Text => registry.with(fmt::layer()).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };
}

/// Apply a new logging level at runtime. Returns `false` before tracing is
/// initialized.
pub fn apply_logging_level(level: &str) -> bool {
    let Some(handle) = LOG_RELOAD_HANDLE.get() else {
        return false;
    };
    if let Err(e) = handle.modify(|f| *f = EnvFilter::new(level)) {
        tracing::warn!(error = %e, level, "failed to apply logging level");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reinit_changes_level() {
        init_tracing_with(&LoggingConfig {
            level: "warn".to_string(),
            format: LogFormat::Text,
        });
        assert!(apply_logging_level("error"));
        assert!(!tracing::enabled!(tracing::Level::WARN));

        init_tracing_with(&LoggingConfig {
            level: "debug".to_string(),
            format: LogFormat::Json,
        });
        assert!(tracing::enabled!(tracing::Level::DEBUG));
    }
}
