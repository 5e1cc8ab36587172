//! # Structured Logging
//!
//! Installs the global `tracing` subscriber: an `EnvFilter` seeded from the
//! configured level (overridable with `RUST_LOG`) and a `fmt` layer writing
//! JSON or human-readable text.

use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::config::{LogFormat, LoggingConfig};

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize the subscriber; a second call keeps the first one
pub fn init_logging(config: &LoggingConfig) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(parse_level(&config.level).into())
        .from_env_lossy();

    let result = match config.format {
        LogFormat::Json => Registry::default()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init(),
    };

    if result.is_err() {
        warn!("Tracing subscriber already initialized, skipping initialization");
        return;
    }

    info!(level = %config.level, format = ?config.format, "Structured logging initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_defaults_to_info() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("nonsense"), Level::INFO);
    }

    #[test]
    fn test_double_init_is_tolerated() {
        let config = LoggingConfig {
            level: "warn".to_string(),
            format: LogFormat::Text,
        };
        init_logging(&config);
        init_logging(&config);
    }
}
