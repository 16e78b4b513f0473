//! Structured logging configuration.
//!
//! `RUST_LOG` wins when set; otherwise the configured default level
//! applies. JSON output is for production, text for development.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use searchlink_server::config::LoggingSettings;

/// Configuration for structured logging.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Whether to use JSON format (true) or text format (false).
    pub json_format: bool,
    /// The default log level if RUST_LOG is not set.
    pub default_level: Level,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json_format: false,
            default_level: Level::INFO,
        }
    }
}

impl LoggingConfig {
    /// Derives logging configuration from the settings tree.
    pub fn from_settings(settings: &LoggingSettings) -> Self {
        Self {
            json_format: settings.json,
            default_level: parse_log_level(&settings.level),
        }
    }
}

/// Initializes the global subscriber once; later calls are no-ops.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_level.to_string()));

    if config.json_format {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init();
    }
}

/// Parse log level from string.
fn parse_log_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}
