//! Shared logging infrastructure for PlayLab binaries.
//!
//! Unified `tracing` setup with environment-based configuration and optional
//! daily-rotated file output.
//!
//! # Usage
//!
//! ```rust,ignore
//! use playlab_logging::{init_logging, LogConfig};
//!
//! let _guard = init_logging(&LogConfig::from_env());
//! tracing::info!("engine started");
//! ```

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Configuration for PlayLab logging.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Enable logging output.
    pub enabled: bool,
    /// Level filter (e.g. "info", "playlab=debug,polars=warn").
    pub filter: String,
    /// Directory for log files (stderr only when `None`).
    pub log_dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            filter: "info,playlab=debug".to_string(),
            log_dir: None,
        }
    }
}

impl LogConfig {
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            ..Default::default()
        }
    }

    /// Build from environment variables.
    ///
    /// - `PLAYLAB_LOG`: level filter (defaults to "info,playlab=debug")
    /// - `PLAYLAB_LOG_DIR`: enable daily-rotated file output in this directory
    /// - `PLAYLAB_LOG_DISABLED`: set to "1" to disable logging entirely
    pub fn from_env() -> Self {
        let disabled = std::env::var("PLAYLAB_LOG_DISABLED")
            .map(|v| v == "1")
            .unwrap_or(false);
        Self {
            enabled: !disabled,
            filter: std::env::var("PLAYLAB_LOG")
                .unwrap_or_else(|_| "info,playlab=debug".to_string()),
            log_dir: std::env::var("PLAYLAB_LOG_DIR").ok().map(PathBuf::from),
        }
    }
}

/// Initialize the global subscriber.
///
/// Returns a guard that must stay alive for the duration of the process when
/// file output is enabled (dropping it flushes the writer).
pub fn init_logging(config: &LogConfig) -> Option<WorkerGuard> {
    if !config.enabled {
        return None;
    }

    let filter = EnvFilter::try_new(&config.filter)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "playlab.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter);
            // Best effort: a second init (tests) keeps the first subscriber.
            let _ = tracing_subscriber::registry().with(file_layer).try_init();
            Some(guard)
        }
        None => {
            let stderr_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter);
            let _ = tracing_subscriber::registry().with(stderr_layer).try_init();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert!(config.enabled);
        assert!(config.filter.contains("playlab=debug"));
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LogConfig::new("warn");
        let first = init_logging(&config);
        let second = init_logging(&config);
        assert!(first.is_none());
        assert!(second.is_none());
    }
}
