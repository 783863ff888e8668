//! Log output setup
//!
//! Library code logs through the `log` facade. The binaries install a
//! `tracing-subscriber` formatter, which also picks up `log` records, filtered
//! by `RUST_LOG` or the configured level.

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Minimum level when `RUST_LOG` is not set
    pub level: LogLevel,
    /// One JSON object per line instead of human readable output
    pub json_format: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
        }
    }
}

impl LoggerConfig {
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(format!("{:?}", self.level).to_lowercase()))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Installs the global subscriber. Calling it again is harmless.
pub fn init(config: &LoggerConfig) {
    let init_result = if config.json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(config.filter())
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(config.filter())
            .try_init()
    };

    if let Err(e) = init_result {
        eprintln!("Warning: Tracing subscriber already initialized: {}", e);
    }
}
