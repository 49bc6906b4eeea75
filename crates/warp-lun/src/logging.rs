//! Structured logging with tracing

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::error::{LunError, LunResult};

/// Log levels compatible with tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Per-request tracing
    Trace,
    /// Diagnostics
    Debug,
    /// Attach, detach and other lifecycle events
    Info,
    /// Recoverable problems
    Warn,
    /// Errors
    Error,
}

impl LogLevel {
    /// Convert to tracing Level
    #[must_use]
    pub const fn to_tracing_level(&self) -> Level {
        match self {
            Self::Trace => Level::TRACE,
            Self::Debug => Level::DEBUG,
            Self::Info => Level::INFO,
            Self::Warn => Level::WARN,
            Self::Error => Level::ERROR,
        }
    }

    /// Level for a `-v` count on top of a base level
    pub fn raised_by(self, verbosity: u8) -> Self {
        const ORDER: [LogLevel; 5] = [
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ];
        let base = ORDER.iter().position(|l| *l == self).unwrap_or(2);
        ORDER[(base + verbosity as usize).min(ORDER.len() - 1)]
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Trace => "trace",
                Self::Debug => "debug",
                Self::Info => "info",
                Self::Warn => "warn",
                Self::Error => "error",
            }
        )
    }
}

impl FromStr for LogLevel {
    type Err = LunError;

    fn from_str(s: &str) -> LunResult<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(LunError::Logging(format!("Invalid log level: {s}"))),
        }
    }
}

/// Output format for logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON lines
    Json,
    /// Multi-line human-readable output
    Pretty,
    /// One line per event
    Compact,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Minimum level; `RUST_LOG` overrides it
    pub level: LogLevel,
    /// Output format
    pub format: LogFormat,
    /// Write to stderr instead of stdout
    pub stderr: bool,
    /// Include the target module path
    pub include_target: bool,
    /// Include thread ids
    pub include_thread_id: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            stderr: true,
            include_target: true,
            include_thread_id: false,
        }
    }
}

/// Initialize global logging.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> LunResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    if config.stderr {
        apply_fmt(config, std::io::stderr, filter)
    } else {
        apply_fmt(config, std::io::stdout, filter)
    }
}

fn apply_fmt<W>(config: &LogConfig, writer: W, filter: EnvFilter) -> LunResult<()>
where
    W: for<'a> tracing_subscriber::fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    let init_result = match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_writer(writer)
            .with_target(config.include_target)
            .with_thread_ids(config.include_thread_id)
            .with_env_filter(filter)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .pretty()
            .with_writer(writer)
            .with_target(config.include_target)
            .with_thread_ids(config.include_thread_id)
            .with_env_filter(filter)
            .try_init(),
        LogFormat::Compact => tracing_subscriber::fmt()
            .compact()
            .with_writer(writer)
            .with_target(config.include_target)
            .with_thread_ids(config.include_thread_id)
            .with_env_filter(filter)
            .try_init(),
    };
    init_result.map_err(|e| LunError::Logging(format!("Failed to init subscriber: {e}")))
}
