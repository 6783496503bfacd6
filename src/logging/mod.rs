//! Logging configuration and initialization
//!
//! Subscriber setup for the `tracing` events emitted by the allocator,
//! contexts and kernel caches. Human-readable or JSON output, optionally
//! mirrored to a JSON log file.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Standard tracing filter (e.g., "info", "tensorforge::kernels=debug")
//! - `TFORGE_LOG_LEVEL`: Simple log level (error, warn, info, debug, trace)
//! - `TFORGE_LOG_FORMAT`: Output format ("human" or "json")
//! - `TFORGE_LOG_FILE`: Optional file path for log output (always JSON)

use once_cell::sync::OnceCell;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Outcome of the one and only subscriber installation
static TRACING_INITIALIZED: OnceCell<Result<(), LoggingError>> = OnceCell::new();

const LOG_LEVEL_ENV: &str = "TFORGE_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "TFORGE_LOG_FORMAT";
const LOG_FILE_ENV: &str = "TFORGE_LOG_FILE";

/// Errors that can occur during logging initialization
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoggingError {
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("invalid log format: {0}")]
    InvalidLogFormat(String),

    #[error("failed to open log file {path}: {reason}")]
    FileOpenFailed { path: String, reason: String },

    /// Another global subscriber was installed first
    #[error("global subscriber already set: {0}")]
    AlreadySet(String),
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }

    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(LoggingError::InvalidLogLevel(other.to_string())),
        }
    }
}

/// Console output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "human" | "pretty" | "console" => Ok(LogFormat::Human),
            "json" | "structured" => Ok(LogFormat::Json),
            other => Err(LoggingError::InvalidLogFormat(other.to_string())),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Include file/line in console output
    pub with_file_info: bool,
    /// Mirror events as JSON into this file
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file_info(mut self, with_file_info: bool) -> Self {
        self.with_file_info = with_file_info;
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Read `TFORGE_LOG_LEVEL`, `TFORGE_LOG_FORMAT` and `TFORGE_LOG_FILE`.
    ///
    /// Unparseable values are reported rather than silently replaced.
    pub fn from_env() -> Result<Self, LoggingError> {
        let mut config = LoggingConfig::new();
        if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
            config.level = level.parse()?;
        }
        if let Ok(format) = std::env::var(LOG_FORMAT_ENV) {
            config.format = format.parse()?;
        }
        if let Ok(file) = std::env::var(LOG_FILE_ENV) {
            if !file.is_empty() {
                config.log_file = Some(PathBuf::from(file));
            }
        }
        Ok(config)
    }
}

/// Initialize logging from the environment, ignoring failures.
///
/// Idempotent: only the first call installs a subscriber.
pub fn init_logging_default() {
    if let Err(e) = init_logging_from_env() {
        eprintln!("tensorforge: logging not initialized: {}", e);
    }
}

/// Initialize logging from environment variables.
///
/// Falls back to the default config when the variables cannot be parsed.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    let config = LoggingConfig::from_env().unwrap_or_default();
    init_with_config(&config)
}

/// Initialize logging with a custom configuration.
///
/// Idempotent: later calls return the outcome of the first one.
pub fn init_with_config(config: &LoggingConfig) -> Result<(), LoggingError> {
    TRACING_INITIALIZED
        .get_or_init(|| install(config))
        .clone()
}

fn install(config: &LoggingConfig) -> Result<(), LoggingError> {
    let env_filter = build_env_filter(config.level)?;

    let console = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(false)
            .with_file(config.with_file_info)
            .with_line_number(config.with_file_info)
            .boxed(),
        LogFormat::Human => fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(config.with_file_info)
            .with_line_number(config.with_file_info)
            .boxed(),
    };

    let file_layer = match &config.log_file {
        Some(path) => {
            let file = open_log_file(path)?;
            Some(
                fmt::layer()
                    .json()
                    .with_writer(file)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::AlreadySet(e.to_string()))
}

fn open_log_file(path: &Path) -> Result<File, LoggingError> {
    let to_err = |e: std::io::Error| LoggingError::FileOpenFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(to_err)?;
        }
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(to_err)
}

/// `RUST_LOG` wins over the configured level
fn build_env_filter(default_level: LogLevel) -> Result<EnvFilter, LoggingError> {
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(rust_log)
            .map_err(|e| LoggingError::InvalidLogLevel(e.to_string()));
    }
    Ok(EnvFilter::new(default_level.as_filter_str()))
}

/// Check if tracing has been initialized
pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}
