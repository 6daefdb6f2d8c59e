//! Logging configuration and initialization
//!
//! Centralized `tracing` setup for the library, the CLI and the benchmarks.
//! Kernel runs emit one `info` event per invocation, `debug` events per phase
//! and `trace` events per barrier release, so the default level keeps output
//! quiet while `NPUFORGE_LOG_LEVEL=debug` shows the phase protocol of a run.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Standard tracing filter (e.g., "info", "npuforge::sync=trace")
//! - `NPUFORGE_LOG_LEVEL`: Simple log level (error, warn, info, debug, trace)
//! - `NPUFORGE_LOG_FORMAT`: Output format ("human" or "json")
//! - `NPUFORGE_LOG_FILE`: Optional file path for an additional JSON log

use once_cell::sync::OnceCell;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Global flag to track if tracing has been initialized
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Environment variable for log level override
const LOG_LEVEL_ENV: &str = "NPUFORGE_LOG_LEVEL";

/// Environment variable for log format (json/human)
const LOG_FORMAT_ENV: &str = "NPUFORGE_LOG_FORMAT";

/// Environment variable for log file path
const LOG_FILE_ENV: &str = "NPUFORGE_LOG_FILE";

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("failed to create log directory: {0}")]
    DirectoryCreationFailed(String),

    #[error("failed to open log file: {0}")]
    FileOpenFailed(String),

    #[error("a global subscriber is already installed")]
    AlreadyInstalled,
}

/// Log level enumeration
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
    /// Convert to tracing Level
    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to EnvFilter directive
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

/// Log format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable output (default)
    #[default]
    Human,
    /// JSON structured output
    Json,
}

impl LogFormat {
    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "human" | "pretty" | "console" => Some(LogFormat::Human),
            "json" | "structured" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Include file/line in console events
    pub with_file_info: bool,
    /// Emit span close events (phase timings)
    pub with_span_events: bool,
    /// Thread names carry the unit coordinates, off by default
    pub with_thread_names: bool,
    /// Additional JSON log file
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

    pub fn with_span_events(mut self, with_span_events: bool) -> Self {
        self.with_span_events = with_span_events;
        self
    }

    pub fn with_thread_names(mut self, with_thread_names: bool) -> Self {
        self.with_thread_names = with_thread_names;
        self
    }

    pub fn with_log_file(mut self, path: PathBuf) -> Self {
        self.log_file = Some(path);
        self
    }

    /// Build a configuration from `NPUFORGE_LOG_*` variables
    pub fn from_env() -> Self {
        let mut config = LoggingConfig::new();

        if let Some(level) = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|s| LogLevel::parse(&s))
        {
            config = config.with_level(level);
        }

        if let Some(format) = std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|s| LogFormat::parse(&s))
        {
            config = config.with_format(format);
        }

        if let Ok(file) = std::env::var(LOG_FILE_ENV) {
            config = config.with_log_file(PathBuf::from(file));
        }

        config
    }
}

/// Initialize logging from the environment, ignoring failures.
///
/// Idempotent: only the first call installs a subscriber.
///
/// ```ignore
/// npuforge::logging::init_logging_default();
/// tracing::info!("cosimulation started");
/// ```
pub fn init_logging_default() {
    let _ = init_logging_from_env();
}

/// Initialize logging from environment variables.
///
/// Idempotent. Returns the error of the first initialization attempt only.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    init_with_config(&LoggingConfig::from_env())
}

/// Initialize logging with a custom configuration.
///
/// Idempotent: later calls are no-ops returning `Ok(())`.
pub fn init_with_config(config: &LoggingConfig) -> Result<(), LoggingError> {
    let mut outcome = Ok(());
    TRACING_INITIALIZED.get_or_init(|| {
        outcome = install(config);
    });
    outcome
}

fn install(config: &LoggingConfig) -> Result<(), LoggingError> {
    let env_filter = build_env_filter(config.level)?;
    let file = match &config.log_file {
        Some(path) => Some(open_log_file(path)?),
        None => None,
    };

    // File layer is always JSON regardless of console format
    let file_layer = file.map(|file| {
        fmt::layer()
            .json()
            .with_writer(Mutex::new(file))
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_span_events(span_events(config.with_span_events))
    });

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer);

    let result = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_thread_names(config.with_thread_names)
                    .with_file(config.with_file_info)
                    .with_line_number(config.with_file_info)
                    .with_span_events(span_events(config.with_span_events)),
            )
            .try_init(),
        LogFormat::Human => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_thread_names(config.with_thread_names)
                    .with_file(config.with_file_info)
                    .with_line_number(config.with_file_info)
                    .with_span_events(span_events(config.with_span_events)),
            )
            .try_init(),
    };

    result.map_err(|_| LoggingError::AlreadyInstalled)
}

fn span_events(enabled: bool) -> FmtSpan {
    if enabled {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

fn open_log_file(path: &Path) -> Result<File, LoggingError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LoggingError::DirectoryCreationFailed(e.to_string()))?;
        }
    }

    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| LoggingError::FileOpenFailed(e.to_string()))
}

/// Tries RUST_LOG first, then the configured level.
fn build_env_filter(default_level: LogLevel) -> Result<EnvFilter, LoggingError> {
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(rust_log).map_err(|e| LoggingError::InvalidFilter(e.to_string()));
    }
    Ok(EnvFilter::new(default_level.as_filter_str()))
}

/// Check if tracing has been initialized
pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}
