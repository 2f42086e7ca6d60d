//! # Logging
//!
//! `tracing` subscriber setup for the clrshim binaries.
//!
//! The core only emits events; whoever hosts it decides where they go. The
//! command-line tool logs to stderr so its stdout stays parseable. The C ABI
//! library stays silent inside the debugger that loaded it unless
//! `CLRSHIM_LOG_FILE` or `RUST_LOG` is set.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: filter directives (`debug`, `clrshim_core::startup=trace`)
//! - `CLRSHIM_LOG_FORMAT`: `pretty` (default) or `json`
//! - `CLRSHIM_LOG_FILE`: also write to this file, rolled daily
//!
//! ```rust,no_run
//! let _guard = clrshim_utils::init_logging().expect("logging");
//! tracing::info!("ready");
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

pub const LOG_FORMAT_VAR: &str = "CLRSHIM_LOG_FORMAT";
pub const LOG_FILE_VAR: &str = "CLRSHIM_LOG_FILE";
pub const LOG_FILTER_VAR: &str = "RUST_LOG";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event, with the span list
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

/// Logging configuration as read from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings
{
    pub format: LogFormat,
    /// `EnvFilter` directives
    pub filter: String,
    pub file: Option<PathBuf>,
}

impl LoggingSettings
{
    /// Read settings through `lookup`, which maps a variable name to its value
    ///
    /// ## Errors
    ///
    /// `InvalidFormat` for an unknown `CLRSHIM_LOG_FORMAT`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, LoggingError>
    {
        let format = lookup(LOG_FORMAT_VAR).map(|s| s.parse()).transpose()?.unwrap_or_default();
        let filter = lookup(LOG_FILTER_VAR).filter(|s| !s.trim().is_empty()).unwrap_or_else(|| "info".to_string());
        let file = lookup(LOG_FILE_VAR).filter(|s| !s.is_empty()).map(PathBuf::from);
        Ok(LoggingSettings { format, filter, file })
    }

    /// ## Errors
    ///
    /// See [`LoggingSettings::from_lookup`].
    pub fn from_env() -> Result<Self, LoggingError>
    {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn env_filter(&self) -> Result<EnvFilter, LoggingError>
    {
        EnvFilter::try_new(&self.filter).map_err(|err| LoggingError::InvalidFilter(format!("{}: {err}", self.filter)))
    }
}

/// Keeps the background file writer alive; drop it last
#[must_use = "dropping the guard stops file logging"]
#[derive(Debug, Default)]
pub struct LoggingGuard
{
    _file: Option<WorkerGuard>,
}

fn layer<W>(format: LogFormat, writer: W, ansi: bool, filter: EnvFilter) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let base = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(writer);
    match format {
        LogFormat::Pretty => base.with_ansi(ansi).with_filter(filter).boxed(),
        LogFormat::Json => base.json().with_current_span(true).with_span_list(true).with_filter(filter).boxed(),
    }
}

fn split_log_path(path: &Path) -> (PathBuf, PathBuf)
{
    let directory = path.parent().filter(|p| !p.as_os_str().is_empty()).map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let name = path.file_name().map_or_else(|| PathBuf::from("clrshim.log"), PathBuf::from);
    (directory, name)
}

fn install(layers: Vec<BoxedLayer>) -> Result<(), LoggingError>
{
    Registry::default().with(layers).try_init().map_err(|err| LoggingError::InitializationFailed(err.to_string()))
}

/// Initialise logging from the environment: stderr plus the optional file
///
/// ## Errors
///
/// - invalid `CLRSHIM_LOG_FORMAT` or `RUST_LOG`
/// - a subscriber is already installed
/// - the log directory can't be created
pub fn init_logging() -> Result<LoggingGuard, LoggingError>
{
    init_with(&LoggingSettings::from_env()?)
}

/// Like [`init_logging`], with an explicit level and format
///
/// ## Errors
///
/// See [`init_logging`].
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<LoggingGuard, LoggingError>
{
    let mut settings = LoggingSettings::from_env()?;
    settings.filter = Level::from(level).to_string();
    settings.format = format;
    init_with(&settings)
}

fn init_with(settings: &LoggingSettings) -> Result<LoggingGuard, LoggingError>
{
    let mut layers = vec![layer(settings.format, io::stderr, true, settings.env_filter()?)];
    let mut guard = LoggingGuard::default();
    if let Some(path) = &settings.file {
        let (directory, name) = split_log_path(path);
        std::fs::create_dir_all(&directory)?;
        let (writer, file_guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(directory, name));
        layers.push(layer(settings.format, writer, false, settings.env_filter()?));
        guard._file = Some(file_guard);
    }
    install(layers)?;
    Ok(guard)
}

/// Log to `path` only, never to the console
///
/// `level` overrides `RUST_LOG` when given.
///
/// ## Errors
///
/// - invalid `RUST_LOG`
/// - a subscriber is already installed
/// - the log directory can't be created
pub fn init_file_logging(path: &Path, format: LogFormat, level: Option<LogLevel>) -> Result<LoggingGuard, LoggingError>
{
    let mut settings = LoggingSettings::from_env()?;
    if let Some(level) = level {
        settings.filter = Level::from(level).to_string();
    }
    let (directory, name) = split_log_path(path);
    std::fs::create_dir_all(&directory)?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(directory, name));
    install(vec![layer(format, writer, false, settings.env_filter()?)])?;
    Ok(LoggingGuard { _file: Some(guard) })
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    #[error("invalid log format {0:?}, expected 'pretty' or 'json'")]
    InvalidFormat(String),

    #[error("invalid log level {0:?}")]
    InvalidLevel(String),

    #[error("invalid log filter {0}")]
    InvalidFilter(String),

    #[error("failed to initialize logging: {0}")]
    InitializationFailed(String),

    #[error("log file error: {0}")]
    FileError(#[from] io::Error),
}
