//! # clrshim Utilities
//!
//! Logging setup and environment-driven configuration shared by the
//! `clrshim` command-line tool and the C ABI library.

pub mod config;
pub mod logging;

pub use config::{shim_config_from_env, ConfigError};
pub use logging::{
    init_file_logging, init_logging, init_logging_with_level, LogFormat, LogLevel, LoggingError, LoggingGuard,
    LoggingSettings, LOG_FILE_VAR, LOG_FILTER_VAR, LOG_FORMAT_VAR,
};
pub use tracing::{debug, error, info, trace, warn};
