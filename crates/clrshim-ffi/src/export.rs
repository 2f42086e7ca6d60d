//! Plumbing shared by every exported entry point.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Mutex;

use clrshim_core::error::hresult;
use clrshim_core::{DbgShim, ShimConfig, ShimError, ShimResult};
use clrshim_utils::{
    init_file_logging, init_logging, shim_config_from_env, LogFormat, LoggingGuard, LoggingSettings, LOG_FILE_VAR,
    LOG_FILTER_VAR,
};
use once_cell::sync::OnceCell;
use tracing::{debug, error, warn};

static SHIM: OnceCell<DbgShim> = OnceCell::new();
static LOGGING: OnceCell<Mutex<Option<LoggingGuard>>> = OnceCell::new();

/// The process-wide shim, created on first use from the environment
pub(crate) fn shim() -> ShimResult<&'static DbgShim>
{
    SHIM.get_or_try_init(|| {
        let config = shim_config_from_env().unwrap_or_else(|err| {
            warn!(%err, "ignoring shim configuration");
            ShimConfig::default()
        });
        DbgShim::with_config(config)
    })
}

/// Logging for the library, only when the environment asks for it
///
/// `CLRSHIM_LOG_FILE` sends events to that file alone; `RUST_LOG` without a
/// file logs to stderr. A failure to set up logging never fails a call.
fn init_logging_once()
{
    LOGGING.get_or_init(|| {
        let file = std::env::var_os(LOG_FILE_VAR).filter(|p| !p.is_empty()).map(PathBuf::from);
        let guard = match file {
            Some(path) => {
                let format = LoggingSettings::from_env().map(|s| s.format).unwrap_or(LogFormat::Pretty);
                init_file_logging(&path, format, None).ok()
            }
            None if std::env::var_os(LOG_FILTER_VAR).is_some() => init_logging().ok(),
            None => None,
        };
        Mutex::new(guard)
    });
}

/// Run the body of an export, turning errors and panics into an HRESULT
pub(crate) fn ffi_call(entry: &'static str, body: impl FnOnce() -> ShimResult<()>) -> i32
{
    init_logging_once();
    let span = tracing::debug_span!("export", entry);
    let _enter = span.enter();

    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(())) => hresult::S_OK,
        Ok(Err(err)) => {
            debug!(%err, hr = format_args!("{:#010x}", err.hresult()), "failed");
            err.hresult()
        }
        Err(_) => {
            error!("panicked");
            hresult::E_FAIL
        }
    }
}

/// Store `value` through `out` when the caller passed somewhere to put it
///
/// # Safety
///
/// `out` must be null or valid for a write of `T`.
pub(crate) unsafe fn write_out<T>(out: *mut T, value: T)
{
    if !out.is_null() {
        unsafe { out.write(value) };
    }
}

pub(crate) fn invalid(what: &str) -> ShimError
{
    ShimError::InvalidArgument(what.to_string())
}
