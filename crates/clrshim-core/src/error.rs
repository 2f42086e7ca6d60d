//! # Error Types
//!
//! Error handling for the shim.
//!
//! Every public operation returns [`ShimResult`]. The variants follow the
//! HRESULT taxonomy debuggers already understand, and [`ShimError::hresult`]
//! produces the exact code the C ABI hands back. Errors coming the other
//! way (out of a DBI entry point or a native provider) are decoded with
//! [`ShimError::from_hresult`].

use thiserror::Error;

/// HRESULT values produced and recognised by the shim.
///
/// Stored as `i32` because that is what crosses the ABI; the hex literals are
/// the familiar unsigned spellings.
#[allow(clippy::cast_possible_wrap, clippy::unreadable_literal)]
pub mod hresult
{
    pub const S_OK: i32 = 0;
    pub const S_FALSE: i32 = 1;
    pub const E_NOTIMPL: i32 = 0x8000_4001_u32 as i32;
    pub const E_NOINTERFACE: i32 = 0x8000_4002_u32 as i32;
    pub const E_POINTER: i32 = 0x8000_4003_u32 as i32;
    pub const E_FAIL: i32 = 0x8000_4005_u32 as i32;
    pub const E_UNEXPECTED: i32 = 0x8000_FFFF_u32 as i32;
    pub const E_ACCESSDENIED: i32 = 0x8007_0005_u32 as i32;
    pub const E_HANDLE: i32 = 0x8007_0006_u32 as i32;
    pub const E_OUTOFMEMORY: i32 = 0x8007_000E_u32 as i32;
    pub const E_INVALIDARG: i32 = 0x8007_0057_u32 as i32;

    pub const COR_E_FILENOTFOUND: i32 = 0x8007_0002_u32 as i32;

    pub const CORDBG_E_INCOMPATIBLE_PROTOCOL: i32 = 0x8013_1C3C_u32 as i32;
    pub const CORDBG_E_DEBUG_COMPONENT_MISSING: i32 = 0x8013_1C3D_u32 as i32;
    pub const CORDBG_E_LIBRARY_PROVIDER_ERROR: i32 = 0x8013_1C43_u32 as i32;
    pub const CORDBG_E_NOT_CLR: i32 = 0x8013_1C44_u32 as i32;
    pub const CORDBG_E_MISSING_DATA_TARGET_INTERFACE: i32 = 0x8013_1C45_u32 as i32;
    pub const CORDBG_E_UNSUPPORTED_VERSION_STRUCT: i32 = 0x8013_1C47_u32 as i32;

    pub const ERROR_FILE_NOT_FOUND: u32 = 2;
    pub const ERROR_ACCESS_DENIED: u32 = 5;
    pub const ERROR_NOT_ENOUGH_MEMORY: u32 = 8;
    pub const ERROR_BAD_LENGTH: u32 = 24;
    pub const ERROR_INVALID_PARAMETER: u32 = 87;
    pub const ERROR_INSUFFICIENT_BUFFER: u32 = 122;
    pub const ERROR_ALREADY_EXISTS: u32 = 183;
    pub const ERROR_PARTIAL_COPY: u32 = 299;
    pub const ERROR_TIMEOUT: u32 = 1460;

    /// `HRESULT_FROM_WIN32`
    #[must_use]
    pub const fn from_win32(code: u32) -> i32
    {
        if code == 0 || (code as i32) < 0 {
            code as i32
        } else {
            ((code & 0x0000_FFFF) | 0x8007_0000) as i32
        }
    }

    /// `FAILED(hr)`
    #[must_use]
    pub const fn failed(hr: i32) -> bool
    {
        hr < 0
    }
}

/// Main error type for shim operations
///
/// ## Error Categories
///
/// 1. **Identification**: `NotClr` (soft, scanning may continue)
/// 2. **Library resolution and loading**: `IncompatibleProtocol`,
///    `DebugComponentMissing`, `LibraryProviderError`
/// 3. **Caller contract**: `InvalidArgument`, `InsufficientBuffer`, `Pointer`,
///    `UnsupportedVersionStruct`, `MissingDataTargetInterface`, `NoInterface`
/// 4. **Target access**: `PartialCopy`, `BadLength`, `Timeout`, `FileNotFound`,
///    `ProcessNotFound`
/// 5. **Platform**: `Os`, `Io`, `NotImplemented`, `NotEnoughMemory`
/// 6. **Foreign**: `Hresult` for codes returned verbatim by native code
#[derive(Error, Debug)]
pub enum ShimError
{
    /// The inspected module is not a managed runtime
    ///
    /// This is the soft answer of runtime identification. Callers walking a
    /// module list treat it as "try the next one".
    #[error("Module is not a managed runtime")]
    NotClr,

    /// The runtime is recognisable but cannot be debugged with what we have
    ///
    /// Raised when the DBI exports none of the supported creation entry
    /// points, when a `ClrInfo` handed to the resolver is invalid, or when the
    /// DBI found next to the runtime has a different product version.
    #[error("Incompatible debugging protocol: {0}")]
    IncompatibleProtocol(String),

    /// The DBI (or DAC) could not be loaded
    #[error("Debugging component missing: {0}")]
    DebugComponentMissing(String),

    /// The library provider failed or produced an empty path or handle
    #[error("Library provider error: {0}")]
    LibraryProviderError(String),

    /// The caller's `CLR_DEBUGGING_VERSION` has a struct version we do not know
    #[error("Unsupported CLR_DEBUGGING_VERSION struct version {0}")]
    UnsupportedVersionStruct(u16),

    /// The object passed as a data target does not implement the data-target interface
    #[error("Object does not implement the data target interface")]
    MissingDataTargetInterface,

    /// Only part of a target memory range could be read
    ///
    /// Transient: the module list of a starting process is in flux and the
    /// caller may retry.
    #[error("Partial copy while reading target at 0x{0:016x}")]
    PartialCopy(u64),

    /// The OS reported an inconsistent length while enumerating the target
    ///
    /// Transient, see [`ShimError::PartialCopy`].
    #[error("Bad length while enumerating target")]
    BadLength,

    /// The bounded retry budget for finding the runtime ran out
    #[error("Timed out waiting for the runtime")]
    Timeout,

    /// Invalid argument passed to a shim function
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Output buffer is too small
    ///
    /// `required` is the length (in characters, including the terminator)
    /// the caller has to supply.
    #[error("Buffer too small: {required} characters required")]
    InsufficientBuffer
    {
        /// Required buffer length
        required: usize,
    },

    /// An allocation failed
    #[error("Out of memory")]
    OutOfMemory,

    /// The requested interface or class is not supported
    #[error("Interface not supported")]
    NoInterface,

    /// A required output or input pointer was missing
    #[error("Required pointer missing: {0}")]
    Pointer(&'static str),

    /// The named module is not loaded in the target
    #[error("Module not found in target: {0}")]
    FileNotFound(String),

    /// A handle could not be created or converted
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// A shared view could not be mapped and no existing view can be aliased
    #[error("Not enough memory to map view")]
    NotEnoughMemory,

    /// The operation has no implementation on this platform
    #[error("Not implemented on this platform: {0}")]
    NotImplemented(&'static str),

    /// The target process doesn't exist or has exited
    #[error("Process not found: PID {0}")]
    ProcessNotFound(u32),

    /// Unspecified failure (`E_FAIL`)
    #[error("Operation failed: {0}")]
    Failed(String),

    /// A raw OS call failed
    ///
    /// `code` is the Win32 error on Windows and `errno` elsewhere.
    #[error("{api} failed with OS error {code}")]
    Os
    {
        /// Name of the failing API
        api: &'static str,
        /// Raw OS error code
        code: i32,
    },

    /// A native component returned a failure HRESULT we pass through verbatim
    #[error("Native call failed with HRESULT 0x{0:08x}")]
    Hresult(i32),

    /// I/O error (reading module files, `/proc`, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShimError
{
    /// Capture the calling thread's last OS error for `api`.
    #[must_use]
    pub fn last_os_error(api: &'static str) -> Self
    {
        let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        ShimError::Os { api, code }
    }

    /// Whether the error is one of the transient enumeration errors that a
    /// bounded retry loop should absorb.
    #[must_use]
    pub fn is_transient(&self) -> bool
    {
        matches!(self, ShimError::PartialCopy(_) | ShimError::BadLength)
    }

    /// Map this error to the HRESULT the C ABI reports.
    #[must_use]
    pub fn hresult(&self) -> i32
    {
        use hresult as hr;

        match self {
            ShimError::NotClr => hr::CORDBG_E_NOT_CLR,
            ShimError::IncompatibleProtocol(_) => hr::CORDBG_E_INCOMPATIBLE_PROTOCOL,
            ShimError::DebugComponentMissing(_) => hr::CORDBG_E_DEBUG_COMPONENT_MISSING,
            ShimError::LibraryProviderError(_) => hr::CORDBG_E_LIBRARY_PROVIDER_ERROR,
            ShimError::UnsupportedVersionStruct(_) => hr::CORDBG_E_UNSUPPORTED_VERSION_STRUCT,
            ShimError::MissingDataTargetInterface => hr::CORDBG_E_MISSING_DATA_TARGET_INTERFACE,
            ShimError::PartialCopy(_) => hr::from_win32(hr::ERROR_PARTIAL_COPY),
            ShimError::BadLength => hr::from_win32(hr::ERROR_BAD_LENGTH),
            ShimError::Timeout => hr::from_win32(hr::ERROR_TIMEOUT),
            ShimError::InvalidArgument(_) | ShimError::ProcessNotFound(_) => hr::E_INVALIDARG,
            ShimError::InsufficientBuffer { .. } => hr::from_win32(hr::ERROR_INSUFFICIENT_BUFFER),
            ShimError::OutOfMemory => hr::E_OUTOFMEMORY,
            ShimError::NoInterface => hr::E_NOINTERFACE,
            ShimError::Pointer(_) => hr::E_POINTER,
            ShimError::FileNotFound(_) => hr::COR_E_FILENOTFOUND,
            ShimError::InvalidHandle(_) => hr::E_HANDLE,
            ShimError::NotEnoughMemory => hr::from_win32(hr::ERROR_NOT_ENOUGH_MEMORY),
            ShimError::NotImplemented(_) => hr::E_NOTIMPL,
            ShimError::Failed(_) => hr::E_FAIL,
            ShimError::Os { code, .. } => os_code_to_hresult(*code),
            ShimError::Hresult(code) => *code,
            ShimError::Io(err) => err.raw_os_error().map_or(hr::E_FAIL, os_code_to_hresult),
        }
    }

    /// Decode a failure HRESULT returned by native code.
    ///
    /// Codes with a dedicated variant come back as that variant so callers can
    /// match on them; anything else is kept verbatim in [`ShimError::Hresult`].
    #[must_use]
    pub fn from_hresult(code: i32) -> Self
    {
        use hresult as hr;

        match code {
            hr::CORDBG_E_NOT_CLR => ShimError::NotClr,
            hr::CORDBG_E_INCOMPATIBLE_PROTOCOL => {
                ShimError::IncompatibleProtocol("reported by native component".to_string())
            }
            hr::CORDBG_E_DEBUG_COMPONENT_MISSING => {
                ShimError::DebugComponentMissing("reported by native component".to_string())
            }
            hr::CORDBG_E_LIBRARY_PROVIDER_ERROR => {
                ShimError::LibraryProviderError("reported by native component".to_string())
            }
            hr::CORDBG_E_MISSING_DATA_TARGET_INTERFACE => ShimError::MissingDataTargetInterface,
            hr::E_OUTOFMEMORY => ShimError::OutOfMemory,
            hr::E_NOINTERFACE => ShimError::NoInterface,
            c if c == hr::from_win32(hr::ERROR_PARTIAL_COPY) => ShimError::PartialCopy(0),
            c if c == hr::from_win32(hr::ERROR_BAD_LENGTH) => ShimError::BadLength,
            c if c == hr::from_win32(hr::ERROR_TIMEOUT) => ShimError::Timeout,
            other => ShimError::Hresult(other),
        }
    }
}

#[cfg(windows)]
#[allow(clippy::cast_sign_loss)]
fn os_code_to_hresult(code: i32) -> i32
{
    hresult::from_win32(code as u32)
}

#[cfg(not(windows))]
fn os_code_to_hresult(code: i32) -> i32
{
    use hresult as hr;

    match code {
        libc::ENOENT => hr::from_win32(hr::ERROR_FILE_NOT_FOUND),
        libc::EACCES | libc::EPERM => hr::E_ACCESSDENIED,
        libc::ENOMEM => hr::E_OUTOFMEMORY,
        libc::ESRCH | libc::EINVAL => hr::E_INVALIDARG,
        libc::EFAULT | libc::EIO => hr::from_win32(hr::ERROR_PARTIAL_COPY),
        _ => hr::E_FAIL,
    }
}

/// Convenience type alias for `Result<T, ShimError>`
///
/// ```rust
/// use clrshim_core::error::ShimResult;
/// fn foo() -> ShimResult<()>
/// {
///     Ok(())
/// }
/// ```
pub type ShimResult<T> = std::result::Result<T, ShimError>;

/// Turn an HRESULT returned by native code into a `ShimResult`.
///
/// # Errors
///
/// Returns the decoded error when `code` is a failure HRESULT.
pub fn check_hresult(code: i32) -> ShimResult<()>
{
    if hresult::failed(code) {
        Err(ShimError::from_hresult(code))
    } else {
        Ok(())
    }
}
