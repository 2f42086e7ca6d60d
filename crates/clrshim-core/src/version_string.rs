//! # Version Strings
//!
//! The opaque token a debugger carries from `CreateVersionStringFromModule`
//! to `CreateDebuggingInterfaceFromVersion*`:
//!
//! ```text
//! <dbiVersion:08x>;<pid:08x>;<moduleBase:pointer-width hex>
//! ```
//!
//! The token comes back from the debugger untrusted, so parsing checks the
//! fixed separator positions first. The pointer field is either 8 or 16 hex
//! digits; no other width parses.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::enumerate::module_base_address;
use crate::error::{ShimError, ShimResult};
use crate::host::ProcessHost;
use crate::runtime::target_clr_metrics;
use crate::types::{Address, CorDebugInterfaceVersion, ProcessId};

/// Longest token: two 8-digit fields and a 64-bit pointer
pub const MAX_VERSION_STRING_LEN: usize = 8 + 1 + 8 + 1 + 16;
/// Shortest token: two 8-digit fields and a 32-bit pointer
pub const MIN_VERSION_STRING_LEN: usize = 8 + 1 + 8 + 1 + 8;
/// Characters a caller must supply, terminator included
pub const VERSION_STRING_BUFFER_LEN: usize = MAX_VERSION_STRING_LEN + 1;

const FIRST_SEMICOLON: usize = 8;
const SECOND_SEMICOLON: usize = 17;
const POINTER_DIGITS: usize = 2 * std::mem::size_of::<usize>();

/// The fields a version string carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionToken
{
    /// Highest debugger interface version the runtime's DBI speaks
    pub dbi_version: CorDebugInterfaceVersion,
    pub pid: ProcessId,
    /// Base of the runtime module in the debuggee
    pub module_base: Address,
}

impl VersionToken
{
    /// Render into a wide, NUL-terminated buffer
    ///
    /// Returns the number of characters written, terminator included.
    ///
    /// ## Errors
    ///
    /// `InsufficientBuffer` when `buffer` is shorter than
    /// [`VERSION_STRING_BUFFER_LEN`], whatever this token's actual length.
    pub fn write_wide(&self, buffer: &mut [u16]) -> ShimResult<usize>
    {
        if buffer.len() < VERSION_STRING_BUFFER_LEN {
            return Err(ShimError::InsufficientBuffer { required: VERSION_STRING_BUFFER_LEN });
        }
        let text = self.to_string();
        let mut written = 0;
        for (slot, unit) in buffer.iter_mut().zip(text.encode_utf16()) {
            *slot = unit;
            written += 1;
        }
        buffer[written] = 0;
        Ok(written + 1)
    }
}

impl fmt::Display for VersionToken
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        #[allow(clippy::cast_sign_loss)]
        let dbi = self.dbi_version.raw() as u32;
        write!(
            f,
            "{dbi:08x};{:08x};{:0width$X}",
            self.pid.0,
            self.module_base.value(),
            width = POINTER_DIGITS
        )
    }
}

fn hex_field(text: &str) -> Option<u64>
{
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(text, 16).ok()
}

impl FromStr for VersionToken
{
    type Err = ShimError;

    fn from_str(text: &str) -> Result<Self, Self::Err>
    {
        parse_version_string(text)
    }
}

/// Parse a token produced by [`VersionToken`]'s `Display`
///
/// ```rust
/// use clrshim_core::version_string::parse_version_string;
///
/// let token = parse_version_string("00000004;00001267;00007FF812340000").unwrap();
/// assert_eq!(token.pid.0, 0x1267);
/// assert_eq!(token.module_base.value(), 0x7ff8_1234_0000);
/// assert!(parse_version_string("4;1267;7FF812340000").is_err());
/// ```
///
/// ## Errors
///
/// `InvalidArgument` for anything that doesn't have exactly that shape.
pub fn parse_version_string(text: &str) -> ShimResult<VersionToken>
{
    let malformed = || ShimError::InvalidArgument(format!("malformed version string {text:?}"));
    let bytes = text.as_bytes();
    if (bytes.len() != MIN_VERSION_STRING_LEN && bytes.len() != MAX_VERSION_STRING_LEN)
        || bytes[FIRST_SEMICOLON] != b';'
        || bytes[SECOND_SEMICOLON] != b';'
    {
        return Err(malformed());
    }

    let dbi = hex_field(&text[..FIRST_SEMICOLON]).ok_or_else(malformed)?;
    let pid = hex_field(&text[FIRST_SEMICOLON + 1..SECOND_SEMICOLON]).ok_or_else(malformed)?;
    let base = hex_field(&text[SECOND_SEMICOLON + 1..]).ok_or_else(malformed)?;

    let dbi = u32::try_from(dbi).map_err(|_| malformed())?;
    let pid = u32::try_from(pid).map_err(|_| malformed())?;
    Ok(VersionToken { dbi_version: CorDebugInterfaceVersion::from(dbi), pid: ProcessId(pid), module_base: Address::new(base) })
}

/// Build the token for the runtime loaded from `module_path` in `pid`
///
/// The DBI version comes from the engine metrics of the file on disk; the
/// base from the debuggee's module list.
///
/// ## Errors
///
/// - the identification error when the file has no engine metrics
/// - `FileNotFound` when the module is not loaded in `pid`
/// - module enumeration errors
pub fn create_version_string(host: &dyn ProcessHost, pid: ProcessId, module_path: &Path) -> ShimResult<VersionToken>
{
    let metrics = target_clr_metrics(module_path, false)?;
    let module_base = module_base_address(host, pid, module_path)?
        .ok_or_else(|| ShimError::FileNotFound(module_path.display().to_string()))?;
    let token = VersionToken { dbi_version: metrics.engine.interface_version(), pid, module_base };
    tracing::debug!(pid = pid.0, %token, "created version string");
    Ok(token)
}
