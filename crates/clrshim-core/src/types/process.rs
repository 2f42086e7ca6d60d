//! Process and module identity types.

use std::fmt;
use std::path::{Path, PathBuf};

use super::Address;

/// Process identifier (PID)
///
/// Debuggee PIDs are 32-bit on every platform the shim supports; the version
/// string even serialises them as exactly eight hex digits.
///
/// ## Example
///
/// ```rust
/// use clrshim_core::types::ProcessId;
///
/// let pid = ProcessId::from(4711);
/// assert_eq!(u32::from(pid), 4711);
/// assert_eq!(pid.to_string(), "4711");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u32);

impl ProcessId
{
    /// PID of the calling process
    #[must_use]
    pub fn current() -> Self
    {
        ProcessId(std::process::id())
    }
}

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

impl fmt::Display for ProcessId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// A module loaded in a target process
///
/// `base` doubles as the module handle on Windows (an `HMODULE` is the load
/// address) and as the runtime instance id handed to the DBI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule
{
    /// Load address in the target
    pub base: Address,
    /// Full path of the backing file
    pub path: PathBuf,
}

impl LoadedModule
{
    /// Create a module record
    pub fn new(base: Address, path: impl Into<PathBuf>) -> Self
    {
        LoadedModule { base, path: path.into() }
    }

    /// File name component of the module path
    #[must_use]
    pub fn file_name(&self) -> Option<&str>
    {
        file_name_of(&self.path)
    }
}

/// File name of `path`, accepting both separators
///
/// Module paths reported for Windows targets use `\` even when the debugger
/// runs elsewhere, so `Path::file_name` alone is not enough.
#[must_use]
pub fn file_name_of(path: &Path) -> Option<&str>
{
    let text = path.to_str()?;
    let name = text.rsplit(['/', '\\']).next()?;
    (!name.is_empty()).then_some(name)
}
