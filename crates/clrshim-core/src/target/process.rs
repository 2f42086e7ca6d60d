//! Live Linux process data target.

use super::DataTarget;
use crate::error::{ShimError, ShimResult};
use crate::types::{Address, Platform, ProcessId};

/// Reads another process's memory with `process_vm_readv`
///
/// Needs the same permission as `ptrace` attach (same user and a permissive
/// `kernel.yama.ptrace_scope`, or `CAP_SYS_PTRACE`). Nothing is written to
/// the target and the target isn't stopped.
#[derive(Debug, Clone, Copy)]
pub struct ProcessTarget
{
    pid: ProcessId,
}

impl ProcessTarget
{
    /// Open `pid` for reading
    ///
    /// ## Errors
    ///
    /// `ProcessNotFound` when `/proc/<pid>` doesn't exist.
    pub fn open(pid: ProcessId) -> ShimResult<Self>
    {
        if !std::path::Path::new(&format!("/proc/{}", pid.0)).exists() {
            return Err(ShimError::ProcessNotFound(pid.0));
        }
        Ok(ProcessTarget { pid })
    }

    pub fn pid(&self) -> ProcessId
    {
        self.pid
    }
}

impl DataTarget for ProcessTarget
{
    fn platform(&self) -> ShimResult<Platform>
    {
        Ok(Platform::host())
    }

    fn read_virtual(&self, address: Address, buffer: &mut [u8]) -> ShimResult<usize>
    {
        if buffer.is_empty() {
            return Ok(0);
        }
        let local = libc::iovec { iov_base: buffer.as_mut_ptr().cast(), iov_len: buffer.len() };
        let remote = libc::iovec { iov_base: address.value() as usize as *mut libc::c_void, iov_len: buffer.len() };
        #[allow(clippy::cast_possible_wrap)]
        let pid = self.pid.0 as libc::pid_t;

        // SAFETY: `local` covers exactly `buffer`; the remote side is only read.
        let read = unsafe { libc::process_vm_readv(pid, &local, 1, &remote, 1, 0) };
        if read < 0 {
            let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
            tracing::trace!(pid = self.pid.0, %address, code, "process_vm_readv failed");
            return match code {
                libc::ESRCH => Err(ShimError::ProcessNotFound(self.pid.0)),
                libc::EFAULT | libc::EIO => Err(ShimError::PartialCopy(address.value())),
                _ => Err(ShimError::Os { api: "process_vm_readv", code }),
            };
        }
        #[allow(clippy::cast_sign_loss)]
        Ok(read as usize)
    }
}
