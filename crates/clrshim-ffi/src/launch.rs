//! `CreateProcessForLaunch`, `ResumeProcess` and `CloseResumeHandle`.

use std::ffi::{c_void, CStr, OsString};
use std::ptr;

use clrshim_core::loader::from_wide_ptr;
use clrshim_core::{close_resume_handle, create_process_for_launch, resume_process, LaunchOptions, ResumeHandle};

use crate::export::{ffi_call, invalid, write_out};

/// Entries of an environment block: `NAME=value` strings, each NUL
/// terminated, ending with an empty string
///
/// A leading `=` belongs to the name (`=C:=C:\work`).
///
/// # Safety
///
/// `block` must point to a complete, double-NUL-terminated block.
unsafe fn parse_environment_block(block: *const u8) -> Vec<(OsString, OsString)>
{
    let mut entries = Vec::new();
    let mut cursor = block;
    loop {
        let entry = unsafe { CStr::from_ptr(cursor.cast()) };
        let bytes = entry.to_bytes();
        if bytes.is_empty() {
            break;
        }
        cursor = unsafe { cursor.add(bytes.len() + 1) };

        let text = String::from_utf8_lossy(bytes);
        let split = text.char_indices().skip(1).find(|&(_, c)| c == '=').map(|(i, _)| i);
        match split {
            Some(i) => entries.push((OsString::from(&text[..i]), OsString::from(&text[i + 1..]))),
            None => entries.push((OsString::from(text.as_ref()), OsString::new())),
        }
    }
    entries
}

/// `CreateProcessForLaunch`: start a debuggee, optionally suspended
///
/// The resume handle goes to [`ResumeProcess`] and must be released with
/// [`CloseResumeHandle`]. On failure the process id is 0 and the handle null.
///
/// # Safety
///
/// `command_line` is a NUL-terminated wide string; `environment` is null or
/// a narrow environment block; `current_directory` is null or a wide
/// string; both out-parameters are writable.
#[no_mangle]
pub unsafe extern "C" fn CreateProcessForLaunch(
    command_line: *mut u16,
    suspend_process: i32,
    environment: *mut c_void,
    current_directory: *const u16,
    process_id: *mut u32,
    resume_handle: *mut *mut c_void,
) -> i32
{
    unsafe {
        write_out(process_id, 0);
        write_out(resume_handle, ptr::null_mut());
    }
    ffi_call("CreateProcessForLaunch", || {
        if process_id.is_null() || resume_handle.is_null() {
            return Err(invalid("launch out-parameters"));
        }
        let command_line = unsafe { from_wide_ptr(command_line) }.ok_or_else(|| invalid("command line"))?;

        let mut options = LaunchOptions { suspend: suspend_process != 0, ..LaunchOptions::default() };
        if !environment.is_null() {
            options = options.with_environment(unsafe { parse_environment_block(environment.cast()) });
        }
        if let Some(directory) = unsafe { from_wide_ptr(current_directory) } {
            options = options.with_current_directory(directory);
        }

        let launched = create_process_for_launch(&command_line, &options)?;
        unsafe {
            process_id.write(launched.pid.0);
            resume_handle.write(launched.resume.into_raw() as *mut c_void);
        }
        Ok(())
    })
}

/// `ResumeProcess`: let a process started suspended run
///
/// # Safety
///
/// `resume_handle` comes from [`CreateProcessForLaunch`] and is still open.
#[no_mangle]
pub unsafe extern "C" fn ResumeProcess(resume_handle: *mut c_void) -> i32
{
    ffi_call("ResumeProcess", || {
        if resume_handle.is_null() {
            return Err(invalid("resume handle"));
        }
        let handle = unsafe { ResumeHandle::borrow_raw(resume_handle as usize) };
        resume_process(&handle)
    })
}

/// `CloseResumeHandle`
///
/// # Safety
///
/// `resume_handle` comes from [`CreateProcessForLaunch`]; it is invalid
/// afterwards.
#[no_mangle]
pub unsafe extern "C" fn CloseResumeHandle(resume_handle: *mut c_void) -> i32
{
    ffi_call("CloseResumeHandle", || {
        if resume_handle.is_null() {
            return Err(invalid("resume handle"));
        }
        close_resume_handle(unsafe { ResumeHandle::from_raw(resume_handle as usize) })
    })
}

#[cfg(test)]
mod tests
{
    use clrshim_core::error::hresult;

    use super::*;

    #[test]
    fn test_parse_environment_block()
    {
        let block = b"PATH=/usr/bin:/bin\0=C:=C:\\work\0EMPTY=\0FLAG\0DOTNET_gcServer=1\0\0";
        let entries = unsafe { parse_environment_block(block.as_ptr()) };
        let expected: Vec<(OsString, OsString)> = [
            ("PATH", "/usr/bin:/bin"),
            ("=C:", "C:\\work"),
            ("EMPTY", ""),
            ("FLAG", ""),
            ("DOTNET_gcServer", "1"),
        ]
        .iter()
        .map(|(k, v)| (OsString::from(k), OsString::from(v)))
        .collect();
        assert_eq!(entries, expected);
    }

    #[test]
    fn test_empty_environment_block()
    {
        assert!(unsafe { parse_environment_block(b"\0\0".as_ptr()) }.is_empty());
    }

    #[test]
    fn test_launch_failure_clears_outputs()
    {
        let command_line = clrshim_core::loader::to_wide_str("   ");
        let mut pid = 99;
        let mut handle = 0x40 as *mut c_void;
        let hr = unsafe {
            CreateProcessForLaunch(
                command_line.as_ptr().cast_mut(),
                0,
                ptr::null_mut(),
                ptr::null(),
                &mut pid,
                &mut handle,
            )
        };
        assert_eq!(hr, hresult::E_INVALIDARG);
        assert_eq!(pid, 0);
        assert!(handle.is_null());
    }

    #[test]
    fn test_null_resume_handle_rejected()
    {
        assert_eq!(unsafe { ResumeProcess(ptr::null_mut()) }, hresult::E_INVALIDARG);
        assert_eq!(unsafe { CloseResumeHandle(ptr::null_mut()) }, hresult::E_INVALIDARG);
    }

    #[cfg(unix)]
    #[test]
    fn test_launch_suspended_then_resume()
    {
        let command_line = clrshim_core::loader::to_wide_str("/bin/sh -c \"exit 3\"");
        let mut pid = 0;
        let mut handle = ptr::null_mut();
        let hr = unsafe {
            CreateProcessForLaunch(command_line.as_ptr().cast_mut(), 1, ptr::null_mut(), ptr::null(), &mut pid, &mut handle)
        };
        assert_eq!(hr, hresult::S_OK);
        assert_ne!(pid, 0);
        assert!(!handle.is_null());

        assert_eq!(unsafe { ResumeProcess(handle) }, hresult::S_OK);
        assert_eq!(unsafe { CloseResumeHandle(handle) }, hresult::S_OK);

        let mut status = 0;
        let waited = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, 0) };
        assert_eq!(waited, pid as libc::pid_t);
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 3);
    }
}
