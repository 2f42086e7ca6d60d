//! Windows process host: module enumeration, target reads and the named
//! startup event.

use std::ffi::c_void;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use windows::core::{Error as WinError, PCWSTR, PWSTR};
use windows::Win32::Foundation::{
    CloseHandle, DuplicateHandle, LocalFree, DUPLICATE_HANDLE_OPTIONS, HANDLE, HLOCAL, HMODULE, WAIT_OBJECT_0,
    WAIT_TIMEOUT,
};
use windows::Win32::Security::Authorization::{
    SetEntriesInAclW, EXPLICIT_ACCESS_W, NO_MULTIPLE_TRUSTEE, SET_ACCESS, TRUSTEE_IS_SID, TRUSTEE_IS_USER, TRUSTEE_W,
};
use windows::Win32::Security::{
    GetTokenInformation, InitializeSecurityDescriptor, SetSecurityDescriptorDacl, TokenUser, ACL, NO_INHERITANCE,
    PSECURITY_DESCRIPTOR, SECURITY_ATTRIBUTES, SECURITY_DESCRIPTOR, TOKEN_QUERY, TOKEN_USER,
};
use windows::Win32::System::Diagnostics::Debug::ReadProcessMemory;
use windows::Win32::System::ProcessStatus::{EnumProcessModules, GetModuleFileNameExW};
use windows::Win32::System::RemoteDesktop::ProcessIdToSessionId;
use windows::Win32::System::Threading::{
    CreateEventW, GetCurrentProcess, OpenEventW, OpenProcess, OpenProcessToken, SetEvent, WaitForSingleObject,
    EVENT_ALL_ACCESS, EVENT_MODIFY_STATE, INFINITE, PROCESS_ACCESS_RIGHTS, PROCESS_DUP_HANDLE,
    PROCESS_QUERY_INFORMATION, PROCESS_VM_READ, SYNCHRONIZATION_SYNCHRONIZE,
};

use super::{enumerate_with_retry, ProcessHost};
use crate::error::{hresult, ShimError, ShimResult};
use crate::loader::to_wide_str;
use crate::startup::{startup_event_name, NotifyEvent};
use crate::types::{Address, LoadedModule, ProcessId};

const MAX_LONGPATH: usize = 32767;
const SECURITY_DESCRIPTOR_REVISION: u32 = 1;

fn win32_error(api: &'static str, err: &WinError) -> ShimError
{
    let code = err.code().0;
    if code == hresult::from_win32(hresult::ERROR_PARTIAL_COPY) {
        ShimError::PartialCopy(0)
    } else if code == hresult::from_win32(hresult::ERROR_BAD_LENGTH) {
        ShimError::BadLength
    } else {
        ShimError::Os { api, code }
    }
}

/// A process handle closed on drop
struct ProcessHandle(HANDLE);

impl ProcessHandle
{
    fn open(pid: ProcessId, access: PROCESS_ACCESS_RIGHTS) -> ShimResult<Self>
    {
        let handle = unsafe { OpenProcess(access, false, pid.0) }.map_err(|err| win32_error("OpenProcess", &err))?;
        Ok(ProcessHandle(handle))
    }
}

impl Drop for ProcessHandle
{
    fn drop(&mut self)
    {
        let _ = unsafe { CloseHandle(self.0) };
    }
}

/// An owned Win32 event handle
#[derive(Debug)]
pub struct Win32Event
{
    handle: usize,
}

impl Win32Event
{
    /// Take ownership of `handle`
    ///
    /// # Safety
    ///
    /// `handle` must be an event handle nobody else closes.
    pub unsafe fn from_raw(handle: usize) -> Self
    {
        Win32Event { handle }
    }

    /// Give up ownership; the caller closes the handle
    pub fn into_raw(self) -> usize
    {
        let handle = self.handle;
        std::mem::forget(self);
        handle
    }

    fn as_handle(&self) -> HANDLE
    {
        HANDLE(self.handle as _)
    }
}

impl NotifyEvent for Win32Event
{
    fn set(&self) -> ShimResult<()>
    {
        unsafe { SetEvent(self.as_handle()) }.map_err(|err| win32_error("SetEvent", &err))
    }

    fn wait(&self, timeout: Option<Duration>) -> ShimResult<bool>
    {
        let millis = timeout.map_or(INFINITE, |t| u32::try_from(t.as_millis()).unwrap_or(INFINITE - 1));
        let status = unsafe { WaitForSingleObject(self.as_handle(), millis) };
        if status == WAIT_OBJECT_0 {
            Ok(true)
        } else if status == WAIT_TIMEOUT {
            Ok(false)
        } else {
            Err(ShimError::last_os_error("WaitForSingleObject"))
        }
    }

    fn raw_handle(&self) -> usize
    {
        self.handle
    }
}

impl Drop for Win32Event
{
    fn drop(&mut self)
    {
        let _ = unsafe { CloseHandle(self.as_handle()) };
    }
}

/// Terminal-services session of `pid`
///
/// ## Errors
///
/// `Os` when the process can't be queried.
pub fn session_of(pid: ProcessId) -> ShimResult<u32>
{
    let mut session = 0u32;
    unsafe { ProcessIdToSessionId(pid.0, &mut session) }.map_err(|err| win32_error("ProcessIdToSessionId", &err))?;
    Ok(session)
}

/// An ACL granting the user `pid` runs as full access to an event
///
/// The debuggee may run as another user or at a lower integrity level and
/// still has to be able to signal the startup event.
struct DebuggeeAcl(*mut ACL);

impl DebuggeeAcl
{
    fn for_process(process: &ProcessHandle) -> ShimResult<Self>
    {
        let mut token = HANDLE::default();
        unsafe { OpenProcessToken(process.0, TOKEN_QUERY, &mut token) }
            .map_err(|err| win32_error("OpenProcessToken", &err))?;
        let token = ProcessHandle(token);

        let mut needed = 0u32;
        let _ = unsafe { GetTokenInformation(token.0, TokenUser, None, 0, &mut needed) };
        let mut buffer = vec![0u64; (needed as usize).div_ceil(8)];
        unsafe {
            GetTokenInformation(token.0, TokenUser, Some(buffer.as_mut_ptr().cast()), needed, &mut needed)
        }
        .map_err(|err| win32_error("GetTokenInformation", &err))?;
        let user = unsafe { &*buffer.as_ptr().cast::<TOKEN_USER>() };

        let access = EXPLICIT_ACCESS_W {
            grfAccessPermissions: EVENT_ALL_ACCESS.0,
            grfAccessMode: SET_ACCESS,
            grfInheritance: NO_INHERITANCE,
            Trustee: TRUSTEE_W {
                pMultipleTrustee: std::ptr::null_mut(),
                MultipleTrusteeOperation: NO_MULTIPLE_TRUSTEE,
                TrusteeForm: TRUSTEE_IS_SID,
                TrusteeType: TRUSTEE_IS_USER,
                ptstrName: PWSTR(user.User.Sid.0.cast()),
            },
        };
        let mut acl: *mut ACL = std::ptr::null_mut();
        let status = unsafe { SetEntriesInAclW(Some(&[access]), None, &mut acl) };
        if status.0 != 0 {
            #[allow(clippy::cast_possible_wrap)]
            return Err(ShimError::Os { api: "SetEntriesInAclW", code: status.0 as i32 });
        }
        Ok(DebuggeeAcl(acl))
    }
}

impl Drop for DebuggeeAcl
{
    fn drop(&mut self)
    {
        if !self.0.is_null() {
            let _ = unsafe { LocalFree(HLOCAL(self.0 as _)) };
        }
    }
}

/// Create the startup event for `pid`, or open the one a previous debugger
/// session left behind
///
/// ## Errors
///
/// - `Os` when either session id or the debuggee's user can't be read
/// - `Failed` when the event neither can be created nor opened
pub fn create_startup_event(pid: ProcessId) -> ShimResult<Win32Event>
{
    let name = startup_event_name(pid, session_of(ProcessId::current())?, session_of(pid)?);
    let wide = to_wide_str(&name);

    let process = ProcessHandle::open(pid, PROCESS_QUERY_INFORMATION)?;
    let acl = DebuggeeAcl::for_process(&process)?;
    let mut descriptor = SECURITY_DESCRIPTOR::default();
    let descriptor_ptr = PSECURITY_DESCRIPTOR(std::ptr::addr_of_mut!(descriptor).cast::<c_void>());
    unsafe {
        InitializeSecurityDescriptor(descriptor_ptr, SECURITY_DESCRIPTOR_REVISION)
            .map_err(|err| win32_error("InitializeSecurityDescriptor", &err))?;
        SetSecurityDescriptorDacl(descriptor_ptr, true, Some(acl.0), false)
            .map_err(|err| win32_error("SetSecurityDescriptorDacl", &err))?;
    }
    #[allow(clippy::cast_possible_truncation)]
    let attributes = SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: descriptor_ptr.0,
        bInheritHandle: false.into(),
    };

    let created = unsafe { CreateEventW(Some(&attributes), false, false, PCWSTR::from_raw(wide.as_ptr())) };
    let handle = match created {
        Ok(handle) => handle,
        Err(err) if err.code().0 == hresult::from_win32(hresult::ERROR_ALREADY_EXISTS) => {
            unsafe { OpenEventW(SYNCHRONIZATION_SYNCHRONIZE, false, PCWSTR::from_raw(wide.as_ptr())) }
                .map_err(|_| ShimError::Failed(format!("cannot open existing event {name}")))?
        }
        Err(err) => {
            tracing::debug!(%name, code = err.code().0, "CreateEventW failed");
            return Err(ShimError::Failed(format!("cannot create event {name}")));
        }
    };
    tracing::debug!(pid = pid.0, %name, "startup event ready");
    Ok(Win32Event { handle: handle.0 as usize })
}

/// Windows host over the process-status and debug APIs
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsHost;

impl WindowsHost
{
    pub fn new() -> Self
    {
        WindowsHost
    }
}

impl ProcessHost for WindowsHost
{
    fn modules(&self, pid: ProcessId) -> ShimResult<Vec<LoadedModule>>
    {
        let process = ProcessHandle::open(pid, PROCESS_QUERY_INFORMATION | PROCESS_VM_READ)?;
        let handles = enumerate_with_retry(|slots: &mut [HMODULE]| {
            let bytes = u32::try_from(std::mem::size_of_val(slots)).unwrap_or(u32::MAX);
            let mut needed = 0u32;
            unsafe { EnumProcessModules(process.0, slots.as_mut_ptr(), bytes, &mut needed) }
                .map_err(|err| win32_error("EnumProcessModules", &err))?;
            Ok(needed as usize / std::mem::size_of::<HMODULE>())
        })?;

        let mut path = vec![0u16; MAX_LONGPATH];
        let mut modules = Vec::with_capacity(handles.len());
        for module in handles {
            let len = unsafe { GetModuleFileNameExW(process.0, module, &mut path) } as usize;
            if len == 0 {
                continue;
            }
            let text = String::from_utf16_lossy(&path[..len.min(MAX_LONGPATH - 1)]);
            modules.push(LoadedModule::new(Address::new(module.0 as u64), PathBuf::from(text)));
        }
        Ok(modules)
    }

    fn read_memory(&self, pid: ProcessId, address: Address, buffer: &mut [u8]) -> ShimResult<usize>
    {
        let process = ProcessHandle::open(pid, PROCESS_VM_READ)?;
        let mut read = 0usize;
        unsafe {
            ReadProcessMemory(
                process.0,
                address.value() as usize as *const c_void,
                buffer.as_mut_ptr().cast(),
                buffer.len(),
                Some(&mut read),
            )
        }
        .map_err(|err| match win32_error("ReadProcessMemory", &err) {
            ShimError::PartialCopy(_) => ShimError::PartialCopy(address.value()),
            other => other,
        })?;
        Ok(read)
    }

    fn startup_event(&self, pid: ProcessId) -> ShimResult<Arc<dyn NotifyEvent>>
    {
        Ok(Arc::new(create_startup_event(pid)?))
    }

    fn continue_event(&self, pid: ProcessId, handle: u64) -> ShimResult<Arc<dyn NotifyEvent>>
    {
        let process = ProcessHandle::open(pid, PROCESS_DUP_HANDLE)?;
        let mut local = HANDLE::default();
        unsafe {
            DuplicateHandle(
                process.0,
                HANDLE(handle as _),
                GetCurrentProcess(),
                &mut local,
                EVENT_MODIFY_STATE.0,
                false,
                DUPLICATE_HANDLE_OPTIONS(0),
            )
        }
        .map_err(|err| win32_error("DuplicateHandle", &err))?;
        Ok(Arc::new(Win32Event { handle: local.0 as usize }))
    }
}
