//! Runtime startup registration.

use std::ffi::c_void;
use std::ptr;
use std::sync::Arc;

use clrshim_core::error::hresult;
use clrshim_core::interop::{ComObject, NativeLibraryProvider};
use clrshim_core::loader::from_wide_ptr;
use clrshim_core::{LibraryProvider, ProcessId, Registration, ShimError};

use crate::export::{ffi_call, invalid, shim, write_out};

/// `PSTARTUP_CALLBACK`: receives the debugger object (owned) or a failure HRESULT
pub type StartupCallbackFn = unsafe extern "C" fn(cordb: *mut c_void, parameter: *mut c_void, hr: i32);

/// The caller's opaque callback parameter, carried to the shim thread
struct CallbackParameter(*mut c_void);

// The pointer is only handed back to the caller's callback.
unsafe impl Send for CallbackParameter {}

impl CallbackParameter
{
    fn into_inner(self) -> *mut c_void
    {
        self.0
    }
}

unsafe fn register(
    entry: &'static str,
    pid: u32,
    group_id: *const u16,
    provider: *mut c_void,
    callback: Option<StartupCallbackFn>,
    parameter: *mut c_void,
    token: *mut *mut c_void,
) -> i32
{
    ffi_call(entry, || {
        if token.is_null() {
            return Err(invalid("unregister token"));
        }
        unsafe { token.write(ptr::null_mut()) };
        let callback = callback.ok_or_else(|| invalid("startup callback"))?;

        let group_id = unsafe { from_wide_ptr(group_id) };
        let provider = unsafe { ComObject::from_borrowed(provider) }
            .map(|object| Arc::new(NativeLibraryProvider::new(object)) as Arc<dyn LibraryProvider>);
        let parameter = CallbackParameter(parameter);

        let registration =
            shim()?.register_for_runtime_startup(ProcessId(pid), group_id.as_deref(), provider, move |result| {
                let parameter = parameter.into_inner();
                match result {
                    Ok(cordb) => unsafe { callback(cordb.into_raw(), parameter, hresult::S_OK) },
                    Err(err) => unsafe { callback(ptr::null_mut(), parameter, err.hresult()) },
                }
            })?;
        unsafe { token.write(Box::into_raw(Box::new(registration)).cast()) };
        Ok(())
    })
}

/// `RegisterForRuntimeStartup`
///
/// # Safety
///
/// `token` must be writable; `callback` must stay callable until it has run
/// or the token has been unregistered.
#[no_mangle]
pub unsafe extern "C" fn RegisterForRuntimeStartup(
    process_id: u32,
    callback: Option<StartupCallbackFn>,
    parameter: *mut c_void,
    token: *mut *mut c_void,
) -> i32
{
    unsafe {
        register(
            "RegisterForRuntimeStartup",
            process_id,
            ptr::null(),
            ptr::null_mut(),
            callback,
            parameter,
            token,
        )
    }
}

/// `RegisterForRuntimeStartupEx`, for runtimes in an application group
///
/// # Safety
///
/// As [`RegisterForRuntimeStartup`]; `group_id` is null or a NUL-terminated
/// wide string.
#[no_mangle]
pub unsafe extern "C" fn RegisterForRuntimeStartupEx(
    process_id: u32,
    group_id: *const u16,
    callback: Option<StartupCallbackFn>,
    parameter: *mut c_void,
    token: *mut *mut c_void,
) -> i32
{
    unsafe {
        register("RegisterForRuntimeStartupEx", process_id, group_id, ptr::null_mut(), callback, parameter, token)
    }
}

/// `RegisterForRuntimeStartup3`, locating the DBI and DAC through `library_provider`
///
/// # Safety
///
/// As [`RegisterForRuntimeStartupEx`]; `library_provider` is null or a live
/// library provider object.
#[no_mangle]
pub unsafe extern "C" fn RegisterForRuntimeStartup3(
    process_id: u32,
    group_id: *const u16,
    library_provider: *mut c_void,
    callback: Option<StartupCallbackFn>,
    parameter: *mut c_void,
    token: *mut *mut c_void,
) -> i32
{
    unsafe {
        register("RegisterForRuntimeStartup3", process_id, group_id, library_provider, callback, parameter, token)
    }
}

/// `UnregisterForRuntimeStartup`; a null token is accepted
///
/// # Safety
///
/// `token` must be null or a token from a registration call, used once.
#[no_mangle]
pub unsafe extern "C" fn UnregisterForRuntimeStartup(token: *mut c_void) -> i32
{
    ffi_call("UnregisterForRuntimeStartup", || {
        if !token.is_null() {
            let registration = unsafe { Box::from_raw(token.cast::<Registration>()) };
            registration.unregister();
        }
        Ok(())
    })
}

/// `GetStartupNotificationEvent`: the named event a starting runtime signals
///
/// The caller owns the returned handle. Only Windows has named kernel
/// events; elsewhere this reports `E_NOTIMPL`.
///
/// # Safety
///
/// `event` must be null or writable.
#[no_mangle]
pub unsafe extern "C" fn GetStartupNotificationEvent(process_id: u32, event: *mut *mut c_void) -> i32
{
    ffi_call("GetStartupNotificationEvent", || {
        if event.is_null() {
            return Err(invalid("event"));
        }
        let handle = startup_event_handle(ProcessId(process_id))?;
        unsafe { write_out(event, handle as *mut c_void) };
        Ok(())
    })
}

#[cfg(windows)]
fn startup_event_handle(pid: ProcessId) -> Result<usize, ShimError>
{
    Ok(clrshim_core::host::create_startup_event(pid)?.into_raw())
}

#[cfg(not(windows))]
fn startup_event_handle(_pid: ProcessId) -> Result<usize, ShimError>
{
    Err(ShimError::NotImplemented("named startup events"))
}
