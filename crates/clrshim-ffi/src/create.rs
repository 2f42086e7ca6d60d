//! Version strings and debugger object creation.

use std::ffi::{c_char, c_void, CStr};
use std::path::{Path, PathBuf};
use std::ptr;

use clrshim_core::interop::{ComObject, NativeLibraryProvider};
use clrshim_core::loader::from_wide_ptr;
use clrshim_core::version_string::VERSION_STRING_BUFFER_LEN;
use clrshim_core::{CorDebugInterfaceVersion, LibraryProvider, ProcessId, ShimError, ShimResult};

use crate::export::{ffi_call, invalid, shim, write_out};

/// `CreateVersionStringFromModule`
///
/// Pass a null buffer and zero length to learn the required length through
/// `length`. The module is matched against the full paths of the modules
/// loaded in `process_id`.
///
/// # Safety
///
/// `module_name` is a NUL-terminated wide string; `buffer` holds
/// `buffer_length` characters; `length` is null or writable.
#[no_mangle]
pub unsafe extern "C" fn CreateVersionStringFromModule(
    process_id: u32,
    module_name: *const u16,
    buffer: *mut u16,
    buffer_length: u32,
    length: *mut u32,
) -> i32
{
    ffi_call("CreateVersionStringFromModule", || {
        let module = unsafe { from_wide_ptr(module_name) }.ok_or_else(|| invalid("module name"))?;
        if buffer.is_null() != (buffer_length == 0) {
            return Err(invalid("buffer and length disagree"));
        }
        let required = VERSION_STRING_BUFFER_LEN as u32;
        unsafe { write_out(length, required) };
        if buffer_length < required {
            return Err(ShimError::InsufficientBuffer { required: VERSION_STRING_BUFFER_LEN });
        }

        let token = shim()?.create_version_string(ProcessId(process_id), Path::new(&module))?;
        let buffer = unsafe { std::slice::from_raw_parts_mut(buffer, buffer_length as usize) };
        token.write_wide(buffer)?;
        Ok(())
    })
}

unsafe fn create(
    entry: &'static str,
    debugger_version: i32,
    version_string: *const u16,
    group_id: *const u16,
    library_provider: *mut c_void,
    cordb: *mut *mut c_void,
) -> i32
{
    ffi_call(entry, || {
        if cordb.is_null() {
            return Err(invalid("debugger object"));
        }
        unsafe { cordb.write(ptr::null_mut()) };
        let version_string = unsafe { from_wide_ptr(version_string) }.ok_or_else(|| invalid("version string"))?;
        let group_id = unsafe { from_wide_ptr(group_id) };
        let provider = unsafe { ComObject::from_borrowed(library_provider) }.map(NativeLibraryProvider::new);

        let object = shim()?.create_debugging_interface_from_version3(
            CorDebugInterfaceVersion(debugger_version),
            &version_string,
            group_id.as_deref(),
            provider.as_ref().map(|p| p as &dyn LibraryProvider),
        )?;
        unsafe { cordb.write(object.into_raw()) };
        Ok(())
    })
}

/// `CreateDebuggingInterfaceFromVersion`: an `ICorDebug` speaking v2.0
///
/// # Safety
///
/// `version_string` is a NUL-terminated wide string; `cordb` is writable.
#[no_mangle]
pub unsafe extern "C" fn CreateDebuggingInterfaceFromVersion(version_string: *const u16, cordb: *mut *mut c_void) -> i32
{
    unsafe {
        create(
            "CreateDebuggingInterfaceFromVersion",
            CorDebugInterfaceVersion::V2_0.0,
            version_string,
            ptr::null(),
            ptr::null_mut(),
            cordb,
        )
    }
}

/// `CreateDebuggingInterfaceFromVersionEx`
///
/// # Safety
///
/// See [`CreateDebuggingInterfaceFromVersion`].
#[no_mangle]
pub unsafe extern "C" fn CreateDebuggingInterfaceFromVersionEx(
    debugger_version: i32,
    version_string: *const u16,
    cordb: *mut *mut c_void,
) -> i32
{
    unsafe {
        create(
            "CreateDebuggingInterfaceFromVersionEx",
            debugger_version,
            version_string,
            ptr::null(),
            ptr::null_mut(),
            cordb,
        )
    }
}

/// `CreateDebuggingInterfaceFromVersion2`, for runtimes in an application group
///
/// # Safety
///
/// See [`CreateDebuggingInterfaceFromVersion`]; `group_id` is null or a
/// NUL-terminated wide string.
#[no_mangle]
pub unsafe extern "C" fn CreateDebuggingInterfaceFromVersion2(
    debugger_version: i32,
    version_string: *const u16,
    group_id: *const u16,
    cordb: *mut *mut c_void,
) -> i32
{
    unsafe {
        create(
            "CreateDebuggingInterfaceFromVersion2",
            debugger_version,
            version_string,
            group_id,
            ptr::null_mut(),
            cordb,
        )
    }
}

/// `CreateDebuggingInterfaceFromVersion3`, with a library provider
///
/// # Safety
///
/// See [`CreateDebuggingInterfaceFromVersion2`]; `library_provider` is null
/// or a live library provider object.
#[no_mangle]
pub unsafe extern "C" fn CreateDebuggingInterfaceFromVersion3(
    debugger_version: i32,
    version_string: *const u16,
    group_id: *const u16,
    library_provider: *mut c_void,
    cordb: *mut *mut c_void,
) -> i32
{
    unsafe {
        create(
            "CreateDebuggingInterfaceFromVersion3",
            debugger_version,
            version_string,
            group_id,
            library_provider,
            cordb,
        )
    }
}

unsafe fn narrow(text: *const c_char, what: &str) -> ShimResult<String>
{
    if text.is_null() {
        return Err(invalid(what));
    }
    unsafe { CStr::from_ptr(text) }.to_str().map(str::to_string).map_err(|_| invalid(what))
}

/// `RegisterForRuntimeStartupRemotePort`: a debugger object for a runtime
/// reachable through `port`
///
/// # Safety
///
/// Both paths are NUL-terminated strings; `cordb` is writable.
#[no_mangle]
pub unsafe extern "C" fn RegisterForRuntimeStartupRemotePort(
    port: u32,
    dbi_path: *const c_char,
    assembly_base_path: *const c_char,
    cordb: *mut *mut c_void,
) -> i32
{
    ffi_call("RegisterForRuntimeStartupRemotePort", || {
        if cordb.is_null() {
            return Err(invalid("debugger object"));
        }
        unsafe { cordb.write(ptr::null_mut()) };
        let dbi_path = PathBuf::from(unsafe { narrow(dbi_path, "DBI path") }?);
        let base_path = unsafe { narrow(assembly_base_path, "assembly base path") }?;

        let object = shim()?.register_for_runtime_startup_remote_port(port, &dbi_path, &base_path)?;
        unsafe { cordb.write(object.into_raw()) };
        Ok(())
    })
}

#[cfg(test)]
mod tests
{
    use clrshim_core::error::hresult;
    use clrshim_core::loader::to_wide_str;

    use super::*;

    #[test]
    fn test_version_string_length_query()
    {
        let module = to_wide_str("/usr/share/dotnet/libcoreclr.so");
        let mut length = 0;
        let hr = unsafe { CreateVersionStringFromModule(1, module.as_ptr(), ptr::null_mut(), 0, &mut length) };
        assert_eq!(hr, hresult::from_win32(hresult::ERROR_INSUFFICIENT_BUFFER));
        assert_eq!(length as usize, VERSION_STRING_BUFFER_LEN);
    }

    #[test]
    fn test_version_string_buffer_and_length_must_agree()
    {
        let module = to_wide_str("libcoreclr.so");
        let mut buffer = [0u16; 64];
        let hr = unsafe { CreateVersionStringFromModule(1, module.as_ptr(), buffer.as_mut_ptr(), 0, ptr::null_mut()) };
        assert_eq!(hr, hresult::E_INVALIDARG);
        let hr = unsafe { CreateVersionStringFromModule(1, module.as_ptr(), ptr::null_mut(), 64, ptr::null_mut()) };
        assert_eq!(hr, hresult::E_INVALIDARG);
    }

    #[test]
    fn test_version_string_requires_module()
    {
        let mut buffer = [0u16; 64];
        let hr = unsafe { CreateVersionStringFromModule(1, ptr::null(), buffer.as_mut_ptr(), 64, ptr::null_mut()) };
        assert_eq!(hr, hresult::E_INVALIDARG);
    }

    #[test]
    fn test_create_requires_arguments()
    {
        let version = to_wide_str("00000004;00001267;00007FF812340000");
        assert_eq!(unsafe { CreateDebuggingInterfaceFromVersion(version.as_ptr(), ptr::null_mut()) }, hresult::E_INVALIDARG);

        let mut cordb = 0x10 as *mut c_void;
        assert_eq!(unsafe { CreateDebuggingInterfaceFromVersion(ptr::null(), &mut cordb) }, hresult::E_INVALIDARG);
        assert!(cordb.is_null());
    }

    #[test]
    fn test_remote_port_requires_paths()
    {
        let mut cordb = ptr::null_mut();
        let base = b"/tmp/app\0";
        let hr = unsafe { RegisterForRuntimeStartupRemotePort(4711, ptr::null(), base.as_ptr().cast(), &mut cordb) };
        assert_eq!(hr, hresult::E_INVALIDARG);
        assert!(cordb.is_null());
    }
}
