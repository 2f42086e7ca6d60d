//! `EnumerateCLRs` / `CloseCLREnumeration`.
//!
//! One allocation holds both arrays: `n` continue-event handles followed by
//! `n` module path pointers, so the string array always starts at
//! `handles + n`. The runtime instances (which own the events) and the wide
//! path strings stay in a table keyed by the handle array until the caller
//! closes the enumeration.

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr;
use std::sync::{Mutex, PoisonError};

#[cfg(test)]
use clrshim_core::error::hresult;
use clrshim_core::host::RuntimeInstance;
use clrshim_core::loader::to_wide;
use clrshim_core::{ProcessId, ShimError};
use once_cell::sync::Lazy;
use tracing::debug;

use crate::export::{ffi_call, invalid, shim};

struct Enumeration
{
    slots: Vec<usize>,
    _paths: Vec<Vec<u16>>,
    _runtimes: Vec<RuntimeInstance>,
}

static OPEN: Lazy<Mutex<HashMap<usize, Enumeration>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn publish(runtimes: Vec<RuntimeInstance>) -> (*mut *mut c_void, *mut *mut u16, u32)
{
    if runtimes.is_empty() {
        return (ptr::null_mut(), ptr::null_mut(), 0);
    }
    let count = runtimes.len();
    let mut paths: Vec<Vec<u16>> = runtimes.iter().map(|r| to_wide(&r.module.path)).collect();
    let mut slots: Vec<usize> = runtimes.iter().map(|r| r.continue_event.raw_handle()).collect();
    slots.extend(paths.iter_mut().map(|p| p.as_mut_ptr() as usize));

    // Moving the vectors into the table doesn't move their heap buffers.
    let handles = slots.as_mut_ptr();
    let key = handles as usize;
    OPEN.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(key, Enumeration { slots, _paths: paths, _runtimes: runtimes });
    let strings = unsafe { handles.add(count) };
    (handles.cast(), strings.cast(), u32::try_from(count).unwrap_or(u32::MAX))
}

/// `EnumerateCLRs`: the runtimes loaded in `process_id`
///
/// Each handle is the runtime's continue event: `NULL` when the runtime
/// waits for no debugger, `INVALID_HANDLE_VALUE` while it hasn't created
/// the event yet. Release both arrays with [`CloseCLREnumeration`].
///
/// # Safety
///
/// The three out-parameters must be null or writable.
#[no_mangle]
pub unsafe extern "C" fn EnumerateCLRs(
    process_id: u32,
    handle_array: *mut *mut *mut c_void,
    string_array: *mut *mut *mut u16,
    array_length: *mut u32,
) -> i32
{
    ffi_call("EnumerateCLRs", || {
        if handle_array.is_null() || string_array.is_null() || array_length.is_null() {
            return Err(invalid("enumeration out-parameters"));
        }
        unsafe {
            handle_array.write(ptr::null_mut());
            string_array.write(ptr::null_mut());
            array_length.write(0);
        }

        let runtimes = shim()?.enumerate_clrs(ProcessId(process_id))?;
        debug!(pid = process_id, count = runtimes.len(), "enumerated runtimes");
        let (handles, strings, length) = publish(runtimes);
        unsafe {
            handle_array.write(handles);
            string_array.write(strings);
            array_length.write(length);
        }
        Ok(())
    })
}

/// `CloseCLREnumeration`: release what [`EnumerateCLRs`] returned
///
/// # Safety
///
/// The arguments must be exactly what one `EnumerateCLRs` call produced.
#[no_mangle]
pub unsafe extern "C" fn CloseCLREnumeration(
    handle_array: *mut *mut c_void,
    string_array: *mut *mut u16,
    array_length: u32,
) -> i32
{
    ffi_call("CloseCLREnumeration", || {
        if handle_array.is_null() {
            return Ok(());
        }
        let expected = (handle_array as usize).wrapping_add(array_length as usize * std::mem::size_of::<usize>());
        if string_array as usize != expected {
            return Err(invalid("string array does not follow the handle array"));
        }
        let closed = OPEN.lock().unwrap_or_else(PoisonError::into_inner).remove(&(handle_array as usize));
        let Some(enumeration) = closed else {
            return Err(ShimError::InvalidArgument("unknown enumeration".to_string()));
        };
        debug!(count = enumeration.slots.len() / 2, "closed enumeration");
        Ok(())
    })
}

#[cfg(test)]
mod tests
{
    use std::path::PathBuf;

    use clrshim_core::startup::ContinueEvent;
    use clrshim_core::types::{Address, ClrInfo, EngineMetrics, LoadedModule};

    use super::*;

    fn instance(path: &str, event: ContinueEvent) -> RuntimeInstance
    {
        RuntimeInstance {
            module: LoadedModule { base: Address::new(0x7f00_0000), path: PathBuf::from(path) },
            engine: EngineMetrics::default(),
            info: ClrInfo::default(),
            continue_event: event,
        }
    }

    #[test]
    fn test_enumerate_requires_out_pointers()
    {
        let mut length = 7;
        let hr = unsafe { EnumerateCLRs(1, ptr::null_mut(), ptr::null_mut(), &mut length) };
        assert_eq!(hr, hresult::E_INVALIDARG);
    }

    #[test]
    fn test_close_null_is_ok()
    {
        assert_eq!(unsafe { CloseCLREnumeration(ptr::null_mut(), ptr::null_mut(), 0) }, hresult::S_OK);
    }

    #[test]
    fn test_published_arrays_are_contiguous()
    {
        let runtimes = vec![
            instance("/usr/share/dotnet/shared/Microsoft.NETCore.App/8.0.5/libcoreclr.so", ContinueEvent::Absent),
            instance("/opt/app/libcoreclr.so", ContinueEvent::Pending),
        ];
        let (handles, strings, length) = publish(runtimes);
        assert_eq!(length, 2);
        assert_eq!(strings as usize, handles as usize + 2 * std::mem::size_of::<usize>());
        unsafe {
            assert_eq!(*handles as usize, 0);
            assert_eq!(*handles.add(1) as usize, usize::MAX);
            let second = clrshim_core::loader::from_wide_ptr(*strings.add(1));
            assert_eq!(second.as_deref(), Some("/opt/app/libcoreclr.so"));
        }

        let hr = unsafe { CloseCLREnumeration(handles, strings.wrapping_add(1), length) };
        assert_eq!(hr, hresult::E_INVALIDARG);
        assert_eq!(unsafe { CloseCLREnumeration(handles, strings, length) }, hresult::S_OK);
        assert_eq!(unsafe { CloseCLREnumeration(handles, strings, length) }, hresult::E_INVALIDARG);
    }

    #[test]
    fn test_no_runtimes_publishes_nothing()
    {
        let (handles, strings, length) = publish(Vec::new());
        assert!(handles.is_null() && strings.is_null());
        assert_eq!(length, 0);
    }
}
