//! `CLRCreateInstance` and the native `ICLRDebugging` object it hands out.

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use clrshim_core::error::hresult;
use clrshim_core::interop::{ComObject, IUnknownVtbl, NativeLibraryProvider};
use clrshim_core::loader::ModuleHandle;
use clrshim_core::types::guid::{IID_ICLR_DEBUGGING, IID_IUNKNOWN};
use clrshim_core::types::{Address, ClrDebuggingVersion, Guid};
use clrshim_core::{clr_create_instance, ClrDebugging, LibraryProvider, OpenVirtualProcessArgs, ShimError};

use crate::export::ffi_call;

#[repr(C)]
pub struct ICLRDebuggingVtbl
{
    pub base: IUnknownVtbl,
    pub open_virtual_process: unsafe extern "system" fn(
        this: *mut c_void,
        module_base: u64,
        data_target: *mut c_void,
        library_provider: *mut c_void,
        max_debugger_supported_version: *const ClrDebuggingVersion,
        riid_process: *const Guid,
        process: *mut *mut c_void,
        version: *mut ClrDebuggingVersion,
        flags: *mut u32,
    ) -> i32,
    pub can_unload_now: unsafe extern "system" fn(this: *mut c_void, module: *mut c_void) -> i32,
}

#[repr(C)]
struct NativeClrDebugging
{
    vtable: &'static ICLRDebuggingVtbl,
    refs: AtomicU32,
    facade: ClrDebugging,
}

static VTABLE: ICLRDebuggingVtbl = ICLRDebuggingVtbl {
    base: IUnknownVtbl { query_interface, add_ref, release },
    open_virtual_process,
    can_unload_now,
};

impl NativeClrDebugging
{
    fn into_raw(facade: ClrDebugging) -> *mut c_void
    {
        let object = Box::new(NativeClrDebugging { vtable: &VTABLE, refs: AtomicU32::new(1), facade });
        Box::into_raw(object).cast()
    }

    unsafe fn from_this<'a>(this: *mut c_void) -> &'a NativeClrDebugging
    {
        unsafe { &*this.cast::<NativeClrDebugging>() }
    }
}

unsafe extern "system" fn query_interface(this: *mut c_void, iid: *const Guid, out: *mut *mut c_void) -> i32
{
    if iid.is_null() || out.is_null() {
        return hresult::E_POINTER;
    }
    let iid = unsafe { *iid };
    if iid != IID_IUNKNOWN && iid != IID_ICLR_DEBUGGING {
        unsafe { out.write(ptr::null_mut()) };
        return hresult::E_NOINTERFACE;
    }
    unsafe {
        add_ref(this);
        out.write(this);
    }
    hresult::S_OK
}

unsafe extern "system" fn add_ref(this: *mut c_void) -> u32
{
    unsafe { NativeClrDebugging::from_this(this) }.refs.fetch_add(1, Ordering::AcqRel) + 1
}

unsafe extern "system" fn release(this: *mut c_void) -> u32
{
    let remaining = unsafe { NativeClrDebugging::from_this(this) }.refs.fetch_sub(1, Ordering::AcqRel) - 1;
    if remaining == 0 {
        drop(unsafe { Box::from_raw(this.cast::<NativeClrDebugging>()) });
    }
    remaining
}

#[allow(clippy::too_many_arguments)]
unsafe extern "system" fn open_virtual_process(
    this: *mut c_void,
    module_base: u64,
    data_target: *mut c_void,
    library_provider: *mut c_void,
    max_debugger_supported_version: *const ClrDebuggingVersion,
    riid_process: *const Guid,
    process: *mut *mut c_void,
    version: *mut ClrDebuggingVersion,
    flags: *mut u32,
) -> i32
{
    ffi_call("ICLRDebugging::OpenVirtualProcess", || {
        if !process.is_null() {
            unsafe { process.write(ptr::null_mut()) };
        }
        let facade = &unsafe { NativeClrDebugging::from_this(this) }.facade;
        let data_target =
            unsafe { ComObject::from_borrowed(data_target) }.ok_or(ShimError::MissingDataTargetInterface)?;
        let provider = unsafe { ComObject::from_borrowed(library_provider) }.map(NativeLibraryProvider::new);
        let riid = if riid_process.is_null() { Guid::default() } else { unsafe { *riid_process } };

        let args = OpenVirtualProcessArgs {
            module_base: Address::new(module_base),
            data_target: &data_target,
            provider: provider.as_ref().map(|p| p as &dyn LibraryProvider),
            max_version: unsafe { max_debugger_supported_version.as_ref() }.copied(),
            riid: &riid,
            wants_process: !process.is_null(),
            wants_flags: !flags.is_null(),
            version_struct: unsafe { version.as_ref() }.map(|v| v.struct_version),
        };
        let opened = facade.open_virtual_process(&args)?;

        unsafe {
            if let Some(object) = opened.process {
                if process.is_null() {
                    drop(object);
                } else {
                    process.write(object.into_raw());
                }
            }
            if !flags.is_null() {
                flags.write(opened.flags);
            }
            if !version.is_null() {
                version.write(opened.version);
            }
        }
        Ok(())
    })
}

unsafe extern "system" fn can_unload_now(this: *mut c_void, module: *mut c_void) -> i32
{
    let facade = &unsafe { NativeClrDebugging::from_this(this) }.facade;
    match ModuleHandle::from_raw(module) {
        Some(handle) if facade.can_unload_now(handle) => hresult::S_OK,
        _ => hresult::S_FALSE,
    }
}

/// `CLRCreateInstance`: the `ICLRDebugging` object for `CLSID_CLRDebugging`
///
/// # Safety
///
/// `clsid` and `riid` point to GUIDs; `object` is writable.
#[no_mangle]
pub unsafe extern "system" fn CLRCreateInstance(clsid: *const Guid, riid: *const Guid, object: *mut *mut c_void) -> i32
{
    if object.is_null() {
        return hresult::E_POINTER;
    }
    unsafe { object.write(ptr::null_mut()) };
    ffi_call("CLRCreateInstance", || {
        if clsid.is_null() || riid.is_null() {
            return Err(ShimError::Pointer("class or interface id"));
        }
        let facade = clr_create_instance(unsafe { &*clsid }, unsafe { &*riid })?;
        unsafe { object.write(NativeClrDebugging::into_raw(facade)) };
        Ok(())
    })
}

#[cfg(test)]
mod tests
{
    use clrshim_core::interop::ComDataTarget;
    use clrshim_core::target::MemoryTarget;
    use clrshim_core::types::guid::{CLSID_CLR_DEBUGGING, IID_ICOR_DEBUG_PROCESS};
    use clrshim_core::types::Platform;

    use super::*;

    fn empty_target() -> ComObject
    {
        ComDataTarget::create(MemoryTarget::new(Platform::WindowsAmd64))
    }

    fn create() -> *mut c_void
    {
        let mut object = ptr::null_mut();
        let hr = unsafe { CLRCreateInstance(&CLSID_CLR_DEBUGGING, &IID_ICLR_DEBUGGING, &mut object) };
        assert_eq!(hr, hresult::S_OK);
        assert!(!object.is_null());
        object
    }

    fn vtable<'a>(object: *mut c_void) -> &'a ICLRDebuggingVtbl
    {
        unsafe { &**object.cast::<*const ICLRDebuggingVtbl>() }
    }

    #[test]
    fn test_create_instance_checks_ids()
    {
        assert_eq!(unsafe { CLRCreateInstance(&CLSID_CLR_DEBUGGING, &IID_ICLR_DEBUGGING, ptr::null_mut()) }, hresult::E_POINTER);

        let mut object = 0x20 as *mut c_void;
        let hr = unsafe { CLRCreateInstance(&IID_ICLR_DEBUGGING, &IID_ICLR_DEBUGGING, &mut object) };
        assert_eq!(hr, hresult::E_NOINTERFACE);
        assert!(object.is_null());
    }

    #[test]
    fn test_reference_counting_and_query_interface()
    {
        let object = create();
        let vtable = vtable(object);
        let mut unknown = ptr::null_mut();
        assert_eq!(unsafe { (vtable.base.query_interface)(object, &IID_IUNKNOWN, &mut unknown) }, hresult::S_OK);
        assert_eq!(unknown, object);

        let mut process = ptr::null_mut();
        let hr = unsafe { (vtable.base.query_interface)(object, &IID_ICOR_DEBUG_PROCESS, &mut process) };
        assert_eq!(hr, hresult::E_NOINTERFACE);
        assert!(process.is_null());

        assert_eq!(unsafe { (vtable.base.release)(object) }, 1);
        assert_eq!(unsafe { (vtable.base.release)(object) }, 0);
    }

    #[test]
    fn test_can_unload_now_is_false()
    {
        let object = create();
        let vtable = vtable(object);
        assert_eq!(unsafe { (vtable.can_unload_now)(object, 0x1000 as *mut c_void) }, hresult::S_FALSE);
        unsafe { (vtable.base.release)(object) };
    }

    #[test]
    fn test_open_requires_provider_for_process()
    {
        let object = create();
        let vtable = vtable(object);
        let target = empty_target();
        let max = ClrDebuggingVersion::new(8, 0, 0, 0);
        let mut process = 0x30 as *mut c_void;
        let hr = unsafe {
            (vtable.open_virtual_process)(
                object,
                0x1_8000_0000,
                target.as_raw(),
                ptr::null_mut(),
                &max,
                &IID_ICOR_DEBUG_PROCESS,
                &mut process,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        assert_eq!(hr, hresult::E_POINTER);
        assert!(process.is_null());
        unsafe { (vtable.base.release)(object) };
    }

    #[test]
    fn test_open_rejects_unknown_version_struct()
    {
        let object = create();
        let vtable = vtable(object);
        let target = empty_target();
        let mut version = ClrDebuggingVersion { struct_version: 1, ..ClrDebuggingVersion::default() };
        let hr = unsafe {
            (vtable.open_virtual_process)(
                object,
                0x1_8000_0000,
                target.as_raw(),
                ptr::null_mut(),
                ptr::null(),
                ptr::null(),
                ptr::null_mut(),
                &mut version,
                ptr::null_mut(),
            )
        };
        assert_eq!(hr, hresult::CORDBG_E_UNSUPPORTED_VERSION_STRUCT);
        assert_eq!(version.struct_version, 1);
        unsafe { (vtable.base.release)(object) };
    }
}
