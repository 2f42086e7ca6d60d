//! `ICorDebugDataTarget` in both directions.

use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, Ordering};

use super::{ComObject, IUnknownVtbl};
use crate::error::{hresult, ShimError, ShimResult};
use crate::target::DataTarget;
use crate::types::guid::{IID_ICOR_DEBUG_DATA_TARGET, IID_IUNKNOWN};
use crate::types::{Address, Guid, Platform};

#[repr(C)]
pub struct ICorDebugDataTargetVtbl
{
    pub base: IUnknownVtbl,
    pub get_platform: unsafe extern "system" fn(*mut c_void, *mut u32) -> i32,
    pub read_virtual: unsafe extern "system" fn(*mut c_void, u64, *mut u8, u32, *mut u32) -> i32,
    pub get_thread_context: unsafe extern "system" fn(*mut c_void, u32, u32, u32, *mut u8) -> i32,
}

/// A native `ICorDebugDataTarget` used as a [`DataTarget`]
#[derive(Debug, Clone)]
pub struct NativeDataTarget
{
    object: ComObject,
}

impl NativeDataTarget
{
    /// `QueryInterface` `object` for the data-target interface
    pub fn query(object: &ComObject) -> Option<Self>
    {
        object.query_interface(&IID_ICOR_DEBUG_DATA_TARGET).map(|object| NativeDataTarget { object })
    }

    pub fn object(&self) -> &ComObject
    {
        &self.object
    }

    fn vtable(&self) -> &ICorDebugDataTargetVtbl
    {
        unsafe { self.object.vtable::<ICorDebugDataTargetVtbl>() }
    }
}

impl DataTarget for NativeDataTarget
{
    fn platform(&self) -> ShimResult<Platform>
    {
        let mut raw = 0u32;
        let hr = unsafe { (self.vtable().get_platform)(self.object.as_raw(), &mut raw) };
        if hresult::failed(hr) {
            return Err(ShimError::from_hresult(hr));
        }
        Platform::from_raw(raw).ok_or_else(|| ShimError::Failed(format!("unknown target platform {raw}")))
    }

    fn read_virtual(&self, address: Address, buffer: &mut [u8]) -> ShimResult<usize>
    {
        let len = u32::try_from(buffer.len()).unwrap_or(u32::MAX);
        let mut read = 0u32;
        let hr = unsafe {
            (self.vtable().read_virtual)(self.object.as_raw(), address.value(), buffer.as_mut_ptr(), len, &mut read)
        };
        if hresult::failed(hr) {
            tracing::trace!(%address, hr, "native data target read failed");
            return Err(match ShimError::from_hresult(hr) {
                ShimError::PartialCopy(_) => ShimError::PartialCopy(address.value()),
                other => other,
            });
        }
        Ok((read as usize).min(buffer.len()))
    }
}

/// A Rust [`DataTarget`] exposed as a native `ICorDebugDataTarget`
///
/// This is what a DBI entry point receives when the debugger drives the
/// shim from Rust.
#[repr(C)]
pub struct ComDataTarget
{
    vtbl: *const ICorDebugDataTargetVtbl,
    refs: AtomicU32,
    target: Box<dyn DataTarget>,
}

static COM_DATA_TARGET_VTBL: ICorDebugDataTargetVtbl = ICorDebugDataTargetVtbl {
    base: IUnknownVtbl { query_interface, add_ref, release },
    get_platform,
    read_virtual,
    get_thread_context,
};

impl ComDataTarget
{
    /// Wrap `target` in a new COM object holding one reference
    pub fn create(target: impl DataTarget + 'static) -> ComObject
    {
        let object = Box::new(ComDataTarget {
            vtbl: &COM_DATA_TARGET_VTBL,
            refs: AtomicU32::new(1),
            target: Box::new(target),
        });
        let raw = Box::into_raw(object).cast::<c_void>();
        // A fresh box is never null.
        match unsafe { ComObject::from_raw(raw) } {
            Some(object) => object,
            None => unreachable!("Box::into_raw returned null"),
        }
    }
}

unsafe fn this<'a>(raw: *mut c_void) -> &'a ComDataTarget
{
    unsafe { &*(raw as *const ComDataTarget) }
}

unsafe extern "system" fn query_interface(raw: *mut c_void, iid: *const Guid, out: *mut *mut c_void) -> i32
{
    if out.is_null() || iid.is_null() {
        return hresult::E_POINTER;
    }
    let iid = unsafe { &*iid };
    if *iid == IID_IUNKNOWN || *iid == IID_ICOR_DEBUG_DATA_TARGET {
        unsafe {
            add_ref(raw);
            *out = raw;
        }
        return hresult::S_OK;
    }
    unsafe { *out = std::ptr::null_mut() };
    hresult::E_NOINTERFACE
}

unsafe extern "system" fn add_ref(raw: *mut c_void) -> u32
{
    unsafe { this(raw) }.refs.fetch_add(1, Ordering::SeqCst) + 1
}

unsafe extern "system" fn release(raw: *mut c_void) -> u32
{
    let count = unsafe { this(raw) }.refs.fetch_sub(1, Ordering::SeqCst) - 1;
    if count == 0 {
        drop(unsafe { Box::from_raw(raw.cast::<ComDataTarget>()) });
    }
    count
}

unsafe extern "system" fn get_platform(raw: *mut c_void, platform: *mut u32) -> i32
{
    if platform.is_null() {
        return hresult::E_POINTER;
    }
    match unsafe { this(raw) }.target.platform() {
        Ok(value) => {
            unsafe { *platform = value as u32 };
            hresult::S_OK
        }
        Err(err) => err.hresult(),
    }
}

unsafe extern "system" fn read_virtual(raw: *mut c_void, address: u64, buffer: *mut u8, len: u32, read: *mut u32) -> i32
{
    if buffer.is_null() && len != 0 {
        return hresult::E_POINTER;
    }
    let buffer = if len == 0 { &mut [][..] } else { unsafe { std::slice::from_raw_parts_mut(buffer, len as usize) } };
    match unsafe { this(raw) }.target.read_virtual(Address::new(address), buffer) {
        Ok(count) => {
            if !read.is_null() {
                unsafe { *read = u32::try_from(count).unwrap_or(len) };
            }
            hresult::S_OK
        }
        Err(err) => err.hresult(),
    }
}

unsafe extern "system" fn get_thread_context(_raw: *mut c_void, _thread: u32, _flags: u32, _size: u32, _context: *mut u8) -> i32
{
    hresult::E_NOTIMPL
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::interop::fake;
    use crate::target::MemoryTarget;

    #[test]
    fn test_rust_target_through_com()
    {
        let target = MemoryTarget::new(Platform::PosixArm64).with_region(Address::new(0x1000), vec![1, 2, 3, 4]);
        let object = ComDataTarget::create(target);
        let native = NativeDataTarget::query(&object).unwrap();

        assert_eq!(native.platform().unwrap(), Platform::PosixArm64);
        assert_eq!(native.read_u32(Address::new(0x1000)).unwrap(), 0x0403_0201);
        assert!(native.read_u32(Address::new(0x2000)).is_err());
    }

    #[test]
    fn test_object_without_data_target_interface()
    {
        let (raw, _refs) = fake::create();
        let object = unsafe { ComObject::from_raw(raw) }.unwrap();
        assert!(NativeDataTarget::query(&object).is_none());
    }
}
