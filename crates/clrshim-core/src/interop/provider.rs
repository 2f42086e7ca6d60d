//! A caller-supplied `ICLRDebuggingLibraryProvider{,2,3}` object.

use std::ffi::c_void;
use std::path::{Path, PathBuf};

use super::{ComObject, IUnknownVtbl};
use crate::error::{hresult, ShimError, ShimResult};
use crate::loader::{from_wide_ptr, to_wide, to_wide_str, ModuleHandle};
use crate::provider::{LibraryProvider, LibraryProviderV1, LibraryProviderV2, LibraryProviderV3};
use crate::types::guid::{
    IID_ICLR_DEBUGGING_LIBRARY_PROVIDER, IID_ICLR_DEBUGGING_LIBRARY_PROVIDER2, IID_ICLR_DEBUGGING_LIBRARY_PROVIDER3,
};
use crate::types::IndexType;

#[repr(C)]
pub struct ICLRDebuggingLibraryProviderVtbl
{
    pub base: IUnknownVtbl,
    pub provide_library: unsafe extern "system" fn(*mut c_void, *const u16, u32, u32, *mut *mut c_void) -> i32,
}

#[repr(C)]
pub struct ICLRDebuggingLibraryProvider2Vtbl
{
    pub base: IUnknownVtbl,
    pub provide_library2: unsafe extern "system" fn(*mut c_void, *const u16, u32, u32, *mut *mut u16) -> i32,
}

#[repr(C)]
pub struct ICLRDebuggingLibraryProvider3Vtbl
{
    pub base: IUnknownVtbl,
    pub provide_windows_library:
        unsafe extern "system" fn(*mut c_void, *const u16, *const u16, u32, u32, u32, *mut *mut u16) -> i32,
    pub provide_unix_library:
        unsafe extern "system" fn(*mut c_void, *const u16, *const u16, u32, *const u8, i32, *mut *mut u16) -> i32,
}

/// Release a path string a provider allocated for us
///
/// Providers allocate with `CoTaskMemAlloc` on Windows and `malloc`
/// elsewhere.
///
/// # Safety
///
/// `text` must be null or a string allocated the way described above.
pub unsafe fn free_provider_string(text: *mut u16)
{
    if text.is_null() {
        return;
    }
    #[cfg(windows)]
    unsafe {
        windows::Win32::System::Com::CoTaskMemFree(Some(text as *const c_void));
    }
    #[cfg(not(windows))]
    unsafe {
        libc::free(text.cast());
    }
}

/// Turn a provider's out-string into a path, releasing the string
fn take_path(hr: i32, text: *mut u16) -> ShimResult<Option<PathBuf>>
{
    let path = unsafe { from_wide_ptr(text) }.map(PathBuf::from);
    unsafe { free_provider_string(text) };
    if hresult::failed(hr) {
        return Err(ShimError::from_hresult(hr));
    }
    Ok(path)
}

fn wide_or_null(path: Option<&Path>) -> Option<Vec<u16>>
{
    path.map(to_wide)
}

struct NativeProviderV3(ComObject);
struct NativeProviderV2(ComObject);
struct NativeProviderV1(ComObject);

impl LibraryProviderV3 for NativeProviderV3
{
    fn provide_windows_library(
        &self,
        name: &str,
        runtime_module_path: Option<&Path>,
        index_type: IndexType,
        timestamp: u32,
        size_of_image: u32,
    ) -> ShimResult<Option<PathBuf>>
    {
        let vtable = unsafe { self.0.vtable::<ICLRDebuggingLibraryProvider3Vtbl>() };
        let name = to_wide_str(name);
        let runtime = wide_or_null(runtime_module_path);
        let mut out = std::ptr::null_mut();
        let hr = unsafe {
            (vtable.provide_windows_library)(
                self.0.as_raw(),
                name.as_ptr(),
                runtime.as_ref().map_or(std::ptr::null(), |w| w.as_ptr()),
                index_type as u32,
                timestamp,
                size_of_image,
                &mut out,
            )
        };
        take_path(hr, out)
    }

    fn provide_unix_library(
        &self,
        name: &str,
        runtime_module_path: Option<&Path>,
        index_type: IndexType,
        build_id: Option<&[u8]>,
    ) -> ShimResult<Option<PathBuf>>
    {
        let vtable = unsafe { self.0.vtable::<ICLRDebuggingLibraryProvider3Vtbl>() };
        let name = to_wide_str(name);
        let runtime = wide_or_null(runtime_module_path);
        let (bytes, len) = build_id.map_or((std::ptr::null(), 0), |id| (id.as_ptr(), id.len()));
        let len = i32::try_from(len).map_err(|_| ShimError::InvalidArgument("build id too long".into()))?;
        let mut out = std::ptr::null_mut();
        let hr = unsafe {
            (vtable.provide_unix_library)(
                self.0.as_raw(),
                name.as_ptr(),
                runtime.as_ref().map_or(std::ptr::null(), |w| w.as_ptr()),
                index_type as u32,
                bytes,
                len,
                &mut out,
            )
        };
        take_path(hr, out)
    }
}

impl LibraryProviderV2 for NativeProviderV2
{
    fn provide_library2(&self, name: &str, timestamp: u32, size_of_image: u32) -> ShimResult<Option<PathBuf>>
    {
        let vtable = unsafe { self.0.vtable::<ICLRDebuggingLibraryProvider2Vtbl>() };
        let name = to_wide_str(name);
        let mut out = std::ptr::null_mut();
        let hr = unsafe { (vtable.provide_library2)(self.0.as_raw(), name.as_ptr(), timestamp, size_of_image, &mut out) };
        take_path(hr, out)
    }
}

impl LibraryProviderV1 for NativeProviderV1
{
    fn provide_library(&self, name: &str, timestamp: u32, size_of_image: u32) -> ShimResult<Option<ModuleHandle>>
    {
        let vtable = unsafe { self.0.vtable::<ICLRDebuggingLibraryProviderVtbl>() };
        let name = to_wide_str(name);
        let mut out = std::ptr::null_mut();
        let hr = unsafe { (vtable.provide_library)(self.0.as_raw(), name.as_ptr(), timestamp, size_of_image, &mut out) };
        if hresult::failed(hr) {
            return Err(ShimError::from_hresult(hr));
        }
        Ok(ModuleHandle::from_raw(out))
    }
}

/// A native library provider, viewed through whichever interface levels it implements
pub struct NativeLibraryProvider
{
    object: ComObject,
    v3: Option<NativeProviderV3>,
    v2: Option<NativeProviderV2>,
    v1: Option<NativeProviderV1>,
}

impl NativeLibraryProvider
{
    /// Probe `object` for the three provider interfaces
    pub fn new(object: ComObject) -> Self
    {
        let v3 = object.query_interface(&IID_ICLR_DEBUGGING_LIBRARY_PROVIDER3).map(NativeProviderV3);
        let v2 = object.query_interface(&IID_ICLR_DEBUGGING_LIBRARY_PROVIDER2).map(NativeProviderV2);
        let v1 = object.query_interface(&IID_ICLR_DEBUGGING_LIBRARY_PROVIDER).map(NativeProviderV1);
        tracing::trace!(v3 = v3.is_some(), v2 = v2.is_some(), v1 = v1.is_some(), "library provider interfaces");
        NativeLibraryProvider { object, v3, v2, v1 }
    }

    pub fn object(&self) -> &ComObject
    {
        &self.object
    }
}

impl LibraryProvider for NativeLibraryProvider
{
    fn v3(&self) -> Option<&dyn LibraryProviderV3>
    {
        self.v3.as_ref().map(|p| p as &dyn LibraryProviderV3)
    }

    fn v2(&self) -> Option<&dyn LibraryProviderV2>
    {
        self.v2.as_ref().map(|p| p as &dyn LibraryProviderV2)
    }

    fn v1(&self) -> Option<&dyn LibraryProviderV1>
    {
        self.v1.as_ref().map(|p| p as &dyn LibraryProviderV1)
    }
}

impl std::fmt::Debug for NativeLibraryProvider
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("NativeLibraryProvider")
            .field("object", &self.object)
            .field("v3", &self.v3.is_some())
            .field("v2", &self.v2.is_some())
            .field("v1", &self.v1.is_some())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests
{
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::types::guid::IID_IUNKNOWN;
    use crate::types::Guid;

    /// A native V2-only provider that answers `/symbols/<name>`
    #[repr(C)]
    struct PathProvider
    {
        vtbl: *const ICLRDebuggingLibraryProvider2Vtbl,
        refs: AtomicU32,
    }

    static PATH_PROVIDER_VTBL: ICLRDebuggingLibraryProvider2Vtbl = ICLRDebuggingLibraryProvider2Vtbl {
        base: IUnknownVtbl { query_interface, add_ref, release },
        provide_library2,
    };

    unsafe extern "system" fn query_interface(this: *mut c_void, iid: *const Guid, out: *mut *mut c_void) -> i32
    {
        let iid = unsafe { *iid };
        if iid == IID_IUNKNOWN || iid == IID_ICLR_DEBUGGING_LIBRARY_PROVIDER2 {
            unsafe {
                add_ref(this);
                *out = this;
            }
            return hresult::S_OK;
        }
        unsafe { *out = std::ptr::null_mut() };
        hresult::E_NOINTERFACE
    }

    unsafe extern "system" fn add_ref(this: *mut c_void) -> u32
    {
        unsafe { &*(this as *const PathProvider) }.refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    unsafe extern "system" fn release(this: *mut c_void) -> u32
    {
        let count = unsafe { &*(this as *const PathProvider) }.refs.fetch_sub(1, Ordering::SeqCst) - 1;
        if count == 0 {
            drop(unsafe { Box::from_raw(this.cast::<PathProvider>()) });
        }
        count
    }

    unsafe extern "system" fn provide_library2(_this: *mut c_void, name: *const u16, timestamp: u32, _size: u32, out: *mut *mut u16) -> i32
    {
        if timestamp == 0 {
            return hresult::E_FAIL;
        }
        let name = unsafe { from_wide_ptr(name) }.unwrap_or_default();
        let wide = to_wide_str(&format!("/symbols/{name}"));
        let bytes = wide.len() * std::mem::size_of::<u16>();
        let text = unsafe { libc::malloc(bytes) }.cast::<u16>();
        unsafe {
            std::ptr::copy_nonoverlapping(wide.as_ptr(), text, wide.len());
            *out = text;
        }
        hresult::S_OK
    }

    fn provider() -> NativeLibraryProvider
    {
        let object = Box::new(PathProvider { vtbl: &PATH_PROVIDER_VTBL, refs: AtomicU32::new(1) });
        let object = unsafe { ComObject::from_raw(Box::into_raw(object).cast()) }.unwrap();
        NativeLibraryProvider::new(object)
    }

    #[test]
    fn test_native_provider_levels()
    {
        let provider = provider();
        assert!(provider.v3().is_none());
        assert!(provider.v2().is_some());
        assert!(provider.v1().is_none());
    }

    #[test]
    fn test_native_provider_paths()
    {
        let provider = provider();
        let v2 = provider.v2().unwrap();
        let path = v2.provide_library2("mscordbi.dll", 0x4d53_6868, 0x17_b000).unwrap();
        assert_eq!(path, Some(PathBuf::from("/symbols/mscordbi.dll")));
        assert!(v2.provide_library2("mscordbi.dll", 0, 0).is_err());
    }
}
