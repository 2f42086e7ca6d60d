//! # COM Interop
//!
//! The DBI and its callers speak COM-shaped ABI: objects are pointers to a
//! vtable pointer, reference counted through `IUnknown`. This module holds
//! the owning wrapper for such pointers and the adapters between native
//! objects and the shim's traits.
//!
//! - [`ComObject`]: one counted reference to any native object
//! - [`CordbObject`]: the debugger object a DBI entry point produced
//! - [`ComDataTarget`] / [`NativeDataTarget`]: data targets across the ABI
//! - [`NativeLibraryProvider`]: a caller's library provider object

mod data_target;
mod provider;

use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;

pub use data_target::{ComDataTarget, ICorDebugDataTargetVtbl, NativeDataTarget};
pub use provider::{
    free_provider_string, ICLRDebuggingLibraryProvider2Vtbl, ICLRDebuggingLibraryProvider3Vtbl,
    ICLRDebuggingLibraryProviderVtbl, NativeLibraryProvider,
};

use crate::error::hresult;
use crate::types::Guid;

/// The three `IUnknown` slots every vtable starts with
#[repr(C)]
pub struct IUnknownVtbl
{
    pub query_interface: unsafe extern "system" fn(*mut c_void, *const Guid, *mut *mut c_void) -> i32,
    pub add_ref: unsafe extern "system" fn(*mut c_void) -> u32,
    pub release: unsafe extern "system" fn(*mut c_void) -> u32,
}

/// One counted reference to a native COM object
///
/// Cloning adds a reference, dropping releases one. The objects crossing
/// this boundary (data targets, providers, DBI objects) are free-threaded.
pub struct ComObject(NonNull<c_void>);

unsafe impl Send for ComObject {}
unsafe impl Sync for ComObject {}

impl ComObject
{
    /// Take over a reference the caller already owns
    ///
    /// # Safety
    ///
    /// `raw` must be null or a live COM object whose vtable starts with
    /// [`IUnknownVtbl`].
    pub unsafe fn from_raw(raw: *mut c_void) -> Option<Self>
    {
        NonNull::new(raw).map(ComObject)
    }

    /// Add a reference to a borrowed pointer
    ///
    /// # Safety
    ///
    /// Same as [`ComObject::from_raw`].
    pub unsafe fn from_borrowed(raw: *mut c_void) -> Option<Self>
    {
        let object = NonNull::new(raw).map(ComObject)?;
        unsafe { (object.unknown_vtable().add_ref)(raw) };
        Some(object)
    }

    pub fn as_raw(&self) -> *mut c_void
    {
        self.0.as_ptr()
    }

    /// Give up the reference without releasing it
    pub fn into_raw(self) -> *mut c_void
    {
        let raw = self.as_raw();
        std::mem::forget(self);
        raw
    }

    fn unknown_vtable(&self) -> &IUnknownVtbl
    {
        unsafe { self.vtable::<IUnknownVtbl>() }
    }

    /// The object's vtable viewed as `V`
    ///
    /// # Safety
    ///
    /// The object must implement an interface whose vtable layout is `V`.
    pub(crate) unsafe fn vtable<V>(&self) -> &V
    {
        unsafe { &**(self.as_raw() as *const *const V) }
    }

    /// `QueryInterface`; `None` when the object doesn't implement `iid`
    pub fn query_interface(&self, iid: &Guid) -> Option<ComObject>
    {
        let mut out = std::ptr::null_mut();
        let hr = unsafe { (self.unknown_vtable().query_interface)(self.as_raw(), iid, &mut out) };
        if hresult::failed(hr) {
            return None;
        }
        unsafe { ComObject::from_raw(out) }
    }
}

impl Clone for ComObject
{
    fn clone(&self) -> Self
    {
        unsafe { (self.unknown_vtable().add_ref)(self.as_raw()) };
        ComObject(self.0)
    }
}

impl Drop for ComObject
{
    fn drop(&mut self)
    {
        unsafe { (self.unknown_vtable().release)(self.as_raw()) };
    }
}

impl fmt::Debug for ComObject
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "ComObject({:p})", self.0)
    }
}

/// The object a DBI entry point produced (an `ICorDebug` or `ICorDebugProcess`)
///
/// Owns one reference; [`CordbObject::into_raw`] hands it to a native caller.
#[derive(Debug, Clone)]
pub struct CordbObject(ComObject);

impl CordbObject
{
    /// # Safety
    ///
    /// See [`ComObject::from_raw`].
    pub unsafe fn from_raw(raw: *mut c_void) -> Option<Self>
    {
        unsafe { ComObject::from_raw(raw) }.map(CordbObject)
    }

    pub fn as_raw(&self) -> *mut c_void
    {
        self.0.as_raw()
    }

    pub fn into_raw(self) -> *mut c_void
    {
        self.0.into_raw()
    }

    pub fn query_interface(&self, iid: &Guid) -> Option<ComObject>
    {
        self.0.query_interface(iid)
    }
}

#[cfg(test)]
pub(crate) mod fake
{
    //! A minimal COM object with a visible reference count, for tests.

    use std::ffi::c_void;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::IUnknownVtbl;
    use crate::error::hresult;
    use crate::types::guid::IID_IUNKNOWN;
    use crate::types::Guid;

    #[repr(C)]
    pub struct FakeObject
    {
        vtbl: *const IUnknownVtbl,
        refs: Arc<AtomicU32>,
    }

    static FAKE_VTBL: IUnknownVtbl = IUnknownVtbl { query_interface, add_ref, release };

    /// A heap object with one reference, and a handle on its count
    pub fn create() -> (*mut c_void, Arc<AtomicU32>)
    {
        let refs = Arc::new(AtomicU32::new(1));
        let object = Box::new(FakeObject { vtbl: &FAKE_VTBL, refs: Arc::clone(&refs) });
        (Box::into_raw(object).cast(), refs)
    }

    unsafe extern "system" fn query_interface(this: *mut c_void, iid: *const Guid, out: *mut *mut c_void) -> i32
    {
        if unsafe { *iid } == IID_IUNKNOWN {
            unsafe {
                add_ref(this);
                *out = this;
            }
            hresult::S_OK
        } else {
            unsafe { *out = std::ptr::null_mut() };
            hresult::E_NOINTERFACE
        }
    }

    unsafe extern "system" fn add_ref(this: *mut c_void) -> u32
    {
        let object = unsafe { &*(this as *const FakeObject) };
        object.refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    unsafe extern "system" fn release(this: *mut c_void) -> u32
    {
        let object = unsafe { &*(this as *const FakeObject) };
        let count = object.refs.fetch_sub(1, Ordering::SeqCst) - 1;
        if count == 0 {
            drop(unsafe { Box::from_raw(this.cast::<FakeObject>()) });
        }
        count
    }
}

#[cfg(test)]
mod tests
{
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::types::guid::{IID_ICOR_DEBUG_DATA_TARGET, IID_IUNKNOWN};

    #[test]
    fn test_com_object_reference_counting()
    {
        let (raw, refs) = fake::create();
        let object = unsafe { ComObject::from_raw(raw) }.unwrap();
        let copy = object.clone();
        assert_eq!(refs.load(Ordering::SeqCst), 2);

        let unknown = object.query_interface(&IID_IUNKNOWN).unwrap();
        assert_eq!(refs.load(Ordering::SeqCst), 3);
        assert!(object.query_interface(&IID_ICOR_DEBUG_DATA_TARGET).is_none());

        drop(unknown);
        drop(copy);
        assert_eq!(refs.load(Ordering::SeqCst), 1);

        let raw = object.into_raw();
        assert_eq!(refs.load(Ordering::SeqCst), 1);
        drop(unsafe { CordbObject::from_raw(raw) });
    }

    #[test]
    fn test_borrowed_adds_reference()
    {
        let (raw, refs) = fake::create();
        let borrowed = unsafe { ComObject::from_borrowed(raw) }.unwrap();
        assert_eq!(refs.load(Ordering::SeqCst), 2);
        drop(borrowed);
        drop(unsafe { ComObject::from_raw(raw) });
        assert!(unsafe { ComObject::from_raw(std::ptr::null_mut()) }.is_none());
    }
}
