//! # Native Library Loading
//!
//! The DBI and DAC are native shared libraries. This module abstracts how
//! they are opened and how exports are looked up, so the probing logic in
//! [`dbi`] can run against fakes in tests.
//!
//! Loaded libraries are never unloaded once a DBI object has been handed
//! out: nothing tells the shim when the debugger is finished with it.

pub mod dbi;

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use crate::error::ShimResult;
use crate::types::Address;

/// Raw OS module handle (`HMODULE` or a `dlopen` handle)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(usize);

impl ModuleHandle
{
    /// Wrap a raw handle; `None` for null
    pub fn from_raw(raw: *mut c_void) -> Option<Self>
    {
        (!raw.is_null()).then(|| ModuleHandle(raw as usize))
    }

    /// Handle for a module known only by its base address in the target
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_base(base: Address) -> Option<Self>
    {
        Self::from_raw(base.value() as usize as *mut c_void)
    }

    pub fn as_ptr(self) -> *mut c_void
    {
        self.0 as *mut c_void
    }

    pub fn value(self) -> usize
    {
        self.0
    }
}

/// An opened native library
pub trait NativeLibrary: Send + Sync
{
    /// Path the library was opened from, when known
    fn path(&self) -> Option<&Path>;

    fn handle(&self) -> ModuleHandle;

    /// Address of the export `name`
    fn symbol(&self, name: &str) -> Option<NonNull<c_void>>;
}

/// Opens native libraries
pub trait LibraryLoader: Send + Sync
{
    /// Open the library at `path`
    ///
    /// ## Errors
    ///
    /// `Os` with the loader's error code.
    fn load(&self, path: &Path) -> ShimResult<Box<dyn NativeLibrary>>;

    /// Wrap a handle someone else already opened
    fn adopt(&self, handle: ModuleHandle) -> Box<dyn NativeLibrary>;
}

/// NUL-terminated UTF-16 copy of `path`, the form DBI entry points take
pub fn to_wide(path: &Path) -> Vec<u16>
{
    to_wide_str(&path.to_string_lossy())
}

/// NUL-terminated UTF-16 copy of `text`
pub fn to_wide_str(text: &str) -> Vec<u16>
{
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Read a NUL-terminated UTF-16 string
///
/// # Safety
///
/// `text` must be null or point to a NUL-terminated UTF-16 string.
pub unsafe fn from_wide_ptr(text: *const u16) -> Option<String>
{
    if text.is_null() {
        return None;
    }
    let mut len = 0;
    while unsafe { *text.add(len) } != 0 {
        len += 1;
    }
    Some(String::from_utf16_lossy(unsafe { std::slice::from_raw_parts(text, len) }))
}

/// A library opened through the OS loader
///
/// Dropping it closes the handle; [`dbi`] forgets libraries it hands out.
#[derive(Debug)]
pub struct SystemLibrary
{
    handle: ModuleHandle,
    path: Option<PathBuf>,
    owned: bool,
}

impl NativeLibrary for SystemLibrary
{
    fn path(&self) -> Option<&Path>
    {
        self.path.as_deref()
    }

    fn handle(&self) -> ModuleHandle
    {
        self.handle
    }

    fn symbol(&self, name: &str) -> Option<NonNull<c_void>>
    {
        let name = std::ffi::CString::new(name).ok()?;
        sys::symbol(self.handle, &name)
    }
}

impl Drop for SystemLibrary
{
    fn drop(&mut self)
    {
        if self.owned {
            sys::close(self.handle);
        }
    }
}

/// [`LibraryLoader`] over `dlopen` / `LoadLibraryW`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLoader;

impl LibraryLoader for SystemLoader
{
    fn load(&self, path: &Path) -> ShimResult<Box<dyn NativeLibrary>>
    {
        let handle = sys::open(path)?;
        tracing::debug!(path = %path.display(), "loaded native library");
        Ok(Box::new(SystemLibrary { handle, path: Some(path.to_path_buf()), owned: true }))
    }

    fn adopt(&self, handle: ModuleHandle) -> Box<dyn NativeLibrary>
    {
        Box::new(SystemLibrary { handle, path: None, owned: false })
    }
}

#[cfg(unix)]
mod sys
{
    use std::ffi::{c_void, CStr, CString};
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;
    use std::ptr::NonNull;

    use super::ModuleHandle;
    use crate::error::{ShimError, ShimResult};

    pub(super) fn open(path: &Path) -> ShimResult<ModuleHandle>
    {
        let name = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| ShimError::InvalidArgument(format!("NUL in {}", path.display())))?;
        let raw = unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_LAZY) };
        ModuleHandle::from_raw(raw).ok_or_else(|| {
            let reason = unsafe {
                let message = libc::dlerror();
                if message.is_null() {
                    String::new()
                } else {
                    CStr::from_ptr(message).to_string_lossy().into_owned()
                }
            };
            tracing::debug!(path = %path.display(), %reason, "dlopen failed");
            ShimError::Os { api: "dlopen", code: libc::ENOENT }
        })
    }

    pub(super) fn symbol(handle: ModuleHandle, name: &CStr) -> Option<NonNull<c_void>>
    {
        NonNull::new(unsafe { libc::dlsym(handle.as_ptr(), name.as_ptr()) })
    }

    pub(super) fn close(handle: ModuleHandle)
    {
        unsafe {
            libc::dlclose(handle.as_ptr());
        }
    }
}

#[cfg(windows)]
mod sys
{
    use std::ffi::{c_void, CStr};
    use std::path::Path;
    use std::ptr::NonNull;

    use windows::core::{PCSTR, PCWSTR};
    use windows::Win32::Foundation::{FreeLibrary, HMODULE};
    use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryW};

    use super::{to_wide, ModuleHandle};
    use crate::error::{ShimError, ShimResult};

    pub(super) fn open(path: &Path) -> ShimResult<ModuleHandle>
    {
        let wide = to_wide(path);
        let module = unsafe { LoadLibraryW(PCWSTR::from_raw(wide.as_ptr())) }.map_err(|err| ShimError::Os {
            api: "LoadLibraryW",
            code: err.code().0,
        })?;
        ModuleHandle::from_raw(module.0 as *mut c_void).ok_or_else(|| ShimError::last_os_error("LoadLibraryW"))
    }

    pub(super) fn symbol(handle: ModuleHandle, name: &CStr) -> Option<NonNull<c_void>>
    {
        let module = HMODULE(handle.value() as _);
        let address = unsafe { GetProcAddress(module, PCSTR::from_raw(name.as_ptr().cast())) }?;
        NonNull::new(address as *mut c_void)
    }

    pub(super) fn close(handle: ModuleHandle)
    {
        let _ = unsafe { FreeLibrary(HMODULE(handle.value() as _)) };
    }
}

#[cfg(test)]
pub(crate) mod fake
{
    //! In-process stand-ins for native libraries.
    //!
    //! Exports are plain Rust `extern "system"` functions registered by
    //! address, so entry-point probing runs without any real DBI.

    use std::collections::HashMap;
    use std::ffi::c_void;
    use std::path::{Path, PathBuf};
    use std::ptr::NonNull;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::{LibraryLoader, ModuleHandle, NativeLibrary};
    use crate::error::{ShimError, ShimResult};

    #[derive(Debug, Clone)]
    pub struct FakeLibrary
    {
        path: PathBuf,
        handle: usize,
        symbols: HashMap<String, usize>,
        released: Option<Arc<AtomicUsize>>,
    }

    impl FakeLibrary
    {
        pub fn new(path: impl Into<PathBuf>) -> Self
        {
            FakeLibrary { path: path.into(), handle: 0x5000, symbols: HashMap::new(), released: None }
        }

        #[must_use]
        pub fn with_symbol(mut self, name: &str, address: usize) -> Self
        {
            self.symbols.insert(name.to_string(), address);
            self
        }

        #[must_use]
        pub fn with_handle(mut self, handle: usize) -> Self
        {
            self.handle = handle;
            self
        }
    }

    impl NativeLibrary for FakeLibrary
    {
        fn path(&self) -> Option<&Path>
        {
            Some(&self.path)
        }

        fn handle(&self) -> ModuleHandle
        {
            ModuleHandle(self.handle)
        }

        fn symbol(&self, name: &str) -> Option<NonNull<c_void>>
        {
            self.symbols.get(name).and_then(|address| NonNull::new(*address as *mut c_void))
        }
    }

    impl Drop for FakeLibrary
    {
        fn drop(&mut self)
        {
            if let Some(released) = &self.released {
                released.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Serves [`FakeLibrary`] copies by path and counts how many get released
    #[derive(Debug, Default)]
    pub struct FakeLoader
    {
        libraries: HashMap<PathBuf, FakeLibrary>,
        loads: Mutex<Vec<PathBuf>>,
        released: Arc<AtomicUsize>,
    }

    impl FakeLoader
    {
        pub fn new() -> Self
        {
            FakeLoader::default()
        }

        #[must_use]
        pub fn with_library(mut self, library: FakeLibrary) -> Self
        {
            self.libraries.insert(library.path.clone(), library);
            self
        }

        /// Paths loaded so far, in order
        pub fn loads(&self) -> Vec<PathBuf>
        {
            self.loads.lock().unwrap().clone()
        }

        /// Libraries handed out and later dropped
        pub fn released(&self) -> usize
        {
            self.released.load(Ordering::SeqCst)
        }
    }

    impl LibraryLoader for FakeLoader
    {
        fn load(&self, path: &Path) -> ShimResult<Box<dyn NativeLibrary>>
        {
            self.loads.lock().unwrap().push(path.to_path_buf());
            let library = self.libraries.get(path).ok_or(ShimError::Os { api: "dlopen", code: 2 })?;
            let mut copy = library.clone();
            copy.released = Some(Arc::clone(&self.released));
            Ok(Box::new(copy))
        }

        fn adopt(&self, handle: ModuleHandle) -> Box<dyn NativeLibrary>
        {
            let found = self.libraries.values().find(|library| library.handle == handle.0);
            Box::new(found.cloned().unwrap_or_else(|| FakeLibrary::new("").with_handle(handle.0)))
        }
    }
}
