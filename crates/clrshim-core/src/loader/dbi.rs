//! # DBI Entry Points
//!
//! The DBI exports a handful of creation functions that changed shape over
//! the runtime's history. Each operation here probes for the newest form
//! first and falls back to older ones:
//!
//! - [`create_cordb`]: `CoreCLRCreateCordbObject3` → `...Ex` → `CoreCLRCreateCordbObject`
//! - [`create_cordb_remote_port`]: the remote-port `CoreCLRCreateCordbObject`
//! - [`open_virtual_process`]: `OpenVirtualProcessImpl2` → `OpenVirtualProcessImpl`
//!   → `OpenVirtualProcess2`

use std::ffi::{c_char, c_void, CString};
use std::path::Path;
use std::ptr::NonNull;

use super::{to_wide, to_wide_str, LibraryLoader, NativeLibrary};
use crate::error::{hresult, ShimError, ShimResult};
use crate::interop::{ComObject, CordbObject};
use crate::types::{Address, ClrDebuggingVersion, CorDebugInterfaceVersion, Guid, ProcessId};

type CreateCordbObject3Fn =
    unsafe extern "system" fn(i32, u32, *const u16, *const u16, *mut c_void, *mut *mut c_void) -> i32;
type CreateCordbObjectExFn = unsafe extern "system" fn(i32, u32, *const u16, *mut c_void, *mut *mut c_void) -> i32;
type CreateCordbObjectFn = unsafe extern "system" fn(i32, u32, *mut c_void, *mut *mut c_void) -> i32;
type CreateCordbObjectRemotePortFn = unsafe extern "system" fn(u32, *const c_char, *mut *mut c_void) -> i32;

type OpenVirtualProcessImpl2Fn = unsafe extern "system" fn(
    u64,
    *mut c_void,
    *const u16,
    *mut ClrDebuggingVersion,
    *const Guid,
    *mut *mut c_void,
    *mut u32,
) -> i32;
type OpenVirtualProcessImplFn = unsafe extern "system" fn(
    u64,
    *mut c_void,
    *mut c_void,
    *mut ClrDebuggingVersion,
    *const Guid,
    *mut *mut c_void,
    *mut u32,
) -> i32;
type OpenVirtualProcess2Fn =
    unsafe extern "system" fn(u64, *mut c_void, *mut c_void, *const Guid, *mut *mut c_void, *mut u32) -> i32;
type DacLoadLibraryWFn = unsafe extern "system" fn(*const u16) -> *mut c_void;

pub const CREATE_CORDB_OBJECT_3: &str = "CoreCLRCreateCordbObject3";
pub const CREATE_CORDB_OBJECT_EX: &str = "CoreCLRCreateCordbObjectEx";
pub const CREATE_CORDB_OBJECT: &str = "CoreCLRCreateCordbObject";
pub const OPEN_VIRTUAL_PROCESS_IMPL2: &str = "OpenVirtualProcessImpl2";
pub const OPEN_VIRTUAL_PROCESS_IMPL: &str = "OpenVirtualProcessImpl";
pub const OPEN_VIRTUAL_PROCESS_2: &str = "OpenVirtualProcess2";
pub const DAC_LOAD_LIBRARY_W: &str = "LoadLibraryW";

/// Reinterpret an export as a function pointer of type `F`
///
/// # Safety
///
/// The export must really be a function with the signature `F`.
unsafe fn entry<F: Copy>(symbol: NonNull<c_void>) -> F
{
    debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<*mut c_void>());
    unsafe { std::mem::transmute_copy(&symbol.as_ptr()) }
}

fn object_from(hr: i32, out: *mut c_void) -> ShimResult<CordbObject>
{
    if hresult::failed(hr) {
        return Err(ShimError::from_hresult(hr));
    }
    unsafe { CordbObject::from_raw(out) }.ok_or_else(|| ShimError::Failed("DBI returned no object".into()))
}

/// Arguments of a `CoreCLRCreateCordbObject*` call
#[derive(Debug, Clone, Copy)]
pub struct CordbRequest<'a>
{
    pub dbi_path: &'a Path,
    /// Handed to `CoreCLRCreateCordbObject3`; `None` lets the DBI find the DAC itself
    pub dac_path: Option<&'a Path>,
    /// Base of the runtime module in the target (its `HMODULE`)
    pub runtime_base: Address,
    pub pid: ProcessId,
    pub group_id: Option<&'a str>,
    pub version: CorDebugInterfaceVersion,
}

impl CordbRequest<'_>
{
    #[allow(clippy::cast_possible_truncation)]
    fn runtime_handle(&self) -> *mut c_void
    {
        self.runtime_base.value() as usize as *mut c_void
    }
}

fn load_dbi(loader: &dyn LibraryLoader, path: &Path) -> ShimResult<Box<dyn NativeLibrary>>
{
    loader.load(path).map_err(|err| {
        tracing::debug!(path = %path.display(), %err, "failed to load DBI");
        ShimError::DebugComponentMissing(format!("{}: {err}", path.display()))
    })
}

/// Load the DBI and create the debugger object for one process
///
/// On success the DBI stays loaded for the life of the process; on failure it
/// is unloaded again.
///
/// ## Errors
///
/// - `DebugComponentMissing` when the DBI cannot be loaded
/// - `IncompatibleProtocol` when it exports no usable creation function
/// - whatever the creation function itself reports
pub fn create_cordb(loader: &dyn LibraryLoader, request: &CordbRequest<'_>) -> ShimResult<CordbObject>
{
    let dbi = load_dbi(loader, request.dbi_path)?;
    let pid = request.pid.0;
    let version = request.version.raw();
    let group = request.group_id.map(to_wide_str);
    let group_ptr = group.as_ref().map_or(std::ptr::null(), |g| g.as_ptr());
    let mut out = std::ptr::null_mut();

    let hr = if let Some(symbol) = dbi.symbol(CREATE_CORDB_OBJECT_3) {
        let create: CreateCordbObject3Fn = unsafe { entry(symbol) };
        let dac = request.dac_path.filter(|p| !p.as_os_str().is_empty()).map(to_wide);
        let dac_ptr = dac.as_ref().map_or(std::ptr::null(), |d| d.as_ptr());
        tracing::debug!(pid, version, "calling {CREATE_CORDB_OBJECT_3}");
        unsafe { create(version, pid, group_ptr, dac_ptr, request.runtime_handle(), &mut out) }
    } else if request.group_id.is_some() {
        let Some(symbol) = dbi.symbol(CREATE_CORDB_OBJECT_EX) else {
            return Err(ShimError::IncompatibleProtocol(format!(
                "DBI exports neither {CREATE_CORDB_OBJECT_3} nor {CREATE_CORDB_OBJECT_EX}"
            )));
        };
        let create: CreateCordbObjectExFn = unsafe { entry(symbol) };
        tracing::debug!(pid, version, "calling {CREATE_CORDB_OBJECT_EX}");
        unsafe { create(version, pid, group_ptr, request.runtime_handle(), &mut out) }
    } else {
        let Some(symbol) = dbi.symbol(CREATE_CORDB_OBJECT) else {
            return Err(ShimError::IncompatibleProtocol(format!(
                "DBI exports neither {CREATE_CORDB_OBJECT_3} nor {CREATE_CORDB_OBJECT}"
            )));
        };
        let create: CreateCordbObjectFn = unsafe { entry(symbol) };
        tracing::debug!(pid, version, "calling {CREATE_CORDB_OBJECT}");
        unsafe { create(version, pid, request.runtime_handle(), &mut out) }
    };

    let object = object_from(hr, out)?;
    // The debugger may use the object long after we return.
    std::mem::forget(dbi);
    Ok(object)
}

/// Create a debugger object connected to a remote debugging port
///
/// ## Errors
///
/// - `DebugComponentMissing` when the DBI cannot be loaded
/// - `IncompatibleProtocol` when it lacks the remote-port entry point
/// - the entry point's own failure, verbatim
pub fn create_cordb_remote_port(
    loader: &dyn LibraryLoader,
    dbi_path: &Path,
    port: u32,
    assembly_base_path: &str,
) -> ShimResult<CordbObject>
{
    let dbi = load_dbi(loader, dbi_path)?;
    let Some(symbol) = dbi.symbol(CREATE_CORDB_OBJECT) else {
        return Err(ShimError::IncompatibleProtocol(format!("DBI does not export {CREATE_CORDB_OBJECT}")));
    };
    let base = CString::new(assembly_base_path)
        .map_err(|_| ShimError::InvalidArgument("assembly base path contains NUL".into()))?;
    let create: CreateCordbObjectRemotePortFn = unsafe { entry(symbol) };
    let mut out = std::ptr::null_mut();
    tracing::debug!(port, "calling remote-port {CREATE_CORDB_OBJECT}");
    let hr = unsafe { create(port, base.as_ptr(), &mut out) };
    let object = object_from(hr, out)?;
    std::mem::forget(dbi);
    Ok(object)
}

/// Arguments of an `OpenVirtualProcess*` call
#[derive(Debug, Clone, Copy)]
pub struct VirtualProcessRequest<'a>
{
    pub module_base: Address,
    /// The caller's data target object, passed through to the DBI untouched
    pub data_target: &'a ComObject,
    pub max_version: ClrDebuggingVersion,
    pub riid: &'a Guid,
    pub wants_process: bool,
    pub wants_flags: bool,
}

/// What `OpenVirtualProcess*` produced
#[derive(Debug, Default)]
pub struct VirtualProcess
{
    pub process: Option<ComObject>,
    /// `CLR_DEBUGGING_PROCESS_FLAGS`
    pub flags: u32,
}

struct Outputs
{
    process: *mut c_void,
    flags: u32,
}

impl Outputs
{
    fn process_ptr(&mut self, wanted: bool) -> *mut *mut c_void
    {
        if wanted {
            &mut self.process
        } else {
            std::ptr::null_mut()
        }
    }

    fn flags_ptr(&mut self, wanted: bool) -> *mut u32
    {
        if wanted {
            &mut self.flags
        } else {
            std::ptr::null_mut()
        }
    }
}

/// Re-open the DAC through the DAC's own loader export
///
/// On Unix the DAC and DBI share a platform layer of their own, so a handle
/// from our loader means nothing to them.
fn rematerialize_dac(dac: &dyn NativeLibrary, dac_path: &Path) -> ShimResult<*mut c_void>
{
    let Some(symbol) = dac.symbol(DAC_LOAD_LIBRARY_W) else {
        return Err(ShimError::InvalidHandle(format!("DAC does not export {DAC_LOAD_LIBRARY_W}")));
    };
    let load: DacLoadLibraryWFn = unsafe { entry(symbol) };
    let path = to_wide(dac_path);
    let handle = unsafe { load(path.as_ptr()) };
    if handle.is_null() {
        return Err(ShimError::InvalidHandle(format!("DAC could not reopen {}", dac_path.display())));
    }
    Ok(handle)
}

/// Open the runtime instance at `request.module_base` through the DBI
///
/// `dac_path` is what the provider returned; it is `None` when a level-1
/// provider handed back loaded modules instead.
///
/// ## Errors
///
/// - `InvalidHandle` when the Unix DAC re-open fails
/// - `LibraryProviderError` when the DBI exports no `OpenVirtualProcess*`
/// - the DBI's own failure, verbatim
pub fn open_virtual_process(
    dbi: &dyn NativeLibrary,
    dac: &dyn NativeLibrary,
    dac_path: Option<&Path>,
    request: &VirtualProcessRequest<'_>,
) -> ShimResult<VirtualProcess>
{
    let mut outputs = Outputs { process: std::ptr::null_mut(), flags: 0 };
    let mut max_version = request.max_version;
    let target = request.data_target.as_raw();
    let base = request.module_base.value();
    let mut dac_handle: *mut c_void = dac.handle().as_ptr();
    let mut called = false;

    if let Some(dac_path) = dac_path.filter(|p| !p.as_os_str().is_empty()) {
        if let Some(symbol) = dbi.symbol(OPEN_VIRTUAL_PROCESS_IMPL2) {
            let open: OpenVirtualProcessImpl2Fn = unsafe { entry(symbol) };
            let path = to_wide(dac_path);
            tracing::debug!(module_base = %request.module_base, "calling {OPEN_VIRTUAL_PROCESS_IMPL2}");
            let hr = unsafe {
                open(
                    base,
                    target,
                    path.as_ptr(),
                    &mut max_version,
                    request.riid,
                    outputs.process_ptr(request.wants_process),
                    outputs.flags_ptr(request.wants_flags),
                )
            };
            finish(hr, &outputs)?;
            called = true;
        } else if cfg!(not(windows)) {
            dac_handle = rematerialize_dac(dac, dac_path)?;
        }
    }

    if !called {
        if let Some(symbol) = dbi.symbol(OPEN_VIRTUAL_PROCESS_IMPL) {
            let open: OpenVirtualProcessImplFn = unsafe { entry(symbol) };
            tracing::debug!(module_base = %request.module_base, "calling {OPEN_VIRTUAL_PROCESS_IMPL}");
            let hr = unsafe {
                open(
                    base,
                    target,
                    dac_handle,
                    &mut max_version,
                    request.riid,
                    outputs.process_ptr(request.wants_process),
                    outputs.flags_ptr(request.wants_flags),
                )
            };
            finish(hr, &outputs)?;
        } else if let Some(symbol) = dbi.symbol(OPEN_VIRTUAL_PROCESS_2) {
            let open: OpenVirtualProcess2Fn = unsafe { entry(symbol) };
            tracing::debug!(module_base = %request.module_base, "calling {OPEN_VIRTUAL_PROCESS_2}");
            let hr = unsafe {
                open(
                    base,
                    target,
                    dac_handle,
                    request.riid,
                    outputs.process_ptr(request.wants_process),
                    outputs.flags_ptr(request.wants_flags),
                )
            };
            finish(hr, &outputs)?;
        } else {
            return Err(ShimError::LibraryProviderError("DBI exports no OpenVirtualProcess entry point".into()));
        }
    }

    Ok(VirtualProcess { process: unsafe { ComObject::from_raw(outputs.process) }, flags: outputs.flags })
}

fn finish(hr: i32, outputs: &Outputs) -> ShimResult<()>
{
    if hresult::failed(hr) {
        // A failing DBI may still have written an object; don't leak it.
        drop(unsafe { ComObject::from_raw(outputs.process) });
        return Err(ShimError::from_hresult(hr));
    }
    Ok(())
}

#[cfg(test)]
mod tests
{
    use std::cell::RefCell;
    use std::path::PathBuf;

    use super::*;
    use crate::interop::fake;
    use crate::loader::fake::{FakeLibrary, FakeLoader};
    use crate::types::guid::IID_ICOR_DEBUG_PROCESS;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Seen
    {
        entry: &'static str,
        version: i32,
        pid: u32,
        group: Option<String>,
        dac: Option<String>,
        runtime: usize,
        port: u32,
        base_path: Option<String>,
        dac_handle: usize,
    }

    thread_local! {
        static SEEN: RefCell<Vec<Seen>> = const { RefCell::new(Vec::new()) };
        static RESULT: RefCell<i32> = const { RefCell::new(0) };
    }

    fn record(seen: Seen)
    {
        SEEN.with(|s| s.borrow_mut().push(seen));
    }

    fn seen() -> Vec<Seen>
    {
        SEEN.with(|s| s.borrow().clone())
    }

    fn reply(out: *mut *mut c_void) -> i32
    {
        let hr = RESULT.with(|r| *r.borrow());
        if !hresult::failed(hr) && !out.is_null() {
            unsafe { *out = fake::create().0 };
        }
        hr
    }

    fn reset(result: i32)
    {
        SEEN.with(|s| s.borrow_mut().clear());
        RESULT.with(|r| *r.borrow_mut() = result);
    }

    fn wide(text: *const u16) -> Option<String>
    {
        unsafe { super::super::from_wide_ptr(text) }
    }

    unsafe extern "system" fn create3(v: i32, pid: u32, group: *const u16, dac: *const u16, rt: *mut c_void, out: *mut *mut c_void) -> i32
    {
        record(Seen { entry: "3", version: v, pid, group: wide(group), dac: wide(dac), runtime: rt as usize, ..Seen::default() });
        reply(out)
    }

    unsafe extern "system" fn create_ex(v: i32, pid: u32, group: *const u16, rt: *mut c_void, out: *mut *mut c_void) -> i32
    {
        record(Seen { entry: "ex", version: v, pid, group: wide(group), runtime: rt as usize, ..Seen::default() });
        reply(out)
    }

    unsafe extern "system" fn create(v: i32, pid: u32, rt: *mut c_void, out: *mut *mut c_void) -> i32
    {
        record(Seen { entry: "plain", version: v, pid, runtime: rt as usize, ..Seen::default() });
        reply(out)
    }

    unsafe extern "system" fn create_remote(port: u32, base: *const c_char, out: *mut *mut c_void) -> i32
    {
        let base_path = unsafe { std::ffi::CStr::from_ptr(base) }.to_string_lossy().into_owned();
        record(Seen { entry: "remote", port, base_path: Some(base_path), ..Seen::default() });
        reply(out)
    }

    unsafe extern "system" fn ovp_impl2(
        _base: u64,
        _dt: *mut c_void,
        dac: *const u16,
        _max: *mut ClrDebuggingVersion,
        _riid: *const Guid,
        out: *mut *mut c_void,
        flags: *mut u32,
    ) -> i32
    {
        record(Seen { entry: "impl2", dac: wide(dac), ..Seen::default() });
        if !flags.is_null() {
            unsafe { *flags = 1 };
        }
        reply(out)
    }

    unsafe extern "system" fn ovp_impl(
        _base: u64,
        _dt: *mut c_void,
        dac: *mut c_void,
        _max: *mut ClrDebuggingVersion,
        _riid: *const Guid,
        out: *mut *mut c_void,
        _flags: *mut u32,
    ) -> i32
    {
        record(Seen { entry: "impl", dac_handle: dac as usize, ..Seen::default() });
        reply(out)
    }

    unsafe extern "system" fn dac_load_library(_path: *const u16) -> *mut c_void
    {
        0xdac0 as *mut c_void
    }

    fn request(group_id: Option<&str>) -> CordbRequest<'_>
    {
        CordbRequest {
            dbi_path: Path::new("/rt/libmscordbi.so"),
            dac_path: Some(Path::new("/rt/libmscordaccore.so")),
            runtime_base: Address::new(0x7f00_1000),
            pid: ProcessId(4242),
            group_id,
            version: CorDebugInterfaceVersion::V4_0,
        }
    }

    #[test]
    fn test_create3_preferred()
    {
        reset(hresult::S_OK);
        let dbi = FakeLibrary::new("/rt/libmscordbi.so")
            .with_symbol(CREATE_CORDB_OBJECT_3, create3 as usize)
            .with_symbol(CREATE_CORDB_OBJECT, create as usize);
        let loader = FakeLoader::new().with_library(dbi);

        let object = create_cordb(&loader, &request(Some("group"))).unwrap();
        drop(object);

        let calls = seen();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].entry, "3");
        assert_eq!(calls[0].version, 4);
        assert_eq!(calls[0].pid, 4242);
        assert_eq!(calls[0].group.as_deref(), Some("group"));
        assert_eq!(calls[0].dac.as_deref(), Some("/rt/libmscordaccore.so"));
        assert_eq!(calls[0].runtime, 0x7f00_1000);
        // Leaked on success.
        assert_eq!(loader.released(), 0);
    }

    #[test]
    fn test_group_requires_ex()
    {
        reset(hresult::S_OK);
        let dbi = FakeLibrary::new("/rt/libmscordbi.so").with_symbol(CREATE_CORDB_OBJECT, create as usize);
        let loader = FakeLoader::new().with_library(dbi);

        let result = create_cordb(&loader, &request(Some("group")));
        assert!(matches!(result, Err(ShimError::IncompatibleProtocol(_))));
        assert!(seen().is_empty());
        assert_eq!(loader.released(), 1);

        let dbi = FakeLibrary::new("/rt/libmscordbi.so").with_symbol(CREATE_CORDB_OBJECT_EX, create_ex as usize);
        let loader = FakeLoader::new().with_library(dbi);
        create_cordb(&loader, &request(Some("group"))).unwrap();
        assert_eq!(seen()[0].entry, "ex");
    }

    #[test]
    fn test_plain_without_group()
    {
        reset(hresult::S_OK);
        let dbi = FakeLibrary::new("/rt/libmscordbi.so")
            .with_symbol(CREATE_CORDB_OBJECT_EX, create_ex as usize)
            .with_symbol(CREATE_CORDB_OBJECT, create as usize);
        let loader = FakeLoader::new().with_library(dbi);
        create_cordb(&loader, &request(None)).unwrap();
        assert_eq!(seen()[0].entry, "plain");

        let loader = FakeLoader::new().with_library(FakeLibrary::new("/rt/libmscordbi.so"));
        assert!(matches!(create_cordb(&loader, &request(None)), Err(ShimError::IncompatibleProtocol(_))));
    }

    #[test]
    fn test_missing_dbi()
    {
        reset(hresult::S_OK);
        let loader = FakeLoader::new();
        assert!(matches!(create_cordb(&loader, &request(None)), Err(ShimError::DebugComponentMissing(_))));
    }

    #[test]
    fn test_failure_propagated_and_dbi_released()
    {
        reset(hresult::E_ACCESSDENIED);
        let dbi = FakeLibrary::new("/rt/libmscordbi.so").with_symbol(CREATE_CORDB_OBJECT_3, create3 as usize);
        let loader = FakeLoader::new().with_library(dbi);

        let result = create_cordb(&loader, &request(None));
        assert!(matches!(result, Err(ShimError::Hresult(hr)) if hr == hresult::E_ACCESSDENIED));
        assert_eq!(loader.released(), 1);
    }

    #[test]
    fn test_remote_port()
    {
        reset(hresult::S_OK);
        let dbi = FakeLibrary::new("/rt/libmscordbi.so").with_symbol(CREATE_CORDB_OBJECT, create_remote as usize);
        let loader = FakeLoader::new().with_library(dbi);
        create_cordb_remote_port(&loader, Path::new("/rt/libmscordbi.so"), 5555, "/app").unwrap();
        let calls = seen();
        assert_eq!(calls[0].port, 5555);
        assert_eq!(calls[0].base_path.as_deref(), Some("/app"));

        let loader = FakeLoader::new().with_library(FakeLibrary::new("/rt/libmscordbi.so"));
        let result = create_cordb_remote_port(&loader, Path::new("/rt/libmscordbi.so"), 5555, "/app");
        assert!(matches!(result, Err(ShimError::IncompatibleProtocol(_))));
    }

    fn ovp_request(target: &ComObject) -> VirtualProcessRequest<'_>
    {
        VirtualProcessRequest {
            module_base: Address::new(0x1000),
            data_target: target,
            max_version: ClrDebuggingVersion::new(8, 0, 0, 0),
            riid: &IID_ICOR_DEBUG_PROCESS,
            wants_process: true,
            wants_flags: true,
        }
    }

    #[test]
    fn test_open_virtual_process_impl2_with_path()
    {
        reset(hresult::S_OK);
        let target = unsafe { ComObject::from_raw(fake::create().0) }.unwrap();
        let dbi = FakeLibrary::new("/rt/libmscordbi.so")
            .with_symbol(OPEN_VIRTUAL_PROCESS_IMPL2, ovp_impl2 as usize)
            .with_symbol(OPEN_VIRTUAL_PROCESS_IMPL, ovp_impl as usize);
        let dac = FakeLibrary::new("/rt/libmscordaccore.so");
        let dac_path = PathBuf::from("/rt/libmscordaccore.so");

        let opened = open_virtual_process(&dbi, &dac, Some(&dac_path), &ovp_request(&target)).unwrap();
        assert!(opened.process.is_some());
        assert_eq!(opened.flags, 1);
        let calls = seen();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].dac.as_deref(), Some("/rt/libmscordaccore.so"));
    }

    #[test]
    fn test_open_virtual_process_handle_fallback()
    {
        reset(hresult::S_OK);
        let target = unsafe { ComObject::from_raw(fake::create().0) }.unwrap();
        let dbi = FakeLibrary::new("/rt/libmscordbi.so").with_symbol(OPEN_VIRTUAL_PROCESS_IMPL, ovp_impl as usize);
        let dac = FakeLibrary::new("/rt/libmscordaccore.so").with_handle(0xd000);

        // Handles from a level-1 provider: no path, DAC handle passed as is.
        open_virtual_process(&dbi, &dac, None, &ovp_request(&target)).unwrap();
        assert_eq!(seen()[0].dac_handle, 0xd000);
    }

    #[cfg(not(windows))]
    #[test]
    fn test_unix_dac_rematerialized()
    {
        reset(hresult::S_OK);
        let target = unsafe { ComObject::from_raw(fake::create().0) }.unwrap();
        let dbi = FakeLibrary::new("/rt/libmscordbi.so").with_symbol(OPEN_VIRTUAL_PROCESS_IMPL, ovp_impl as usize);
        let dac = FakeLibrary::new("/rt/libmscordaccore.so").with_handle(0xd000);
        let dac_path = PathBuf::from("/rt/libmscordaccore.so");

        let result = open_virtual_process(&dbi, &dac, Some(&dac_path), &ovp_request(&target));
        assert!(matches!(result, Err(ShimError::InvalidHandle(_))));

        let dac = dac.with_symbol(DAC_LOAD_LIBRARY_W, dac_load_library as usize);
        open_virtual_process(&dbi, &dac, Some(&dac_path), &ovp_request(&target)).unwrap();
        assert_eq!(seen()[0].dac_handle, 0xdac0);
    }

    #[test]
    fn test_open_virtual_process_without_entry_points()
    {
        reset(hresult::S_OK);
        let target = unsafe { ComObject::from_raw(fake::create().0) }.unwrap();
        let dbi = FakeLibrary::new("/rt/libmscordbi.so");
        let dac = FakeLibrary::new("/rt/libmscordaccore.so");
        let result = open_virtual_process(&dbi, &dac, None, &ovp_request(&target));
        assert!(matches!(result, Err(ShimError::LibraryProviderError(_))));
    }
}
