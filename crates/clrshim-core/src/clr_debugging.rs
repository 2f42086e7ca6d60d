//! # `ICLRDebugging`
//!
//! The facade a dump or live debugger uses when it already has a data
//! target: point it at a module base and it identifies the runtime there,
//! asks the debugger's provider for the matching DBI and DAC, and opens the
//! runtime through the DBI.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::error::{ShimError, ShimResult};
use crate::interop::{ComObject, NativeDataTarget};
use crate::loader::dbi::{open_virtual_process, VirtualProcessRequest};
use crate::loader::{LibraryLoader, ModuleHandle, NativeLibrary, SystemLoader};
use crate::provider::{provide_libraries, LibraryProvider, ProvidedLibraries};
use crate::runtime::{Identification, RuntimeIdentifier};
use crate::types::guid::{CLR_ID_ONECORE_CLR, CLSID_CLR_DEBUGGING, IID_ICLR_DEBUGGING};
use crate::types::{Address, ClrDebuggingVersion, Guid, Machine};

/// Arguments of [`ClrDebugging::open_virtual_process`]
#[derive(Clone, Copy)]
pub struct OpenVirtualProcessArgs<'a>
{
    pub module_base: Address,
    /// The debugger's data target; must answer for `ICorDebugDataTarget`
    pub data_target: &'a ComObject,
    pub provider: Option<&'a dyn LibraryProvider>,
    /// Newest runtime version the debugger understands
    pub max_version: Option<ClrDebuggingVersion>,
    /// Interface requested for the process object
    pub riid: &'a Guid,
    pub wants_process: bool,
    pub wants_flags: bool,
    /// `wStructVersion` of the caller's version out-parameter, when it passed one
    pub version_struct: Option<u16>,
}

impl std::fmt::Debug for OpenVirtualProcessArgs<'_>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("OpenVirtualProcessArgs")
            .field("module_base", &self.module_base)
            .field("provider", &self.provider.is_some())
            .field("max_version", &self.max_version)
            .field("wants_process", &self.wants_process)
            .field("wants_flags", &self.wants_flags)
            .finish_non_exhaustive()
    }
}

/// A runtime opened through the DBI
#[derive(Debug)]
pub struct OpenedRuntime
{
    /// The process object, when one was asked for
    pub process: Option<ComObject>,
    /// `CLR_DEBUGGING_PROCESS_FLAGS`, when asked for
    pub flags: u32,
    /// Product version of the runtime
    pub version: ClrDebuggingVersion,
}

/// `ICLRDebugging` for one runtime flavor
#[derive(Clone)]
pub struct ClrDebugging
{
    identifier: RuntimeIdentifier,
    loader: Arc<dyn LibraryLoader>,
}

impl std::fmt::Debug for ClrDebugging
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("ClrDebugging").field("identifier", &self.identifier).finish_non_exhaustive()
    }
}

impl ClrDebugging
{
    /// Facade for runtimes stamped `sku`, loading libraries through the OS
    pub fn new(sku: Guid) -> Self
    {
        Self::with_loader(sku, Arc::new(SystemLoader))
    }

    pub fn with_loader(sku: Guid, loader: Arc<dyn LibraryLoader>) -> Self
    {
        ClrDebugging { identifier: RuntimeIdentifier::new(sku), loader }
    }

    /// Identify runtimes as a debugger on `machine` would
    #[must_use]
    pub fn with_host_machine(mut self, machine: Machine) -> Self
    {
        self.identifier = self.identifier.with_host_machine(machine);
        self
    }

    pub fn sku(&self) -> Guid
    {
        self.identifier.sku()
    }

    /// Open the runtime loaded at `args.module_base`
    ///
    /// Without `wants_process` or `wants_flags` this only identifies the
    /// runtime and reports its version.
    ///
    /// ## Errors
    ///
    /// - `Pointer` when a process or flags are wanted without a provider or
    ///   max version
    /// - `UnsupportedVersionStruct` for a version struct other than 0
    /// - `MissingDataTargetInterface` when the data target isn't one
    /// - `NotClr` when no runtime of this flavor is at the base
    /// - provider, library load and DBI failures
    pub fn open_virtual_process(&self, args: &OpenVirtualProcessArgs<'_>) -> ShimResult<OpenedRuntime>
    {
        let wants_output = args.wants_process || args.wants_flags;
        if wants_output && args.provider.is_none() {
            return Err(ShimError::Pointer("library provider"));
        }
        if wants_output && args.max_version.is_none() {
            return Err(ShimError::Pointer("max debugger supported version"));
        }
        if let Some(struct_version) = args.version_struct.filter(|v| *v != 0) {
            return Err(ShimError::UnsupportedVersionStruct(struct_version));
        }
        let target = NativeDataTarget::query(args.data_target).ok_or(ShimError::MissingDataTargetInterface)?;

        let Identification { info, version } = self.identifier.identify(&target, args.module_base)?;
        debug!(base = %args.module_base, ?version, dbi = %info.dbi.name, dac = %info.dac.name, "identified runtime");

        let (true, Some(provider), Some(max_version)) = (wants_output, args.provider, args.max_version) else {
            return Ok(OpenedRuntime { process: None, flags: 0, version });
        };

        let (dbi, dac, dac_path) = self.load_libraries(provide_libraries(&info, provider)?)?;
        let request = VirtualProcessRequest {
            module_base: args.module_base,
            data_target: args.data_target,
            max_version,
            riid: args.riid,
            wants_process: args.wants_process,
            wants_flags: args.wants_flags,
        };
        let opened = open_virtual_process(dbi.as_ref(), dac.as_ref(), dac_path.as_deref(), &request)?;
        // The process object keeps using both libraries.
        std::mem::forget(dbi);
        std::mem::forget(dac);
        Ok(OpenedRuntime { process: opened.process, flags: opened.flags, version })
    }

    /// DAC first: the DBI links against the DAC's platform layer
    fn load_libraries(
        &self,
        provided: ProvidedLibraries,
    ) -> ShimResult<(Box<dyn NativeLibrary>, Box<dyn NativeLibrary>, Option<PathBuf>)>
    {
        match provided {
            ProvidedLibraries::Paths { dbi, dac } => {
                let dac_library = self.loader.load(&dac)?;
                let dbi_library = self.loader.load(&dbi)?;
                Ok((dbi_library, dac_library, Some(dac)))
            }
            ProvidedLibraries::Handles { dbi, dac } => Ok((self.loader.adopt(dbi), self.loader.adopt(dac), None)),
        }
    }

    /// Whether a library handed out by the provider may be unloaded; never
    pub fn can_unload_now(&self, _module: ModuleHandle) -> bool
    {
        false
    }
}

/// `CLRCreateInstance`: the `ICLRDebugging` facade for the OneCore runtime
///
/// ## Errors
///
/// `NoInterface` for any class or interface other than
/// `CLSID_CLRDebugging` / `IID_ICLRDebugging`.
pub fn clr_create_instance(clsid: &Guid, iid: &Guid) -> ShimResult<ClrDebugging>
{
    if *clsid != CLSID_CLR_DEBUGGING || *iid != IID_ICLR_DEBUGGING {
        return Err(ShimError::NoInterface);
    }
    Ok(ClrDebugging::new(CLR_ID_ONECORE_CLR))
}

#[cfg(test)]
mod tests
{
    use std::ffi::c_void;
    use std::sync::Mutex;

    use super::*;
    use crate::error::hresult;
    use crate::image::pe::RT_RCDATA;
    use crate::image::testing::PeBuilder;
    use crate::image::ResourceKey;
    use crate::interop::{fake, ComDataTarget};
    use crate::loader::dbi::OPEN_VIRTUAL_PROCESS_IMPL2;
    use crate::loader::fake::{FakeLibrary, FakeLoader};
    use crate::provider::recording::RecordingProvider;
    use crate::target::MemoryTarget;
    use crate::types::guid::{CLR_ID_CORECLR, IID_ICOR_DEBUG_PROCESS};
    use crate::types::{DebugResource, Platform};

    const BASE: u64 = 0x1_8000_0000;

    static OPENED_WITH: Mutex<Vec<Option<String>>> = Mutex::new(Vec::new());

    unsafe extern "system" fn ovp_impl2(
        base: u64,
        _dt: *mut c_void,
        dac: *const u16,
        _max: *mut ClrDebuggingVersion,
        _riid: *const Guid,
        out: *mut *mut c_void,
        flags: *mut u32,
    ) -> i32
    {
        if base != BASE {
            return hresult::E_FAIL;
        }
        OPENED_WITH.lock().unwrap().push(unsafe { crate::loader::from_wide_ptr(dac) });
        if !out.is_null() {
            unsafe { *out = fake::create().0 };
        }
        if !flags.is_null() {
            unsafe { *flags = 0 };
        }
        hresult::S_OK
    }

    fn runtime_target() -> ComObject
    {
        let resource = DebugResource {
            version: 0,
            signature: CLR_ID_ONECORE_CLR,
            dac_timestamp: 10,
            dac_size_of_image: 20,
            dbi_timestamp: 30,
            dbi_size_of_image: 40,
        };
        let image = PeBuilder::new(Machine::Amd64)
            .version(8, 0, 5, 1)
            .resource(ResourceKey::Id(RT_RCDATA), "CLRDEBUGINFO", 0, resource.encode().to_vec())
            .build_mapped();
        ComDataTarget::create(MemoryTarget::new(Platform::WindowsAmd64).with_region(Address::new(BASE), image))
    }

    fn facade(loader: FakeLoader) -> ClrDebugging
    {
        ClrDebugging::with_loader(CLR_ID_ONECORE_CLR, Arc::new(loader)).with_host_machine(Machine::Amd64)
    }

    fn args<'a>(target: &'a ComObject, provider: Option<&'a dyn LibraryProvider>) -> OpenVirtualProcessArgs<'a>
    {
        OpenVirtualProcessArgs {
            module_base: Address::new(BASE),
            data_target: target,
            provider,
            max_version: Some(ClrDebuggingVersion::new(8, 0, 0, 0)),
            riid: &IID_ICOR_DEBUG_PROCESS,
            wants_process: true,
            wants_flags: false,
            version_struct: Some(0),
        }
    }

    #[test]
    fn test_argument_checks_in_order()
    {
        let target = runtime_target();
        let clr = facade(FakeLoader::new());
        let provider = RecordingProvider::with_levels(false, true, false);

        let no_provider = args(&target, None);
        assert!(matches!(clr.open_virtual_process(&no_provider), Err(ShimError::Pointer(_))));

        let no_max = OpenVirtualProcessArgs { max_version: None, ..args(&target, Some(&provider)) };
        assert!(matches!(clr.open_virtual_process(&no_max), Err(ShimError::Pointer(_))));

        let bad_struct = OpenVirtualProcessArgs { version_struct: Some(1), ..args(&target, Some(&provider)) };
        assert!(matches!(clr.open_virtual_process(&bad_struct), Err(ShimError::UnsupportedVersionStruct(1))));

        let (raw, _) = fake::create();
        let not_a_target = unsafe { ComObject::from_raw(raw) }.unwrap();
        let missing = args(&not_a_target, Some(&provider));
        assert!(matches!(clr.open_virtual_process(&missing), Err(ShimError::MissingDataTargetInterface)));
        assert!(provider.calls().is_empty());
    }

    #[test]
    fn test_version_only_needs_no_provider()
    {
        let target = runtime_target();
        let clr = facade(FakeLoader::new());
        let query = OpenVirtualProcessArgs { wants_process: false, ..args(&target, None) };
        let opened = clr.open_virtual_process(&query).unwrap();
        assert!(opened.process.is_none());
        assert_eq!(opened.version, ClrDebuggingVersion::new(8, 0, 5, 1));
    }

    #[test]
    fn test_open_loads_dac_before_dbi()
    {
        let target = runtime_target();
        let loader = Arc::new(
            FakeLoader::new()
                .with_library(FakeLibrary::new("/symbols/mscordbi.dll").with_symbol(OPEN_VIRTUAL_PROCESS_IMPL2, ovp_impl2 as usize))
                .with_library(FakeLibrary::new("/symbols/mscordaccore.dll")),
        );
        let clr = ClrDebugging::with_loader(CLR_ID_ONECORE_CLR, loader.clone()).with_host_machine(Machine::Amd64);
        let provider = RecordingProvider::with_levels(false, true, false);

        let opened = clr.open_virtual_process(&args(&target, Some(&provider))).unwrap();
        assert!(opened.process.is_some());
        assert_eq!(opened.version, ClrDebuggingVersion::new(8, 0, 5, 1));
        assert_eq!(
            loader.loads(),
            vec![PathBuf::from("/symbols/mscordaccore.dll"), PathBuf::from("/symbols/mscordbi.dll")]
        );
        assert!(OPENED_WITH.lock().unwrap().contains(&Some("/symbols/mscordaccore.dll".to_string())));
        assert_eq!(loader.released(), 0);
    }

    #[test]
    fn test_other_flavor_is_not_clr()
    {
        let target = runtime_target();
        let clr = ClrDebugging::with_loader(CLR_ID_CORECLR, Arc::new(FakeLoader::new())).with_host_machine(Machine::Amd64);
        let query = OpenVirtualProcessArgs { wants_process: false, ..args(&target, None) };
        assert!(matches!(clr.open_virtual_process(&query), Err(ShimError::NotClr)));
    }

    #[test]
    fn test_missing_dac_fails_before_dbi()
    {
        let target = runtime_target();
        let loader = Arc::new(FakeLoader::new());
        let clr = ClrDebugging::with_loader(CLR_ID_ONECORE_CLR, loader.clone()).with_host_machine(Machine::Amd64);
        let provider = RecordingProvider::with_levels(false, true, false);
        assert!(clr.open_virtual_process(&args(&target, Some(&provider))).is_err());
        assert_eq!(loader.loads(), vec![PathBuf::from("/symbols/mscordaccore.dll")]);
    }

    #[test]
    fn test_clr_create_instance_accepts_only_the_facade()
    {
        let clr = clr_create_instance(&CLSID_CLR_DEBUGGING, &IID_ICLR_DEBUGGING).unwrap();
        assert_eq!(clr.sku(), CLR_ID_ONECORE_CLR);
        assert!(!clr.can_unload_now(ModuleHandle::from_base(Address::new(0x1000)).unwrap()));
        assert!(matches!(clr_create_instance(&IID_ICLR_DEBUGGING, &IID_ICLR_DEBUGGING), Err(ShimError::NoInterface)));
        assert!(matches!(clr_create_instance(&CLSID_CLR_DEBUGGING, &CLSID_CLR_DEBUGGING), Err(ShimError::NoInterface)));
    }
}
