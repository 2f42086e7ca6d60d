//! Runtime identification from a module file on disk.
//!
//! Used while enumerating a live process: the module list gives file paths,
//! and reading the file is cheaper and safer than reading a half-initialised
//! target. A bogus runtime file can be planted by anyone, so every offset is
//! bounds-checked before use.

use std::path::Path;

use object::BinaryFormat;
use tracing::debug;

use super::names;
use crate::error::{ShimError, ShimResult};
use crate::image::pe::RT_RCDATA;
use crate::image::{ModuleFile, PeImage, ResourceKey};
use crate::target::FileImage;
use crate::types::guid::CLR_ID_ONECORE_CLR;
use crate::types::{BuildId, ClrInfo, DebugResource, EngineMetrics, IndexType, Machine, ModuleIndex, RuntimeInfoRecord};

/// Export ordinal of the engine metrics record
pub const METRICS_ORDINAL: u32 = 2;

/// What a runtime module file says about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetMetrics
{
    pub engine: EngineMetrics,
    /// RVA of the continue-event handle, 0 when the runtime has none
    pub continue_event_rva: u32,
    /// Filled when identification was requested
    pub info: Option<ClrInfo>,
}

/// Read engine metrics (and optionally the runtime identity) from `path`
///
/// PE files are read the way a Windows runtime is laid out; ELF and Mach-O
/// files the way a Unix one is.
///
/// ## Errors
///
/// - `Io` when the file can't be opened
/// - `Failed` when the file is not a runtime
/// - `InvalidArgument` when the metrics record has the wrong size
pub fn target_clr_metrics(path: &Path, want_info: bool) -> ShimResult<TargetMetrics>
{
    let module = ModuleFile::open(path)?;
    match module.format() {
        Some(BinaryFormat::Pe) => windows_metrics(&module, want_info),
        Some(BinaryFormat::Elf | BinaryFormat::MachO) => unix_metrics(&module, want_info),
        _ => Err(ShimError::Failed(format!("{} is not an executable image", path.display()))),
    }
}

fn failed(what: &str) -> ShimError
{
    ShimError::Failed(what.to_string())
}

fn windows_metrics(module: &ModuleFile, want_info: bool) -> ShimResult<TargetMetrics>
{
    let pe = module.pe().map_err(|_| failed("bad PE headers"))?;
    if !pe.has_exports().unwrap_or(false) {
        return Err(failed("no export directory"));
    }

    // Identity first: plenty of modules export something at ordinal 2.
    let info = if want_info {
        let mut info = if names::is_core_clr(module.path()) {
            runtime_resource_identity(&pe)?
        } else {
            single_file_identity(&pe)?
        };
        let (dbi, dac) = names::windows_library_names(&CLR_ID_ONECORE_CLR)?;
        info.dbi.name = dbi;
        info.dac.name = dac;
        info.runtime_module_path = Some(module.path().to_path_buf());
        Some(info)
    } else {
        None
    };

    let metrics_rva = pe.export_rva_by_ordinal(METRICS_ORDINAL).map_err(|_| failed("no metrics export"))?;
    let size = EngineMetrics::size_for(pe.pointer_size());
    let raw = pe.read_rva(metrics_rva, size).map_err(|_| failed("metrics out of image"))?;
    let engine = EngineMetrics::decode(&raw, pe.pointer_size()).ok_or_else(|| failed("metrics out of image"))?;
    if engine.cb_size as usize != size {
        return Err(ShimError::InvalidArgument(format!("engine metrics size {} != {size}", engine.cb_size)));
    }

    // The handle pointer assumes the image sits at its preferred base.
    let preferred = pe.preferred_base();
    let virtual_size = u64::from(pe.size_of_image());
    let pointer = engine.continue_startup_event.value();
    if pointer < preferred || pointer > preferred + virtual_size {
        return Err(failed("continue event outside the image"));
    }
    let rva = pointer - preferred;
    if rva + pe.pointer_size() as u64 > virtual_size {
        return Err(failed("continue event outside the image"));
    }
    let continue_event_rva = u32::try_from(rva).map_err(|_| failed("continue event outside the image"))?;

    Ok(TargetMetrics { engine, continue_event_rva, info })
}

fn runtime_resource_identity(pe: &PeImage<'_, FileImage>) -> ShimResult<ClrInfo>
{
    let extended = names::debug_resource_name(Machine::host());
    for name in [extended.as_str(), names::DEBUG_RESOURCE_NAME] {
        let Ok(Some(resource)) = pe.find_resource_any_language(ResourceKey::Id(RT_RCDATA), ResourceKey::Name(name))
        else {
            continue;
        };
        if resource.size as usize != DebugResource::SIZE {
            continue;
        }
        let Some(debug) = pe.read_rva(resource.rva, DebugResource::SIZE).ok().and_then(|raw| DebugResource::decode(&raw))
        else {
            continue;
        };
        if debug.version != 0 || debug.signature != CLR_ID_ONECORE_CLR {
            continue;
        }
        let mut info = ClrInfo::new(true);
        info.index_type = IndexType::Identity;
        info.dbi = ModuleIndex { timestamp: debug.dbi_timestamp, size_of_image: debug.dbi_size_of_image, ..Default::default() };
        info.dac = ModuleIndex { timestamp: debug.dac_timestamp, size_of_image: debug.dac_size_of_image, ..Default::default() };
        if info.is_valid() {
            return Ok(info);
        }
    }
    Err(failed("no debug resource"))
}

fn single_file_identity(pe: &PeImage<'_, FileImage>) -> ShimResult<ClrInfo>
{
    let rva = pe
        .export_rva_by_name(RuntimeInfoRecord::SYMBOL)
        .ok()
        .flatten()
        .ok_or_else(|| failed("no runtime info export"))?;
    let raw = pe.read_rva(rva, RuntimeInfoRecord::SIZE).map_err(|_| failed("runtime info out of image"))?;
    let record = RuntimeInfoRecord::decode(&raw).ok_or_else(|| failed("runtime info out of image"))?;
    if !record.signature_matches() || record.version <= 0 {
        return Err(failed("bad runtime info record"));
    }
    let dbi = RuntimeInfoRecord::windows_index(record.dbi_index_bytes());
    let dac = RuntimeInfoRecord::windows_index(record.dac_index_bytes());
    let (Some((dbi_timestamp, dbi_size)), Some((dac_timestamp, dac_size))) = (dbi, dac) else {
        return Err(failed("runtime info indexes too short"));
    };

    let mut info = ClrInfo::new(true);
    info.index_type = IndexType::Identity;
    info.dbi = ModuleIndex { timestamp: dbi_timestamp, size_of_image: dbi_size, ..Default::default() };
    info.dac = ModuleIndex { timestamp: dac_timestamp, size_of_image: dac_size, ..Default::default() };
    Ok(info)
}

fn unix_metrics(module: &ModuleFile, want_info: bool) -> ShimResult<TargetMetrics>
{
    let info = if want_info {
        let (dbi, dac) = names::unix_library_names(module.format() == Some(BinaryFormat::MachO));
        let mut info = ClrInfo::new(false);
        info.dbi = ModuleIndex::named(dbi);
        info.dac = ModuleIndex::named(dac);
        info.runtime_module_path = Some(module.path().to_path_buf());

        if names::is_core_clr(module.path()) {
            // A missing build-id leaves the identity invalid; the resolver
            // turns that into an error for the callback.
            match module.build_id() {
                Ok(Some(build_id)) => {
                    info.index_type = IndexType::Runtime;
                    info.runtime_build_id = build_id;
                }
                Ok(None) => debug!(path = %module.path().display(), "runtime has no build-id"),
                Err(err) => debug!(path = %module.path().display(), %err, "unreadable runtime build-id"),
            }
        } else {
            let raw = module
                .read_symbol(RuntimeInfoRecord::SYMBOL, RuntimeInfoRecord::SIZE)
                .ok()
                .flatten()
                .ok_or_else(|| failed("no runtime info symbol"))?;
            let record = RuntimeInfoRecord::decode(&raw).ok_or_else(|| failed("short runtime info record"))?;
            if !record.signature_matches() {
                return Err(failed("bad runtime info signature"));
            }
            info.index_type = IndexType::Identity;
            info.dbi.build_id = BuildId::from_slice(record.dbi_index_bytes()).unwrap_or_default();
            info.dac.build_id = BuildId::from_slice(record.dac_index_bytes()).unwrap_or_default();
        }
        Some(info)
    } else {
        None
    };

    Ok(TargetMetrics { engine: EngineMetrics::unix_default(), continue_event_rva: 0, info })
}

#[cfg(test)]
mod tests
{
    use std::io::Write;
    use std::path::PathBuf;

    use super::*;
    use crate::image::testing::{ElfBuilder, MachOBuilder, PeBuilder};
    use crate::types::guid::CLR_ID_CORECLR;
    use crate::types::{Address, CorDebugInterfaceVersion};

    fn write_temp(name: &str, bytes: &[u8]) -> PathBuf
    {
        let dir = std::env::temp_dir().join(format!("clrshim-metrics-{}-{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::File::create(&path).unwrap().write_all(bytes).unwrap();
        path
    }

    fn metrics_record(cb_size: u32, handle_pointer: u64) -> Vec<u8>
    {
        let mut raw = Vec::new();
        raw.extend_from_slice(&cb_size.to_le_bytes());
        raw.extend_from_slice(&4u32.to_le_bytes());
        raw.extend_from_slice(&handle_pointer.to_le_bytes());
        raw
    }

    fn debug_resource(signature: crate::types::Guid) -> Vec<u8>
    {
        DebugResource {
            version: 0,
            signature,
            dac_timestamp: 10,
            dac_size_of_image: 20,
            dbi_timestamp: 30,
            dbi_size_of_image: 40,
        }
        .encode()
        .to_vec()
    }

    /// A runtime whose metrics sit at 0x1000 and continue handle at 0x1100
    fn windows_runtime() -> PeBuilder
    {
        PeBuilder::new(Machine::Amd64)
            .data(0x1000, metrics_record(16, 0x1_8000_1100))
            .data(0x1100, vec![0u8; 8])
            .export("Unrelated", 0x1100)
            .export_ordinal(0x1000)
    }

    #[test]
    fn test_windows_runtime_metrics_and_identity()
    {
        let bytes = windows_runtime().resource(ResourceKey::Id(RT_RCDATA), "CLRDEBUGINFO", 0x409, debug_resource(CLR_ID_ONECORE_CLR)).build_flat();
        let path = write_temp("coreclr.dll", &bytes);

        let metrics = target_clr_metrics(&path, true).unwrap();
        assert_eq!(metrics.engine.cb_size, 16);
        assert_eq!(metrics.engine.interface_version(), CorDebugInterfaceVersion::V4_0);
        assert_eq!(metrics.continue_event_rva, 0x1100);
        let info = metrics.info.unwrap();
        assert_eq!(info.index_type, IndexType::Identity);
        assert_eq!((info.dbi.timestamp, info.dac.size_of_image), (30, 20));
        assert_eq!(info.dbi.name, "mscordbi.dll");
        assert_eq!(info.runtime_module_path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn test_windows_runtime_requires_onecore_signature()
    {
        let bytes = windows_runtime().resource(ResourceKey::Id(RT_RCDATA), "CLRDEBUGINFO", 0, debug_resource(CLR_ID_CORECLR)).build_flat();
        let path = write_temp("coreclr.dll", &bytes);
        assert!(matches!(target_clr_metrics(&path, true), Err(ShimError::Failed(_))));
        assert!(target_clr_metrics(&path, false).unwrap().info.is_none());
    }

    #[test]
    fn test_windows_single_file_export()
    {
        let mut dbi_index = Vec::new();
        dbi_index.extend_from_slice(&0x1234u32.to_le_bytes());
        dbi_index.extend_from_slice(&0x5000u32.to_le_bytes());
        let record = RuntimeInfoRecord::new(1, &[], &dbi_index, &dbi_index).encode();
        let bytes = windows_runtime().data(0x1200, record.to_vec()).export(RuntimeInfoRecord::SYMBOL, 0x1200).build_flat();
        let path = write_temp("app.exe", &bytes);

        let info = target_clr_metrics(&path, true).unwrap().info.unwrap();
        assert_eq!((info.dbi.timestamp, info.dbi.size_of_image), (0x1234, 0x5000));
        assert!(info.is_valid());

        let short = RuntimeInfoRecord::new(1, &[], &[1, 2, 3], &dbi_index).encode();
        let bytes = windows_runtime().data(0x1200, short.to_vec()).export(RuntimeInfoRecord::SYMBOL, 0x1200).build_flat();
        let path = write_temp("app-short.exe", &bytes);
        assert!(matches!(target_clr_metrics(&path, true), Err(ShimError::Failed(_))));
    }

    #[test]
    fn test_windows_metrics_size_mismatch()
    {
        let bytes = PeBuilder::new(Machine::Amd64)
            .data(0x1000, metrics_record(12, 0x1_8000_1100))
            .export("Unrelated", 0x1100)
            .export_ordinal(0x1000)
            .build_flat();
        let path = write_temp("other.dll", &bytes);
        assert!(matches!(target_clr_metrics(&path, false), Err(ShimError::InvalidArgument(_))));
    }

    #[test]
    fn test_windows_continue_event_outside_image()
    {
        let bytes = PeBuilder::new(Machine::Amd64)
            .data(0x1000, metrics_record(16, 0x1000))
            .export("Unrelated", 0x1100)
            .export_ordinal(0x1000)
            .build_flat();
        let path = write_temp("outside.dll", &bytes);
        assert!(matches!(target_clr_metrics(&path, false), Err(ShimError::Failed(_))));
    }

    #[test]
    fn test_windows_without_exports_fails()
    {
        let path = write_temp("plain.dll", &PeBuilder::new(Machine::Amd64).build_flat());
        assert!(matches!(target_clr_metrics(&path, false), Err(ShimError::Failed(_))));
    }

    #[test]
    fn test_unix_runtime_uses_build_id()
    {
        let path = write_temp("libcoreclr.so", &ElfBuilder::new().build_id(&[0x31; 20]).build());
        let metrics = target_clr_metrics(&path, true).unwrap();
        assert_eq!(metrics.engine, EngineMetrics::unix_default());
        assert_eq!(metrics.engine.continue_startup_event, Address::ZERO);
        assert_eq!(metrics.continue_event_rva, 0);
        let info = metrics.info.unwrap();
        assert_eq!(info.index_type, IndexType::Runtime);
        assert_eq!(info.runtime_build_id.as_bytes(), &[0x31; 20]);
        assert_eq!(info.dbi.name, "libmscordbi.so");
    }

    #[test]
    fn test_unix_runtime_without_build_id_is_invalid()
    {
        let path = write_temp("libcoreclr.dylib", &MachOBuilder::new().build());
        let info = target_clr_metrics(&path, true).unwrap().info.unwrap();
        assert!(!info.is_valid());
        assert_eq!(info.dac.name, "libmscordaccore.dylib");
    }

    #[test]
    fn test_unix_single_file_symbol()
    {
        let record = RuntimeInfoRecord::new(1, &[], &[0xd0; 20], &[0xb0; 20]).encode();
        let path = write_temp("myapp", &ElfBuilder::new().symbol(RuntimeInfoRecord::SYMBOL, record.to_vec()).build());
        let info = target_clr_metrics(&path, true).unwrap().info.unwrap();
        assert_eq!(info.index_type, IndexType::Identity);
        assert_eq!(info.dbi.build_id.as_bytes(), &[0xb0; 20]);

        let path = write_temp("libother.so", &ElfBuilder::new().build());
        assert!(matches!(target_clr_metrics(&path, true), Err(ShimError::Failed(_))));
        assert!(target_clr_metrics(&path, false).is_ok());
    }

    #[test]
    fn test_not_an_image()
    {
        let path = write_temp("notes.txt", b"hello world, not a module at all");
        assert!(matches!(target_clr_metrics(&path, false), Err(ShimError::Failed(_))));
    }
}
