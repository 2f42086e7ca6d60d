//! Runtime identification over a data target.
//!
//! Windows runtimes carry a `CLRDEBUGINFO` resource naming the exact DBI and
//! DAC builds by timestamp and image size. Unix runtimes are keyed by
//! build-id: single-file apps export a `DotNetRuntimeInfo` record with the
//! DBI and DAC build-ids, plain runtimes only have their own.

use tracing::{debug, trace};

use super::names::{self, CROSS_DBI_NAME};
use super::Identification;
use crate::error::{ShimError, ShimResult};
use crate::image::pe::RT_RCDATA;
use crate::image::{PeImage, PeLayout, ResourceKey, UnixImage};
use crate::target::DataTarget;
use crate::types::guid::{CLR_ID_ONECORE_CLR, CLR_ID_PHONE_CLR};
use crate::types::{
    Address, BuildId, ClrDebuggingVersion, ClrInfo, DebugResource, Guid, IndexType, Machine, ModuleIndex,
    RuntimeInfoRecord,
};

/// Decides whether a loaded module is a runtime and which DBI/DAC it needs
///
/// The SKU is the runtime flavor the debugger is prepared to handle; a
/// runtime stamped with another flavor is reported as
/// [`ShimError::NotClr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeIdentifier
{
    sku: Guid,
    host_machine: Machine,
}

impl RuntimeIdentifier
{
    pub fn new(sku: Guid) -> Self
    {
        RuntimeIdentifier { sku, host_machine: Machine::host() }
    }

    /// Identify as if running on `host_machine`
    ///
    /// The host architecture selects the extended resource name and the
    /// long DAC name.
    #[must_use]
    pub fn with_host_machine(mut self, host_machine: Machine) -> Self
    {
        self.host_machine = host_machine;
        self
    }

    pub fn sku(&self) -> Guid
    {
        self.sku
    }

    /// Identify the module loaded at `base`
    ///
    /// ## Errors
    ///
    /// - `NotClr` when the module is not a runtime of the configured SKU
    /// - the data target's error when its platform can't be queried, or a
    ///   Unix module header can't be read
    pub fn identify<T: DataTarget + ?Sized>(&self, target: &T, base: Address) -> ShimResult<Identification>
    {
        if target.platform()?.is_windows() {
            self.identify_windows(target, base).map_err(|err| {
                debug!(%base, %err, "not a runtime");
                ShimError::NotClr
            })
        } else {
            Self::identify_unix(target, base)
        }
    }

    fn identify_windows<T: DataTarget + ?Sized>(&self, target: &T, base: Address) -> ShimResult<Identification>
    {
        let pe = PeImage::parse(target, base, PeLayout::Mapped)?;
        let fixed = pe.fixed_file_info()?;
        let version = fixed.product_version();

        let rc_data = ResourceKey::Id(RT_RCDATA);
        let extended = names::debug_resource_name(self.host_machine);
        let mut cross_platform_naming = true;
        let mut resource = pe.find_resource(rc_data, ResourceKey::Name(&extended), 0)?;
        if resource.is_none() && pe.machine_raw() == self.host_machine.pe_machine() {
            cross_platform_naming = false;
            resource = pe.find_resource(rc_data, ResourceKey::Name(names::DEBUG_RESOURCE_NAME), 0)?;
        }
        let resource = resource.ok_or(ShimError::NotClr)?;
        if resource.size as usize != DebugResource::SIZE {
            return Err(ShimError::NotClr);
        }
        let debug = DebugResource::decode(&pe.read_rva(resource.rva, DebugResource::SIZE)?).ok_or(ShimError::NotClr)?;
        if debug.version != 0 {
            return Err(ShimError::NotClr);
        }
        if debug.signature != self.sku && !(debug.signature == CLR_ID_PHONE_CLR && self.sku == CLR_ID_ONECORE_CLR) {
            let signature = debug.signature;
            trace!(%signature, sku = %self.sku, "runtime SKU mismatch");
            return Err(ShimError::NotClr);
        }

        let (short_dbi, short_dac) = names::windows_library_names(&self.sku)?;
        let (dbi_name, dac_name) = if debug.signature != CLR_ID_ONECORE_CLR && cross_platform_naming {
            let long = pe.machine().ok_or(ShimError::NotClr).and_then(|target_machine| {
                names::long_dac_name(&self.sku, self.host_machine, target_machine, version, fixed.flavor_suffix())
            });
            match long {
                Ok(dac) => (CROSS_DBI_NAME.to_string(), dac),
                Err(err) => {
                    debug!(%err, "no long DAC name, using the short one");
                    (CROSS_DBI_NAME.to_string(), short_dac)
                }
            }
        } else {
            (short_dbi, short_dac)
        };

        let mut info = ClrInfo::new(true);
        info.index_type = IndexType::Identity;
        info.dbi = ModuleIndex {
            name: dbi_name,
            timestamp: debug.dbi_timestamp,
            size_of_image: debug.dbi_size_of_image,
            ..Default::default()
        };
        info.dac = ModuleIndex {
            name: dac_name,
            timestamp: debug.dac_timestamp,
            size_of_image: debug.dac_size_of_image,
            ..Default::default()
        };
        debug!(%base, %version, dbi = %info.dbi.name, dac = %info.dac.name, "identified Windows runtime");
        Ok(Identification { info, version })
    }

    fn identify_unix<T: DataTarget + ?Sized>(target: &T, base: Address) -> ShimResult<Identification>
    {
        let image = UnixImage::parse(target, base)?;
        let (dbi_name, dac_name) = names::unix_library_names(matches!(image, UnixImage::MachO(_)));
        let mut info = ClrInfo::new(false);
        info.dbi = ModuleIndex::named(dbi_name);
        info.dac = ModuleIndex::named(dac_name);

        match Self::read_runtime_info(target, &image) {
            Ok(Some(record)) if record.signature_matches() => {
                info.index_type = IndexType::Identity;
                info.dbi.build_id = BuildId::from_slice(record.dbi_index_bytes()).unwrap_or_default();
                info.dac.build_id = BuildId::from_slice(record.dac_index_bytes()).unwrap_or_default();
            }
            Ok(_) => {}
            Err(err) => debug!(%base, %err, "unreadable runtime info record"),
        }

        if !info.is_valid() {
            match image.build_id() {
                Ok(Some(build_id)) => {
                    info.index_type = IndexType::Runtime;
                    info.runtime_build_id = build_id;
                }
                Ok(None) => trace!(%base, "module has no build-id"),
                Err(err) => debug!(%base, %err, "unreadable build-id"),
            }
        }

        // An invalid identity is still handed back; the resolver rejects it.
        debug!(%base, index_type = ?info.index_type, valid = info.is_valid(), "identified Unix module");
        Ok(Identification { info, version: ClrDebuggingVersion::default() })
    }

    fn read_runtime_info<T: DataTarget + ?Sized>(
        target: &T,
        image: &UnixImage<'_, T>,
    ) -> ShimResult<Option<RuntimeInfoRecord>>
    {
        let Some(address) = image.symbol_address(RuntimeInfoRecord::SYMBOL)? else {
            return Ok(None);
        };
        let bytes = target.read_bytes(address, RuntimeInfoRecord::SIZE)?;
        Ok(RuntimeInfoRecord::decode(&bytes))
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::image::testing::{ElfBuilder, MachOBuilder, PeBuilder};
    use crate::target::MemoryTarget;
    use crate::types::guid::{CLR_ID_CORECLR, CLR_ID_V4_DESKTOP};
    use crate::types::Platform;

    const PE_BASE: u64 = 0x1_8000_0000;
    const UNIX_BASE: u64 = 0x7f00_0000_0000;

    fn debug_resource(signature: Guid) -> Vec<u8>
    {
        DebugResource {
            version: 0,
            signature,
            dac_timestamp: 0x1111,
            dac_size_of_image: 0x2222,
            dbi_timestamp: 0x3333,
            dbi_size_of_image: 0x4444,
        }
        .encode()
        .to_vec()
    }

    fn windows_target(builder: &PeBuilder) -> MemoryTarget
    {
        MemoryTarget::new(Platform::WindowsAmd64).with_region(Address::new(PE_BASE), builder.build_mapped())
    }

    fn rc_data() -> ResourceKey<'static>
    {
        ResourceKey::Id(RT_RCDATA)
    }

    #[test]
    fn test_windows_extended_resource_uses_long_dac_name()
    {
        let builder = PeBuilder::new(Machine::Arm64)
            .version(8, 0, 1, 2)
            .resource(rc_data(), "CLRDEBUGINFOWINDOWSAMD64", 0, debug_resource(CLR_ID_CORECLR));
        let target = windows_target(&builder);
        let identifier = RuntimeIdentifier::new(CLR_ID_CORECLR).with_host_machine(Machine::Amd64);

        let found = identifier.identify(&target, Address::new(PE_BASE)).unwrap();
        assert_eq!(found.version, ClrDebuggingVersion::new(8, 0, 1, 2));
        assert_eq!(found.info.index_type, IndexType::Identity);
        assert_eq!(found.info.dac.name, "mscordaccore_amd64_arm64_8.0.1.02.dll");
        assert_eq!(found.info.dbi.name, "mscordbi_x86.dll");
        assert_eq!((found.info.dbi.timestamp, found.info.dbi.size_of_image), (0x3333, 0x4444));
        assert_eq!((found.info.dac.timestamp, found.info.dac.size_of_image), (0x1111, 0x2222));
        assert!(found.info.is_valid());
    }

    #[test]
    fn test_windows_bare_resource_needs_matching_machine()
    {
        let builder = PeBuilder::new(Machine::Amd64)
            .version(6, 0, 0, 0)
            .resource(rc_data(), "CLRDEBUGINFO", 0, debug_resource(CLR_ID_PHONE_CLR));
        let target = windows_target(&builder);

        let onecore = RuntimeIdentifier::new(CLR_ID_ONECORE_CLR).with_host_machine(Machine::Amd64);
        let found = onecore.identify(&target, Address::new(PE_BASE)).unwrap();
        assert_eq!(found.info.dbi.name, "mscordbi.dll");
        assert_eq!(found.info.dac.name, "mscordaccore.dll");

        let other_host = RuntimeIdentifier::new(CLR_ID_ONECORE_CLR).with_host_machine(Machine::Arm64);
        assert!(matches!(other_host.identify(&target, Address::new(PE_BASE)), Err(ShimError::NotClr)));
    }

    #[test]
    fn test_windows_sku_mismatch_is_not_clr()
    {
        let builder = PeBuilder::new(Machine::Amd64)
            .version(4, 0, 30319, 0)
            .resource(rc_data(), "CLRDEBUGINFO", 0, debug_resource(CLR_ID_V4_DESKTOP));
        let target = windows_target(&builder);
        let identifier = RuntimeIdentifier::new(CLR_ID_CORECLR).with_host_machine(Machine::Amd64);
        assert!(matches!(identifier.identify(&target, Address::new(PE_BASE)), Err(ShimError::NotClr)));

        let desktop = RuntimeIdentifier::new(CLR_ID_V4_DESKTOP).with_host_machine(Machine::Amd64);
        assert_eq!(desktop.identify(&target, Address::new(PE_BASE)).unwrap().info.dac.name, "mscordacwks.dll");
    }

    #[test]
    fn test_windows_malformed_resource_is_not_clr()
    {
        let identifier = RuntimeIdentifier::new(CLR_ID_CORECLR).with_host_machine(Machine::Amd64);

        let mut short = debug_resource(CLR_ID_CORECLR);
        short.pop();
        let builder = PeBuilder::new(Machine::Amd64).version(8, 0, 0, 0).resource(rc_data(), "CLRDEBUGINFO", 0, short);
        assert!(matches!(identifier.identify(&windows_target(&builder), Address::new(PE_BASE)), Err(ShimError::NotClr)));

        let mut versioned = debug_resource(CLR_ID_CORECLR);
        versioned[0] = 1;
        let builder =
            PeBuilder::new(Machine::Amd64).version(8, 0, 0, 0).resource(rc_data(), "CLRDEBUGINFO", 0, versioned);
        assert!(matches!(identifier.identify(&windows_target(&builder), Address::new(PE_BASE)), Err(ShimError::NotClr)));

        let builder = PeBuilder::new(Machine::Amd64).resource(rc_data(), "CLRDEBUGINFO", 0, debug_resource(CLR_ID_CORECLR));
        assert!(matches!(identifier.identify(&windows_target(&builder), Address::new(PE_BASE)), Err(ShimError::NotClr)));
    }

    #[test]
    fn test_unix_single_file_identity()
    {
        let record = RuntimeInfoRecord::new(2, &[0xaa; 20], &[0xdd; 20], &[0xbb; 20]);
        let bytes = ElfBuilder::new().build_id(&[0x11; 20]).symbol(RuntimeInfoRecord::SYMBOL, record.encode().to_vec()).build();
        let target = MemoryTarget::new(Platform::PosixAmd64).with_region(Address::new(UNIX_BASE), bytes);

        let found = RuntimeIdentifier::new(CLR_ID_CORECLR).identify(&target, Address::new(UNIX_BASE)).unwrap();
        assert_eq!(found.info.index_type, IndexType::Identity);
        assert_eq!(found.info.dbi.build_id.as_bytes(), &[0xbb; 20]);
        assert_eq!(found.info.dac.build_id.as_bytes(), &[0xdd; 20]);
        assert_eq!(found.info.dbi.name, "libmscordbi.so");
        assert!(found.info.runtime_build_id.is_empty());
        assert_eq!(found.version, ClrDebuggingVersion::default());
    }

    #[test]
    fn test_unix_runtime_build_id()
    {
        let bytes = ElfBuilder::new().build_id(&[0x42; 20]).build();
        let target = MemoryTarget::new(Platform::PosixAmd64).with_region(Address::new(UNIX_BASE), bytes);
        let found = RuntimeIdentifier::new(CLR_ID_CORECLR).identify(&target, Address::new(UNIX_BASE)).unwrap();
        assert_eq!(found.info.index_type, IndexType::Runtime);
        assert_eq!(found.info.runtime_build_id.as_bytes(), &[0x42; 20]);
        assert!(found.info.is_valid());
    }

    #[test]
    fn test_unix_bad_signature_falls_back_to_build_id()
    {
        let mut record = RuntimeInfoRecord::new(2, &[], &[0xdd; 20], &[0xbb; 20]).encode();
        record[0] = b'X';
        let bytes = MachOBuilder::new().uuid([0x77; 16]).symbol(RuntimeInfoRecord::SYMBOL, record.to_vec()).build();
        let target = MemoryTarget::new(Platform::PosixArm64).with_region(Address::new(UNIX_BASE), bytes);
        let found = RuntimeIdentifier::new(CLR_ID_CORECLR).identify(&target, Address::new(UNIX_BASE)).unwrap();
        assert_eq!(found.info.index_type, IndexType::Runtime);
        assert_eq!(found.info.dac.name, "libmscordaccore.dylib");
    }

    #[test]
    fn test_unix_without_identity_is_invalid_not_error()
    {
        let target = MemoryTarget::new(Platform::PosixAmd64).with_region(Address::new(UNIX_BASE), ElfBuilder::new().build());
        let found = RuntimeIdentifier::new(CLR_ID_CORECLR).identify(&target, Address::new(UNIX_BASE)).unwrap();
        assert!(!found.info.is_valid());

        let target = MemoryTarget::new(Platform::PosixAmd64).with_region(Address::new(UNIX_BASE), vec![0u8; 256]);
        assert!(matches!(
            RuntimeIdentifier::new(CLR_ID_CORECLR).identify(&target, Address::new(UNIX_BASE)),
            Err(ShimError::NotClr)
        ));
    }
}
