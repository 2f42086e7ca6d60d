//! # PE Image Decoder
//!
//! Reads the parts of a PE image the shim needs: machine type, data
//! directories, exports (by name and ordinal) and the resource tree.
//!
//! Works over any [`DataTarget`] in one of two layouts:
//!
//! - [`PeLayout::Mapped`]: the image as the loader mapped it, so an RVA is an
//!   offset from the base. This is what a live target or dump presents.
//! - [`PeLayout::Flat`]: the raw file, so RVAs go through the section table
//!   to become file offsets.
//!
//! Every RVA coming out of the image is checked against `SizeOfImage` (or the
//! section table) before it is dereferenced. Structural problems surface as
//! [`ShimError::NotClr`]; read failures propagate unchanged.

use object::pe;

use crate::error::{ShimError, ShimResult};
use crate::target::DataTarget;
use crate::types::{Address, FixedFileInfo, Machine};

const SECTION_HEADER_SIZE: u64 = 40;
const EXPORT_DIRECTORY_SIZE: usize = 40;
const RESOURCE_DIRECTORY_SIZE: u64 = 16;
const RESOURCE_ENTRY_SIZE: u64 = 8;
const RESOURCE_DATA_ENTRY_SIZE: usize = 16;
const HIGH_BIT: u32 = 0x8000_0000;

/// Predefined resource types
pub const RT_VERSION: u16 = 16;
pub const RT_RCDATA: u16 = 10;

/// How RVAs map onto target addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeLayout
{
    Mapped,
    Flat,
}

/// An RVA and length inside the image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataDirectory
{
    pub rva: u32,
    pub size: u32,
}

impl DataDirectory
{
    pub fn is_present(&self) -> bool
    {
        self.rva != 0
    }
}

/// A resource directory key: numeric id or case-sensitive UTF-16 name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKey<'a>
{
    Id(u16),
    Name(&'a str),
}

#[derive(Debug, Clone, Copy)]
struct Section
{
    virtual_address: u32,
    virtual_size: u32,
    raw_size: u32,
    raw_pointer: u32,
}

/// Decoded export directory
#[derive(Debug, Clone, Copy)]
struct ExportDirectory
{
    base: u32,
    number_of_functions: u32,
    number_of_names: u32,
    address_of_functions: u32,
    address_of_names: u32,
    address_of_name_ordinals: u32,
}

/// A parsed PE image in a data target
pub struct PeImage<'t, T: DataTarget + ?Sized>
{
    target: &'t T,
    base: Address,
    layout: PeLayout,
    machine: u16,
    timestamp: u32,
    is_pe32_plus: bool,
    preferred_base: u64,
    size_of_image: u32,
    directories: Vec<DataDirectory>,
    sections: Vec<Section>,
}

fn not_clr<T>(what: &str) -> ShimResult<T>
{
    tracing::trace!(what, "malformed PE image");
    Err(ShimError::NotClr)
}

impl<'t, T: DataTarget + ?Sized> PeImage<'t, T>
{
    /// Parse the headers at `base`
    ///
    /// ## Errors
    ///
    /// `NotClr` on bad signatures or inconsistent headers; read errors as-is.
    pub fn parse(target: &'t T, base: Address, layout: PeLayout) -> ShimResult<Self>
    {
        if target.read_u16(base)? != pe::IMAGE_DOS_SIGNATURE {
            return not_clr("dos signature");
        }
        let nt_offset = u64::from(target.read_u32(base + 0x3c)?);
        let nt = base.checked_add(nt_offset).ok_or(ShimError::NotClr)?;
        if target.read_u32(nt)? != pe::IMAGE_NT_SIGNATURE {
            return not_clr("nt signature");
        }

        let file_header = nt + 4;
        let machine = target.read_u16(file_header)?;
        let section_count = target.read_u16(file_header + 2)?;
        let timestamp = target.read_u32(file_header + 4)?;
        let optional_size = target.read_u16(file_header + 16)?;

        let optional = file_header + 20;
        let magic = target.read_u16(optional)?;
        let (is_pe32_plus, preferred_base, directory_count_offset) = match magic {
            pe::IMAGE_NT_OPTIONAL_HDR64_MAGIC => (true, target.read_u64(optional + 24)?, 108),
            pe::IMAGE_NT_OPTIONAL_HDR32_MAGIC => (false, u64::from(target.read_u32(optional + 28)?), 92),
            _ => return not_clr("optional header magic"),
        };
        let size_of_image = target.read_u32(optional + 56)?;
        let directory_count = target.read_u32(optional + directory_count_offset)?.min(16);
        if u64::from(optional_size) < directory_count_offset + 4 + u64::from(directory_count) * 8 {
            return not_clr("optional header size");
        }

        let mut directories = Vec::with_capacity(directory_count as usize);
        let directory_table = optional + directory_count_offset + 4;
        for index in 0..u64::from(directory_count) {
            let entry = directory_table + index * 8;
            directories.push(DataDirectory { rva: target.read_u32(entry)?, size: target.read_u32(entry + 4)? });
        }

        let mut sections = Vec::with_capacity(usize::from(section_count));
        let section_table = optional + u64::from(optional_size);
        for index in 0..u64::from(section_count) {
            let header = section_table + index * SECTION_HEADER_SIZE;
            sections.push(Section {
                virtual_size: target.read_u32(header + 8)?,
                virtual_address: target.read_u32(header + 12)?,
                raw_size: target.read_u32(header + 16)?,
                raw_pointer: target.read_u32(header + 20)?,
            });
        }

        Ok(PeImage {
            target,
            base,
            layout,
            machine,
            timestamp,
            is_pe32_plus,
            preferred_base,
            size_of_image,
            directories,
            sections,
        })
    }

    /// Raw `IMAGE_FILE_HEADER::Machine`
    pub fn machine_raw(&self) -> u16
    {
        self.machine
    }

    /// Decoded machine, when it is one the shim knows
    pub fn machine(&self) -> Option<Machine>
    {
        Machine::from_pe(self.machine)
    }

    pub fn timestamp(&self) -> u32
    {
        self.timestamp
    }

    pub fn size_of_image(&self) -> u32
    {
        self.size_of_image
    }

    /// `ImageBase` from the optional header
    pub fn preferred_base(&self) -> u64
    {
        self.preferred_base
    }

    /// Width of a target pointer in bytes
    pub fn pointer_size(&self) -> usize
    {
        if self.is_pe32_plus {
            8
        } else {
            4
        }
    }

    pub fn target(&self) -> &'t T
    {
        self.target
    }

    /// Data directory `index` (`IMAGE_DIRECTORY_ENTRY_*`)
    pub fn directory(&self, index: usize) -> DataDirectory
    {
        self.directories.get(index).copied().unwrap_or_default()
    }

    /// Translate `rva..rva+len` to a target address
    ///
    /// ## Errors
    ///
    /// `NotClr` when the range leaves the image.
    pub fn rva_to_address(&self, rva: u32, len: u32) -> ShimResult<Address>
    {
        let end = u64::from(rva) + u64::from(len);
        match self.layout {
            PeLayout::Mapped => {
                if end > u64::from(self.size_of_image) {
                    return not_clr("rva outside image");
                }
                Ok(self.base + u64::from(rva))
            }
            PeLayout::Flat => {
                let section = self
                    .sections
                    .iter()
                    .find(|section| {
                        let start = u64::from(section.virtual_address);
                        let size = u64::from(section.virtual_size.max(section.raw_size));
                        u64::from(rva) >= start && end <= start + size
                    })
                    .ok_or(ShimError::NotClr)?;
                let delta = rva - section.virtual_address;
                if u64::from(delta) + u64::from(len) > u64::from(section.raw_size) {
                    return not_clr("rva outside raw data");
                }
                Ok(self.base + u64::from(section.raw_pointer) + u64::from(delta))
            }
        }
    }

    /// Read `len` bytes at `rva`
    ///
    /// ## Errors
    ///
    /// `NotClr` for out-of-image ranges, read errors otherwise.
    pub fn read_rva(&self, rva: u32, len: usize) -> ShimResult<Vec<u8>>
    {
        let len32 = u32::try_from(len).map_err(|_| ShimError::NotClr)?;
        let address = self.rva_to_address(rva, len32)?;
        self.target.read_bytes(address, len)
    }

    /// ## Errors
    ///
    /// See [`PeImage::read_rva`].
    pub fn read_rva_u32(&self, rva: u32) -> ShimResult<u32>
    {
        let address = self.rva_to_address(rva, 4)?;
        self.target.read_u32(address)
    }

    fn read_rva_u16(&self, rva: u32) -> ShimResult<u16>
    {
        let address = self.rva_to_address(rva, 2)?;
        self.target.read_u16(address)
    }

    fn export_directory(&self) -> ShimResult<Option<ExportDirectory>>
    {
        let directory = self.directory(pe::IMAGE_DIRECTORY_ENTRY_EXPORT as usize);
        if !directory.is_present() {
            return Ok(None);
        }
        let raw = self.read_rva(directory.rva, EXPORT_DIRECTORY_SIZE)?;
        let field = |offset: usize| u32::from_le_bytes([raw[offset], raw[offset + 1], raw[offset + 2], raw[offset + 3]]);
        Ok(Some(ExportDirectory {
            base: field(16),
            number_of_functions: field(20),
            number_of_names: field(24),
            address_of_functions: field(28),
            address_of_names: field(32),
            address_of_name_ordinals: field(36),
        }))
    }

    /// Whether the image has an export directory at all
    ///
    /// ## Errors
    ///
    /// Read errors on the directory itself.
    pub fn has_exports(&self) -> ShimResult<bool>
    {
        Ok(self.export_directory()?.is_some())
    }

    /// RVA exported under `ordinal`
    ///
    /// The ordinal is biased by the export table's `Base`, so the function
    /// index is `ordinal - Base`.
    ///
    /// ## Errors
    ///
    /// `NotClr` when there is no such export.
    pub fn export_rva_by_ordinal(&self, ordinal: u32) -> ShimResult<u32>
    {
        let Some(exports) = self.export_directory()? else {
            return not_clr("no export directory");
        };
        if exports.base > ordinal || exports.number_of_functions <= ordinal - exports.base {
            return not_clr("ordinal out of range");
        }
        let slot = exports.address_of_functions + (ordinal - exports.base) * 4;
        let rva = self.read_rva_u32(slot)?;
        if rva == 0 {
            return not_clr("empty export slot");
        }
        Ok(rva)
    }

    /// RVA exported under `name`, if any
    ///
    /// ## Errors
    ///
    /// `NotClr` on a corrupt export table, read errors otherwise.
    pub fn export_rva_by_name(&self, name: &str) -> ShimResult<Option<u32>>
    {
        let Some(exports) = self.export_directory()? else {
            return Ok(None);
        };
        for index in 0..exports.number_of_names {
            let name_rva = self.read_rva_u32(exports.address_of_names + index * 4)?;
            if !self.rva_string_equals(name_rva, name)? {
                continue;
            }
            let function_index = u32::from(self.read_rva_u16(exports.address_of_name_ordinals + index * 2)?);
            if function_index >= exports.number_of_functions {
                return not_clr("export name ordinal out of range");
            }
            return self.read_rva_u32(exports.address_of_functions + function_index * 4).map(Some);
        }
        Ok(None)
    }

    fn rva_string_equals(&self, rva: u32, expected: &str) -> ShimResult<bool>
    {
        let wanted = expected.len() + 1;
        let Ok(wanted32) = u32::try_from(wanted) else {
            return Ok(false);
        };
        // A name at the very end of the image may be shorter than `expected`.
        let address = match self.rva_to_address(rva, wanted32) {
            Ok(address) => address,
            Err(ShimError::NotClr) => return Ok(false),
            Err(err) => return Err(err),
        };
        let mut buffer = vec![0u8; wanted];
        let read = self.target.read_virtual(address, &mut buffer)?;
        Ok(read == wanted && &buffer[..expected.len()] == expected.as_bytes() && buffer[expected.len()] == 0)
    }

    /// Walk `type → name → language` in the resource tree to a data leaf
    ///
    /// Returns the leaf's `(rva, size)`, or `None` when any level is missing.
    ///
    /// ## Errors
    ///
    /// `NotClr` on a corrupt tree, read errors otherwise.
    pub fn find_resource(
        &self,
        resource_type: ResourceKey<'_>,
        name: ResourceKey<'_>,
        language: u16,
    ) -> ShimResult<Option<DataDirectory>>
    {
        self.resource_leaf(resource_type, name, Some(language))
    }

    /// Like [`PeImage::find_resource`], taking the first language present
    ///
    /// ## Errors
    ///
    /// `NotClr` on a corrupt tree, read errors otherwise.
    pub fn find_resource_any_language(
        &self,
        resource_type: ResourceKey<'_>,
        name: ResourceKey<'_>,
    ) -> ShimResult<Option<DataDirectory>>
    {
        self.resource_leaf(resource_type, name, None)
    }

    fn resource_leaf(
        &self,
        resource_type: ResourceKey<'_>,
        name: ResourceKey<'_>,
        language: Option<u16>,
    ) -> ShimResult<Option<DataDirectory>>
    {
        let directory = self.directory(pe::IMAGE_DIRECTORY_ENTRY_RESOURCE as usize);
        if !directory.is_present() {
            return Ok(None);
        }
        let root = directory.rva;

        let Some(type_entry) = self.find_resource_entry(root, root, resource_type)? else {
            return Ok(None);
        };
        let Some(name_dir) = Self::subdirectory(root, type_entry) else {
            return not_clr("resource type is a leaf");
        };
        let Some(name_entry) = self.find_resource_entry(root, name_dir, name)? else {
            return Ok(None);
        };
        let Some(language_dir) = Self::subdirectory(root, name_entry) else {
            return not_clr("resource name is a leaf");
        };
        let language_entry = match language {
            Some(language) => self.find_resource_entry(root, language_dir, ResourceKey::Id(language))?,
            None => self.first_resource_entry(language_dir)?,
        };
        let Some(language_entry) = language_entry else {
            return Ok(None);
        };
        if language_entry & HIGH_BIT != 0 {
            return not_clr("resource language is a directory");
        }

        let leaf = self.read_rva(root + language_entry, RESOURCE_DATA_ENTRY_SIZE)?;
        let rva = u32::from_le_bytes([leaf[0], leaf[1], leaf[2], leaf[3]]);
        let size = u32::from_le_bytes([leaf[4], leaf[5], leaf[6], leaf[7]]);
        // The data itself must lie inside the image too.
        self.rva_to_address(rva, size)?;
        Ok(Some(DataDirectory { rva, size }))
    }

    fn first_resource_entry(&self, directory: u32) -> ShimResult<Option<u32>>
    {
        let header = self.read_rva(directory, RESOURCE_DIRECTORY_SIZE as usize)?;
        let named = u16::from_le_bytes([header[12], header[13]]);
        let ids = u16::from_le_bytes([header[14], header[15]]);
        if named == 0 && ids == 0 {
            return Ok(None);
        }
        self.read_rva_u32(directory + RESOURCE_DIRECTORY_SIZE as u32 + 4).map(Some)
    }

    fn subdirectory(root: u32, offset_to_data: u32) -> Option<u32>
    {
        (offset_to_data & HIGH_BIT != 0).then(|| root + (offset_to_data & !HIGH_BIT))
    }

    /// Search one resource directory for `key`, returning its `OffsetToData`
    fn find_resource_entry(&self, root: u32, directory: u32, key: ResourceKey<'_>) -> ShimResult<Option<u32>>
    {
        let header = self.read_rva(directory, RESOURCE_DIRECTORY_SIZE as usize)?;
        let named = u32::from(u16::from_le_bytes([header[12], header[13]]));
        let ids = u32::from(u16::from_le_bytes([header[14], header[15]]));
        let first_entry = directory + RESOURCE_DIRECTORY_SIZE as u32;

        // Named entries come first, then id entries.
        let (start, count) = match key {
            ResourceKey::Name(_) => (0, named),
            ResourceKey::Id(_) => (named, ids),
        };
        for index in start..start + count {
            let entry = first_entry + index * RESOURCE_ENTRY_SIZE as u32;
            let name = self.read_rva_u32(entry)?;
            let matches = match key {
                ResourceKey::Id(id) => name & HIGH_BIT == 0 && name == u32::from(id),
                ResourceKey::Name(expected) => {
                    name & HIGH_BIT != 0 && self.resource_name_equals(root + (name & !HIGH_BIT), expected)?
                }
            };
            if matches {
                return self.read_rva_u32(entry + 4).map(Some);
            }
        }
        Ok(None)
    }

    fn resource_name_equals(&self, rva: u32, expected: &str) -> ShimResult<bool>
    {
        let length = usize::from(self.read_rva_u16(rva)?);
        let expected: Vec<u16> = expected.encode_utf16().collect();
        if length != expected.len() {
            return Ok(false);
        }
        let raw = self.read_rva(rva + 2, length * 2)?;
        Ok(raw.chunks_exact(2).map(|pair| u16::from_le_bytes([pair[0], pair[1]])).eq(expected))
    }

    /// `VS_FIXEDFILEINFO` of the `RT_VERSION` resource
    ///
    /// Looks for name 1 in language 0x409, then language-neutral, and checks
    /// the signature.
    ///
    /// ## Errors
    ///
    /// `NotClr` when there is no version resource or it is malformed.
    pub fn fixed_file_info(&self) -> ShimResult<FixedFileInfo>
    {
        let version_type = ResourceKey::Id(RT_VERSION);
        let resource = match self.find_resource(version_type, ResourceKey::Id(1), 0x409)? {
            Some(resource) => resource,
            None => self.find_resource(version_type, ResourceKey::Id(1), 0)?.ok_or(ShimError::NotClr)?,
        };

        // Three WORDs, "VS_VERSION_INFO\0" as UTF-16, then padding to a DWORD.
        let fixed_rva = ((resource.rva + 3 * 2 + 16 * 2 + 3) / 4) * 4;
        let raw = self.read_rva(fixed_rva, FixedFileInfo::SIZE)?;
        let info = FixedFileInfo::decode(&raw).ok_or(ShimError::NotClr)?;
        if info.signature != FixedFileInfo::SIGNATURE {
            return not_clr("fixed file info signature");
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::image::testing::PeBuilder;
    use crate::target::MemoryTarget;
    use crate::types::Platform;

    fn mapped(bytes: Vec<u8>) -> MemoryTarget
    {
        MemoryTarget::new(Platform::WindowsAmd64).with_region(Address::new(0x1_8000_0000), bytes)
    }

    #[test]
    fn test_parse_headers()
    {
        let image = PeBuilder::new(Machine::Amd64).build_mapped();
        let target = mapped(image);
        let pe = PeImage::parse(&target, Address::new(0x1_8000_0000), PeLayout::Mapped).unwrap();
        assert_eq!(pe.machine(), Some(Machine::Amd64));
        assert_eq!(pe.pointer_size(), 8);
        assert!(!pe.has_exports().unwrap());
    }

    #[test]
    fn test_bad_signature_is_not_clr()
    {
        let mut image = PeBuilder::new(Machine::Amd64).build_mapped();
        image[0] = b'X';
        let target = mapped(image);
        assert!(matches!(
            PeImage::parse(&target, Address::new(0x1_8000_0000), PeLayout::Mapped),
            Err(ShimError::NotClr)
        ));
    }

    #[test]
    fn test_exports_by_name_and_ordinal()
    {
        let image = PeBuilder::new(Machine::X86)
            .export("First", 0x1100)
            .export("Second", 0x1200)
            .build_mapped();
        let target = mapped(image);
        let pe = PeImage::parse(&target, Address::new(0x1_8000_0000), PeLayout::Mapped).unwrap();
        assert_eq!(pe.pointer_size(), 4);
        assert_eq!(pe.export_rva_by_name("Second").unwrap(), Some(0x1200));
        assert_eq!(pe.export_rva_by_name("Third").unwrap(), None);
        assert_eq!(pe.export_rva_by_name("Secon").unwrap(), None);
        assert_eq!(pe.export_rva_by_ordinal(2).unwrap(), 0x1200);
        assert!(matches!(pe.export_rva_by_ordinal(3), Err(ShimError::NotClr)));
        assert!(matches!(pe.export_rva_by_ordinal(0), Err(ShimError::NotClr)));
    }

    #[test]
    fn test_resource_lookup_is_case_sensitive()
    {
        let image = PeBuilder::new(Machine::Amd64)
            .resource(ResourceKey::Id(10), "CLRDEBUGINFO", 0, vec![7; 36])
            .build_mapped();
        let target = mapped(image);
        let pe = PeImage::parse(&target, Address::new(0x1_8000_0000), PeLayout::Mapped).unwrap();
        let found = pe.find_resource(ResourceKey::Id(10), ResourceKey::Name("CLRDEBUGINFO"), 0).unwrap().unwrap();
        assert_eq!(found.size, 36);
        assert_eq!(pe.read_rva(found.rva, 36).unwrap(), vec![7; 36]);
        assert!(pe.find_resource(ResourceKey::Id(10), ResourceKey::Name("clrdebuginfo"), 0).unwrap().is_none());
        assert!(pe.find_resource(ResourceKey::Id(10), ResourceKey::Name("CLRDEBUGINFO"), 1).unwrap().is_none());
    }

    #[test]
    fn test_resource_any_language()
    {
        let image = PeBuilder::new(Machine::Amd64)
            .resource(ResourceKey::Id(10), "CLRDEBUGINFO", 0x409, vec![3; 36])
            .build_mapped();
        let target = mapped(image);
        let pe = PeImage::parse(&target, Address::new(0x1_8000_0000), PeLayout::Mapped).unwrap();
        assert!(pe.find_resource(ResourceKey::Id(10), ResourceKey::Name("CLRDEBUGINFO"), 0).unwrap().is_none());
        let found = pe.find_resource_any_language(ResourceKey::Id(10), ResourceKey::Name("CLRDEBUGINFO")).unwrap().unwrap();
        assert_eq!(pe.read_rva(found.rva, 36).unwrap(), vec![3; 36]);
    }

    #[test]
    fn test_flat_layout_matches_mapped()
    {
        let builder = PeBuilder::new(Machine::Amd64).export("DotNetRuntimeInfo", 0x1040).version(8, 0, 1, 2);
        let flat = builder.build_flat();
        let target = MemoryTarget::new(Platform::WindowsAmd64).with_region(Address::ZERO, flat);
        let pe = PeImage::parse(&target, Address::ZERO, PeLayout::Flat).unwrap();
        assert_eq!(pe.export_rva_by_name("DotNetRuntimeInfo").unwrap(), Some(0x1040));
        assert_eq!(pe.fixed_file_info().unwrap().product_version().major, 8);
    }

    #[test]
    fn test_out_of_image_rva_is_not_clr()
    {
        let target = mapped(PeBuilder::new(Machine::Amd64).build_mapped());
        let pe = PeImage::parse(&target, Address::new(0x1_8000_0000), PeLayout::Mapped).unwrap();
        assert!(matches!(pe.read_rva(pe.size_of_image() - 2, 4), Err(ShimError::NotClr)));
    }
}
