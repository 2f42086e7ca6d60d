//! Module files read from disk instead of target memory.
//!
//! ELF and Mach-O files go through the `object` crate: section headers and
//! the full symbol tables are available on disk even when the loader never
//! maps them. PE files use the shim's own decoder in flat layout.

use std::path::Path;

use object::{BinaryFormat, Object, ObjectSegment, ObjectSymbol};

use super::pe::{PeImage, PeLayout};
use crate::error::{ShimError, ShimResult};
use crate::target::FileImage;
use crate::types::{Address, BuildId};

/// A module file opened for identification
#[derive(Debug)]
pub struct ModuleFile
{
    image: FileImage,
}

impl ModuleFile
{
    /// Open `path`
    ///
    /// ## Errors
    ///
    /// `Io` when the file can't be opened or mapped.
    pub fn open(path: impl AsRef<Path>) -> ShimResult<Self>
    {
        Ok(ModuleFile { image: FileImage::open(path)? })
    }

    pub fn path(&self) -> &Path
    {
        self.image.path()
    }

    pub fn bytes(&self) -> &[u8]
    {
        self.image.bytes()
    }

    /// Container format, if the file is one `object` recognises
    pub fn format(&self) -> Option<BinaryFormat>
    {
        object::FileKind::parse(self.bytes()).ok().and_then(|kind| match kind {
            object::FileKind::Elf32 | object::FileKind::Elf64 => Some(BinaryFormat::Elf),
            object::FileKind::MachO32 | object::FileKind::MachO64 => Some(BinaryFormat::MachO),
            object::FileKind::Pe32 | object::FileKind::Pe64 => Some(BinaryFormat::Pe),
            _ => None,
        })
    }

    /// Whether the file is a PE image
    pub fn is_pe(&self) -> bool
    {
        self.format() == Some(BinaryFormat::Pe)
    }

    /// PE view over the file
    ///
    /// ## Errors
    ///
    /// `NotClr` when the file isn't a PE image.
    pub fn pe(&self) -> ShimResult<PeImage<'_, FileImage>>
    {
        PeImage::parse(&self.image, Address::ZERO, PeLayout::Flat)
    }

    fn parse(&self) -> ShimResult<object::File<'_>>
    {
        object::File::parse(self.bytes()).map_err(|err| {
            tracing::debug!(path = %self.path().display(), %err, "unparseable module file");
            ShimError::NotClr
        })
    }

    /// ELF `NT_GNU_BUILD_ID` or Mach-O `LC_UUID`
    ///
    /// ## Errors
    ///
    /// `NotClr` when the file isn't an ELF or Mach-O image.
    pub fn build_id(&self) -> ShimResult<Option<BuildId>>
    {
        let file = self.parse()?;
        let id = match file.format() {
            BinaryFormat::Elf => file.build_id().map_err(|_| ShimError::NotClr)?.and_then(BuildId::from_slice),
            BinaryFormat::MachO => file.mach_uuid().map_err(|_| ShimError::NotClr)?.and_then(|uuid| BuildId::from_slice(&uuid)),
            _ => return Err(ShimError::NotClr),
        };
        Ok(id)
    }

    /// File offset of the exported symbol `name`
    ///
    /// Dynamic symbols are searched first, then the static table. Mach-O
    /// names carry a leading underscore, which is added here.
    ///
    /// ## Errors
    ///
    /// `NotClr` when the file can't be parsed.
    pub fn symbol_offset(&self, name: &str) -> ShimResult<Option<u64>>
    {
        let file = self.parse()?;
        let wanted = if file.format() == BinaryFormat::MachO { format!("_{name}") } else { name.to_string() };
        let address = file
            .dynamic_symbols()
            .chain(file.symbols())
            .find(|symbol| symbol.is_definition() && symbol.name().is_ok_and(|found| found == wanted))
            .map(|symbol| symbol.address());
        let Some(address) = address else {
            return Ok(None);
        };

        // Translate the virtual address through the segment that holds it.
        for segment in file.segments() {
            let start = segment.address();
            if address < start || address >= start + segment.size() {
                continue;
            }
            let (offset, size) = segment.file_range();
            let delta = address - start;
            if delta >= size {
                return Ok(None);
            }
            return Ok(Some(offset + delta));
        }
        Ok(None)
    }

    /// Read `len` bytes of the symbol `name` from the file
    ///
    /// ## Errors
    ///
    /// `NotClr` when the file can't be parsed or the symbol runs past its end.
    pub fn read_symbol(&self, name: &str, len: usize) -> ShimResult<Option<Vec<u8>>>
    {
        let Some(offset) = self.symbol_offset(name)? else {
            return Ok(None);
        };
        let start = usize::try_from(offset).map_err(|_| ShimError::NotClr)?;
        let bytes = self.bytes().get(start..start + len).ok_or(ShimError::NotClr)?;
        Ok(Some(bytes.to_vec()))
    }
}

#[cfg(test)]
mod tests
{
    use std::io::Write;

    use super::*;
    use crate::image::testing::{ElfBuilder, MachOBuilder, PeBuilder};
    use crate::types::Machine;

    fn write_temp(name: &str, bytes: &[u8]) -> std::path::PathBuf
    {
        let dir = std::env::temp_dir().join(format!("clrshim-ondisk-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::File::create(&path).unwrap().write_all(bytes).unwrap();
        path
    }

    #[test]
    fn test_elf_build_id_and_symbol()
    {
        let bytes = ElfBuilder::new().build_id(&[0x11; 20]).symbol("DotNetRuntimeInfo", vec![0x42; 96]).build();
        let path = write_temp("libsingle.so", &bytes);
        let module = ModuleFile::open(&path).unwrap();
        assert_eq!(module.format(), Some(BinaryFormat::Elf));
        assert_eq!(module.build_id().unwrap().unwrap().as_bytes(), &[0x11; 20]);
        assert_eq!(module.read_symbol("DotNetRuntimeInfo", 96).unwrap().unwrap(), vec![0x42; 96]);
        assert!(module.read_symbol("Nope", 4).unwrap().is_none());
    }

    #[test]
    fn test_macho_uuid_and_symbol()
    {
        let bytes = MachOBuilder::new().uuid([0x22; 16]).symbol("DotNetRuntimeInfo", vec![0x43; 96]).build();
        let path = write_temp("libsingle.dylib", &bytes);
        let module = ModuleFile::open(&path).unwrap();
        assert_eq!(module.format(), Some(BinaryFormat::MachO));
        assert_eq!(module.build_id().unwrap().unwrap().as_bytes(), &[0x22; 16]);
        assert_eq!(module.read_symbol("DotNetRuntimeInfo", 96).unwrap().unwrap(), vec![0x43; 96]);
    }

    #[test]
    fn test_pe_file_uses_flat_layout()
    {
        let bytes = PeBuilder::new(Machine::Amd64).export("Thing", 0x1010).build_flat();
        let path = write_temp("thing.dll", &bytes);
        let module = ModuleFile::open(&path).unwrap();
        assert!(module.is_pe());
        assert_eq!(module.pe().unwrap().export_rva_by_name("Thing").unwrap(), Some(0x1010));
        assert!(matches!(module.build_id(), Err(ShimError::NotClr)));
    }
}
