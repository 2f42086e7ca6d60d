//! ELF images as the dynamic loader left them in a target.
//!
//! Only what is reachable from the program headers is used: section headers
//! are not mapped at run time. Symbols come from `PT_DYNAMIC` through the
//! GNU or SysV hash table, the build-id from `PT_NOTE`.

use object::elf;

use crate::error::{ShimError, ShimResult};
use crate::target::DataTarget;
use crate::types::{Address, BuildId, Machine};

const MAX_PROGRAM_HEADERS: u16 = 512;
const MAX_DYNAMIC_ENTRIES: u64 = 1024;
const MAX_NOTE_SIZE: u64 = 0x1_0000;
const MAX_HASH_CHAIN: u32 = 0x10_0000;
const PAGE_MASK: u64 = 0xfff;

/// GNU-style symbol hash (`DT_GNU_HASH`)
pub(crate) fn gnu_hash(name: &[u8]) -> u32
{
    name.iter().fold(5381u32, |hash, byte| hash.wrapping_mul(33).wrapping_add(u32::from(*byte)))
}

/// Classic SysV symbol hash (`DT_HASH`)
pub(crate) fn sysv_hash(name: &[u8]) -> u32
{
    name.iter().fold(0u32, |hash, byte| {
        let hash = (hash << 4).wrapping_add(u32::from(*byte));
        let high = hash & 0xf000_0000;
        (hash ^ (high >> 24)) & !high
    })
}

#[derive(Debug, Clone, Copy)]
struct Segment
{
    kind: u32,
    vaddr: u64,
    memsz: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct DynamicTables
{
    gnu_hash: Option<Address>,
    sysv_hash: Option<Address>,
    symtab: Option<Address>,
    strtab: Option<Address>,
}

/// A loaded ELF module
pub struct ElfImage<'t, T: DataTarget + ?Sized>
{
    target: &'t T,
    bias: Address,
    is_64: bool,
    machine: u16,
    segments: Vec<Segment>,
}

impl<'t, T: DataTarget + ?Sized> ElfImage<'t, T>
{
    /// Whether the bytes at `base` start with the ELF magic
    ///
    /// ## Errors
    ///
    /// Read errors from the target.
    pub fn probe(target: &T, base: Address) -> ShimResult<bool>
    {
        let mut magic = [0u8; 4];
        target.read_exact(base, &mut magic)?;
        Ok(magic == elf::ELFMAG)
    }

    /// Parse the ELF and program headers of the module mapped at `base`
    ///
    /// ## Errors
    ///
    /// `NotClr` for anything but a little-endian ELF with sane headers.
    pub fn parse(target: &'t T, base: Address) -> ShimResult<Self>
    {
        let mut ident = [0u8; 16];
        target.read_exact(base, &mut ident)?;
        if ident[..4] != elf::ELFMAG || ident[5] != elf::ELFDATA2LSB {
            return Err(ShimError::NotClr);
        }
        let is_64 = match ident[4] {
            elf::ELFCLASS64 => true,
            elf::ELFCLASS32 => false,
            _ => return Err(ShimError::NotClr),
        };

        let machine = target.read_u16(base + 18)?;
        let (phoff, phentsize, phnum) = if is_64 {
            (target.read_u64(base + 32)?, target.read_u16(base + 54)?, target.read_u16(base + 56)?)
        } else {
            (u64::from(target.read_u32(base + 28)?), target.read_u16(base + 42)?, target.read_u16(base + 44)?)
        };
        let expected_entsize = if is_64 { 56 } else { 32 };
        if phnum > MAX_PROGRAM_HEADERS || (phnum > 0 && phentsize < expected_entsize) {
            return Err(ShimError::NotClr);
        }

        let mut segments = Vec::with_capacity(usize::from(phnum));
        for index in 0..u64::from(phnum) {
            let header = base + phoff + index * u64::from(phentsize);
            let segment = if is_64 {
                Segment {
                    kind: target.read_u32(header)?,
                    vaddr: target.read_u64(header + 16)?,
                    memsz: target.read_u64(header + 40)?,
                }
            } else {
                Segment {
                    kind: target.read_u32(header)?,
                    vaddr: u64::from(target.read_u32(header + 8)?),
                    memsz: u64::from(target.read_u32(header + 20)?),
                }
            };
            segments.push(segment);
        }

        // The first PT_LOAD maps file offset 0 at `base`.
        let first_load = segments.iter().find(|segment| segment.kind == elf::PT_LOAD).map_or(0, |segment| segment.vaddr);
        let bias = base.checked_sub(first_load & !PAGE_MASK).ok_or(ShimError::NotClr)?;

        Ok(ElfImage { target, bias, is_64, machine, segments })
    }

    pub fn machine(&self) -> Option<Machine>
    {
        Machine::from_elf(self.machine)
    }

    /// Load bias: target address of virtual address 0
    pub fn bias(&self) -> Address
    {
        self.bias
    }

    fn pointer_size(&self) -> usize
    {
        if self.is_64 {
            8
        } else {
            4
        }
    }

    /// `NT_GNU_BUILD_ID` from the first note segment that has one
    ///
    /// ## Errors
    ///
    /// Read errors from the target.
    pub fn build_id(&self) -> ShimResult<Option<BuildId>>
    {
        for segment in self.segments.iter().filter(|segment| segment.kind == elf::PT_NOTE) {
            let size = segment.memsz.min(MAX_NOTE_SIZE);
            if size == 0 {
                continue;
            }
            #[allow(clippy::cast_possible_truncation)]
            let notes = self.target.read_bytes(self.bias + segment.vaddr, size as usize)?;
            if let Some(id) = find_build_id_note(&notes) {
                return Ok(BuildId::from_slice(id));
            }
        }
        Ok(None)
    }

    /// Target address of the dynamic symbol `name`
    ///
    /// ## Errors
    ///
    /// Read errors from the target. A module without a dynamic section or
    /// hash table simply has no symbols.
    pub fn symbol_address(&self, name: &str) -> ShimResult<Option<Address>>
    {
        let tables = self.dynamic_tables()?;
        let (Some(symtab), Some(strtab)) = (tables.symtab, tables.strtab) else {
            return Ok(None);
        };
        let index = if let Some(table) = tables.gnu_hash {
            self.gnu_lookup(table, symtab, strtab, name)?
        } else if let Some(table) = tables.sysv_hash {
            self.sysv_lookup(table, symtab, strtab, name)?
        } else {
            tracing::debug!("ELF module has no symbol hash table");
            None
        };
        let Some(index) = index else {
            return Ok(None);
        };
        let (_, value, section) = self.read_symbol(symtab, index)?;
        if section == elf::SHN_UNDEF {
            return Ok(None);
        }
        Ok(Some(self.bias + value))
    }

    fn dynamic_tables(&self) -> ShimResult<DynamicTables>
    {
        let mut tables = DynamicTables::default();
        let Some(dynamic) = self.segments.iter().find(|segment| segment.kind == elf::PT_DYNAMIC) else {
            return Ok(tables);
        };
        let entry_size = 2 * self.pointer_size() as u64;
        let count = (dynamic.memsz / entry_size).min(MAX_DYNAMIC_ENTRIES);
        for index in 0..count {
            let entry = self.bias + dynamic.vaddr + index * entry_size;
            let tag = self.target.read_pointer(entry, self.pointer_size())?.value();
            let value = self.target.read_pointer(entry + entry_size / 2, self.pointer_size())?.value();
            match u32::try_from(tag) {
                Ok(elf::DT_NULL) => break,
                Ok(elf::DT_GNU_HASH) => tables.gnu_hash = Some(self.relocate(value)),
                Ok(elf::DT_HASH) => tables.sysv_hash = Some(self.relocate(value)),
                Ok(elf::DT_SYMTAB) => tables.symtab = Some(self.relocate(value)),
                Ok(elf::DT_STRTAB) => tables.strtab = Some(self.relocate(value)),
                _ => {}
            }
        }
        Ok(tables)
    }

    /// The dynamic linker rewrites most `d_ptr` values to absolute addresses
    /// in place; some architectures keep `.dynamic` read-only and leave them
    /// as virtual addresses.
    fn relocate(&self, value: u64) -> Address
    {
        if !self.bias.is_null() && value >= self.bias.value() {
            Address::new(value)
        } else {
            self.bias + value
        }
    }

    fn symbol_size(&self) -> u64
    {
        if self.is_64 {
            24
        } else {
            16
        }
    }

    /// `(st_name, st_value, st_shndx)` of symbol `index`
    fn read_symbol(&self, symtab: Address, index: u32) -> ShimResult<(u32, u64, u16)>
    {
        let symbol = symtab + u64::from(index) * self.symbol_size();
        if self.is_64 {
            Ok((self.target.read_u32(symbol)?, self.target.read_u64(symbol + 8)?, self.target.read_u16(symbol + 6)?))
        } else {
            Ok((
                self.target.read_u32(symbol)?,
                u64::from(self.target.read_u32(symbol + 4)?),
                self.target.read_u16(symbol + 14)?,
            ))
        }
    }

    fn symbol_named(&self, symtab: Address, strtab: Address, index: u32, name: &str) -> ShimResult<bool>
    {
        let (name_offset, _, _) = self.read_symbol(symtab, index)?;
        let mut buffer = vec![0u8; name.len() + 1];
        let read = match self.target.read_virtual(strtab + u64::from(name_offset), &mut buffer) {
            Ok(read) => read,
            Err(err) if err.is_transient() => return Ok(false),
            Err(err) => return Err(err),
        };
        Ok(read == buffer.len() && &buffer[..name.len()] == name.as_bytes() && buffer[name.len()] == 0)
    }

    fn gnu_lookup(&self, table: Address, symtab: Address, strtab: Address, name: &str) -> ShimResult<Option<u32>>
    {
        let bucket_count = self.target.read_u32(table)?;
        let symbol_offset = self.target.read_u32(table + 4)?;
        let bloom_size = self.target.read_u32(table + 8)?;
        if bucket_count == 0 {
            return Ok(None);
        }
        let hash = gnu_hash(name.as_bytes());
        let buckets = table + 16 + u64::from(bloom_size) * self.pointer_size() as u64;
        let chains = buckets + u64::from(bucket_count) * 4;

        let mut index = self.target.read_u32(buckets + u64::from(hash % bucket_count) * 4)?;
        if index < symbol_offset {
            return Ok(None);
        }
        for _ in 0..MAX_HASH_CHAIN {
            let chain = self.target.read_u32(chains + u64::from(index - symbol_offset) * 4)?;
            if (chain | 1) == (hash | 1) && self.symbol_named(symtab, strtab, index, name)? {
                return Ok(Some(index));
            }
            if chain & 1 != 0 {
                break;
            }
            index += 1;
        }
        Ok(None)
    }

    fn sysv_lookup(&self, table: Address, symtab: Address, strtab: Address, name: &str) -> ShimResult<Option<u32>>
    {
        let bucket_count = self.target.read_u32(table)?;
        let chain_count = self.target.read_u32(table + 4)?;
        if bucket_count == 0 {
            return Ok(None);
        }
        let buckets = table + 8;
        let chains = buckets + u64::from(bucket_count) * 4;

        let hash = sysv_hash(name.as_bytes());
        let mut index = self.target.read_u32(buckets + u64::from(hash % bucket_count) * 4)?;
        let mut steps = 0;
        while index != 0 && index < chain_count && steps < MAX_HASH_CHAIN {
            if self.symbol_named(symtab, strtab, index, name)? {
                return Ok(Some(index));
            }
            index = self.target.read_u32(chains + u64::from(index) * 4)?;
            steps += 1;
        }
        Ok(None)
    }
}

/// Walk a note segment for `NT_GNU_BUILD_ID` owned by `"GNU"`
fn find_build_id_note(mut notes: &[u8]) -> Option<&[u8]>
{
    let align = |value: usize| value.div_ceil(4) * 4;
    while notes.len() >= 12 {
        let field = |offset: usize| u32::from_le_bytes([notes[offset], notes[offset + 1], notes[offset + 2], notes[offset + 3]]);
        let name_size = field(0) as usize;
        let desc_size = field(4) as usize;
        let kind = field(8);
        let desc_start = 12 + align(name_size);
        let next = desc_start.checked_add(align(desc_size))?;
        if desc_start + desc_size > notes.len() {
            return None;
        }
        let name = &notes[12..12 + name_size];
        if kind == elf::NT_GNU_BUILD_ID && name.strip_suffix(&[0]).unwrap_or(name) == elf::ELF_NOTE_GNU {
            return Some(&notes[desc_start..desc_start + desc_size]);
        }
        if next >= notes.len() {
            return None;
        }
        notes = &notes[next..];
    }
    None
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::image::testing::ElfBuilder;
    use crate::target::MemoryTarget;
    use crate::types::Platform;

    const BASE: u64 = 0x7f00_0000_0000;

    fn load(image: Vec<u8>) -> MemoryTarget
    {
        MemoryTarget::new(Platform::PosixAmd64).with_region(Address::new(BASE), image)
    }

    #[test]
    fn test_gnu_hash_known_values()
    {
        assert_eq!(gnu_hash(b""), 0x0000_1505);
        assert_eq!(gnu_hash(b"printf"), 0x156b_2bb8);
    }

    #[test]
    fn test_sysv_hash_known_values()
    {
        assert_eq!(sysv_hash(b""), 0);
        assert_eq!(sysv_hash(b"printf"), 0x0779_05a6);
    }

    #[test]
    fn test_build_id_and_machine()
    {
        let target = load(ElfBuilder::new().build_id(&[0xab; 20]).build());
        let image = ElfImage::parse(&target, Address::new(BASE)).unwrap();
        assert_eq!(image.machine(), Some(Machine::Amd64));
        assert_eq!(image.bias(), Address::new(BASE));
        assert_eq!(image.build_id().unwrap().unwrap().as_bytes(), &[0xab; 20]);
    }

    #[test]
    fn test_build_id_note_with_terminated_owner()
    {
        let mut notes = Vec::new();
        // An unrelated note first, then the build-id owned by "GNU\0".
        notes.extend_from_slice(&[8, 0, 0, 0, 4, 0, 0, 0, 1, 0, 0, 0]);
        notes.extend_from_slice(b"stapsdt\0");
        notes.extend_from_slice(&[1, 2, 3, 4]);
        notes.extend_from_slice(&[4, 0, 0, 0, 4, 0, 0, 0, 3, 0, 0, 0]);
        notes.extend_from_slice(b"GNU\0");
        notes.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(find_build_id_note(&notes), Some(&[0xde, 0xad, 0xbe, 0xef][..]));

        let mut other_owner = Vec::new();
        other_owner.extend_from_slice(&[4, 0, 0, 0, 4, 0, 0, 0, 3, 0, 0, 0]);
        other_owner.extend_from_slice(b"Go\0\0");
        other_owner.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(find_build_id_note(&other_owner), None);
    }

    #[test]
    fn test_missing_build_id()
    {
        let target = load(ElfBuilder::new().build());
        let image = ElfImage::parse(&target, Address::new(BASE)).unwrap();
        assert!(image.build_id().unwrap().is_none());
    }

    #[test]
    fn test_symbol_lookup_gnu_hash()
    {
        let target = load(ElfBuilder::new().symbol("alpha", vec![1; 8]).symbol("DotNetRuntimeInfo", vec![2; 96]).build());
        let image = ElfImage::parse(&target, Address::new(BASE)).unwrap();
        let address = image.symbol_address("DotNetRuntimeInfo").unwrap().unwrap();
        assert_eq!(target.read_bytes(address, 96).unwrap(), vec![2; 96]);
        assert!(image.symbol_address("DotNetRuntimeInf").unwrap().is_none());
        assert!(image.symbol_address("beta").unwrap().is_none());
    }

    #[test]
    fn test_symbol_lookup_sysv_hash()
    {
        let target = load(ElfBuilder::new().sysv_hash(true).symbol("alpha", vec![1; 8]).symbol("gamma", vec![3; 4]).build());
        let image = ElfImage::parse(&target, Address::new(BASE)).unwrap();
        let address = image.symbol_address("gamma").unwrap().unwrap();
        assert_eq!(target.read_u32(address).unwrap(), 0x0303_0303);
        assert!(image.symbol_address("delta").unwrap().is_none());
    }

    #[test]
    fn test_not_elf()
    {
        let target = load(vec![0u8; 256]);
        assert!(!ElfImage::probe(&target, Address::new(BASE)).unwrap());
        assert!(matches!(ElfImage::parse(&target, Address::new(BASE)), Err(ShimError::NotClr)));
    }
}
