//! Builders for small synthetic PE, ELF and Mach-O images.
//!
//! The test suites use these to stand up runtimes (and non-runtimes) in
//! memory or on disk without shipping binaries. The images are minimal but
//! structurally valid: the PE images load in the shim's decoder in both
//! mapped and flat layout, and the ELF and Mach-O images also parse with
//! the `object` crate.

use object::{elf, macho, pe};

use super::pe::{ResourceKey, RT_VERSION};
use crate::types::{FixedFileInfo, Machine};

const PE_HEADERS_SIZE: usize = 0x400;
const PE_SECTION_RVA: u32 = 0x1000;
const PE_NT_OFFSET: usize = 0x80;

#[derive(Debug, Clone)]
enum OwnedKey
{
    Id(u16),
    Name(String),
}

impl OwnedKey
{
    fn from_key(key: ResourceKey<'_>) -> Self
    {
        match key {
            ResourceKey::Id(id) => OwnedKey::Id(id),
            ResourceKey::Name(name) => OwnedKey::Name(name.to_string()),
        }
    }

    fn same(&self, other: &OwnedKey) -> bool
    {
        match (self, other) {
            (OwnedKey::Id(a), OwnedKey::Id(b)) => a == b,
            (OwnedKey::Name(a), OwnedKey::Name(b)) => a == b,
            _ => false,
        }
    }

    fn is_named(&self) -> bool
    {
        matches!(self, OwnedKey::Name(_))
    }
}

type LanguageNode = (u16, Vec<u8>);
type NameNode = (OwnedKey, Vec<LanguageNode>);
type TypeNode = (OwnedKey, Vec<NameNode>);

/// Builder for a one-section PE image
///
/// The single section starts at RVA `0x1000` and file offset `0x400`, so the
/// mapped and flat renderings differ and RVA translation gets exercised.
#[derive(Debug, Clone)]
pub struct PeBuilder
{
    machine: Machine,
    timestamp: u32,
    image_base: u64,
    data: Vec<(u32, Vec<u8>)>,
    functions: Vec<u32>,
    names: Vec<(String, u32)>,
    resources: Vec<TypeNode>,
}

impl PeBuilder
{
    pub fn new(machine: Machine) -> Self
    {
        PeBuilder {
            machine,
            timestamp: 0x5F00_0000,
            image_base: 0x1_8000_0000,
            data: Vec::new(),
            functions: Vec::new(),
            names: Vec::new(),
            resources: Vec::new(),
        }
    }

    fn is_pe32_plus(&self) -> bool
    {
        !matches!(self.machine, Machine::X86 | Machine::Arm)
    }

    #[must_use]
    pub fn timestamp(mut self, timestamp: u32) -> Self
    {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn image_base(mut self, image_base: u64) -> Self
    {
        self.image_base = image_base;
        self
    }

    /// Place `bytes` at `rva` (must be at least `0x1000`)
    #[must_use]
    pub fn data(mut self, rva: u32, bytes: impl Into<Vec<u8>>) -> Self
    {
        self.data.push((rva, bytes.into()));
        self
    }

    /// Named export; its ordinal is its position in the function table plus one
    #[must_use]
    pub fn export(mut self, name: &str, rva: u32) -> Self
    {
        let index = u32::try_from(self.functions.len()).unwrap_or(u32::MAX);
        self.functions.push(rva);
        self.names.push((name.to_string(), index));
        self
    }

    /// Export reachable only by ordinal
    #[must_use]
    pub fn export_ordinal(mut self, rva: u32) -> Self
    {
        self.functions.push(rva);
        self
    }

    /// Add a resource leaf
    #[must_use]
    pub fn resource(mut self, kind: ResourceKey<'_>, name: &str, language: u16, bytes: impl Into<Vec<u8>>) -> Self
    {
        self.add_resource(OwnedKey::from_key(kind), OwnedKey::Name(name.to_string()), language, bytes.into());
        self
    }

    /// Add a resource leaf with a numeric name
    #[must_use]
    pub fn resource_id(mut self, kind: ResourceKey<'_>, id: u16, language: u16, bytes: impl Into<Vec<u8>>) -> Self
    {
        self.add_resource(OwnedKey::from_key(kind), OwnedKey::Id(id), language, bytes.into());
        self
    }

    /// Add an `RT_VERSION` resource (name 1, language 0x409)
    #[must_use]
    pub fn version(self, major: u16, minor: u16, build: u16, revision: u16) -> Self
    {
        self.version_with(major, minor, build, revision, 0, 0x409)
    }

    /// Add an `RT_VERSION` resource with explicit file flags and language
    #[must_use]
    pub fn version_with(self, major: u16, minor: u16, build: u16, revision: u16, flags: u32, language: u16) -> Self
    {
        let ms = (u32::from(major) << 16) | u32::from(minor);
        let ls = (u32::from(build) << 16) | u32::from(revision);
        let mut blob = Vec::new();
        blob.extend_from_slice(&(40u16 + 52).to_le_bytes());
        blob.extend_from_slice(&52u16.to_le_bytes());
        blob.extend_from_slice(&0u16.to_le_bytes());
        for unit in "VS_VERSION_INFO\0".encode_utf16() {
            blob.extend_from_slice(&unit.to_le_bytes());
        }
        blob.extend_from_slice(&[0, 0]);
        for value in [FixedFileInfo::SIGNATURE, 0x0001_0000, ms, ls, ms, ls, 0x3f, flags, 4, 2, 0, 0, 0] {
            blob.extend_from_slice(&value.to_le_bytes());
        }
        self.resource_id(ResourceKey::Id(RT_VERSION), 1, language, blob)
    }

    fn add_resource(&mut self, kind: OwnedKey, name: OwnedKey, language: u16, bytes: Vec<u8>)
    {
        let type_index = match self.resources.iter().position(|(key, _)| key.same(&kind)) {
            Some(index) => index,
            None => {
                self.resources.push((kind, Vec::new()));
                self.resources.len() - 1
            }
        };
        let names = &mut self.resources[type_index].1;
        let name_index = match names.iter().position(|(key, _)| key.same(&name)) {
            Some(index) => index,
            None => {
                names.push((name, Vec::new()));
                names.len() - 1
            }
        };
        names[name_index].1.push((language, bytes));
    }

    /// The image as the loader maps it (RVA == offset)
    pub fn build_mapped(&self) -> Vec<u8>
    {
        let (headers, section, size_of_image) = self.render();
        let mut image = headers;
        image.resize(PE_SECTION_RVA as usize, 0);
        image.extend_from_slice(&section);
        image.resize(size_of_image as usize, 0);
        image
    }

    /// The image as a file on disk
    pub fn build_flat(&self) -> Vec<u8>
    {
        let (headers, section, _) = self.render();
        let mut file = headers;
        file.extend_from_slice(&section);
        file
    }

    fn render(&self) -> (Vec<u8>, Vec<u8>, u32)
    {
        let mut section = Vec::new();
        let place = |section: &mut Vec<u8>, rva: u32, bytes: &[u8]| {
            let offset = (rva - PE_SECTION_RVA) as usize;
            if section.len() < offset + bytes.len() {
                section.resize(offset + bytes.len(), 0);
            }
            section[offset..offset + bytes.len()].copy_from_slice(bytes);
        };
        for (rva, bytes) in &self.data {
            place(&mut section, *rva, bytes);
        }

        let mut export_directory = (0u32, 0u32);
        if !self.functions.is_empty() {
            align(&mut section, 16);
            let rva = PE_SECTION_RVA + len32(&section);
            let exports = self.render_exports(rva);
            export_directory = (rva, len32(&exports));
            section.extend_from_slice(&exports);
        }

        let mut resource_directory = (0u32, 0u32);
        if !self.resources.is_empty() {
            align(&mut section, 16);
            let rva = PE_SECTION_RVA + len32(&section);
            let resources = self.render_resources(rva);
            resource_directory = (rva, len32(&resources));
            section.extend_from_slice(&resources);
        }

        align(&mut section, 0x200);
        let size_of_image = PE_SECTION_RVA + round_up(len32(&section).max(1), 0x1000);
        let headers = self.render_headers(len32(&section), size_of_image, export_directory, resource_directory);
        (headers, section, size_of_image)
    }

    fn render_headers(&self, section_size: u32, size_of_image: u32, exports: (u32, u32), resources: (u32, u32)) -> Vec<u8>
    {
        let mut out = vec![0u8; PE_HEADERS_SIZE];
        put_u16(&mut out, 0, pe::IMAGE_DOS_SIGNATURE);
        put_u32(&mut out, 0x3c, PE_NT_OFFSET as u32);
        put_u32(&mut out, PE_NT_OFFSET, pe::IMAGE_NT_SIGNATURE);

        let file_header = PE_NT_OFFSET + 4;
        let optional_size: u16 = if self.is_pe32_plus() { 240 } else { 224 };
        put_u16(&mut out, file_header, self.machine.pe_machine());
        put_u16(&mut out, file_header + 2, 1);
        put_u32(&mut out, file_header + 4, self.timestamp);
        put_u16(&mut out, file_header + 16, optional_size);
        put_u16(&mut out, file_header + 18, pe::IMAGE_FILE_DLL | pe::IMAGE_FILE_EXECUTABLE_IMAGE);

        let optional = file_header + 20;
        let directories = if self.is_pe32_plus() {
            put_u16(&mut out, optional, pe::IMAGE_NT_OPTIONAL_HDR64_MAGIC);
            put_u64(&mut out, optional + 24, self.image_base);
            put_u32(&mut out, optional + 108, 16);
            optional + 112
        } else {
            put_u16(&mut out, optional, pe::IMAGE_NT_OPTIONAL_HDR32_MAGIC);
            put_u32(&mut out, optional + 28, self.image_base as u32);
            put_u32(&mut out, optional + 92, 16);
            optional + 96
        };
        put_u32(&mut out, optional + 32, 0x1000);
        put_u32(&mut out, optional + 36, 0x200);
        put_u32(&mut out, optional + 56, size_of_image);
        put_u32(&mut out, optional + 60, PE_HEADERS_SIZE as u32);
        put_u32(&mut out, directories, exports.0);
        put_u32(&mut out, directories + 4, exports.1);
        put_u32(&mut out, directories + 16, resources.0);
        put_u32(&mut out, directories + 20, resources.1);

        let section_header = optional + usize::from(optional_size);
        out[section_header..section_header + 5].copy_from_slice(b".data");
        put_u32(&mut out, section_header + 8, section_size);
        put_u32(&mut out, section_header + 12, PE_SECTION_RVA);
        put_u32(&mut out, section_header + 16, section_size);
        put_u32(&mut out, section_header + 20, PE_HEADERS_SIZE as u32);
        out
    }

    fn render_exports(&self, rva: u32) -> Vec<u8>
    {
        let functions_rva = rva + 40;
        let names_rva = functions_rva + 4 * len32_of(self.functions.len());
        let ordinals_rva = names_rva + 4 * len32_of(self.names.len());
        let strings_rva = ordinals_rva + 2 * len32_of(self.names.len());

        let mut out = vec![0u8; 40];
        put_u32(&mut out, 16, 1);
        put_u32(&mut out, 20, len32_of(self.functions.len()));
        put_u32(&mut out, 24, len32_of(self.names.len()));
        put_u32(&mut out, 28, functions_rva);
        put_u32(&mut out, 32, names_rva);
        put_u32(&mut out, 36, ordinals_rva);

        for function in &self.functions {
            out.extend_from_slice(&function.to_le_bytes());
        }
        let mut strings = Vec::new();
        for (name, _) in &self.names {
            out.extend_from_slice(&(strings_rva + len32(&strings)).to_le_bytes());
            strings.extend_from_slice(name.as_bytes());
            strings.push(0);
        }
        for (_, index) in &self.names {
            out.extend_from_slice(&(*index as u16).to_le_bytes());
        }
        out.extend_from_slice(&strings);
        out
    }

    fn render_resources(&self, root_rva: u32) -> Vec<u8>
    {
        let mut out = Vec::new();
        let types: Vec<(OwnedKey, Vec<NameNode>)> = self.resources.clone();
        write_directory(&mut out, root_rva, &types, |out, root_rva, names| {
            write_directory(out, root_rva, names, |out, root_rva, languages| {
                let keyed: Vec<(OwnedKey, Vec<u8>)> =
                    languages.iter().map(|(language, data)| (OwnedKey::Id(*language), data.clone())).collect();
                write_leaves(out, root_rva, &keyed);
            });
        });
        out
    }
}

fn write_directory<C>(out: &mut Vec<u8>, root_rva: u32, entries: &[(OwnedKey, C)], mut child: impl FnMut(&mut Vec<u8>, u32, &C))
{
    let ordered = ordered_entries(entries);
    let table = write_directory_header(out, &ordered);
    for (slot, (key, node)) in ordered.iter().enumerate() {
        align(out, 4);
        let child_offset = len32(out);
        put_u32(out, table + slot * 8 + 4, child_offset | 0x8000_0000);
        child(out, root_rva, node);
        patch_name(out, table + slot * 8, key);
    }
}

fn write_leaves(out: &mut Vec<u8>, root_rva: u32, entries: &[(OwnedKey, Vec<u8>)])
{
    let ordered = ordered_entries(entries);
    let table = write_directory_header(out, &ordered);
    for (slot, (key, data)) in ordered.iter().enumerate() {
        align(out, 4);
        let data_entry = out.len();
        put_u32(out, table + slot * 8 + 4, data_entry as u32);
        out.extend_from_slice(&[0u8; 16]);
        align(out, 4);
        let data_offset = len32(out);
        out.extend_from_slice(data);
        put_u32(out, data_entry, root_rva + data_offset);
        put_u32(out, data_entry + 4, len32(data));
        patch_name(out, table + slot * 8, key);
    }
}

fn ordered_entries<C>(entries: &[(OwnedKey, C)]) -> Vec<&(OwnedKey, C)>
{
    let mut ordered: Vec<&(OwnedKey, C)> = entries.iter().filter(|(key, _)| key.is_named()).collect();
    ordered.extend(entries.iter().filter(|(key, _)| !key.is_named()));
    ordered
}

fn write_directory_header<C>(out: &mut Vec<u8>, ordered: &[&(OwnedKey, C)]) -> usize
{
    align(out, 4);
    let named = ordered.iter().filter(|(key, _)| key.is_named()).count();
    let start = out.len();
    out.extend_from_slice(&[0u8; 16]);
    put_u16(out, start + 12, named as u16);
    put_u16(out, start + 14, (ordered.len() - named) as u16);
    let table = out.len();
    out.resize(table + ordered.len() * 8, 0);
    table
}

fn patch_name(out: &mut Vec<u8>, slot: usize, key: &OwnedKey)
{
    match key {
        OwnedKey::Id(id) => put_u32(out, slot, u32::from(*id)),
        OwnedKey::Name(name) => {
            align(out, 2);
            let offset = len32(out);
            let units: Vec<u16> = name.encode_utf16().collect();
            out.extend_from_slice(&(units.len() as u16).to_le_bytes());
            for unit in units {
                out.extend_from_slice(&unit.to_le_bytes());
            }
            put_u32(out, slot, offset | 0x8000_0000);
        }
    }
}

/// Builder for a 64-bit little-endian ELF shared object
///
/// One `PT_LOAD` maps the whole file at virtual address 0, so the in-memory
/// image at any base is the file itself. The image carries a `PT_DYNAMIC`
/// with a GNU (or SysV) hash table, an optional `NT_GNU_BUILD_ID` note and
/// matching section headers.
#[derive(Debug, Clone)]
pub struct ElfBuilder
{
    machine: u16,
    build_id: Option<Vec<u8>>,
    symbols: Vec<(String, Vec<u8>)>,
    sysv_hash: bool,
}

impl ElfBuilder
{
    pub fn new() -> Self
    {
        ElfBuilder { machine: elf::EM_X86_64, build_id: None, symbols: Vec::new(), sysv_hash: false }
    }

    #[must_use]
    pub fn machine(mut self, machine: u16) -> Self
    {
        self.machine = machine;
        self
    }

    #[must_use]
    pub fn build_id(mut self, build_id: &[u8]) -> Self
    {
        self.build_id = Some(build_id.to_vec());
        self
    }

    /// Exported data symbol whose contents are `bytes`
    #[must_use]
    pub fn symbol(mut self, name: &str, bytes: impl Into<Vec<u8>>) -> Self
    {
        self.symbols.push((name.to_string(), bytes.into()));
        self
    }

    /// Emit `DT_HASH` instead of `DT_GNU_HASH`
    #[must_use]
    pub fn sysv_hash(mut self, sysv: bool) -> Self
    {
        self.sysv_hash = sysv;
        self
    }

    #[allow(clippy::too_many_lines)]
    pub fn build(&self) -> Vec<u8>
    {
        const EHDR: usize = 64;
        const PHDR: usize = 56;
        const PHNUM: usize = 3;
        const SYM: usize = 24;

        let mut out = vec![0u8; EHDR + PHDR * PHNUM];

        // .data: symbol contents
        align(&mut out, 16);
        let mut symbol_values = Vec::new();
        for (_, bytes) in &self.symbols {
            align(&mut out, 8);
            symbol_values.push((out.len(), bytes.len()));
            out.extend_from_slice(bytes);
        }

        // .dynstr
        let mut dynstr = vec![0u8];
        let mut name_offsets = Vec::new();
        for (name, _) in &self.symbols {
            name_offsets.push(dynstr.len());
            dynstr.extend_from_slice(name.as_bytes());
            dynstr.push(0);
        }
        align(&mut out, 8);
        let dynstr_offset = out.len();
        out.extend_from_slice(&dynstr);

        // .dynsym: null symbol, then one per export
        align(&mut out, 8);
        let dynsym_offset = out.len();
        out.extend_from_slice(&[0u8; SYM]);
        for (index, (value, size)) in symbol_values.iter().enumerate() {
            let mut sym = [0u8; SYM];
            sym[0..4].copy_from_slice(&(name_offsets[index] as u32).to_le_bytes());
            sym[4] = (elf::STB_GLOBAL << 4) | elf::STT_OBJECT;
            sym[6..8].copy_from_slice(&1u16.to_le_bytes());
            sym[8..16].copy_from_slice(&(*value as u64).to_le_bytes());
            sym[16..24].copy_from_slice(&(*size as u64).to_le_bytes());
            out.extend_from_slice(&sym);
        }
        let symbol_count = self.symbols.len() + 1;

        // hash table
        align(&mut out, 8);
        let hash_offset = out.len();
        if self.sysv_hash {
            let mut table = Vec::new();
            table.extend_from_slice(&1u32.to_le_bytes());
            table.extend_from_slice(&(symbol_count as u32).to_le_bytes());
            let first = u32::from(symbol_count > 1);
            table.extend_from_slice(&first.to_le_bytes());
            for index in 0..symbol_count {
                let next = if index == 0 || index + 1 >= symbol_count { 0 } else { index as u32 + 1 };
                table.extend_from_slice(&next.to_le_bytes());
            }
            out.extend_from_slice(&table);
        } else {
            let mut table = Vec::new();
            table.extend_from_slice(&1u32.to_le_bytes());
            table.extend_from_slice(&1u32.to_le_bytes());
            table.extend_from_slice(&1u32.to_le_bytes());
            table.extend_from_slice(&6u32.to_le_bytes());
            table.extend_from_slice(&u64::MAX.to_le_bytes());
            let bucket = u32::from(symbol_count > 1);
            table.extend_from_slice(&bucket.to_le_bytes());
            for (index, (name, _)) in self.symbols.iter().enumerate() {
                let mut value = super::elf::gnu_hash(name.as_bytes()) & !1;
                if index + 1 == self.symbols.len() {
                    value |= 1;
                }
                table.extend_from_slice(&value.to_le_bytes());
            }
            out.extend_from_slice(&table);
        }

        // build-id note
        align(&mut out, 4);
        let note_offset = out.len();
        if let Some(build_id) = &self.build_id {
            out.extend_from_slice(&4u32.to_le_bytes());
            out.extend_from_slice(&(build_id.len() as u32).to_le_bytes());
            out.extend_from_slice(&elf::NT_GNU_BUILD_ID.to_le_bytes());
            out.extend_from_slice(b"GNU\0");
            out.extend_from_slice(build_id);
            align(&mut out, 4);
        }
        let note_size = out.len() - note_offset;

        // .dynamic
        align(&mut out, 8);
        let dynamic_offset = out.len();
        let hash_tag = if self.sysv_hash { elf::DT_HASH } else { elf::DT_GNU_HASH };
        for (tag, value) in [
            (hash_tag, hash_offset as u64),
            (elf::DT_SYMTAB, dynsym_offset as u64),
            (elf::DT_STRTAB, dynstr_offset as u64),
            (elf::DT_STRSZ, dynstr.len() as u64),
            (elf::DT_SYMENT, SYM as u64),
            (elf::DT_NULL, 0),
        ] {
            out.extend_from_slice(&u64::from(tag).to_le_bytes());
            out.extend_from_slice(&value.to_le_bytes());
        }
        let dynamic_size = out.len() - dynamic_offset;

        // .shstrtab
        let shstrtab: &[u8] = b"\0.dynsym\0.dynstr\0.note.gnu.build-id\0.dynamic\0.shstrtab\0";
        let shstrtab_offset = out.len();
        out.extend_from_slice(shstrtab);
        let file_end = out.len();

        // section headers
        align(&mut out, 8);
        let shoff = out.len();
        let sections: [(u32, u32, u64, usize, usize, u32, u64); 6] = [
            (0, elf::SHT_NULL, 0, 0, 0, 0, 0),
            (1, elf::SHT_DYNSYM, u64::from(elf::SHF_ALLOC), dynsym_offset, SYM * symbol_count, 2, SYM as u64),
            (9, elf::SHT_STRTAB, u64::from(elf::SHF_ALLOC), dynstr_offset, dynstr.len(), 0, 0),
            (17, elf::SHT_NOTE, u64::from(elf::SHF_ALLOC), note_offset, note_size, 0, 0),
            (36, elf::SHT_DYNAMIC, u64::from(elf::SHF_ALLOC | elf::SHF_WRITE), dynamic_offset, dynamic_size, 2, 16),
            (45, elf::SHT_STRTAB, 0, shstrtab_offset, shstrtab.len(), 0, 0),
        ];
        for (name, kind, flags, offset, size, link, entsize) in sections {
            let mut header = [0u8; 64];
            header[0..4].copy_from_slice(&name.to_le_bytes());
            header[4..8].copy_from_slice(&kind.to_le_bytes());
            header[8..16].copy_from_slice(&flags.to_le_bytes());
            let address = if flags & u64::from(elf::SHF_ALLOC) != 0 { offset as u64 } else { 0 };
            header[16..24].copy_from_slice(&address.to_le_bytes());
            header[24..32].copy_from_slice(&(offset as u64).to_le_bytes());
            header[32..40].copy_from_slice(&(size as u64).to_le_bytes());
            header[40..44].copy_from_slice(&link.to_le_bytes());
            header[44..48].copy_from_slice(&u32::from(kind == elf::SHT_DYNSYM).to_le_bytes());
            let alignment: u64 = if kind == elf::SHT_NOTE { 4 } else { 8 };
            header[48..56].copy_from_slice(&alignment.to_le_bytes());
            header[56..64].copy_from_slice(&entsize.to_le_bytes());
            out.extend_from_slice(&header);
        }

        // ELF header
        out[0..4].copy_from_slice(&elf::ELFMAG);
        out[4] = elf::ELFCLASS64;
        out[5] = elf::ELFDATA2LSB;
        out[6] = elf::EV_CURRENT;
        put_u16(&mut out, 16, elf::ET_DYN);
        put_u16(&mut out, 18, self.machine);
        put_u32(&mut out, 20, u32::from(elf::EV_CURRENT));
        put_u64(&mut out, 32, EHDR as u64);
        put_u64(&mut out, 40, shoff as u64);
        put_u16(&mut out, 52, EHDR as u16);
        put_u16(&mut out, 54, PHDR as u16);
        put_u16(&mut out, 56, PHNUM as u16);
        put_u16(&mut out, 58, 64);
        put_u16(&mut out, 60, sections.len() as u16);
        put_u16(&mut out, 62, 5);

        // program headers: PT_LOAD, PT_DYNAMIC, PT_NOTE
        let phdrs = [
            (elf::PT_LOAD, elf::PF_R | elf::PF_W, 0usize, file_end, 0x1000u64),
            (elf::PT_DYNAMIC, elf::PF_R | elf::PF_W, dynamic_offset, dynamic_size, 8),
            (elf::PT_NOTE, elf::PF_R, note_offset, note_size, 4),
        ];
        for (index, (kind, flags, offset, size, alignment)) in phdrs.into_iter().enumerate() {
            let at = EHDR + index * PHDR;
            put_u32(&mut out, at, kind);
            put_u32(&mut out, at + 4, flags);
            put_u64(&mut out, at + 8, offset as u64);
            put_u64(&mut out, at + 16, offset as u64);
            put_u64(&mut out, at + 24, offset as u64);
            put_u64(&mut out, at + 32, size as u64);
            put_u64(&mut out, at + 40, size as u64);
            put_u64(&mut out, at + 48, alignment);
        }
        out
    }
}

impl Default for ElfBuilder
{
    fn default() -> Self
    {
        Self::new()
    }
}

/// Builder for a 64-bit Mach-O dylib
///
/// `__TEXT` covers the whole file at vmaddr 0 and `__LINKEDIT` holds the
/// symbol and string tables, so the in-memory image equals the file.
#[derive(Debug, Clone)]
pub struct MachOBuilder
{
    cpu_type: u32,
    uuid: Option<[u8; 16]>,
    symbols: Vec<(String, Vec<u8>)>,
}

impl MachOBuilder
{
    pub fn new() -> Self
    {
        MachOBuilder { cpu_type: macho::CPU_TYPE_ARM64, uuid: None, symbols: Vec::new() }
    }

    #[must_use]
    pub fn uuid(mut self, uuid: [u8; 16]) -> Self
    {
        self.uuid = Some(uuid);
        self
    }

    /// Exported symbol; the leading underscore is added for you
    #[must_use]
    pub fn symbol(mut self, name: &str, bytes: impl Into<Vec<u8>>) -> Self
    {
        self.symbols.push((format!("_{name}"), bytes.into()));
        self
    }

    pub fn build(&self) -> Vec<u8>
    {
        const HEADER: usize = 32;
        const SEGMENT: usize = 72;
        const UUID: usize = 24;
        const SYMTAB: usize = 24;
        const NLIST: usize = 16;

        let command_count = 3 + usize::from(self.uuid.is_some());
        let commands_size = SEGMENT * 2 + SYMTAB + if self.uuid.is_some() { UUID } else { 0 };
        let mut out = vec![0u8; HEADER + commands_size];

        align(&mut out, 16);
        let mut values = Vec::new();
        for (_, bytes) in &self.symbols {
            align(&mut out, 8);
            values.push(out.len());
            out.extend_from_slice(bytes);
        }
        align(&mut out, 0x1000);
        let text_size = out.len();

        let linkedit = out.len();
        let mut strings = vec![b' ', 0];
        let mut symtab = Vec::new();
        for ((name, _), value) in self.symbols.iter().zip(&values) {
            let mut entry = [0u8; NLIST];
            entry[0..4].copy_from_slice(&(strings.len() as u32).to_le_bytes());
            entry[4] = macho::N_SECT | macho::N_EXT;
            entry[5] = 1;
            entry[8..16].copy_from_slice(&(*value as u64).to_le_bytes());
            symtab.extend_from_slice(&entry);
            strings.extend_from_slice(name.as_bytes());
            strings.push(0);
        }
        let symoff = out.len();
        out.extend_from_slice(&symtab);
        let stroff = out.len();
        out.extend_from_slice(&strings);
        let linkedit_size = out.len() - linkedit;

        put_u32(&mut out, 0, macho::MH_MAGIC_64);
        put_u32(&mut out, 4, self.cpu_type);
        put_u32(&mut out, 12, macho::MH_DYLIB);
        put_u32(&mut out, 16, command_count as u32);
        put_u32(&mut out, 20, commands_size as u32);

        let mut at = HEADER;
        for (name, vmaddr, size) in [(&b"__TEXT"[..], 0usize, text_size), (&b"__LINKEDIT"[..], linkedit, linkedit_size)] {
            put_u32(&mut out, at, macho::LC_SEGMENT_64);
            put_u32(&mut out, at + 4, SEGMENT as u32);
            out[at + 8..at + 8 + name.len()].copy_from_slice(name);
            put_u64(&mut out, at + 24, vmaddr as u64);
            put_u64(&mut out, at + 32, size as u64);
            put_u64(&mut out, at + 40, vmaddr as u64);
            put_u64(&mut out, at + 48, size as u64);
            put_u32(&mut out, at + 56, 1);
            put_u32(&mut out, at + 60, 1);
            at += SEGMENT;
        }
        if let Some(uuid) = self.uuid {
            put_u32(&mut out, at, macho::LC_UUID);
            put_u32(&mut out, at + 4, UUID as u32);
            out[at + 8..at + 24].copy_from_slice(&uuid);
            at += UUID;
        }
        put_u32(&mut out, at, macho::LC_SYMTAB);
        put_u32(&mut out, at + 4, SYMTAB as u32);
        put_u32(&mut out, at + 8, symoff as u32);
        put_u32(&mut out, at + 12, self.symbols.len() as u32);
        put_u32(&mut out, at + 16, stroff as u32);
        put_u32(&mut out, at + 20, strings.len() as u32);
        out
    }
}

impl Default for MachOBuilder
{
    fn default() -> Self
    {
        Self::new()
    }
}

fn align(out: &mut Vec<u8>, alignment: usize)
{
    let len = out.len().div_ceil(alignment) * alignment;
    out.resize(len, 0);
}

fn round_up(value: u32, alignment: u32) -> u32
{
    value.div_ceil(alignment) * alignment
}

#[allow(clippy::cast_possible_truncation)]
fn len32(bytes: &[u8]) -> u32
{
    bytes.len() as u32
}

#[allow(clippy::cast_possible_truncation)]
fn len32_of(len: usize) -> u32
{
    len as u32
}

fn put_u16(out: &mut [u8], at: usize, value: u16)
{
    out[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(out: &mut [u8], at: usize, value: u32)
{
    out[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(out: &mut [u8], at: usize, value: u64)
{
    out[at..at + 8].copy_from_slice(&value.to_le_bytes());
}
