//! Mach-O images loaded in a target.
//!
//! Symbol and string tables live in `__LINKEDIT`; their file offsets are
//! translated through that segment and the image slide.

use object::macho;

use crate::error::{ShimError, ShimResult};
use crate::target::DataTarget;
use crate::types::{Address, BuildId, Machine};

const MAX_LOAD_COMMANDS: u32 = 1024;
const MAX_TABLE_SIZE: u64 = 0x400_0000;

#[derive(Debug, Clone, Copy)]
struct Symtab
{
    symoff: u32,
    nsyms: u32,
    stroff: u32,
    strsize: u32,
}

#[derive(Debug, Clone, Copy)]
struct Linkedit
{
    vmaddr: u64,
    fileoff: u64,
}

/// A loaded Mach-O module
pub struct MachOImage<'t, T: DataTarget + ?Sized>
{
    target: &'t T,
    slide: Address,
    is_64: bool,
    cpu_type: u32,
    uuid: Option<[u8; 16]>,
    symtab: Option<Symtab>,
    linkedit: Option<Linkedit>,
}

impl<'t, T: DataTarget + ?Sized> MachOImage<'t, T>
{
    /// Whether the bytes at `base` start with a little-endian Mach-O magic
    ///
    /// ## Errors
    ///
    /// Read errors from the target.
    pub fn probe(target: &T, base: Address) -> ShimResult<bool>
    {
        let magic = target.read_u32(base)?;
        Ok(magic == macho::MH_MAGIC_64 || magic == macho::MH_MAGIC)
    }

    /// Parse the header and load commands at `base`
    ///
    /// ## Errors
    ///
    /// `NotClr` on a bad magic or load-command table.
    pub fn parse(target: &'t T, base: Address) -> ShimResult<Self>
    {
        let is_64 = match target.read_u32(base)? {
            macho::MH_MAGIC_64 => true,
            macho::MH_MAGIC => false,
            _ => return Err(ShimError::NotClr),
        };
        let cpu_type = target.read_u32(base + 4)?;
        let command_count = target.read_u32(base + 16)?;
        if command_count > MAX_LOAD_COMMANDS {
            return Err(ShimError::NotClr);
        }

        let mut image = MachOImage { target, slide: base, is_64, cpu_type, uuid: None, symtab: None, linkedit: None };
        let mut command = base + if is_64 { 32 } else { 28 };
        for _ in 0..command_count {
            let kind = target.read_u32(command)?;
            let size = target.read_u32(command + 4)?;
            if size < 8 {
                return Err(ShimError::NotClr);
            }
            match kind {
                macho::LC_SEGMENT_64 | macho::LC_SEGMENT => image.segment(base, command, kind == macho::LC_SEGMENT_64)?,
                macho::LC_UUID => {
                    let mut uuid = [0u8; 16];
                    target.read_exact(command + 8, &mut uuid)?;
                    image.uuid = Some(uuid);
                }
                macho::LC_SYMTAB => {
                    image.symtab = Some(Symtab {
                        symoff: target.read_u32(command + 8)?,
                        nsyms: target.read_u32(command + 12)?,
                        stroff: target.read_u32(command + 16)?,
                        strsize: target.read_u32(command + 20)?,
                    });
                }
                _ => {}
            }
            command = command + u64::from(size);
        }
        Ok(image)
    }

    fn segment(&mut self, base: Address, command: Address, is_64: bool) -> ShimResult<()>
    {
        let mut name = [0u8; 16];
        self.target.read_exact(command + 8, &mut name)?;
        let (vmaddr, fileoff) = if is_64 {
            (self.target.read_u64(command + 24)?, self.target.read_u64(command + 40)?)
        } else {
            (u64::from(self.target.read_u32(command + 24)?), u64::from(self.target.read_u32(command + 32)?))
        };
        let name = name.split(|byte| *byte == 0).next().unwrap_or_default();
        if name == b"__TEXT" {
            self.slide = base.checked_sub(vmaddr).ok_or(ShimError::NotClr)?;
        } else if name == b"__LINKEDIT" {
            self.linkedit = Some(Linkedit { vmaddr, fileoff });
        }
        Ok(())
    }

    pub fn machine(&self) -> Option<Machine>
    {
        Machine::from_macho(self.cpu_type)
    }

    /// `LC_UUID`, the Mach-O build-id
    pub fn build_id(&self) -> Option<BuildId>
    {
        self.uuid.and_then(|uuid| BuildId::from_slice(&uuid))
    }

    fn linkedit_address(&self, linkedit: Linkedit, file_offset: u32) -> ShimResult<Address>
    {
        let delta = u64::from(file_offset).checked_sub(linkedit.fileoff).ok_or(ShimError::NotClr)?;
        Ok(self.slide + linkedit.vmaddr + delta)
    }

    /// Target address of the external symbol `name` (without the leading `_`)
    ///
    /// ## Errors
    ///
    /// `NotClr` on inconsistent tables, read errors otherwise.
    #[allow(clippy::cast_possible_truncation)]
    pub fn symbol_address(&self, name: &str) -> ShimResult<Option<Address>>
    {
        let (Some(symtab), Some(linkedit)) = (self.symtab, self.linkedit) else {
            return Ok(None);
        };
        let entry_size: u64 = if self.is_64 { 16 } else { 12 };
        let table_size = u64::from(symtab.nsyms) * entry_size;
        if table_size > MAX_TABLE_SIZE || u64::from(symtab.strsize) > MAX_TABLE_SIZE {
            return Err(ShimError::NotClr);
        }

        let symbols = self.target.read_bytes(self.linkedit_address(linkedit, symtab.symoff)?, table_size as usize)?;
        let strings =
            self.target.read_bytes(self.linkedit_address(linkedit, symtab.stroff)?, symtab.strsize as usize)?;
        let wanted = format!("_{name}");

        for entry in symbols.chunks_exact(entry_size as usize) {
            let kind = entry[4];
            if kind & macho::N_STAB != 0 || kind & macho::N_TYPE != macho::N_SECT {
                continue;
            }
            let name_offset = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]) as usize;
            let Some(rest) = strings.get(name_offset..) else {
                continue;
            };
            let symbol = rest.split(|byte| *byte == 0).next().unwrap_or_default();
            if symbol != wanted.as_bytes() {
                continue;
            }
            let value = if self.is_64 {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&entry[8..16]);
                u64::from_le_bytes(raw)
            } else {
                u64::from(u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]))
            };
            return Ok(Some(self.slide + value));
        }
        Ok(None)
    }
}
