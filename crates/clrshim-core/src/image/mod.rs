//! # Image Parsing
//!
//! Decoders for the executable formats a managed runtime ships in.
//!
//! - [`pe`]: PE images, live (mapped) or on disk (flat), with exports,
//!   resources and the version block
//! - [`ElfImage`] / [`MachOImage`]: Unix modules as loaded in a target, for
//!   dynamic symbols and the build-id
//! - [`ModuleFile`]: a module file on disk, through the `object` crate
//! - [`testing`]: builders for small synthetic images
//!
//! All in-target parsing goes through [`DataTarget`] reads and reports
//! structural problems as [`ShimError::NotClr`](crate::error::ShimError::NotClr).

mod elf;
mod macho;
mod ondisk;
pub mod pe;
pub mod testing;

pub use elf::ElfImage;
pub use macho::MachOImage;
pub use ondisk::ModuleFile;
pub use pe::{DataDirectory, PeImage, PeLayout, ResourceKey};

use crate::error::{ShimError, ShimResult};
use crate::target::DataTarget;
use crate::types::{Address, BuildId, Machine};

/// A Unix module in a target, whichever container it uses
pub enum UnixImage<'t, T: DataTarget + ?Sized>
{
    Elf(ElfImage<'t, T>),
    MachO(MachOImage<'t, T>),
}

impl<'t, T: DataTarget + ?Sized> UnixImage<'t, T>
{
    /// Sniff the magic at `base` and parse accordingly
    ///
    /// ## Errors
    ///
    /// `NotClr` when the module is neither ELF nor Mach-O.
    pub fn parse(target: &'t T, base: Address) -> ShimResult<Self>
    {
        if ElfImage::probe(target, base)? {
            return ElfImage::parse(target, base).map(UnixImage::Elf);
        }
        if MachOImage::probe(target, base)? {
            return MachOImage::parse(target, base).map(UnixImage::MachO);
        }
        Err(ShimError::NotClr)
    }

    pub fn machine(&self) -> Option<Machine>
    {
        match self {
            UnixImage::Elf(image) => image.machine(),
            UnixImage::MachO(image) => image.machine(),
        }
    }

    /// ## Errors
    ///
    /// Read errors from the target.
    pub fn build_id(&self) -> ShimResult<Option<BuildId>>
    {
        match self {
            UnixImage::Elf(image) => image.build_id(),
            UnixImage::MachO(image) => Ok(image.build_id()),
        }
    }

    /// ## Errors
    ///
    /// Read errors from the target.
    pub fn symbol_address(&self, name: &str) -> ShimResult<Option<Address>>
    {
        match self {
            UnixImage::Elf(image) => image.symbol_address(name),
            UnixImage::MachO(image) => image.symbol_address(name),
        }
    }
}
