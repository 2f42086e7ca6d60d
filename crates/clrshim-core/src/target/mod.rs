//! # Target Memory Access
//!
//! The one way the shim touches a debuggee: read N bytes at a target address.
//!
//! Every parser and identifier in this crate is written against
//! [`DataTarget`]. The debugger supplies the implementation (a live process,
//! a dump, a file on disk); the shim never writes to the target through it.
//!
//! ## Implementations
//!
//! - [`MemoryTarget`]: regions of bytes held in memory (files, tests)
//! - [`FileImage`]: a module file on disk, presented at address 0
//! - [`ProcessTarget`] (Linux): a live process via `process_vm_readv`
//! - [`crate::interop::NativeDataTarget`]: a native `ICorDebugDataTarget`

mod file;
mod memory;
#[cfg(target_os = "linux")]
mod process;

pub use file::FileImage;
pub use memory::MemoryTarget;
#[cfg(target_os = "linux")]
pub use process::ProcessTarget;

use crate::error::{ShimError, ShimResult};
use crate::types::{Address, Platform};

/// Read access to a debuggee address space
///
/// Implementations must be side-effect free on the target. A read that runs
/// off the end of a mapped region returns the number of bytes actually copied
/// (possibly 0) or an error; it must never abort the caller.
pub trait DataTarget: Send + Sync
{
    /// Platform of the target (decides PE vs ELF/Mach-O identification)
    ///
    /// ## Errors
    ///
    /// Implementation defined; native data targets pass their HRESULT through.
    fn platform(&self) -> ShimResult<Platform>;

    /// Read up to `buffer.len()` bytes at `address`, returning the count read
    ///
    /// ## Errors
    ///
    /// Returns an error when nothing could be read at all.
    fn read_virtual(&self, address: Address, buffer: &mut [u8]) -> ShimResult<usize>;

    /// Fill `buffer` completely or fail with [`ShimError::PartialCopy`]
    ///
    /// ## Errors
    ///
    /// Propagates read errors; a short read is a partial copy.
    fn read_exact(&self, address: Address, buffer: &mut [u8]) -> ShimResult<()>
    {
        let read = self.read_virtual(address, buffer)?;
        if read == buffer.len() {
            Ok(())
        } else {
            tracing::trace!(%address, wanted = buffer.len(), read, "short read from target");
            Err(ShimError::PartialCopy(address.value()))
        }
    }

    /// Read `len` bytes into a fresh vector
    ///
    /// ## Errors
    ///
    /// See [`DataTarget::read_exact`].
    fn read_bytes(&self, address: Address, len: usize) -> ShimResult<Vec<u8>>
    {
        let mut buffer = vec![0u8; len];
        self.read_exact(address, &mut buffer)?;
        Ok(buffer)
    }

    /// ## Errors
    ///
    /// See [`DataTarget::read_exact`].
    fn read_u16(&self, address: Address) -> ShimResult<u16>
    {
        let mut raw = [0u8; 2];
        self.read_exact(address, &mut raw)?;
        Ok(u16::from_le_bytes(raw))
    }

    /// ## Errors
    ///
    /// See [`DataTarget::read_exact`].
    fn read_u32(&self, address: Address) -> ShimResult<u32>
    {
        let mut raw = [0u8; 4];
        self.read_exact(address, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// ## Errors
    ///
    /// See [`DataTarget::read_exact`].
    fn read_u64(&self, address: Address) -> ShimResult<u64>
    {
        let mut raw = [0u8; 8];
        self.read_exact(address, &mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    /// Read a target pointer of `pointer_size` bytes (4 or 8)
    ///
    /// ## Errors
    ///
    /// See [`DataTarget::read_exact`].
    fn read_pointer(&self, address: Address, pointer_size: usize) -> ShimResult<Address>
    {
        if pointer_size == 8 {
            self.read_u64(address).map(Address::new)
        } else {
            self.read_u32(address).map(|value| Address::new(u64::from(value)))
        }
    }
}

impl<T: DataTarget + ?Sized> DataTarget for &T
{
    fn platform(&self) -> ShimResult<Platform>
    {
        (**self).platform()
    }

    fn read_virtual(&self, address: Address, buffer: &mut [u8]) -> ShimResult<usize>
    {
        (**self).read_virtual(address, buffer)
    }
}

impl<T: DataTarget + ?Sized> DataTarget for std::sync::Arc<T>
{
    fn platform(&self) -> ShimResult<Platform>
    {
        (**self).platform()
    }

    fn read_virtual(&self, address: Address, buffer: &mut [u8]) -> ShimResult<usize>
    {
        (**self).read_virtual(address, buffer)
    }
}

impl<T: DataTarget + ?Sized> DataTarget for Box<T>
{
    fn platform(&self) -> ShimResult<Platform>
    {
        (**self).platform()
    }

    fn read_virtual(&self, address: Address, buffer: &mut [u8]) -> ShimResult<usize>
    {
        (**self).read_virtual(address, buffer)
    }
}
