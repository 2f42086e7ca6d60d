//! In-memory data target.

use std::sync::Arc;

use super::DataTarget;
use crate::error::{ShimError, ShimResult};
use crate::types::{Address, Platform};

/// A data target made of byte regions placed at target addresses
///
/// Used to present a module file to the image parsers and, in tests, to
/// stand in for a live process. Regions must not overlap; a read is served
/// from the region containing its start address and stops at that region's
/// end.
///
/// ## Example
///
/// ```rust
/// use clrshim_core::target::{DataTarget, MemoryTarget};
/// use clrshim_core::types::{Address, Platform};
///
/// let mut target = MemoryTarget::new(Platform::PosixAmd64);
/// target.add_region(Address::new(0x1000), vec![1, 2, 3, 4]);
///
/// assert_eq!(target.read_u16(Address::new(0x1002)).unwrap(), 0x0403);
/// assert!(target.read_u32(Address::new(0x1002)).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct MemoryTarget
{
    platform: Platform,
    regions: Vec<(Address, Arc<[u8]>)>,
}

impl MemoryTarget
{
    pub fn new(platform: Platform) -> Self
    {
        MemoryTarget { platform, regions: Vec::new() }
    }

    /// Place `bytes` at `base`
    pub fn add_region(&mut self, base: Address, bytes: impl Into<Arc<[u8]>>) -> &mut Self
    {
        self.regions.push((base, bytes.into()));
        self
    }

    /// Builder form of [`MemoryTarget::add_region`]
    #[must_use]
    pub fn with_region(mut self, base: Address, bytes: impl Into<Arc<[u8]>>) -> Self
    {
        self.add_region(base, bytes);
        self
    }

    fn region_for(&self, address: Address) -> Option<(usize, &[u8])>
    {
        self.regions.iter().find_map(|(base, bytes)| {
            let offset = address.value().checked_sub(base.value())?;
            let offset = usize::try_from(offset).ok()?;
            (offset < bytes.len()).then(|| (offset, &bytes[..]))
        })
    }
}

impl DataTarget for MemoryTarget
{
    fn platform(&self) -> ShimResult<Platform>
    {
        Ok(self.platform)
    }

    fn read_virtual(&self, address: Address, buffer: &mut [u8]) -> ShimResult<usize>
    {
        let (offset, bytes) = self.region_for(address).ok_or(ShimError::PartialCopy(address.value()))?;
        let count = buffer.len().min(bytes.len() - offset);
        buffer[..count].copy_from_slice(&bytes[offset..offset + count]);
        Ok(count)
    }
}
