//! Runtime identity and the fixed records read out of a runtime image.
//!
//! Everything here is a plain decoder over byte slices; where the bytes come
//! from (a data target, a file on disk) is the caller's business.

use std::fmt;
use std::path::PathBuf;

use smallvec::SmallVec;

use super::guid::Guid;
use super::version::CorDebugInterfaceVersion;
use super::Address;

/// How the DBI and DAC of a runtime are indexed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum IndexType
{
    #[default]
    Unknown = 0,
    /// DBI and DAC carry their own index (timestamp+size or build-id)
    Identity = 1,
    /// DBI and DAC are both keyed by the runtime module's build-id
    Runtime = 2,
}

const BUILD_ID_CAPACITY: usize = 24;

/// A build-id (ELF `NT_GNU_BUILD_ID` or Mach-O `LC_UUID`) of at most 24 bytes
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct BuildId(SmallVec<[u8; BUILD_ID_CAPACITY]>);

impl BuildId
{
    /// Largest build-id the runtime identity can carry
    pub const MAX_LEN: usize = BUILD_ID_CAPACITY;

    /// Copy `bytes`, or `None` when they don't fit
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self>
    {
        (bytes.len() <= Self::MAX_LEN).then(|| BuildId(SmallVec::from_slice(bytes)))
    }

    pub fn as_bytes(&self) -> &[u8]
    {
        &self.0
    }

    pub fn len(&self) -> usize
    {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.0.is_empty()
    }

    /// Lowercase hex rendering, the form symbol servers key on
    #[must_use]
    pub fn to_hex(&self) -> String
    {
        use std::fmt::Write as _;

        let mut out = String::with_capacity(self.0.len() * 2);
        for byte in &self.0 {
            let _ = write!(out, "{byte:02x}");
        }
        out
    }
}

impl fmt::Debug for BuildId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "BuildId({})", self.to_hex())
    }
}

/// Identity of one companion library (DBI or DAC)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModuleIndex
{
    /// File name the provider is asked for
    pub name: String,
    /// Windows: `IMAGE_FILE_HEADER::TimeDateStamp`
    pub timestamp: u32,
    /// Windows: `IMAGE_OPTIONAL_HEADER::SizeOfImage`
    pub size_of_image: u32,
    /// Unix: build-id of the library
    pub build_id: BuildId,
}

impl ModuleIndex
{
    pub fn named(name: impl Into<String>) -> Self
    {
        ModuleIndex { name: name.into(), ..Default::default() }
    }
}

/// Everything needed to locate the DBI and DAC for one runtime build
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClrInfo
{
    /// Windows-style (timestamp+size) rather than build-id identity
    pub target_is_windows: bool,
    pub index_type: IndexType,
    /// Runtime module path when known
    pub runtime_module_path: Option<PathBuf>,
    /// Unix build-id of the runtime module itself
    pub runtime_build_id: BuildId,
    pub dbi: ModuleIndex,
    pub dac: ModuleIndex,
}

impl ClrInfo
{
    /// Create an empty identity for a Windows or Unix target
    #[must_use]
    pub fn new(target_is_windows: bool) -> Self
    {
        ClrInfo { target_is_windows, ..Default::default() }
    }

    /// Whether the fields required by `index_type` are populated
    ///
    /// ```rust
    /// use clrshim_core::types::{BuildId, ClrInfo, IndexType};
    ///
    /// let mut info = ClrInfo::new(false);
    /// assert!(!info.is_valid());
    /// info.index_type = IndexType::Runtime;
    /// info.runtime_build_id = BuildId::from_slice(&[0xab; 20]).unwrap();
    /// assert!(info.is_valid());
    /// ```
    #[must_use]
    pub fn is_valid(&self) -> bool
    {
        match self.index_type {
            IndexType::Unknown => false,
            IndexType::Identity if self.target_is_windows => {
                self.dbi.timestamp != 0
                    && self.dbi.size_of_image != 0
                    && self.dac.timestamp != 0
                    && self.dac.size_of_image != 0
            }
            IndexType::Identity => !self.dbi.build_id.is_empty() && !self.dac.build_id.is_empty(),
            IndexType::Runtime => !self.runtime_build_id.is_empty(),
        }
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32
{
    u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

/// `CLR_DEBUG_RESOURCE`, embedded as `RC_DATA` in a Windows runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugResource
{
    pub version: u32,
    pub signature: Guid,
    pub dac_timestamp: u32,
    pub dac_size_of_image: u32,
    pub dbi_timestamp: u32,
    pub dbi_size_of_image: u32,
}

impl DebugResource
{
    pub const SIZE: usize = 36;

    /// Decode a resource of exactly [`Self::SIZE`] bytes
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self>
    {
        if bytes.len() != Self::SIZE {
            return None;
        }
        let mut guid = [0u8; 16];
        guid.copy_from_slice(&bytes[4..20]);
        Some(DebugResource {
            version: read_u32(bytes, 0),
            signature: Guid::from_le_bytes(guid),
            dac_timestamp: read_u32(bytes, 20),
            dac_size_of_image: read_u32(bytes, 24),
            dbi_timestamp: read_u32(bytes, 28),
            dbi_size_of_image: read_u32(bytes, 32),
        })
    }

    /// Encode; used to build synthetic runtimes
    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE]
    {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..20].copy_from_slice(&self.signature.to_le_bytes());
        out[20..24].copy_from_slice(&self.dac_timestamp.to_le_bytes());
        out[24..28].copy_from_slice(&self.dac_size_of_image.to_le_bytes());
        out[28..32].copy_from_slice(&self.dbi_timestamp.to_le_bytes());
        out[32..36].copy_from_slice(&self.dbi_size_of_image.to_le_bytes());
        out
    }
}

/// The record behind the `DotNetRuntimeInfo` export of single-file apps
///
/// Layout: 18-byte NUL-terminated signature, padding to 4, `i32` version,
/// then three 24-byte module indexes (runtime, DAC, DBI), each a length byte
/// followed by up to 23 bytes of index data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeInfoRecord
{
    pub signature: [u8; 18],
    pub version: i32,
    pub runtime_index: [u8; 24],
    pub dac_index: [u8; 24],
    pub dbi_index: [u8; 24],
}

impl RuntimeInfoRecord
{
    /// Name of the exported symbol, also the expected signature
    pub const SYMBOL: &'static str = "DotNetRuntimeInfo";
    pub const SIZE: usize = 96;

    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self>
    {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let mut record = RuntimeInfoRecord {
            signature: [0; 18],
            version: i32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]),
            runtime_index: [0; 24],
            dac_index: [0; 24],
            dbi_index: [0; 24],
        };
        record.signature.copy_from_slice(&bytes[0..18]);
        record.runtime_index.copy_from_slice(&bytes[24..48]);
        record.dac_index.copy_from_slice(&bytes[48..72]);
        record.dbi_index.copy_from_slice(&bytes[72..96]);
        Some(record)
    }

    /// Build a record; index slices longer than 23 bytes are truncated
    #[must_use]
    pub fn new(version: i32, runtime: &[u8], dac: &[u8], dbi: &[u8]) -> Self
    {
        let mut signature = [0u8; 18];
        signature[..17].copy_from_slice(Self::SYMBOL.as_bytes());
        RuntimeInfoRecord {
            signature,
            version,
            runtime_index: Self::pack_index(runtime),
            dac_index: Self::pack_index(dac),
            dbi_index: Self::pack_index(dbi),
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE]
    {
        let mut out = [0u8; Self::SIZE];
        out[0..18].copy_from_slice(&self.signature);
        out[20..24].copy_from_slice(&self.version.to_le_bytes());
        out[24..48].copy_from_slice(&self.runtime_index);
        out[48..72].copy_from_slice(&self.dac_index);
        out[72..96].copy_from_slice(&self.dbi_index);
        out
    }

    #[allow(clippy::cast_possible_truncation)]
    fn pack_index(data: &[u8]) -> [u8; 24]
    {
        let len = data.len().min(23);
        let mut out = [0u8; 24];
        out[0] = len as u8;
        out[1..=len].copy_from_slice(&data[..len]);
        out
    }

    /// Whether the signature is exactly `"DotNetRuntimeInfo\0"`
    #[must_use]
    pub fn signature_matches(&self) -> bool
    {
        &self.signature[..17] == Self::SYMBOL.as_bytes() && self.signature[17] == 0
    }

    fn index_bytes(index: &[u8; 24]) -> &[u8]
    {
        let len = usize::from(index[0]).min(23);
        &index[1..=len]
    }

    /// Length-prefixed DBI index data
    pub fn dbi_index_bytes(&self) -> &[u8]
    {
        Self::index_bytes(&self.dbi_index)
    }

    /// Length-prefixed DAC index data
    pub fn dac_index_bytes(&self) -> &[u8]
    {
        Self::index_bytes(&self.dac_index)
    }

    /// Windows `(timestamp, size_of_image)` packed in an index
    ///
    /// Requires at least eight bytes of index data.
    #[must_use]
    pub fn windows_index(index: &[u8]) -> Option<(u32, u32)>
    {
        (index.len() >= 8).then(|| (read_u32(index, 0), read_u32(index, 4)))
    }
}

/// `ClrDebuggerEngineMetrics`, exported at ordinal 2 of a Windows runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineMetrics
{
    pub cb_size: u32,
    pub dbi_version: u32,
    /// Preferred-base pointer to the continue-event handle, or 0
    pub continue_startup_event: Address,
}

impl EngineMetrics
{
    /// Encoded size for a target with the given pointer width
    pub const fn size_for(pointer_size: usize) -> usize
    {
        if pointer_size == 8 {
            16
        } else {
            12
        }
    }

    /// Decode for a target with the given pointer width
    #[must_use]
    pub fn decode(bytes: &[u8], pointer_size: usize) -> Option<Self>
    {
        if bytes.len() < Self::size_for(pointer_size) {
            return None;
        }
        let pointer = if pointer_size == 8 {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[8..16]);
            u64::from_le_bytes(raw)
        } else {
            u64::from(read_u32(bytes, 8))
        };
        Some(EngineMetrics {
            cb_size: read_u32(bytes, 0),
            dbi_version: read_u32(bytes, 4),
            continue_startup_event: Address::new(pointer),
        })
    }

    /// Metrics synthesised for Unix runtimes, which export none
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn unix_default() -> Self
    {
        EngineMetrics {
            cb_size: Self::size_for(8) as u32,
            dbi_version: CorDebugInterfaceVersion::V4_0.raw() as u32,
            continue_startup_event: Address::ZERO,
        }
    }

    pub fn interface_version(&self) -> CorDebugInterfaceVersion
    {
        CorDebugInterfaceVersion::from(self.dbi_version)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::types::guid::CLR_ID_ONECORE_CLR;

    #[test]
    fn test_debug_resource_requires_exact_size()
    {
        let resource = DebugResource {
            version: 0,
            signature: CLR_ID_ONECORE_CLR,
            dac_timestamp: 1,
            dac_size_of_image: 2,
            dbi_timestamp: 3,
            dbi_size_of_image: 4,
        };
        let bytes = resource.encode();
        assert_eq!(DebugResource::decode(&bytes), Some(resource));
        assert_eq!(DebugResource::decode(&bytes[..35]), None);
        let mut longer = bytes.to_vec();
        longer.push(0);
        assert_eq!(DebugResource::decode(&longer), None);
    }

    #[test]
    fn test_runtime_info_signature_is_exact()
    {
        let record = RuntimeInfoRecord::new(1, &[], &[0xdd; 20], &[0xbb; 20]);
        assert!(record.signature_matches());
        assert_eq!(record.dbi_index_bytes(), &[0xbb; 20]);

        let mut bytes = record.encode();
        bytes[16] = b'x';
        let decoded = RuntimeInfoRecord::decode(&bytes).unwrap();
        assert!(!decoded.signature_matches());
    }

    #[test]
    fn test_windows_index_needs_eight_bytes()
    {
        assert_eq!(RuntimeInfoRecord::windows_index(&[1, 0, 0, 0, 2, 0, 0, 0]), Some((1, 2)));
        assert_eq!(RuntimeInfoRecord::windows_index(&[1, 0, 0, 0]), None);
    }

    #[test]
    fn test_engine_metrics_pointer_width()
    {
        let mut bytes = [0u8; 16];
        bytes[0] = 16;
        bytes[4] = 4;
        bytes[8..16].copy_from_slice(&0x1_8000_2000_u64.to_le_bytes());
        let metrics = EngineMetrics::decode(&bytes, 8).unwrap();
        assert_eq!(metrics.continue_startup_event, Address::new(0x1_8000_2000));
        let narrow = EngineMetrics::decode(&bytes[..12], 4).unwrap();
        assert_eq!(narrow.continue_startup_event, Address::new(0x8000_2000));
    }

    #[test]
    fn test_clr_info_validity_windows()
    {
        let mut info = ClrInfo::new(true);
        info.index_type = IndexType::Identity;
        info.dbi.timestamp = 1;
        info.dbi.size_of_image = 1;
        assert!(!info.is_valid());
        info.dac.timestamp = 1;
        info.dac.size_of_image = 1;
        assert!(info.is_valid());
    }

    #[test]
    fn test_build_id_bounds()
    {
        assert!(BuildId::from_slice(&[0; 24]).is_some());
        assert!(BuildId::from_slice(&[0; 25]).is_none());
        assert_eq!(BuildId::from_slice(&[0xab, 0x01]).unwrap().to_hex(), "ab01");
    }
}
