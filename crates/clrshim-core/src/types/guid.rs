//! GUIDs: runtime SKU identifiers and the COM class/interface ids the shim speaks.

use std::fmt;

/// A COM-style GUID with the Windows in-memory layout
///
/// The first three fields are little-endian on the wire, which matters when
/// the SKU signature is read straight out of a `CLRDEBUGINFO` resource.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(C)]
pub struct Guid
{
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Guid
{
    /// Size of the encoded GUID in bytes
    pub const SIZE: usize = 16;

    /// Build a GUID from its registry-format parts
    pub const fn from_values(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self
    {
        Guid { data1, data2, data3, data4 }
    }

    /// Decode the 16-byte little-endian layout
    #[must_use]
    pub fn from_le_bytes(bytes: [u8; 16]) -> Self
    {
        let mut data4 = [0u8; 8];
        data4.copy_from_slice(&bytes[8..16]);
        Guid {
            data1: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            data2: u16::from_le_bytes([bytes[4], bytes[5]]),
            data3: u16::from_le_bytes([bytes[6], bytes[7]]),
            data4,
        }
    }

    /// Encode to the 16-byte little-endian layout
    #[must_use]
    pub fn to_le_bytes(&self) -> [u8; 16]
    {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.data1.to_le_bytes());
        out[4..6].copy_from_slice(&self.data2.to_le_bytes());
        out[6..8].copy_from_slice(&self.data3.to_le_bytes());
        out[8..16].copy_from_slice(&self.data4);
        out
    }
}

impl fmt::Display for Guid
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(
            f,
            "{{{:08X}-{:04X}-{:04X}-{:02X}{:02X}-",
            self.data1, self.data2, self.data3, self.data4[0], self.data4[1]
        )?;
        for byte in &self.data4[2..] {
            write!(f, "{byte:02X}")?;
        }
        f.write_str("}")
    }
}

impl fmt::Debug for Guid
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::Display::fmt(self, f)
    }
}

/// Desktop CLR v4
pub const CLR_ID_V4_DESKTOP: Guid =
    Guid::from_values(0x267F_3989, 0xD786, 0x4B9A, [0x9A, 0xF6, 0xD1, 0x9E, 0x42, 0xD5, 0x57, 0xEC]);

/// CoreCLR (Silverlight-era core runtime)
pub const CLR_ID_CORECLR: Guid =
    Guid::from_values(0x8CB8_E075, 0x0A91, 0x408E, [0x92, 0x28, 0xD6, 0x6E, 0x00, 0xA3, 0xBF, 0xF6]);

/// Phone CLR; accepted as an alias of [`CLR_ID_ONECORE_CLR`]
pub const CLR_ID_PHONE_CLR: Guid =
    Guid::from_values(0xE723_7E9C, 0x31C0, 0x488C, [0xAD, 0x48, 0x32, 0x4D, 0x3E, 0x7E, 0xD9, 0x2A]);

/// OneCore CLR, the SKU stamped into every .NET Core / .NET 5+ runtime
pub const CLR_ID_ONECORE_CLR: Guid =
    Guid::from_values(0xB1EE_760D, 0x6C4A, 0x4533, [0xBA, 0x41, 0x6F, 0x4F, 0x66, 0x1F, 0xAB, 0xAF]);

pub const CLSID_CLR_DEBUGGING: Guid =
    Guid::from_values(0xBACC_578D, 0xFBDD, 0x48A4, [0x96, 0x9F, 0x02, 0xD9, 0x32, 0xB7, 0x46, 0x34]);

pub const IID_ICLR_DEBUGGING: Guid =
    Guid::from_values(0xD28F_3C5A, 0x9634, 0x4206, [0xA5, 0x09, 0x47, 0x75, 0x52, 0xEE, 0xFB, 0x10]);

pub const IID_IUNKNOWN: Guid =
    Guid::from_values(0x0000_0000, 0x0000, 0x0000, [0xC0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x46]);

pub const IID_ICOR_DEBUG_DATA_TARGET: Guid =
    Guid::from_values(0xFE06_DC28, 0x49FB, 0x4636, [0xA4, 0xA3, 0xE8, 0x0D, 0xB4, 0xAE, 0x11, 0x6C]);

pub const IID_ICLR_DEBUGGING_LIBRARY_PROVIDER: Guid =
    Guid::from_values(0x3151_C08D, 0x4D09, 0x4F9B, [0x88, 0x38, 0x28, 0x80, 0xBF, 0x18, 0xFE, 0x51]);

pub const IID_ICLR_DEBUGGING_LIBRARY_PROVIDER2: Guid =
    Guid::from_values(0xE04E_2FF1, 0xDCFD, 0x45D5, [0xBC, 0xD1, 0x16, 0xFF, 0xF2, 0xFA, 0xF7, 0xBA]);

pub const IID_ICLR_DEBUGGING_LIBRARY_PROVIDER3: Guid =
    Guid::from_values(0xDE3A_AB18, 0x46A0, 0x48B4, [0xBF, 0x0D, 0x2C, 0x33, 0x6E, 0x69, 0xEA, 0x1B]);

/// `ICorDebugProcess`, the usual interface requested from `OpenVirtualProcess`
pub const IID_ICOR_DEBUG_PROCESS: Guid =
    Guid::from_values(0x3D6F_5F64, 0x7538, 0x11D3, [0x8D, 0x5B, 0x00, 0x10, 0x4B, 0x35, 0xE7, 0xEF]);

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_guid_display_registry_format()
    {
        assert_eq!(CLR_ID_ONECORE_CLR.to_string(), "{B1EE760D-6C4A-4533-BA41-6F4F661FABAF}");
    }

    #[test]
    fn test_guid_le_bytes_layout()
    {
        let bytes = CLR_ID_PHONE_CLR.to_le_bytes();
        assert_eq!(&bytes[0..4], &[0x9C, 0x7E, 0x23, 0xE7]);
        assert_eq!(Guid::from_le_bytes(bytes), CLR_ID_PHONE_CLR);
    }
}
