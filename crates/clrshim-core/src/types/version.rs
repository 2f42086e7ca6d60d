//! Version records, platforms and machine types.

use std::fmt;

use object::{elf, macho, pe};

/// `CLR_DEBUGGING_VERSION`, the version struct exchanged with `OpenVirtualProcess`
///
/// `struct_version` must be 0; anything else is rejected with
/// `UNSUPPORTED_VERSION_STRUCT`. The layout matches the C struct so it can be
/// handed to DBI entry points directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct ClrDebuggingVersion
{
    pub struct_version: u16,
    pub major: u16,
    pub minor: u16,
    pub build: u16,
    pub revision: u16,
}

impl ClrDebuggingVersion
{
    /// Create a version with `struct_version` 0
    pub const fn new(major: u16, minor: u16, build: u16, revision: u16) -> Self
    {
        ClrDebuggingVersion { struct_version: 0, major, minor, build, revision }
    }
}

impl fmt::Display for ClrDebuggingVersion
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.build, self.revision)
    }
}

/// `CorDebugInterfaceVersion`
///
/// Kept open-ended because the engine metrics of a runtime report whatever
/// value that runtime was built with, and the DBI entry points take it as a
/// plain integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CorDebugInterfaceVersion(pub i32);

impl CorDebugInterfaceVersion
{
    pub const INVALID: Self = CorDebugInterfaceVersion(0);
    pub const V1_0: Self = CorDebugInterfaceVersion(1);
    pub const V1_1: Self = CorDebugInterfaceVersion(2);
    pub const V2_0: Self = CorDebugInterfaceVersion(3);
    pub const V4_0: Self = CorDebugInterfaceVersion(4);
    pub const V4_5: Self = CorDebugInterfaceVersion(5);
    pub const LATEST: Self = Self::V4_5;

    /// Raw value passed to the DBI
    pub const fn raw(self) -> i32
    {
        self.0
    }
}

impl From<u32> for CorDebugInterfaceVersion
{
    #[allow(clippy::cast_possible_wrap)]
    fn from(value: u32) -> Self
    {
        CorDebugInterfaceVersion(value as i32)
    }
}

impl Default for CorDebugInterfaceVersion
{
    fn default() -> Self
    {
        Self::V2_0
    }
}

/// `CorDebugPlatform` as reported by a data target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Platform
{
    WindowsX86 = 0,
    WindowsAmd64 = 1,
    WindowsIa64 = 2,
    MacPpc = 3,
    MacX86 = 4,
    WindowsArm = 5,
    MacAmd64 = 6,
    WindowsArm64 = 7,
    PosixAmd64 = 8,
    PosixX86 = 9,
    PosixArm = 10,
    PosixArm64 = 11,
    PosixLoongArch64 = 12,
    PosixRiscV64 = 13,
}

impl Platform
{
    /// Decode the raw enumeration value
    #[must_use]
    pub fn from_raw(value: u32) -> Option<Self>
    {
        Some(match value {
            0 => Platform::WindowsX86,
            1 => Platform::WindowsAmd64,
            2 => Platform::WindowsIa64,
            3 => Platform::MacPpc,
            4 => Platform::MacX86,
            5 => Platform::WindowsArm,
            6 => Platform::MacAmd64,
            7 => Platform::WindowsArm64,
            8 => Platform::PosixAmd64,
            9 => Platform::PosixX86,
            10 => Platform::PosixArm,
            11 => Platform::PosixArm64,
            12 => Platform::PosixLoongArch64,
            13 => Platform::PosixRiscV64,
            _ => return None,
        })
    }

    /// Whether the target uses Windows-style (PE) runtime identification
    pub const fn is_windows(self) -> bool
    {
        matches!(
            self,
            Platform::WindowsX86
                | Platform::WindowsAmd64
                | Platform::WindowsIa64
                | Platform::WindowsArm
                | Platform::WindowsArm64
        )
    }

    /// Platform value describing the host this crate was built for
    #[must_use]
    pub fn host() -> Self
    {
        let machine = Machine::host();
        if cfg!(windows) {
            match machine {
                Machine::X86 => Platform::WindowsX86,
                Machine::Arm => Platform::WindowsArm,
                Machine::Arm64 => Platform::WindowsArm64,
                _ => Platform::WindowsAmd64,
            }
        } else if cfg!(target_os = "macos") {
            match machine {
                Machine::X86 => Platform::MacX86,
                Machine::Arm64 => Platform::PosixArm64,
                _ => Platform::MacAmd64,
            }
        } else {
            match machine {
                Machine::X86 => Platform::PosixX86,
                Machine::Arm => Platform::PosixArm,
                Machine::Arm64 => Platform::PosixArm64,
                Machine::RiscV64 => Platform::PosixRiscV64,
                Machine::LoongArch64 => Platform::PosixLoongArch64,
                Machine::Amd64 => Platform::PosixAmd64,
            }
        }
    }
}

const PE_MACHINE_RISCV64: u16 = 0x5064;
const PE_MACHINE_LOONGARCH64: u16 = 0x6264;

/// Image machine type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Machine
{
    X86,
    Amd64,
    Arm,
    Arm64,
    RiscV64,
    LoongArch64,
}

impl Machine
{
    /// Decode a PE `IMAGE_FILE_HEADER::Machine` value
    #[must_use]
    pub fn from_pe(machine: u16) -> Option<Self>
    {
        match machine {
            pe::IMAGE_FILE_MACHINE_I386 => Some(Machine::X86),
            pe::IMAGE_FILE_MACHINE_AMD64 => Some(Machine::Amd64),
            pe::IMAGE_FILE_MACHINE_ARMNT | pe::IMAGE_FILE_MACHINE_ARM | pe::IMAGE_FILE_MACHINE_THUMB => {
                Some(Machine::Arm)
            }
            pe::IMAGE_FILE_MACHINE_ARM64 => Some(Machine::Arm64),
            PE_MACHINE_RISCV64 => Some(Machine::RiscV64),
            PE_MACHINE_LOONGARCH64 => Some(Machine::LoongArch64),
            _ => None,
        }
    }

    /// Decode an ELF `e_machine` value
    #[must_use]
    pub fn from_elf(machine: u16) -> Option<Self>
    {
        match machine {
            elf::EM_386 => Some(Machine::X86),
            elf::EM_X86_64 => Some(Machine::Amd64),
            elf::EM_ARM => Some(Machine::Arm),
            elf::EM_AARCH64 => Some(Machine::Arm64),
            elf::EM_RISCV => Some(Machine::RiscV64),
            elf::EM_LOONGARCH => Some(Machine::LoongArch64),
            _ => None,
        }
    }

    /// Decode a Mach-O `cputype`
    #[must_use]
    pub fn from_macho(cpu_type: u32) -> Option<Self>
    {
        match cpu_type {
            macho::CPU_TYPE_X86 => Some(Machine::X86),
            macho::CPU_TYPE_X86_64 => Some(Machine::Amd64),
            macho::CPU_TYPE_ARM => Some(Machine::Arm),
            macho::CPU_TYPE_ARM64 => Some(Machine::Arm64),
            _ => None,
        }
    }

    /// The PE machine value for this architecture
    pub const fn pe_machine(self) -> u16
    {
        match self {
            Machine::X86 => pe::IMAGE_FILE_MACHINE_I386,
            Machine::Amd64 => pe::IMAGE_FILE_MACHINE_AMD64,
            Machine::Arm => pe::IMAGE_FILE_MACHINE_ARMNT,
            Machine::Arm64 => pe::IMAGE_FILE_MACHINE_ARM64,
            Machine::RiscV64 => PE_MACHINE_RISCV64,
            Machine::LoongArch64 => PE_MACHINE_LOONGARCH64,
        }
    }

    /// Architecture tag used in DAC file names and resource names
    pub const fn tag(self) -> &'static str
    {
        match self {
            Machine::X86 => "x86",
            Machine::Amd64 => "amd64",
            Machine::Arm => "arm",
            Machine::Arm64 => "arm64",
            Machine::RiscV64 => "riscv64",
            Machine::LoongArch64 => "loongarch64",
        }
    }

    /// Machine this crate was compiled for
    #[must_use]
    pub const fn host() -> Self
    {
        if cfg!(target_arch = "x86") {
            Machine::X86
        } else if cfg!(target_arch = "arm") {
            Machine::Arm
        } else if cfg!(target_arch = "aarch64") {
            Machine::Arm64
        } else if cfg!(target_arch = "riscv64") {
            Machine::RiscV64
        } else if cfg!(target_arch = "loongarch64") {
            Machine::LoongArch64
        } else {
            Machine::Amd64
        }
    }
}

impl fmt::Display for Machine
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.tag())
    }
}

/// `VS_FIXEDFILEINFO` as found in a `RT_VERSION` resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FixedFileInfo
{
    pub signature: u32,
    pub struc_version: u32,
    pub file_version_ms: u32,
    pub file_version_ls: u32,
    pub product_version_ms: u32,
    pub product_version_ls: u32,
    pub file_flags_mask: u32,
    pub file_flags: u32,
}

impl FixedFileInfo
{
    /// Required value of `signature`
    pub const SIGNATURE: u32 = 0xFEEF_04BD;
    /// Encoded size of the structure
    pub const SIZE: usize = 52;

    pub const VS_FF_DEBUG: u32 = 0x0000_0001;
    pub const VS_FF_SPECIALBUILD: u32 = 0x0000_0020;

    /// Decode from the first [`Self::SIZE`] bytes of `bytes`
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self>
    {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let field = |index: usize| {
            let offset = index * 4;
            u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
        };
        Some(FixedFileInfo {
            signature: field(0),
            struc_version: field(1),
            file_version_ms: field(2),
            file_version_ls: field(3),
            product_version_ms: field(4),
            product_version_ls: field(5),
            file_flags_mask: field(6),
            file_flags: field(7),
        })
    }

    /// Product version as `major.minor.build.revision`
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn product_version(&self) -> ClrDebuggingVersion
    {
        ClrDebuggingVersion::new(
            (self.product_version_ms >> 16) as u16,
            (self.product_version_ms & 0xFFFF) as u16,
            (self.product_version_ls >> 16) as u16,
            (self.product_version_ls & 0xFFFF) as u16,
        )
    }

    /// File-name flavor suffix for debug builds (`.dbg`, `.chk`, or empty)
    #[must_use]
    pub fn flavor_suffix(&self) -> &'static str
    {
        if self.file_flags & Self::VS_FF_DEBUG == 0 {
            ""
        } else if self.file_flags & Self::VS_FF_SPECIALBUILD != 0 {
            ".dbg"
        } else {
            ".chk"
        }
    }
}
