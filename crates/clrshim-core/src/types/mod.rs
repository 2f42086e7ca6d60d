//! Platform-agnostic types shared by every component of the shim.
//!
//! Nothing in here touches a target or the OS; these are the values that flow
//! between the image parsers, the runtime identifier, the library resolver and
//! the DBI loader.

mod address;
mod clr_info;
pub mod guid;
mod process;
mod version;

pub use address::Address;
pub use clr_info::{BuildId, ClrInfo, DebugResource, EngineMetrics, IndexType, ModuleIndex, RuntimeInfoRecord};
pub use guid::Guid;
pub use process::{file_name_of, LoadedModule, ProcessId};
pub use version::{ClrDebuggingVersion, CorDebugInterfaceVersion, FixedFileInfo, Machine, Platform};
