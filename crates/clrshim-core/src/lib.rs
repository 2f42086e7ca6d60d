//! # clrshim-core
//!
//! Bootstrap for debuggers of managed runtimes: everything between "I have
//! a process id" and "I hold an `ICorDebug` object for the runtime inside".
//!
//! - [`startup`]: wait for a runtime to start in a process, then hand the
//!   debugger an object bound to it
//! - [`enumerate`] / [`version_string`]: find the runtime in a running
//!   process and describe it with a token the debugger can keep
//! - [`runtime`]: identify a runtime module in a target or on disk, and
//!   name the debugger libraries (DBI, DAC) it needs
//! - [`provider`]: resolve those libraries through the debugger's provider
//! - [`loader`]: load the DBI and call its creation entry points
//! - [`clr_debugging`]: the `ICLRDebugging` facade for dump debugging
//! - [`launch`]: start a debuggee suspended
//!
//! [`DbgShim`] ties these to a process host and a library loader.
//!
//! ## Platform Support
//!
//! - **Windows**: named startup events, `EnumProcessModules`, `LoadLibraryW`
//! - **Linux**: `/proc/<pid>/maps` polling, `process_vm_readv`, `dlopen`
//! - **macOS**: identification, library resolution and launch; no live
//!   process host
//!
//! ## Why unsafe code is needed
//!
//! The DBI and the debugger's own objects speak a C/COM ABI: raw vtables,
//! function pointers resolved from loaded libraries, and handles owned by
//! the OS. Those calls are wrapped once, in [`loader`], [`interop`] and the
//! host backends, and everything above them is safe.

#![allow(unsafe_code)]

pub mod clr_debugging;
pub mod enumerate;
pub mod error;
pub mod host;
pub mod image;
pub mod interop;
pub mod launch;
pub mod loader;
pub mod mapping;
pub mod provider;
pub mod runtime;
pub mod shim;
pub mod startup;
pub mod target;
pub mod types;
pub mod version_string;

pub use clr_debugging::{clr_create_instance, ClrDebugging, OpenVirtualProcessArgs, OpenedRuntime};
pub use error::{ShimError, ShimResult};
pub use interop::CordbObject;
pub use launch::{
    close_resume_handle, create_process_for_launch, resume_process, LaunchOptions, LaunchedProcess, ResumeHandle,
};
pub use provider::{LibraryProvider, ProvidedLibraries};
pub use shim::{DbgShim, ShimConfig};
pub use startup::{Registration, RegistrationPhase};
pub use types::{Address, ClrDebuggingVersion, ClrInfo, CorDebugInterfaceVersion, Guid, ProcessId};
pub use version_string::VersionToken;
