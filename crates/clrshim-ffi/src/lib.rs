//! # dbgshim C ABI
//!
//! Exports the debugger bootstrap entry points under their native names so
//! a debugger can load this library in place of the runtime's own shim.
//!
//! Every export returns an `HRESULT`. Errors become the HRESULT of the
//! corresponding [`clrshim_core::ShimError`] and panics become `E_FAIL`;
//! nothing unwinds into the caller. Output pointers are cleared on failure.
//!
//! The library logs nothing unless `CLRSHIM_LOG_FILE` (log to that file) or
//! `RUST_LOG` (log to stderr) is set.

#![allow(unsafe_code)]
#![allow(non_snake_case)]

mod clr_debugging;
mod create;
mod enumerate;
mod export;
mod launch;
mod startup;

pub use clr_debugging::{CLRCreateInstance, ICLRDebuggingVtbl};
pub use create::{
    CreateDebuggingInterfaceFromVersion, CreateDebuggingInterfaceFromVersion2, CreateDebuggingInterfaceFromVersion3,
    CreateDebuggingInterfaceFromVersionEx, CreateVersionStringFromModule, RegisterForRuntimeStartupRemotePort,
};
pub use enumerate::{CloseCLREnumeration, EnumerateCLRs};
pub use launch::{CloseResumeHandle, CreateProcessForLaunch, ResumeProcess};
pub use startup::{
    GetStartupNotificationEvent, RegisterForRuntimeStartup, RegisterForRuntimeStartup3, RegisterForRuntimeStartupEx,
    StartupCallbackFn, UnregisterForRuntimeStartup,
};
