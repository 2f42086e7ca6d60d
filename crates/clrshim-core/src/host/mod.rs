//! # Process Hosts
//!
//! How the shim sees a live debuggee from the outside: its module list, a
//! few bytes of its memory, and the kernel events of the startup rendezvous.
//!
//! [`find_runtime`] is the module walk shared by runtime enumeration and the
//! registration worker. It runs file-based identification on every loaded
//! module and stops at the first runtime; one runtime per process is all the
//! shim reports.
//!
//! ## Implementations
//!
//! - `WindowsHost`: `EnumProcessModules`, `ReadProcessMemory`, named events
//! - `LinuxHost`: `/proc/<pid>/maps` and `process_vm_readv`; no events

#[cfg(target_os = "linux")]
mod linux;
#[cfg(windows)]
mod win32;

use std::sync::Arc;

#[cfg(target_os = "linux")]
pub use linux::{parse_maps, LinuxHost};
#[cfg(windows)]
pub use win32::{create_startup_event, Win32Event, WindowsHost};

use crate::error::{ShimError, ShimResult};
use crate::runtime::target_clr_metrics;
use crate::startup::{ContinueEvent, NotifyEvent};
use crate::types::{Address, ClrInfo, EngineMetrics, LoadedModule, ProcessId};

/// Module slots tried before asking the OS how many there are
pub const INITIAL_MODULE_CAPACITY: usize = 1024;

/// OS view of a live debuggee
pub trait ProcessHost: Send + Sync
{
    /// Modules loaded in `pid`, in load order
    ///
    /// ## Errors
    ///
    /// `ProcessNotFound` or an OS error when the process can't be opened;
    /// `PartialCopy`/`BadLength` while the module list is changing.
    fn modules(&self, pid: ProcessId) -> ShimResult<Vec<LoadedModule>>;

    /// Read up to `buffer.len()` bytes at `address` in `pid`
    ///
    /// ## Errors
    ///
    /// OS error when nothing could be read.
    fn read_memory(&self, pid: ProcessId, address: Address, buffer: &mut [u8]) -> ShimResult<usize>;

    /// Create (or open) the startup event the runtime in `pid` will signal
    ///
    /// ## Errors
    ///
    /// `NotImplemented` on hosts without named kernel events.
    fn startup_event(&self, _pid: ProcessId) -> ShimResult<Arc<dyn NotifyEvent>>
    {
        Err(ShimError::NotImplemented("startup notification event"))
    }

    /// Take a usable reference to the continue event whose handle value in
    /// `pid` is `handle`
    ///
    /// ## Errors
    ///
    /// `NotImplemented` on hosts without kernel events; OS errors otherwise.
    fn continue_event(&self, _pid: ProcessId, _handle: u64) -> ShimResult<Arc<dyn NotifyEvent>>
    {
        Err(ShimError::NotImplemented("continue startup event"))
    }
}

/// A runtime found loaded in a live process
#[derive(Debug, Clone)]
pub struct RuntimeInstance
{
    /// The module identified as the runtime
    pub module: LoadedModule,
    pub engine: EngineMetrics,
    pub info: ClrInfo,
    pub continue_event: ContinueEvent,
}

/// Fill a buffer through `fetch`, growing it once if the OS asks for more
///
/// `fetch` fills as many slots as fit and returns the count the OS needs.
/// When the second answer disagrees with the first (modules came or went in
/// between) the smaller count wins.
///
/// ## Errors
///
/// Whatever `fetch` returns.
pub fn enumerate_with_retry<T, F>(mut fetch: F) -> ShimResult<Vec<T>>
where
    T: Default + Clone,
    F: FnMut(&mut [T]) -> ShimResult<usize>,
{
    let mut items = vec![T::default(); INITIAL_MODULE_CAPACITY];
    let needed = fetch(&mut items)?;
    let count = if needed > items.len() {
        items.resize(needed, T::default());
        let again = fetch(&mut items)?;
        tracing::trace!(needed, again, "module list grew while enumerating");
        needed.min(again)
    } else {
        needed
    };
    items.truncate(count);
    Ok(items)
}

/// First loaded module of `pid` that identifies as a runtime
///
/// `None` when the process has no runtime loaded (yet).
///
/// ## Errors
///
/// Module enumeration errors; identification failures only skip the module.
pub fn find_runtime(host: &dyn ProcessHost, pid: ProcessId) -> ShimResult<Option<RuntimeInstance>>
{
    for module in host.modules(pid)? {
        let metrics = match target_clr_metrics(&module.path, true) {
            Ok(metrics) => metrics,
            Err(err) => {
                tracing::trace!(path = %module.path.display(), %err, "not a runtime");
                continue;
            }
        };
        let Some(info) = metrics.info else {
            continue;
        };
        let continue_event = capture_continue_event(host, pid, &module, metrics.continue_event_rva);
        tracing::info!(pid = pid.0, path = %module.path.display(), base = %module.base, "found runtime");
        return Ok(Some(RuntimeInstance { module, engine: metrics.engine, info, continue_event }));
    }
    Ok(None)
}

/// Read the continue-event handle out of the runtime's globals
///
/// The slot holds `INVALID_HANDLE_VALUE` until the runtime creates the
/// event; a slot we can't read or duplicate counts the same way.
fn capture_continue_event(host: &dyn ProcessHost, pid: ProcessId, module: &LoadedModule, rva: u32) -> ContinueEvent
{
    if rva == 0 {
        return ContinueEvent::Absent;
    }
    let Some(address) = module.base.checked_add(u64::from(rva)) else {
        return ContinueEvent::Pending;
    };
    let mut raw = [0u8; std::mem::size_of::<usize>()];
    match host.read_memory(pid, address, &mut raw) {
        Ok(read) if read == raw.len() => {}
        Ok(_) | Err(_) => {
            tracing::debug!(pid = pid.0, %address, "continue event slot unreadable");
            return ContinueEvent::Pending;
        }
    }
    let handle = usize::from_le_bytes(raw);
    if handle == 0 {
        return ContinueEvent::Absent;
    }
    if handle == usize::MAX {
        return ContinueEvent::Pending;
    }
    match host.continue_event(pid, handle as u64) {
        Ok(event) => ContinueEvent::Event(event),
        Err(err) => {
            tracing::debug!(pid = pid.0, handle, %err, "could not duplicate continue event");
            ContinueEvent::Pending
        }
    }
}

/// Host backing the running platform
///
/// ## Errors
///
/// `NotImplemented` where the shim has no process host.
pub fn system_host() -> ShimResult<Arc<dyn ProcessHost>>
{
    #[cfg(windows)]
    {
        Ok(Arc::new(WindowsHost::new()))
    }
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(LinuxHost::new()))
    }
    #[cfg(not(any(windows, target_os = "linux")))]
    {
        Err(ShimError::NotImplemented("process host"))
    }
}


#[cfg(test)]
mod tests
{
    use super::fake::*;
    use super::*;

    const BASE: Address = Address::new(0x7ff8_0000_0000);

    fn slot() -> Address
    {
        BASE.checked_add(u64::from(CONTINUE_SLOT_RVA)).unwrap()
    }

    #[test]
    fn test_enumerate_grows_once()
    {
        let mut calls = 0;
        let items: Vec<u32> = enumerate_with_retry(|slots| {
            calls += 1;
            Ok(if slots.len() < 1500 { 1500 } else { 1400 })
        })
        .unwrap();
        assert_eq!(calls, 2);
        assert_eq!(items.len(), 1400);
    }

    #[test]
    fn test_enumerate_small_list_single_call()
    {
        let items: Vec<u8> = enumerate_with_retry(|slots| {
            slots[0] = 7;
            Ok(1)
        })
        .unwrap();
        assert_eq!(items, vec![7]);
    }

    #[test]
    fn test_enumerate_propagates_errors()
    {
        let result: ShimResult<Vec<u8>> = enumerate_with_retry(|_| Err(ShimError::BadLength));
        assert!(matches!(result, Err(ShimError::BadLength)));
    }

    #[test]
    fn test_find_runtime_skips_other_modules()
    {
        let dir = scratch_dir("find");
        let host = FakeHost::new()
            .with_modules(vec![
                LoadedModule::new(Address::new(0x1000), plain_file(&dir, "kernel32.dll")),
                LoadedModule::new(BASE, windows_runtime_file(&dir)),
            ])
            .with_memory(slot(), 0x1234usize.to_le_bytes().to_vec());

        let runtime = find_runtime(&host, ProcessId(4711)).unwrap().unwrap();
        assert_eq!(runtime.module.base, BASE);
        assert_eq!(runtime.info.dbi.timestamp, 30);
        assert!(matches!(runtime.continue_event, ContinueEvent::Event(_)));
        assert_eq!(host.duplicated(), vec![0x1234]);
    }

    #[test]
    fn test_continue_slot_states()
    {
        let dir = scratch_dir("slot");
        let modules = vec![LoadedModule::new(BASE, windows_runtime_file(&dir))];

        let host = FakeHost::new().with_modules(modules.clone()).with_memory(slot(), usize::MAX.to_le_bytes().to_vec());
        assert!(find_runtime(&host, ProcessId(1)).unwrap().unwrap().continue_event.is_pending());

        let host = FakeHost::new().with_modules(modules.clone()).with_memory(slot(), 0usize.to_le_bytes().to_vec());
        assert!(matches!(find_runtime(&host, ProcessId(1)).unwrap().unwrap().continue_event, ContinueEvent::Absent));

        let host = FakeHost::new().with_modules(modules);
        assert!(find_runtime(&host, ProcessId(1)).unwrap().unwrap().continue_event.is_pending());
    }

    #[test]
    fn test_no_runtime_and_errors()
    {
        let dir = scratch_dir("none");
        let host = FakeHost::new().with_modules(vec![LoadedModule::new(Address::new(0x1000), plain_file(&dir, "a.dll"))]);
        assert!(find_runtime(&host, ProcessId(1)).unwrap().is_none());

        let host = FakeHost::new().then(Err(ShimError::PartialCopy(0)));
        assert!(matches!(find_runtime(&host, ProcessId(1)), Err(ShimError::PartialCopy(_))));
    }

    #[test]
    fn test_unix_runtime_has_no_continue_event()
    {
        let dir = scratch_dir("unix");
        let host = FakeHost::new().with_modules(vec![LoadedModule::new(BASE, unix_runtime_file(&dir))]);
        let runtime = find_runtime(&host, ProcessId(1)).unwrap().unwrap();
        assert!(matches!(runtime.continue_event, ContinueEvent::Absent));
        assert_eq!(runtime.info.runtime_build_id.as_bytes(), &[0x42; 20]);
    }
}
