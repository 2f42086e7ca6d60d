//! Runtime-load notification for hosts without named kernel events.
//!
//! A [`StartupMonitor`] reports every module that appears in the target,
//! runtime modules first, until its handler says it is done. The handler
//! decides whether a module is the runtime; the monitor only watches.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use super::{LocalEvent, NotifyEvent};
use crate::error::{ShimError, ShimResult};
use crate::host::ProcessHost;
use crate::runtime::names;
use crate::types::{LoadedModule, ProcessId};

/// Called with each new module (or the error that ended monitoring);
/// returns `true` to stop
pub type ModuleHandler = Box<dyn FnMut(ShimResult<LoadedModule>) -> bool + Send>;

/// Watches a process for modules being loaded
pub trait StartupMonitor: Send + Sync
{
    /// Start watching `pid`
    ///
    /// Modules already loaded are reported as new. `group_id` names the
    /// application group on hosts that sandbox by group.
    ///
    /// ## Errors
    ///
    /// When the watch can't be started (process gone, no thread).
    fn watch(&self, pid: ProcessId, group_id: Option<&str>, handler: ModuleHandler) -> ShimResult<Box<dyn MonitorToken>>;
}

/// A running watch
pub trait MonitorToken: Send + Sync
{
    /// Stop watching and wait for the handler to return, unless called from
    /// inside the handler
    fn cancel(&self);
}

/// Polls the target's module list on a background thread
#[derive(Clone)]
pub struct ProcMapsMonitor
{
    host: Arc<dyn ProcessHost>,
    interval: Duration,
}

impl ProcMapsMonitor
{
    /// Monitor over `/proc/<pid>/maps`
    #[cfg(target_os = "linux")]
    pub fn new(interval: Duration) -> Self
    {
        ProcMapsMonitor { host: Arc::new(crate::host::LinuxHost::new()), interval }
    }

    /// Monitor reading module lists from `host`
    pub fn with_host(host: Arc<dyn ProcessHost>, interval: Duration) -> Self
    {
        ProcMapsMonitor { host, interval }
    }
}

impl std::fmt::Debug for ProcMapsMonitor
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("ProcMapsMonitor").field("interval", &self.interval).finish_non_exhaustive()
    }
}

struct MapsWatch
{
    cancelled: Arc<AtomicBool>,
    stop: Arc<LocalEvent>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl MonitorToken for MapsWatch
{
    fn cancel(&self)
    {
        self.cancelled.store(true, Ordering::SeqCst);
        let _ = self.stop.set();
        if thread::current().id() == self.thread_id {
            return;
        }
        let thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                tracing::warn!("module monitor thread panicked");
            }
        }
    }
}

impl StartupMonitor for ProcMapsMonitor
{
    fn watch(&self, pid: ProcessId, group_id: Option<&str>, handler: ModuleHandler) -> ShimResult<Box<dyn MonitorToken>>
    {
        if group_id.is_some() {
            tracing::debug!(pid = pid.0, ?group_id, "application groups don't apply to module polling");
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(LocalEvent::new());
        let poll = Poll {
            host: Arc::clone(&self.host),
            interval: self.interval,
            pid,
            cancelled: Arc::clone(&cancelled),
            stop: Arc::clone(&stop),
        };
        let thread = thread::Builder::new()
            .name(format!("clrshim-monitor-{}", pid.0))
            .spawn(move || poll.run(handler))
            .map_err(|_| ShimError::OutOfMemory)?;
        let thread_id = thread.thread().id();
        Ok(Box::new(MapsWatch { cancelled, stop, thread: Mutex::new(Some(thread)), thread_id }))
    }
}

struct Poll
{
    host: Arc<dyn ProcessHost>,
    interval: Duration,
    pid: ProcessId,
    cancelled: Arc<AtomicBool>,
    stop: Arc<LocalEvent>,
}

impl Poll
{
    fn run(self, mut handler: ModuleHandler)
    {
        let span = tracing::debug_span!("module_monitor", pid = self.pid.0);
        let _enter = span.enter();
        let mut seen: HashSet<PathBuf> = HashSet::new();

        while !self.cancelled.load(Ordering::SeqCst) {
            match self.host.modules(self.pid) {
                Ok(modules) => {
                    let mut fresh: Vec<LoadedModule> =
                        modules.into_iter().filter(|module| seen.insert(module.path.clone())).collect();
                    // Stable: keeps load order within each group.
                    fresh.sort_by_key(|module| !names::is_core_clr(&module.path));
                    for module in fresh {
                        if self.cancelled.load(Ordering::SeqCst) {
                            return;
                        }
                        tracing::trace!(path = %module.path.display(), "new module");
                        if handler(Ok(module)) {
                            return;
                        }
                    }
                }
                Err(err) if err.is_transient() => tracing::trace!(%err, "module list in flux"),
                Err(err) => {
                    tracing::debug!(%err, "stopped watching");
                    if !self.cancelled.load(Ordering::SeqCst) {
                        handler(Err(err));
                    }
                    return;
                }
            }
            if self.stop.wait(Some(self.interval)).unwrap_or(false) {
                return;
            }
        }
    }
}
