//! One registration for runtime startup, from arming to the callback.
//!
//! Two backends drive the same state:
//!
//! - **event mode** (hosts with named kernel events): a worker thread polls
//!   the module list, falls back to waiting on the startup event, then
//!   attaches and signals the debuggee's continue event
//! - **monitor mode** (everything else): a [`StartupMonitor`] reports new
//!   modules and the handler attaches to the first runtime among them
//!
//! The user callback is a `FnOnce` kept behind a mutex, so whichever path
//! gets to it first is the only one that ever runs it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{ModuleHandler, MonitorToken, NotifyEvent, StartupMonitor};
use crate::error::{ShimError, ShimResult};
use crate::host::{find_runtime, ProcessHost, RuntimeInstance};
use crate::interop::CordbObject;
use crate::loader::dbi::{create_cordb, CordbRequest};
use crate::loader::LibraryLoader;
use crate::provider::fallback::dbi_beside_runtime;
use crate::provider::{provide_library_paths, LibraryProvider};
use crate::runtime::{names, target_clr_metrics};
use crate::shim::ShimConfig;
use crate::types::{ClrInfo, CorDebugInterfaceVersion, LoadedModule, ProcessId};

/// Receives the debugger object, or the error that ended the registration
pub type StartupCallback = Box<dyn FnOnce(ShimResult<CordbObject>) + Send>;

/// Where a registration stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationPhase
{
    /// Waiting for the runtime to load or signal
    Armed,
    /// Identifying the runtime and creating the debugger object
    Identifying,
    /// The callback received a debugger object
    Delivered,
    /// The callback received an error
    Failed,
    /// Unregistered before anything was delivered
    Cancelled,
}

impl RegistrationPhase
{
    pub fn is_terminal(self) -> bool
    {
        matches!(self, RegistrationPhase::Delivered | RegistrationPhase::Failed | RegistrationPhase::Cancelled)
    }
}

/// What the caller asked to be told about
pub struct RegistrationRequest
{
    pub pid: ProcessId,
    pub group_id: Option<String>,
    pub provider: Option<Arc<dyn LibraryProvider>>,
    pub callback: StartupCallback,
}

impl fmt::Debug for RegistrationRequest
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("RegistrationRequest")
            .field("pid", &self.pid)
            .field("group_id", &self.group_id)
            .field("provider", &self.provider.is_some())
            .finish_non_exhaustive()
    }
}

/// Everything the shim needs to act on a registration
#[derive(Clone)]
pub(crate) struct Backend
{
    pub host: Arc<dyn ProcessHost>,
    pub loader: Arc<dyn LibraryLoader>,
    pub config: ShimConfig,
}

struct Shared
{
    pid: ProcessId,
    group_id: Option<String>,
    provider: Option<Arc<dyn LibraryProvider>>,
    backend: Backend,
    callback: Mutex<Option<StartupCallback>>,
    cancelled: AtomicBool,
    phase: Mutex<RegistrationPhase>,
    startup_event: Option<Arc<dyn NotifyEvent>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: OnceCell<ThreadId>,
    finished: Mutex<bool>,
    finished_changed: Condvar,
    monitor: Mutex<Option<Box<dyn MonitorToken>>>,
}

impl Shared
{
    fn new(request: RegistrationRequest, backend: Backend, startup_event: Option<Arc<dyn NotifyEvent>>) -> Self
    {
        Shared {
            pid: request.pid,
            group_id: request.group_id,
            provider: request.provider,
            backend,
            callback: Mutex::new(Some(request.callback)),
            cancelled: AtomicBool::new(false),
            phase: Mutex::new(RegistrationPhase::Armed),
            startup_event,
            worker: Mutex::new(None),
            worker_id: OnceCell::new(),
            finished: Mutex::new(false),
            finished_changed: Condvar::new(),
            monitor: Mutex::new(None),
        }
    }

    fn is_cancelled(&self) -> bool
    {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn phase(&self) -> RegistrationPhase
    {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` unless a terminal phase was reached already
    fn advance(&self, next: RegistrationPhase)
    {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if !phase.is_terminal() {
            *phase = next;
        }
    }

    /// Hand `result` to the user callback, once, unless cancelled
    fn deliver(&self, result: ShimResult<CordbObject>)
    {
        if self.is_cancelled() {
            debug!(pid = self.pid.0, "cancelled; dropping startup result");
            return;
        }
        let Some(callback) = self.callback.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };
        match &result {
            Ok(_) => {
                info!(pid = self.pid.0, "delivering debugger object");
                self.advance(RegistrationPhase::Delivered);
            }
            Err(err) => {
                info!(pid = self.pid.0, %err, "runtime startup failed");
                self.advance(RegistrationPhase::Failed);
            }
        }
        callback(result);
    }

    fn mark_finished(&self)
    {
        *self.finished.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.finished_changed.notify_all();
    }

    /// DBI (and DAC, when a provider names one) for `info`
    fn library_paths(&self, info: &ClrInfo, runtime: &Path, check_version: bool) -> ShimResult<(PathBuf, Option<PathBuf>)>
    {
        if let Some(provider) = &self.provider {
            let (dbi, dac) = provide_library_paths(info, provider.as_ref())?;
            return Ok((dbi, Some(dac)));
        }
        let dbi = if check_version { dbi_beside_runtime(runtime)? } else { names::dbi_next_to_runtime(runtime)? };
        Ok((dbi, None))
    }
}

/// Marks the worker finished however it exits
struct FinishGuard<'a>(&'a Shared);

impl Drop for FinishGuard<'_>
{
    fn drop(&mut self)
    {
        self.0.mark_finished();
    }
}

/// An armed registration; the unregister token
///
/// Dropping it unregisters.
pub struct Registration
{
    shared: Arc<Shared>,
    torn_down: bool,
}

impl fmt::Debug for Registration
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Registration").field("pid", &self.shared.pid).field("phase", &self.phase()).finish()
    }
}

impl Registration
{
    /// Arm a registration served by a worker thread and the startup event
    ///
    /// ## Errors
    ///
    /// - the host's error creating the startup event
    /// - `OutOfMemory` when the worker thread can't be started
    pub(crate) fn start_with_events(request: RegistrationRequest, backend: Backend) -> ShimResult<Self>
    {
        let startup_event = backend.host.startup_event(request.pid)?;
        let pid = request.pid;
        let shared = Arc::new(Shared::new(request, backend, Some(startup_event)));

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("clrshim-startup-{}", pid.0))
            .spawn(move || run_worker(&worker_shared))
            .map_err(|err| {
                warn!(pid = pid.0, %err, "could not start the startup worker");
                ShimError::OutOfMemory
            })?;
        *shared.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(worker);
        debug!(pid = pid.0, "registered for runtime startup");
        Ok(Registration { shared, torn_down: false })
    }

    /// Arm a registration served by `monitor`
    ///
    /// ## Errors
    ///
    /// Whatever the monitor reports when starting the watch.
    pub(crate) fn start_with_monitor(
        request: RegistrationRequest,
        backend: Backend,
        monitor: &dyn StartupMonitor,
    ) -> ShimResult<Self>
    {
        let pid = request.pid;
        let shared = Arc::new(Shared::new(request, backend, None));
        let handler_shared = Arc::clone(&shared);
        let handler: ModuleHandler = Box::new(move |event| on_module(&handler_shared, event));
        let token = monitor.watch(pid, shared.group_id.as_deref(), handler)?;
        *shared.monitor.lock().unwrap_or_else(PoisonError::into_inner) = Some(token);
        debug!(pid = pid.0, "watching for runtime load");
        Ok(Registration { shared, torn_down: false })
    }

    pub fn pid(&self) -> ProcessId
    {
        self.shared.pid
    }

    pub fn phase(&self) -> RegistrationPhase
    {
        self.shared.phase()
    }

    /// Cancel the registration
    ///
    /// Wakes the worker (and the debuggee, if it is parked on its continue
    /// event) and waits a bounded time for the worker to exit. Called from
    /// inside the callback it returns without waiting.
    pub fn unregister(mut self)
    {
        self.tear_down();
    }

    fn tear_down(&mut self)
    {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        let shared = &self.shared;
        shared.cancelled.store(true, Ordering::SeqCst);
        shared.advance(RegistrationPhase::Cancelled);
        debug!(pid = shared.pid.0, "unregistering");

        let monitor = shared.monitor.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(monitor) = monitor {
            monitor.cancel();
        }

        let Some(startup_event) = &shared.startup_event else {
            return;
        };
        // The debuggee may be parked on its continue event.
        if let Ok(Some(runtime)) = find_runtime(shared.backend.host.as_ref(), shared.pid) {
            if let Err(err) = runtime.continue_event.signal() {
                warn!(pid = shared.pid.0, %err, "failed to release the debuggee");
            }
        }
        if let Err(err) = startup_event.set() {
            warn!(pid = shared.pid.0, %err, "failed to wake the startup worker");
        }

        if shared.worker_id.get() == Some(&thread::current().id()) {
            return;
        }
        let finished = shared.finished.lock().unwrap_or_else(PoisonError::into_inner);
        let (finished, _) = shared
            .finished_changed
            .wait_timeout_while(finished, shared.backend.config.join_timeout, |done| !*done)
            .unwrap_or_else(PoisonError::into_inner);
        let done = *finished;
        drop(finished);
        let worker = shared.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        match worker {
            Some(worker) if done => {
                if worker.join().is_err() {
                    warn!(pid = shared.pid.0, "startup worker panicked");
                }
            }
            Some(_) => warn!(pid = shared.pid.0, "startup worker did not exit in time; detaching"),
            None => {}
        }
    }
}

impl Drop for Registration
{
    fn drop(&mut self)
    {
        self.tear_down();
    }
}

fn run_worker(shared: &Shared)
{
    let _ = shared.worker_id.set(thread::current().id());
    let _finish = FinishGuard(shared);
    let span = tracing::info_span!("runtime_startup", pid = shared.pid.0);
    let _enter = span.enter();

    let mut found = false;
    let mut result = attach_if_loaded(shared, &mut found);
    if result.is_ok() || matches!(result, Err(ShimError::Timeout)) {
        if !found && !shared.is_cancelled() {
            debug!("runtime not loaded yet; waiting for the startup event");
            match shared.startup_event.as_ref().map(|event| event.wait(None)) {
                Some(Ok(_)) => {
                    if !shared.is_cancelled() {
                        result = attach_if_loaded(shared, &mut found);
                        if result.is_ok() && !found {
                            result = Err(ShimError::Failed("startup event fired but no runtime is loaded".into()));
                        }
                    }
                }
                Some(Err(err)) => result = Err(err),
                None => {}
            }
        }
    }

    if let Err(err) = result {
        if !shared.is_cancelled() {
            shared.deliver(Err(err));
        }
    }
}

/// Attach to the runtime if it is loaded, setting `found` when it was
fn attach_if_loaded(shared: &Shared, found: &mut bool) -> ShimResult<()>
{
    *found = false;
    let Some(runtime) = poll_runtime(shared)? else {
        return Ok(());
    };
    *found = true;
    shared.advance(RegistrationPhase::Identifying);

    let created = attach(shared, &runtime);
    let outcome = match created {
        Ok(object) => {
            shared.deliver(Ok(object));
            Ok(())
        }
        Err(err) => Err(err),
    };
    // Only now may the debuggee run on.
    if let Err(err) = runtime.continue_event.signal() {
        warn!(%err, "failed to signal the continue event");
    }
    outcome
}

/// Look for the runtime until it appears with its continue event in place,
/// is ruled out, or the retry budget runs out
fn poll_runtime(shared: &Shared) -> ShimResult<Option<RuntimeInstance>>
{
    let config = &shared.backend.config;
    for attempt in 1..=config.poll_attempts {
        match find_runtime(shared.backend.host.as_ref(), shared.pid) {
            Ok(None) => return Ok(None),
            Ok(Some(runtime)) if !runtime.continue_event.is_pending() => return Ok(Some(runtime)),
            Ok(Some(_)) => debug!(attempt, "runtime loaded but its continue event isn't created yet"),
            Err(err) if err.is_transient() => debug!(attempt, %err, "module list in flux"),
            Err(err) => return Err(err),
        }
        if shared.is_cancelled() {
            return Ok(None);
        }
        thread::sleep(config.poll_interval);
    }
    Err(ShimError::Timeout)
}

fn attach(shared: &Shared, runtime: &RuntimeInstance) -> ShimResult<CordbObject>
{
    let (dbi, dac) = shared.library_paths(&runtime.info, &runtime.module.path, true)?;
    let request = CordbRequest {
        dbi_path: &dbi,
        dac_path: dac.as_deref(),
        runtime_base: runtime.module.base,
        pid: shared.pid,
        group_id: None,
        version: runtime.engine.interface_version(),
    };
    create_cordb(shared.backend.loader.as_ref(), &request)
}

/// Monitor callback: `true` once the registration is settled
fn on_module(shared: &Shared, event: ShimResult<LoadedModule>) -> bool
{
    if shared.is_cancelled() {
        return true;
    }
    let module = match event {
        Ok(module) => module,
        Err(err) => {
            shared.deliver(Err(err));
            return true;
        }
    };
    let Some(info) = target_clr_metrics(&module.path, true).ok().and_then(|metrics| metrics.info) else {
        return false;
    };

    let span = tracing::info_span!("runtime_startup", pid = shared.pid.0);
    let _enter = span.enter();
    info!(path = %module.path.display(), base = %module.base, "runtime loaded");
    shared.advance(RegistrationPhase::Identifying);

    let result = shared.library_paths(&info, &module.path, false).and_then(|(dbi, dac)| {
        let request = CordbRequest {
            dbi_path: &dbi,
            dac_path: dac.as_deref(),
            runtime_base: module.base,
            pid: shared.pid,
            group_id: shared.group_id.as_deref(),
            version: CorDebugInterfaceVersion::V2_0,
        };
        create_cordb(shared.backend.loader.as_ref(), &request)
    });
    shared.deliver(result);
    true
}
