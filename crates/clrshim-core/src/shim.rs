//! # The Shim
//!
//! [`DbgShim`] ties the process host, the library loader and the startup
//! monitor together behind the operations a debugger calls:
//!
//! - register for (and unregister from) runtime startup
//! - enumerate the runtimes of a process and build version strings
//! - create a debugger object from a version string
//! - connect to a remote debugging port
//!
//! Every collaborator is a trait object, so tests swap in fakes and the FFI
//! layer holds one process-wide instance over the system implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::enumerate;
use crate::error::{ShimError, ShimResult};
use crate::host::{system_host, ProcessHost, RuntimeInstance};
use crate::interop::CordbObject;
use crate::loader::dbi::{create_cordb, create_cordb_remote_port, CordbRequest};
use crate::loader::{LibraryLoader, SystemLoader};
use crate::provider::fallback::dbi_beside_runtime;
use crate::provider::{provide_library_paths, LibraryProvider};
#[cfg(test)]
use crate::runtime::names;
use crate::runtime::target_clr_metrics;
use crate::startup::{
    Backend, NotifyEvent, ProcMapsMonitor, Registration, RegistrationRequest, StartupCallback, StartupMonitor,
};
use crate::types::{Address, CorDebugInterfaceVersion, ProcessId};
use crate::version_string::{self, parse_version_string, VersionToken};

/// Polls of the module list before giving up on the continue event
pub const RUNTIME_POLL_ATTEMPTS: u32 = 25;
/// Pause between module-list polls
pub const RUNTIME_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long unregistering waits for the startup worker
pub const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(60);
/// Pause between polls of the module monitor
pub const MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Timing knobs of a shim instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimConfig
{
    pub poll_attempts: u32,
    pub poll_interval: Duration,
    pub join_timeout: Duration,
    pub monitor_interval: Duration,
}

impl Default for ShimConfig
{
    fn default() -> Self
    {
        ShimConfig {
            poll_attempts: RUNTIME_POLL_ATTEMPTS,
            poll_interval: RUNTIME_POLL_INTERVAL,
            join_timeout: WORKER_JOIN_TIMEOUT,
            monitor_interval: MONITOR_POLL_INTERVAL,
        }
    }
}

impl ShimConfig
{
    #[must_use]
    pub fn with_poll_attempts(mut self, attempts: u32) -> Self
    {
        self.poll_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self
    {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self
    {
        self.join_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self
    {
        self.monitor_interval = interval;
        self
    }
}

/// Debugger bootstrap over one process host and library loader
pub struct DbgShim
{
    host: Arc<dyn ProcessHost>,
    loader: Arc<dyn LibraryLoader>,
    monitor: Option<Arc<dyn StartupMonitor>>,
    config: ShimConfig,
}

impl std::fmt::Debug for DbgShim
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("DbgShim")
            .field("monitor", &self.monitor.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Keep transient enumeration errors, report everything else as a missing DBI
fn component_missing(err: ShimError) -> ShimError
{
    if err.is_transient() {
        err
    } else {
        debug!(%err, "could not locate the debugging components");
        ShimError::DebugComponentMissing(err.to_string())
    }
}

impl DbgShim
{
    /// Shim over the running platform with default timings
    ///
    /// ## Errors
    ///
    /// `NotImplemented` where the platform has no process host.
    pub fn new() -> ShimResult<Self>
    {
        Self::with_config(ShimConfig::default())
    }

    /// Shim over the running platform
    ///
    /// Hosts without named kernel events get a module-polling startup
    /// monitor.
    ///
    /// ## Errors
    ///
    /// `NotImplemented` where the platform has no process host.
    pub fn with_config(config: ShimConfig) -> ShimResult<Self>
    {
        let host = system_host()?;
        let shim = DbgShim::from_parts(Arc::clone(&host), Arc::new(SystemLoader), config);
        if cfg!(windows) {
            Ok(shim)
        } else {
            let monitor = ProcMapsMonitor::with_host(host, shim.config.monitor_interval);
            Ok(shim.with_monitor(Arc::new(monitor)))
        }
    }

    /// Shim over explicit collaborators, registering in event mode
    pub fn from_parts(host: Arc<dyn ProcessHost>, loader: Arc<dyn LibraryLoader>, config: ShimConfig) -> Self
    {
        DbgShim { host, loader, monitor: None, config }
    }

    /// Serve registrations with `monitor` instead of startup events
    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<dyn StartupMonitor>) -> Self
    {
        self.monitor = Some(monitor);
        self
    }

    pub fn config(&self) -> &ShimConfig
    {
        &self.config
    }

    pub fn host(&self) -> &Arc<dyn ProcessHost>
    {
        &self.host
    }

    pub fn loader(&self) -> &Arc<dyn LibraryLoader>
    {
        &self.loader
    }

    fn backend(&self) -> Backend
    {
        Backend { host: Arc::clone(&self.host), loader: Arc::clone(&self.loader), config: self.config.clone() }
    }

    /// Call `callback` once a runtime in `pid` is ready to debug
    ///
    /// The callback runs exactly once, on a shim thread, unless the returned
    /// registration is dropped or unregistered first.
    ///
    /// ## Errors
    ///
    /// - the host's error creating the startup event (event mode)
    /// - the monitor's error starting the watch (monitor mode)
    /// - `OutOfMemory` when the worker thread can't be started
    pub fn register_for_runtime_startup<F>(
        &self,
        pid: ProcessId,
        group_id: Option<&str>,
        provider: Option<Arc<dyn LibraryProvider>>,
        callback: F,
    ) -> ShimResult<Registration>
    where
        F: FnOnce(ShimResult<CordbObject>) + Send + 'static,
    {
        let callback: StartupCallback = Box::new(callback);
        let request = RegistrationRequest { pid, group_id: group_id.map(str::to_string), provider, callback };
        match &self.monitor {
            Some(monitor) => Registration::start_with_monitor(request, self.backend(), monitor.as_ref()),
            None => Registration::start_with_events(request, self.backend()),
        }
    }

    /// The event the runtime in `pid` signals when it reaches startup
    ///
    /// ## Errors
    ///
    /// `NotImplemented` on hosts without named kernel events.
    pub fn startup_notification_event(&self, pid: ProcessId) -> ShimResult<Arc<dyn NotifyEvent>>
    {
        self.host.startup_event(pid)
    }

    /// See [`enumerate::enumerate_clrs`]
    ///
    /// ## Errors
    ///
    /// Module enumeration errors; transient ones may be retried.
    pub fn enumerate_clrs(&self, pid: ProcessId) -> ShimResult<Vec<RuntimeInstance>>
    {
        enumerate::enumerate_clrs(self.host.as_ref(), pid)
    }

    /// See [`version_string::create_version_string`]
    ///
    /// ## Errors
    ///
    /// `FileNotFound` when the module isn't loaded in `pid`, or the
    /// identification error of the module file.
    pub fn create_version_string(&self, pid: ProcessId, module_path: &Path) -> ShimResult<VersionToken>
    {
        version_string::create_version_string(self.host.as_ref(), pid, module_path)
    }

    /// Create a debugger object for the runtime named by `version_string`,
    /// speaking interface version 2.0
    ///
    /// ## Errors
    ///
    /// See [`DbgShim::create_debugging_interface_from_version3`].
    pub fn create_debugging_interface_from_version(&self, version_string: &str) -> ShimResult<CordbObject>
    {
        self.create_debugging_interface_from_version3(CorDebugInterfaceVersion::V2_0, version_string, None, None)
    }

    /// ## Errors
    ///
    /// See [`DbgShim::create_debugging_interface_from_version3`].
    pub fn create_debugging_interface_from_version_ex(
        &self,
        debugger_version: CorDebugInterfaceVersion,
        version_string: &str,
    ) -> ShimResult<CordbObject>
    {
        self.create_debugging_interface_from_version3(debugger_version, version_string, None, None)
    }

    /// ## Errors
    ///
    /// See [`DbgShim::create_debugging_interface_from_version3`].
    pub fn create_debugging_interface_from_version2(
        &self,
        debugger_version: CorDebugInterfaceVersion,
        version_string: &str,
        group_id: Option<&str>,
    ) -> ShimResult<CordbObject>
    {
        self.create_debugging_interface_from_version3(debugger_version, version_string, group_id, None)
    }

    /// Create a debugger object for the runtime named by `version_string`
    ///
    /// With a provider the DBI and DAC come from it; without one the DBI is
    /// taken from the runtime's directory after the host's version check.
    /// The object speaks `debugger_version`, whatever the runtime supports.
    ///
    /// ## Errors
    ///
    /// - `InvalidArgument` for a malformed version string
    /// - `PartialCopy`/`BadLength` when the module list was in flux
    /// - `LibraryProviderError` when the DBI beside the runtime has another version
    /// - `DebugComponentMissing` when the DBI can't be located or loaded
    /// - whatever the DBI's creation function reports
    pub fn create_debugging_interface_from_version3(
        &self,
        debugger_version: CorDebugInterfaceVersion,
        version_string: &str,
        group_id: Option<&str>,
        provider: Option<&dyn LibraryProvider>,
    ) -> ShimResult<CordbObject>
    {
        let token = parse_version_string(version_string)?;
        debug!(pid = token.pid.0, base = %token.module_base, "creating debugger object from version string");

        let runtime_path = self.runtime_path(token.pid, token.module_base).map_err(component_missing)?;
        let (dbi, dac) = match provider {
            Some(provider) => {
                let (dbi, dac) = provided_paths(&runtime_path, provider).map_err(component_missing)?;
                (dbi, Some(dac))
            }
            None => {
                let dbi = dbi_beside_runtime(&runtime_path).map_err(|err| match err {
                    ShimError::LibraryProviderError(_) => err,
                    other => component_missing(other),
                })?;
                (dbi, None)
            }
        };

        let request = CordbRequest {
            dbi_path: &dbi,
            dac_path: dac.as_deref(),
            runtime_base: token.module_base,
            pid: token.pid,
            group_id,
            version: debugger_version,
        };
        create_cordb(self.loader.as_ref(), &request)
    }

    /// Path of the module loaded at `base` in `pid`
    fn runtime_path(&self, pid: ProcessId, base: Address) -> ShimResult<PathBuf>
    {
        self.host
            .modules(pid)?
            .into_iter()
            .find(|module| module.base == base)
            .map(|module| module.path)
            .ok_or_else(|| ShimError::Failed(format!("no module at {base} in process {}", pid.0)))
    }

    /// Create a debugger object that talks to a runtime over a remote port
    ///
    /// ## Errors
    ///
    /// - `DebugComponentMissing` when the DBI can't be loaded
    /// - `IncompatibleProtocol` when it lacks the remote-port entry point
    /// - the entry point's own failure
    pub fn register_for_runtime_startup_remote_port(
        &self,
        port: u32,
        dbi_path: &Path,
        assembly_base_path: &str,
    ) -> ShimResult<CordbObject>
    {
        create_cordb_remote_port(self.loader.as_ref(), dbi_path, port, assembly_base_path)
    }
}

/// DBI and DAC for the runtime file at `runtime_path`, from `provider`
fn provided_paths(runtime_path: &Path, provider: &dyn LibraryProvider) -> ShimResult<(PathBuf, PathBuf)>
{
    let info = target_clr_metrics(runtime_path, true)?
        .info
        .ok_or_else(|| ShimError::Failed(format!("{} carries no runtime identity", runtime_path.display())))?;
    provide_library_paths(&info, provider)
}
