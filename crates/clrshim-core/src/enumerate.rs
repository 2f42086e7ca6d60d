//! Runtime enumeration for a live process.
//!
//! Only the first runtime found is reported, paired with the continue event
//! the debuggee will wait on once it reaches its startup rendezvous.

use std::path::Path;

use crate::error::ShimResult;
use crate::host::{find_runtime, ProcessHost, RuntimeInstance};
use crate::types::{Address, ProcessId};

/// Runtimes loaded in `pid`
///
/// Empty when no runtime is loaded yet. The caller owns the returned
/// continue events; dropping them releases the handles.
///
/// ## Errors
///
/// Module enumeration errors of the host. `PartialCopy` and `BadLength`
/// mean the module list changed underneath us and the call may be retried.
pub fn enumerate_clrs(host: &dyn ProcessHost, pid: ProcessId) -> ShimResult<Vec<RuntimeInstance>>
{
    let runtimes: Vec<RuntimeInstance> = find_runtime(host, pid)?.into_iter().collect();
    tracing::debug!(pid = pid.0, count = runtimes.len(), "enumerated runtimes");
    Ok(runtimes)
}

/// Base address of the module loaded from `path` in `pid`
///
/// Paths compare without regard to ASCII case.
///
/// ## Errors
///
/// Module enumeration errors of the host.
pub fn module_base_address(host: &dyn ProcessHost, pid: ProcessId, path: &Path) -> ShimResult<Option<Address>>
{
    let wanted = path.as_os_str();
    Ok(host
        .modules(pid)?
        .into_iter()
        .find(|module| module.path.as_os_str().eq_ignore_ascii_case(wanted))
        .map(|module| module.base))
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::error::ShimError;
    use crate::host::fake::*;
    use crate::types::LoadedModule;

    #[test]
    fn test_enumerate_reports_first_runtime_only()
    {
        let dir = scratch_dir("enumerate-first");
        let first = unix_runtime_file(&dir);
        let other = plain_file(&dir, "libfoo.so");
        let host = FakeHost::new().with_modules(vec![
            LoadedModule::new(Address::new(0x1000), &other),
            LoadedModule::new(Address::new(0x2000), &first),
        ]);

        let runtimes = enumerate_clrs(&host, ProcessId(7)).unwrap();
        assert_eq!(runtimes.len(), 1);
        assert_eq!(runtimes[0].module.base, Address::new(0x2000));
        assert!(!runtimes[0].continue_event.is_pending());
    }

    #[test]
    fn test_enumerate_without_runtime_is_empty()
    {
        let dir = scratch_dir("enumerate-empty");
        let other = plain_file(&dir, "libfoo.so");
        let host = FakeHost::new().with_modules(vec![LoadedModule::new(Address::new(0x1000), other)]);
        assert!(enumerate_clrs(&host, ProcessId(7)).unwrap().is_empty());
    }

    #[test]
    fn test_enumerate_propagates_transient_errors()
    {
        let host = FakeHost::new().then(Err(ShimError::BadLength));
        let err = enumerate_clrs(&host, ProcessId(7)).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_module_base_ignores_case()
    {
        let host = FakeHost::new().with_modules(vec![
            LoadedModule::new(Address::new(0x1000), "/opt/App/libfoo.so"),
            LoadedModule::new(Address::new(0x2000), "/opt/App/libcoreclr.so"),
        ]);
        let base = module_base_address(&host, ProcessId(7), Path::new("/OPT/app/LIBCORECLR.SO")).unwrap();
        assert_eq!(base, Some(Address::new(0x2000)));
        assert_eq!(module_base_address(&host, ProcessId(7), Path::new("/opt/app/libbar.so")).unwrap(), None);
    }
}
