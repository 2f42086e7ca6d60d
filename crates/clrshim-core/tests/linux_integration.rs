//! Integration tests against live processes on Linux
//!
//! The test process itself serves as a debuggee without a runtime.

#![cfg(target_os = "linux")]

use std::sync::mpsc;
use std::time::Duration;

use clrshim_core::{DbgShim, ProcessId, RegistrationPhase, ShimConfig, ShimError};

fn shim() -> DbgShim
{
    let config = ShimConfig::default().with_poll_attempts(2).with_poll_interval(Duration::from_millis(1));
    DbgShim::with_config(config).unwrap()
}

#[test]
fn test_enumerate_current_process_has_no_runtime()
{
    let runtimes = shim().enumerate_clrs(ProcessId::current()).unwrap();
    assert!(runtimes.is_empty());
}

#[test]
fn test_enumerate_missing_process()
{
    match shim().enumerate_clrs(ProcessId(u32::MAX)) {
        Err(ShimError::ProcessNotFound(pid)) => assert_eq!(pid, u32::MAX),
        other => panic!("expected ProcessNotFound, got {other:?}"),
    }
}

#[test]
fn test_version_string_for_unloaded_module()
{
    let result = shim().create_version_string(ProcessId::current(), std::path::Path::new("/nonexistent/libcoreclr.so"));
    assert!(result.is_err());
}

#[test]
fn test_startup_event_not_available()
{
    assert!(matches!(
        shim().startup_notification_event(ProcessId::current()),
        Err(ShimError::NotImplemented(_))
    ));
}

#[test]
fn test_registration_without_runtime_can_be_cancelled()
{
    let shim = shim();
    let (sender, receiver) = mpsc::channel();
    let registration = shim
        .register_for_runtime_startup(ProcessId::current(), None, None, move |result| {
            let _ = sender.send(result.is_ok());
        })
        .unwrap();
    assert_eq!(registration.pid(), ProcessId::current());
    assert_eq!(registration.phase(), RegistrationPhase::Armed);

    registration.unregister();
    assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn test_version_string_creation_rejects_garbage()
{
    assert!(matches!(
        shim().create_debugging_interface_from_version("not a version string"),
        Err(ShimError::InvalidArgument(_))
    ));
}
