//! Auto-reset events the startup rendezvous waits on and signals.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::ShimResult;

/// An auto-reset event: one `set` releases one waiter
pub trait NotifyEvent: Send + Sync + fmt::Debug
{
    /// Signal the event
    ///
    /// ## Errors
    ///
    /// OS failure setting a kernel event.
    fn set(&self) -> ShimResult<()>;

    /// Wait for a signal, forever when `timeout` is `None`
    ///
    /// Returns `false` when the timeout elapsed first.
    ///
    /// ## Errors
    ///
    /// OS failure waiting on a kernel event.
    fn wait(&self, timeout: Option<Duration>) -> ShimResult<bool>;

    /// OS handle behind the event, 0 when there is none
    fn raw_handle(&self) -> usize
    {
        0
    }
}

/// In-process event built on a mutex and condition variable
#[derive(Debug, Default)]
pub struct LocalEvent
{
    signalled: Mutex<bool>,
    wake: Condvar,
}

impl LocalEvent
{
    pub fn new() -> Self
    {
        LocalEvent::default()
    }

    /// Whether a signal is pending (nobody consumed it yet)
    pub fn is_set(&self) -> bool
    {
        *self.signalled.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NotifyEvent for LocalEvent
{
    fn set(&self) -> ShimResult<()>
    {
        *self.signalled.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_one();
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> ShimResult<bool>
    {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut signalled = self.signalled.lock().unwrap_or_else(PoisonError::into_inner);
        while !*signalled {
            signalled = match deadline {
                None => self.wake.wait(signalled).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    self.wake.wait_timeout(signalled, deadline - now).unwrap_or_else(PoisonError::into_inner).0
                }
            };
        }
        *signalled = false;
        Ok(true)
    }
}

/// What a runtime exposes as its continue event
#[derive(Debug, Clone, Default)]
pub enum ContinueEvent
{
    /// The runtime has no continue event
    #[default]
    Absent,
    /// The runtime has the slot but has not created the event yet
    Pending,
    Event(Arc<dyn NotifyEvent>),
}

impl ContinueEvent
{
    pub fn is_pending(&self) -> bool
    {
        matches!(self, ContinueEvent::Pending)
    }

    /// Release the debuggee, if there is an event to signal
    ///
    /// ## Errors
    ///
    /// The event's own failure to signal.
    pub fn signal(&self) -> ShimResult<()>
    {
        match self {
            ContinueEvent::Event(event) => event.set(),
            ContinueEvent::Absent | ContinueEvent::Pending => Ok(()),
        }
    }

    /// Handle value as the C ABI reports it (`INVALID_HANDLE_VALUE` while pending)
    pub fn raw_handle(&self) -> usize
    {
        match self {
            ContinueEvent::Absent => 0,
            ContinueEvent::Pending => usize::MAX,
            ContinueEvent::Event(event) => event.raw_handle(),
        }
    }
}

#[cfg(test)]
mod tests
{
    use std::thread;

    use super::*;

    #[test]
    fn test_local_event_auto_resets()
    {
        let event = LocalEvent::new();
        event.set().unwrap();
        assert!(event.is_set());
        assert!(event.wait(Some(Duration::ZERO)).unwrap());
        assert!(!event.is_set());
        assert!(!event.wait(Some(Duration::from_millis(10))).unwrap());
    }

    #[test]
    fn test_local_event_wakes_other_thread()
    {
        let event = Arc::new(LocalEvent::new());
        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait(None).unwrap())
        };
        thread::sleep(Duration::from_millis(20));
        event.set().unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_continue_event_states()
    {
        assert_eq!(ContinueEvent::Absent.raw_handle(), 0);
        assert_eq!(ContinueEvent::Pending.raw_handle(), usize::MAX);
        assert!(ContinueEvent::Pending.signal().is_ok());

        let event = Arc::new(LocalEvent::new());
        let captured = ContinueEvent::Event(event.clone());
        captured.signal().unwrap();
        assert!(event.is_set());
    }
}
