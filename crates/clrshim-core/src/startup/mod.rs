//! # Runtime Startup Rendezvous
//!
//! Lets a debugger attach to a process before any managed code runs.
//!
//! On Windows the runtime, early in its initialisation, opens a named event
//! the debugger created ([`startup_event_name`]), signals it, and then blocks
//! on its own continue event until the debugger has attached. Elsewhere there
//! are no named kernel events; a [`StartupMonitor`] watches the module list
//! for the runtime instead.
//!
//! [`Registration`] ties either mechanism to the user's callback.

mod event;
mod event_name;
mod monitor;
mod registration;

pub use event::{ContinueEvent, LocalEvent, NotifyEvent};
pub use event_name::{startup_event_name, SESSION_PREFIX, STARTUP_EVENT_NAME_CAPACITY, STARTUP_EVENT_PREFIX};
pub use monitor::{ModuleHandler, MonitorToken, ProcMapsMonitor, StartupMonitor};
pub(crate) use registration::Backend;
pub use registration::{Registration, RegistrationPhase, RegistrationRequest, StartupCallback};
