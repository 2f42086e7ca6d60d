//! Name of the kernel event a starting runtime signals.

use crate::types::ProcessId;

pub const STARTUP_EVENT_PREFIX: &str = "TelestoStartupEvent_";
pub const SESSION_PREFIX: &str = "Session\\";

/// Longest name [`startup_event_name`] produces, plus the terminator
pub const STARTUP_EVENT_NAME_CAPACITY: usize = SESSION_PREFIX.len() + 10 + 1 + STARTUP_EVENT_PREFIX.len() + 8 + 1;

/// Event name for `pid`
///
/// The debuggee opens the name in its own session's namespace, so a debugger
/// in another terminal session has to spell out the debuggee's session.
///
/// ```rust
/// use clrshim_core::startup::startup_event_name;
/// use clrshim_core::types::ProcessId;
///
/// assert_eq!(startup_event_name(ProcessId(4711), 1, 1), "TelestoStartupEvent_00001267");
/// assert_eq!(startup_event_name(ProcessId(4711), 2, 1), "Session\\1\\TelestoStartupEvent_00001267");
/// ```
pub fn startup_event_name(pid: ProcessId, current_session: u32, debuggee_session: u32) -> String
{
    if current_session == debuggee_session {
        format!("{STARTUP_EVENT_PREFIX}{:08x}", pid.0)
    } else {
        format!("{SESSION_PREFIX}{debuggee_session}\\{STARTUP_EVENT_PREFIX}{:08x}", pid.0)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_pid_is_zero_padded_lowercase_hex()
    {
        assert_eq!(startup_event_name(ProcessId(0xab), 0, 0), "TelestoStartupEvent_000000ab");
    }

    #[test]
    fn test_longest_name_fits_capacity()
    {
        let name = startup_event_name(ProcessId(u32::MAX), 0, u32::MAX);
        assert_eq!(name, "Session\\4294967295\\TelestoStartupEvent_ffffffff");
        assert_eq!(name.len() + 1, STARTUP_EVENT_NAME_CAPACITY);
    }
}
