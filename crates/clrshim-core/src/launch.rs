//! # Process Launch
//!
//! Start a debuggee, optionally held before its first instruction, so a
//! debugger can create the startup event before the runtime can look for it.
//!
//! - **Windows**: `CreateProcessW` with `CREATE_SUSPENDED`; the resume handle
//!   is the primary thread.
//! - **Unix**: `fork()`, the child blocks reading a gate pipe, then
//!   `execvp()`. Resuming writes one byte to the gate.
//!
//! The command line is split the way the Windows C runtime splits it:
//! whitespace separates arguments, double quotes group them and `\"` is a
//! literal quote.

use std::ffi::OsString;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::error::{ShimError, ShimResult};
use crate::types::ProcessId;

/// How to start the debuggee
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOptions
{
    /// Hold the process until [`resume_process`]
    pub suspend: bool,
    /// Complete environment of the child; inherited when `None`
    pub environment: Option<Vec<(OsString, OsString)>>,
    pub current_directory: Option<PathBuf>,
}

impl LaunchOptions
{
    #[must_use]
    pub fn suspended() -> Self
    {
        LaunchOptions { suspend: true, ..Default::default() }
    }

    #[must_use]
    pub fn with_environment(mut self, environment: Vec<(OsString, OsString)>) -> Self
    {
        self.environment = Some(environment);
        self
    }

    #[must_use]
    pub fn with_current_directory(mut self, directory: impl Into<PathBuf>) -> Self
    {
        self.current_directory = Some(directory.into());
        self
    }
}

/// A started debuggee
#[derive(Debug)]
pub struct LaunchedProcess
{
    pub pid: ProcessId,
    pub resume: ResumeHandle,
}

/// Split a command line into arguments
///
/// ```rust
/// use clrshim_core::launch::split_command_line;
///
/// let args = split_command_line(r#"dotnet "my app.dll" --flag a\"b"#);
/// assert_eq!(args, vec!["dotnet", "my app.dll", "--flag", "a\"b"]);
/// ```
pub fn split_command_line(command_line: &str) -> Vec<String>
{
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quoted = false;
    let mut chars = command_line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'"') => {
                chars.next();
                current.push('"');
                in_token = true;
            }
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        args.push(current);
    }
    args
}

/// Start `command_line`
///
/// ## Errors
///
/// - `InvalidArgument` for an empty command line or one with interior NULs
/// - the OS error of the spawn
pub fn create_process_for_launch(command_line: &str, options: &LaunchOptions) -> ShimResult<LaunchedProcess>
{
    if command_line.trim().is_empty() {
        return Err(ShimError::InvalidArgument("empty command line".into()));
    }
    debug!(command_line, suspend = options.suspend, "launching process");
    let launched = sys::spawn(command_line, options)?;
    info!(pid = launched.pid.0, suspended = options.suspend, "launched process");
    Ok(launched)
}

/// Let a suspended process run
///
/// Resuming a process that was not suspended, or resuming twice, is a no-op
/// on Unix.
///
/// ## Errors
///
/// The OS error of the resume.
pub fn resume_process(handle: &ResumeHandle) -> ShimResult<()>
{
    handle.resume()
}

/// Release a resume handle
///
/// A process that was never resumed stays suspended on Windows; on Unix
/// closing the gate lets it run.
///
/// ## Errors
///
/// The OS error of the close.
pub fn close_resume_handle(handle: ResumeHandle) -> ShimResult<()>
{
    handle.close()
}

pub use sys::ResumeHandle;

#[cfg(unix)]
mod sys
{
    use std::ffi::{CString, OsStr};
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
    use std::os::unix::ffi::OsStrExt;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::{split_command_line, LaunchOptions, LaunchedProcess};
    use crate::error::{ShimError, ShimResult};
    use crate::types::ProcessId;

    const EXEC_FAILED: libc::c_int = 127;

    /// Write end of the child's gate pipe
    #[derive(Debug)]
    pub struct ResumeHandle
    {
        pid: ProcessId,
        gate: Option<OwnedFd>,
        resumed: AtomicBool,
    }

    impl ResumeHandle
    {
        pub fn pid(&self) -> ProcessId
        {
            self.pid
        }

        /// Hand the handle to C callers
        pub fn into_raw(self) -> usize
        {
            Box::into_raw(Box::new(self)) as usize
        }

        /// Take back a handle from [`ResumeHandle::into_raw`]
        ///
        /// # Safety
        ///
        /// `raw` must come from `into_raw` and not have been taken back yet.
        pub unsafe fn from_raw(raw: usize) -> Self
        {
            *unsafe { Box::from_raw(raw as *mut ResumeHandle) }
        }

        /// Borrow a handle still owned by C callers
        ///
        /// # Safety
        ///
        /// `raw` must come from `into_raw` and stay alive for `'a`.
        pub unsafe fn borrow_raw<'a>(raw: usize) -> &'a Self
        {
            unsafe { &*(raw as *const ResumeHandle) }
        }

        pub(super) fn resume(&self) -> ShimResult<()>
        {
            let Some(gate) = &self.gate else {
                return Ok(());
            };
            if self.resumed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            let byte = 1u8;
            loop {
                let written = unsafe { libc::write(gate.as_raw_fd(), std::ptr::addr_of!(byte).cast(), 1) };
                if written == 1 {
                    return Ok(());
                }
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::Interrupted {
                    // The child is gone; nothing left to resume.
                    return Err(ShimError::Io(err));
                }
            }
        }

        pub(super) fn close(self) -> ShimResult<()>
        {
            drop(self);
            Ok(())
        }
    }

    fn c_string(bytes: &[u8]) -> ShimResult<CString>
    {
        CString::new(bytes).map_err(|_| ShimError::InvalidArgument("argument contains a NUL".into()))
    }

    fn gate_pipe() -> ShimResult<(OwnedFd, OwnedFd)>
    {
        let mut fds: [RawFd; 2] = [0; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(ShimError::last_os_error("pipe"));
        }
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        for fd in [&read, &write] {
            if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
                return Err(ShimError::last_os_error("fcntl"));
            }
        }
        Ok((read, write))
    }

    /// Resolve `program` along `PATH` the way `execvp` would
    fn resolve_program(program: &str) -> PathBuf
    {
        if program.contains('/') {
            return PathBuf::from(program);
        }
        std::env::var_os("PATH")
            .and_then(|paths| std::env::split_paths(&paths).map(|dir| dir.join(program)).find(|p| is_executable(p)))
            .unwrap_or_else(|| PathBuf::from(program))
    }

    fn is_executable(path: &Path) -> bool
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path).is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
    }

    pub(super) fn spawn(command_line: &str, options: &LaunchOptions) -> ShimResult<LaunchedProcess>
    {
        let args = split_command_line(command_line);
        let argv_storage = args.iter().map(|arg| c_string(arg.as_bytes())).collect::<ShimResult<Vec<_>>>()?;
        let mut argv: Vec<*const libc::c_char> = argv_storage.iter().map(|arg| arg.as_ptr()).collect();
        argv.push(std::ptr::null());

        let envp_storage = options
            .environment
            .as_ref()
            .map(|vars| {
                vars.iter()
                    .map(|(key, value)| {
                        let mut entry = key.as_bytes().to_vec();
                        entry.push(b'=');
                        entry.extend_from_slice(value.as_bytes());
                        c_string(&entry)
                    })
                    .collect::<ShimResult<Vec<_>>>()
            })
            .transpose()?;
        let envp: Option<Vec<*const libc::c_char>> = envp_storage.as_ref().map(|vars| {
            vars.iter().map(|var| var.as_ptr()).chain(std::iter::once(std::ptr::null())).collect()
        });
        // execve has no PATH search, so resolve before forking.
        let program = match &envp {
            Some(_) => c_string(resolve_program(&args[0]).as_os_str().as_bytes())?,
            None => c_string(args[0].as_bytes())?,
        };
        let directory = options
            .current_directory
            .as_deref()
            .map(|dir| c_string(OsStr::as_bytes(dir.as_os_str())))
            .transpose()?;

        let gate = if options.suspend { Some(gate_pipe()?) } else { None };
        let gate_fds = gate.as_ref().map(|(read, write)| (read.as_raw_fd(), write.as_raw_fd()));

        let pid = unsafe { libc::fork() };
        if pid == -1 {
            return Err(ShimError::last_os_error("fork"));
        }
        if pid == 0 {
            // Only async-signal-safe calls from here to exec.
            unsafe { child(gate_fds, directory.as_ref(), &program, &argv, envp.as_deref()) }
        }

        let gate = gate.map(|(read, write)| {
            drop(read);
            write
        });
        #[allow(clippy::cast_sign_loss)]
        let pid = ProcessId(pid as u32);
        Ok(LaunchedProcess { pid, resume: ResumeHandle { pid, gate, resumed: AtomicBool::new(false) } })
    }

    unsafe fn child(
        gate: Option<(RawFd, RawFd)>,
        directory: Option<&CString>,
        program: &CString,
        argv: &[*const libc::c_char],
        envp: Option<&[*const libc::c_char]>,
    ) -> !
    {
        unsafe {
            if let Some((read, write)) = gate {
                libc::close(write);
                let mut byte = 0u8;
                while libc::read(read, std::ptr::addr_of_mut!(byte).cast(), 1) == -1
                    && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR)
                {}
                libc::close(read);
            }
            if let Some(directory) = directory {
                if libc::chdir(directory.as_ptr()) != 0 {
                    libc::_exit(EXEC_FAILED);
                }
            }
            match envp {
                Some(envp) => libc::execve(program.as_ptr(), argv.as_ptr(), envp.as_ptr()),
                None => libc::execvp(program.as_ptr(), argv.as_ptr()),
            };
            libc::_exit(EXEC_FAILED)
        }
    }
}

#[cfg(windows)]
mod sys
{
    use std::ffi::OsString;
    use std::os::windows::ffi::OsStrExt;

    use windows::core::{PCWSTR, PWSTR};
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::System::Threading::{
        CreateProcessW, ResumeThread, CREATE_SUSPENDED, CREATE_UNICODE_ENVIRONMENT, PROCESS_CREATION_FLAGS,
        PROCESS_INFORMATION, STARTUPINFOW,
    };

    use super::{LaunchOptions, LaunchedProcess};
    use crate::error::{ShimError, ShimResult};
    use crate::loader::{to_wide, to_wide_str};
    use crate::types::ProcessId;

    /// The primary thread of a launched process
    #[derive(Debug)]
    pub struct ResumeHandle
    {
        pid: ProcessId,
        thread: usize,
    }

    impl ResumeHandle
    {
        pub fn pid(&self) -> ProcessId
        {
            self.pid
        }

        /// Hand the thread handle to C callers
        pub fn into_raw(self) -> usize
        {
            let thread = self.thread;
            std::mem::forget(self);
            thread
        }

        /// Take ownership of a thread handle
        ///
        /// # Safety
        ///
        /// `raw` must be a thread handle nobody else closes.
        pub unsafe fn from_raw(raw: usize) -> Self
        {
            ResumeHandle { pid: ProcessId(0), thread: raw }
        }

        /// Borrow a thread handle still owned by C callers
        ///
        /// # Safety
        ///
        /// `raw` must stay a valid thread handle for `'a`.
        pub unsafe fn borrow_raw<'a>(raw: usize) -> std::mem::ManuallyDrop<Self>
        {
            std::mem::ManuallyDrop::new(ResumeHandle { pid: ProcessId(0), thread: raw })
        }

        fn handle(&self) -> HANDLE
        {
            HANDLE(self.thread as _)
        }

        pub(super) fn resume(&self) -> ShimResult<()>
        {
            if unsafe { ResumeThread(self.handle()) } == u32::MAX {
                return Err(ShimError::last_os_error("ResumeThread"));
            }
            Ok(())
        }

        pub(super) fn close(self) -> ShimResult<()>
        {
            let handle = self.handle();
            std::mem::forget(self);
            unsafe { CloseHandle(handle) }.map_err(|err| ShimError::Os { api: "CloseHandle", code: err.code().0 })
        }
    }

    impl Drop for ResumeHandle
    {
        fn drop(&mut self)
        {
            let _ = unsafe { CloseHandle(self.handle()) };
        }
    }

    fn environment_block(vars: &[(OsString, OsString)]) -> Vec<u16>
    {
        let mut block = Vec::new();
        for (key, value) in vars {
            block.extend(key.encode_wide());
            block.push(u16::from(b'='));
            block.extend(value.encode_wide());
            block.push(0);
        }
        if vars.is_empty() {
            block.push(0);
        }
        block.push(0);
        block
    }

    pub(super) fn spawn(command_line: &str, options: &LaunchOptions) -> ShimResult<LaunchedProcess>
    {
        let mut command = to_wide_str(command_line);
        let environment = options.environment.as_deref().map(environment_block);
        let directory = options.current_directory.as_deref().map(to_wide);

        let mut flags = PROCESS_CREATION_FLAGS(0);
        if options.suspend {
            flags |= CREATE_SUSPENDED;
        }
        if environment.is_some() {
            flags |= CREATE_UNICODE_ENVIRONMENT;
        }

        let startup = STARTUPINFOW { cb: std::mem::size_of::<STARTUPINFOW>() as u32, ..Default::default() };
        let mut info = PROCESS_INFORMATION::default();
        unsafe {
            CreateProcessW(
                PCWSTR::null(),
                PWSTR(command.as_mut_ptr()),
                None,
                None,
                false,
                flags,
                environment.as_ref().map(|block| block.as_ptr().cast()),
                directory.as_ref().map_or(PCWSTR::null(), |dir| PCWSTR(dir.as_ptr())),
                &startup,
                &mut info,
            )
        }
        .map_err(|err| ShimError::Os { api: "CreateProcessW", code: err.code().0 })?;

        if !info.hProcess.is_invalid() {
            let _ = unsafe { CloseHandle(info.hProcess) };
        }
        let pid = ProcessId(info.dwProcessId);
        Ok(LaunchedProcess { pid, resume: ResumeHandle { pid, thread: info.hThread.0 as usize } })
    }
}

#[cfg(all(test, unix))]
mod tests
{
    use std::time::{Duration, Instant};

    use super::*;

    fn scratch(name: &str) -> PathBuf
    {
        let dir = std::env::temp_dir().join(format!("clrshim-launch-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn wait_for(path: &std::path::Path, timeout: Duration) -> bool
    {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if path.exists() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        path.exists()
    }

    fn reap(pid: ProcessId)
    {
        let mut status = 0;
        #[allow(clippy::cast_possible_wrap)]
        unsafe {
            libc::waitpid(pid.0 as libc::pid_t, &mut status, 0)
        };
    }

    #[test]
    fn test_split_command_line()
    {
        assert_eq!(split_command_line("  a  b\tc "), vec!["a", "b", "c"]);
        assert_eq!(split_command_line(r#"run "" x"#), vec!["run", "", "x"]);
        assert_eq!(split_command_line(r#""C:\Program Files\app.exe" -v"#), vec![r"C:\Program Files\app.exe", "-v"]);
        assert!(split_command_line("   ").is_empty());
    }

    #[test]
    fn test_empty_command_line_is_rejected()
    {
        assert!(matches!(
            create_process_for_launch(" ", &LaunchOptions::default()),
            Err(ShimError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_suspended_process_waits_for_resume()
    {
        let dir = scratch("suspended");
        let marker = dir.join("ran");
        let command = format!("/bin/sh -c \"touch '{}'\"", marker.display());

        let launched = create_process_for_launch(&command, &LaunchOptions::suspended()).unwrap();
        assert_eq!(launched.resume.pid(), launched.pid);
        assert!(!wait_for(&marker, Duration::from_millis(300)));

        resume_process(&launched.resume).unwrap();
        resume_process(&launched.resume).unwrap();
        assert!(wait_for(&marker, Duration::from_secs(10)));
        close_resume_handle(launched.resume).unwrap();
        reap(launched.pid);
    }

    #[test]
    fn test_environment_and_directory_are_applied()
    {
        let dir = scratch("environment");
        let options = LaunchOptions::default()
            .with_environment(vec![("CLRSHIM_LAUNCH_VALUE".into(), "forty-two".into())])
            .with_current_directory(&dir);

        let launched =
            create_process_for_launch("/bin/sh -c \"echo $CLRSHIM_LAUNCH_VALUE > out.txt\"", &options).unwrap();
        let out = dir.join("out.txt");
        assert!(wait_for(&out, Duration::from_secs(10)));
        reap(launched.pid);
        assert_eq!(std::fs::read_to_string(out).unwrap().trim(), "forty-two");
    }

    #[test]
    fn test_raw_round_trip_keeps_the_gate()
    {
        let dir = scratch("raw");
        let marker = dir.join("ran");
        let command = format!("/bin/sh -c \"touch '{}'\"", marker.display());
        let launched = create_process_for_launch(&command, &LaunchOptions::suspended()).unwrap();

        let raw = launched.resume.into_raw();
        unsafe { ResumeHandle::borrow_raw(raw) }.resume().unwrap();
        assert!(wait_for(&marker, Duration::from_secs(10)));
        close_resume_handle(unsafe { ResumeHandle::from_raw(raw) }).unwrap();
        reap(launched.pid);
    }
}
