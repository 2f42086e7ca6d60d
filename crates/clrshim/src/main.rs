use std::path::PathBuf;
use std::process;
use std::sync::mpsc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use clrshim_core::runtime::target_clr_metrics;
use clrshim_core::types::IndexType;
use clrshim_core::{
    close_resume_handle, create_process_for_launch, resume_process, CordbObject, CorDebugInterfaceVersion, DbgShim,
    LaunchOptions, ProcessId, ShimConfig, ShimResult,
};
use clrshim_utils::{info, init_logging, shim_config_from_env, warn};

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// Bootstrap debuggers of .NET runtimes: find, identify and wait for them.
#[derive(Parser, Debug)]
#[command(name = "clrshim")]
#[command(version)]
#[command(about = "Find, identify and wait for .NET runtimes in a process", long_about = None)]
struct Cli
{
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// List the runtime loaded in a process
    Enumerate
    {
        /// Process ID of the debuggee
        pid: u32,
    },
    /// Print the version string of a runtime module loaded in a process
    VersionString
    {
        pid: u32,
        /// Full path of the runtime module, as loaded
        module: PathBuf,
    },
    /// Identify a runtime module file and name its DBI and DAC
    Identify
    {
        /// Path of the module file on disk
        module: PathBuf,
    },
    /// Identify the runtime mapped at an address of a live process
    Probe
    {
        pid: u32,
        /// Module base address (hex); defaults to the first runtime found
        #[arg(long, value_parser = parse_address)]
        base: Option<u64>,
    },
    /// Create a debugger object from a version string
    Create
    {
        version_string: String,
        /// Interface version the debugger speaks (3 = v2.0, 4 = v4.0)
        #[arg(long, default_value_t = 3)]
        debugger_version: u32,
        /// Application group id (sandboxed runtimes)
        #[arg(long)]
        group_id: Option<String>,
    },
    /// Wait for a runtime to start in a process
    Wait
    {
        pid: u32,
        #[arg(long)]
        group_id: Option<String>,
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Launch a program, optionally holding it until a runtime watch is armed
    Launch
    {
        /// Register for runtime startup before letting the program run
        #[arg(long, default_value_t = false)]
        wait_runtime: bool,
        /// Give up waiting after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Program and its arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Show the shim configuration and .NET environment
    Info,
}

fn main()
{
    let _guard = match init_logging() {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    let cli = Cli::parse();
    if let Err(e) = run_command(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn shim() -> CliResult<DbgShim>
{
    Ok(DbgShim::with_config(shim_config_from_env()?)?)
}

fn run_command(cli: Cli) -> CliResult
{
    match cli.command {
        Commands::Enumerate { pid } => enumerate(ProcessId(pid)),
        Commands::VersionString { pid, module } => {
            let token = shim()?.create_version_string(ProcessId(pid), &module)?;
            println!("{token}");
            Ok(())
        }
        Commands::Identify { module } => identify(module),
        Commands::Probe { pid, base } => probe(ProcessId(pid), base),
        Commands::Create { version_string, debugger_version, group_id } => {
            let object = shim()?.create_debugging_interface_from_version2(
                CorDebugInterfaceVersion::from(debugger_version),
                &version_string,
                group_id.as_deref(),
            )?;
            println!("Created debugger object at {:p}", object.as_raw());
            Ok(())
        }
        Commands::Wait { pid, group_id, timeout } => {
            let shim = shim()?;
            wait_for_runtime(&shim, ProcessId(pid), group_id.as_deref(), timeout.map(Duration::from_secs), || Ok(()))
        }
        Commands::Launch { wait_runtime, timeout, command } => launch(&command, wait_runtime, timeout.map(Duration::from_secs)),
        Commands::Info => {
            print_info(&shim_config_from_env()?);
            Ok(())
        }
    }
}

fn enumerate(pid: ProcessId) -> CliResult
{
    let runtimes = shim()?.enumerate_clrs(pid)?;
    if runtimes.is_empty() {
        println!("No runtime loaded in process {pid}");
    }
    for runtime in &runtimes {
        println!("{} at {}", runtime.module.path.display(), runtime.module.base);
        println!("  DBI interface version: {}", runtime.engine.dbi_version);
        if runtime.continue_event.is_pending() {
            println!("  Continue event: not created yet");
        } else {
            println!("  Continue event: {:#x}", runtime.continue_event.raw_handle());
        }
    }
    Ok(())
}

fn identify(module: PathBuf) -> CliResult
{
    let metrics = target_clr_metrics(&module, true)?;
    println!("{}", module.display());
    println!("  DBI interface version: {}", metrics.engine.dbi_version);
    if metrics.continue_event_rva != 0 {
        println!("  Continue event RVA: {:#x}", metrics.continue_event_rva);
    }
    let Some(clr) = metrics.info else {
        return Ok(());
    };
    println!("  Index type: {:?}", clr.index_type);
    for (role, index) in [("DBI", &clr.dbi), ("DAC", &clr.dac)] {
        if clr.target_is_windows {
            println!("  {role}: {} (timestamp {:#010x}, size {:#x})", index.name, index.timestamp, index.size_of_image);
        } else if clr.index_type == IndexType::Runtime {
            println!("  {role}: {} (runtime build-id {})", index.name, clr.runtime_build_id.to_hex());
        } else {
            println!("  {role}: {} (build-id {})", index.name, index.build_id.to_hex());
        }
    }
    Ok(())
}

fn parse_address(text: &str) -> Result<u64, String>
{
    let digits = text.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).map_err(|err| format!("{text:?} is not a hex address: {err}"))
}

#[cfg(target_os = "linux")]
fn probe(pid: ProcessId, base: Option<u64>) -> CliResult
{
    use clrshim_core::runtime::RuntimeIdentifier;
    use clrshim_core::target::ProcessTarget;
    use clrshim_core::types::guid::CLR_ID_ONECORE_CLR;
    use clrshim_core::Address;

    let base = match base {
        Some(base) => Address::new(base),
        None => {
            let runtimes = shim()?.enumerate_clrs(pid)?;
            let Some(runtime) = runtimes.first() else {
                return Err(format!("no runtime loaded in process {pid}").into());
            };
            runtime.module.base
        }
    };
    let target = ProcessTarget::open(pid)?;
    let identification = RuntimeIdentifier::new(CLR_ID_ONECORE_CLR).identify(&target, base)?;
    let clr = identification.info;
    println!("Runtime at {base} in process {pid}");
    println!("  Index type: {:?}", clr.index_type);
    if clr.index_type == IndexType::Runtime {
        println!("  Runtime build-id: {}", clr.runtime_build_id.to_hex());
    }
    for (role, index) in [("DBI", &clr.dbi), ("DAC", &clr.dac)] {
        println!("  {role}: {} (build-id {})", index.name, index.build_id.to_hex());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn probe(_pid: ProcessId, _base: Option<u64>) -> CliResult
{
    Err("probing live processes is only supported on Linux".into())
}

enum Outcome
{
    Started(ShimResult<CordbObject>),
    Interrupted,
}

/// Register for startup, run `armed`, then wait for the callback
fn wait_for_runtime(
    shim: &DbgShim,
    pid: ProcessId,
    group_id: Option<&str>,
    timeout: Option<Duration>,
    armed: impl FnOnce() -> CliResult,
) -> CliResult
{
    let (sender, receiver) = mpsc::channel();
    let interrupt = sender.clone();
    ctrlc::set_handler(move || {
        let _ = interrupt.send(Outcome::Interrupted);
    })?;

    let registration = shim.register_for_runtime_startup(pid, group_id, None, move |result| {
        let _ = sender.send(Outcome::Started(result));
    })?;
    info!(pid = pid.0, "waiting for runtime startup");
    armed()?;

    let outcome = match timeout {
        Some(timeout) => receiver.recv_timeout(timeout).ok(),
        None => receiver.recv().ok(),
    };
    registration.unregister();

    match outcome {
        Some(Outcome::Started(Ok(object))) => {
            println!("Runtime started in process {pid}; debugger object at {:p}", object.as_raw());
            Ok(())
        }
        Some(Outcome::Started(Err(e))) => Err(e.into()),
        Some(Outcome::Interrupted) => {
            warn!(pid = pid.0, "interrupted");
            Err("interrupted".into())
        }
        None => Err(format!("no runtime started in process {pid}").into()),
    }
}

fn launch(command: &[String], wait_runtime: bool, timeout: Option<Duration>) -> CliResult
{
    let command_line = command.iter().map(|arg| quote(arg)).collect::<Vec<_>>().join(" ");
    let options = if wait_runtime { LaunchOptions::suspended() } else { LaunchOptions::default() };
    let launched = create_process_for_launch(&command_line, &options)?;
    println!("Launched process {}", launched.pid);

    if !wait_runtime {
        close_resume_handle(launched.resume)?;
        return Ok(());
    }
    let shim = shim()?;
    let resume = launched.resume;
    let result = wait_for_runtime(&shim, launched.pid, None, timeout, || Ok(resume_process(&resume)?));
    close_resume_handle(resume)?;
    result
}

fn quote(arg: &str) -> String
{
    if !arg.is_empty() && !arg.contains(|c: char| c.is_whitespace() || c == '"') {
        return arg.to_string();
    }
    format!("\"{}\"", arg.replace('"', "\\\""))
}

fn print_info(config: &ShimConfig)
{
    println!("Host: {} ({})", std::env::consts::OS, std::env::consts::ARCH);
    match std::env::var_os("DOTNET_ROOT") {
        Some(root) => println!("DOTNET_ROOT: {}", PathBuf::from(root).display()),
        None => println!("DOTNET_ROOT: (not set)"),
    }
    println!("Module polls: {} every {:?}", config.poll_attempts, config.poll_interval);
    println!("Worker join timeout: {:?}", config.join_timeout);
    println!("Monitor interval: {:?}", config.monitor_interval);
}
