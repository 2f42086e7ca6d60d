//! File names of the runtime and its companion libraries.

use std::path::{Path, PathBuf};

use crate::error::{hresult, ShimError, ShimResult};
use crate::types::guid::{CLR_ID_CORECLR, CLR_ID_ONECORE_CLR, CLR_ID_PHONE_CLR, CLR_ID_V4_DESKTOP};
use crate::types::{file_name_of, ClrDebuggingVersion, Guid, Machine};

/// Base name of the DBI on Windows
pub const DBI_BASE: &str = "mscordbi";
/// Base name of the DAC shipped with CoreCLR and its relatives
pub const CORECLR_DAC_BASE: &str = "mscordaccore";
/// Base name of the DAC shipped with the desktop runtime
pub const DESKTOP_DAC_BASE: &str = "mscordacwks";
/// Name of the `RC_DATA` resource holding the DBI/DAC identity
pub const DEBUG_RESOURCE_NAME: &str = "CLRDEBUGINFO";

/// Windows DBI used when the DAC is named for a cross-architecture host
pub const CROSS_DBI_NAME: &str = "mscordbi_x86.dll";

const RUNTIME_FILE_NAMES: [&str; 3] = ["coreclr.dll", "libcoreclr.so", "libcoreclr.dylib"];

/// `CLRDEBUGINFO` suffixed with the host OS and architecture
///
/// Runtimes built for cross-architecture debugging carry one resource per
/// host they can be debugged from. The shim itself may run anywhere, but
/// the resource names only ever use the Windows host tag.
///
/// ```rust
/// use clrshim_core::runtime::names::debug_resource_name;
/// use clrshim_core::types::Machine;
///
/// assert_eq!(debug_resource_name(Machine::Amd64), "CLRDEBUGINFOWINDOWSAMD64");
/// ```
#[must_use]
pub fn debug_resource_name(host: Machine) -> String
{
    format!("{DEBUG_RESOURCE_NAME}WINDOWS{}", host.tag().to_ascii_uppercase())
}

/// DAC base name for a runtime SKU
///
/// ## Errors
///
/// `Hresult(E_UNEXPECTED)` for an unknown SKU.
pub fn dac_base_name(sku: &Guid) -> ShimResult<&'static str>
{
    if *sku == CLR_ID_V4_DESKTOP {
        Ok(DESKTOP_DAC_BASE)
    } else if *sku == CLR_ID_CORECLR || *sku == CLR_ID_PHONE_CLR || *sku == CLR_ID_ONECORE_CLR {
        Ok(CORECLR_DAC_BASE)
    } else {
        Err(ShimError::Hresult(hresult::E_UNEXPECTED))
    }
}

/// Long DAC file name used for cross-architecture debugging
///
/// `{dac}_{host}_{target}_{major}.{minor}.{build}.{revision:02}{flavor}.dll`
///
/// ## Errors
///
/// `InvalidArgument` when the target machine has no long-name form,
/// `Hresult(E_UNEXPECTED)` for an unknown SKU.
pub fn long_dac_name(
    sku: &Guid,
    host: Machine,
    target: Machine,
    version: ClrDebuggingVersion,
    flavor: &str,
) -> ShimResult<String>
{
    if !matches!(target, Machine::X86 | Machine::Amd64 | Machine::Arm | Machine::Arm64) {
        return Err(ShimError::InvalidArgument(format!("no long DAC name for {target}")));
    }
    let base = dac_base_name(sku)?;
    Ok(format!(
        "{base}_{host}_{target}_{}.{}.{}.{:02}{flavor}.dll",
        version.major, version.minor, version.build, version.revision
    ))
}

/// Short Windows `(dbi, dac)` names for a SKU
///
/// ## Errors
///
/// `Hresult(E_UNEXPECTED)` for an unknown SKU.
pub fn windows_library_names(sku: &Guid) -> ShimResult<(String, String)>
{
    Ok((format!("{DBI_BASE}.dll"), format!("{}.dll", dac_base_name(sku)?)))
}

/// Unix `(dbi, dac)` names; `.dylib` for Mach-O runtimes
pub fn unix_library_names(mach_o: bool) -> (String, String)
{
    let extension = if mach_o { "dylib" } else { "so" };
    (format!("libmscordbi.{extension}"), format!("libmscordaccore.{extension}"))
}

/// DBI file name for the host this crate runs on
pub const fn host_dbi_file_name() -> &'static str
{
    if cfg!(windows) {
        "mscordbi.dll"
    } else if cfg!(target_os = "macos") {
        "libmscordbi.dylib"
    } else {
        "libmscordbi.so"
    }
}

/// Path of the host DBI in the directory holding `runtime_path`
///
/// ## Errors
///
/// `InvalidArgument` when the path has no parent directory.
pub fn dbi_next_to_runtime(runtime_path: &Path) -> ShimResult<PathBuf>
{
    let text = runtime_path.to_string_lossy();
    // Runtime paths come from the target and may use either separator.
    let Some(split) = text.rfind(['/', '\\']) else {
        return Err(ShimError::InvalidArgument(format!("no directory in {}", runtime_path.display())));
    };
    Ok(PathBuf::from(format!("{}{}", &text[..=split], host_dbi_file_name())))
}

/// Whether the file name of `path` is one of the runtime module names
///
/// The comparison ignores ASCII case and accepts either path separator.
#[must_use]
pub fn is_core_clr(path: &Path) -> bool
{
    file_name_of(path).is_some_and(|name| RUNTIME_FILE_NAMES.iter().any(|runtime| runtime.eq_ignore_ascii_case(name)))
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_long_dac_name_format()
    {
        let version = ClrDebuggingVersion::new(4, 0, 30319, 1);
        let name = long_dac_name(&CLR_ID_CORECLR, Machine::X86, Machine::Arm, version, "").unwrap();
        assert_eq!(name, "mscordaccore_x86_arm_4.0.30319.01.dll");

        let name = long_dac_name(&CLR_ID_V4_DESKTOP, Machine::Amd64, Machine::Amd64, version, ".chk").unwrap();
        assert_eq!(name, "mscordacwks_amd64_amd64_4.0.30319.01.chk.dll");
    }

    #[test]
    fn test_long_dac_name_rejects_unknown_inputs()
    {
        let version = ClrDebuggingVersion::new(1, 0, 0, 0);
        assert!(matches!(
            long_dac_name(&CLR_ID_CORECLR, Machine::Amd64, Machine::RiscV64, version, ""),
            Err(ShimError::InvalidArgument(_))
        ));
        let err = long_dac_name(&Guid::default(), Machine::Amd64, Machine::Amd64, version, "").unwrap_err();
        assert_eq!(err.hresult(), hresult::E_UNEXPECTED);
    }

    #[test]
    fn test_short_names()
    {
        assert_eq!(
            windows_library_names(&CLR_ID_V4_DESKTOP).unwrap(),
            ("mscordbi.dll".to_string(), "mscordacwks.dll".to_string())
        );
        assert_eq!(windows_library_names(&CLR_ID_ONECORE_CLR).unwrap().1, "mscordaccore.dll");
        assert_eq!(unix_library_names(true).0, "libmscordbi.dylib");
        assert_eq!(unix_library_names(false).1, "libmscordaccore.so");
    }

    #[test]
    fn test_is_core_clr()
    {
        assert!(is_core_clr(Path::new("/opt/rt/libcoreclr.so")));
        assert!(is_core_clr(Path::new(r"C:\rt\CoreCLR.dll")));
        assert!(is_core_clr(Path::new("libcoreclr.dylib")));
        assert!(!is_core_clr(Path::new("/opt/app/myapp")));
        assert!(!is_core_clr(Path::new("/opt/rt/libcoreclr.so.bak")));
    }

    #[test]
    fn test_dbi_next_to_runtime()
    {
        let path = dbi_next_to_runtime(Path::new("/opt/rt/libcoreclr.so")).unwrap();
        assert_eq!(path, PathBuf::from(format!("/opt/rt/{}", host_dbi_file_name())));
        let path = dbi_next_to_runtime(Path::new(r"C:\rt\coreclr.dll")).unwrap();
        assert_eq!(path, PathBuf::from(format!(r"C:\rt\{}", host_dbi_file_name())));
        assert!(dbi_next_to_runtime(Path::new("coreclr.dll")).is_err());
    }
}
