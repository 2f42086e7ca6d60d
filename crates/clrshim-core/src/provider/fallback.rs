//! Locating the DBI without a library provider.
//!
//! The DBI ships in the runtime's own directory. On Windows the copy found
//! there must carry the same product version as the runtime, since a
//! servicing update can replace one without the other.

use std::path::{Path, PathBuf};

use crate::error::{ShimError, ShimResult};
use crate::image::ModuleFile;
use crate::runtime::names;

/// DBI path next to `runtime_path`, after the host's version check
///
/// ## Errors
///
/// - `InvalidArgument` when `runtime_path` has no directory component
/// - `LibraryProviderError` when the version check fails
pub fn dbi_beside_runtime(runtime_path: &Path) -> ShimResult<PathBuf>
{
    let dbi = names::dbi_next_to_runtime(runtime_path)?;
    if !check_dbi_and_runtime_version(&dbi, runtime_path) {
        return Err(ShimError::LibraryProviderError(format!(
            "{} does not match the runtime version",
            dbi.display()
        )));
    }
    Ok(dbi)
}

/// Whether the DBI at `dbi` may drive the runtime at `runtime`
///
/// Only Windows builds compare versions; other hosts accept any pairing.
pub fn check_dbi_and_runtime_version(dbi: &Path, runtime: &Path) -> bool
{
    if cfg!(windows) {
        product_versions_match(dbi, runtime)
    } else {
        true
    }
}

/// Compare the `VS_FIXEDFILEINFO` product versions of two PE files
///
/// A file that can't be read or has no version resource counts as a mismatch.
pub fn product_versions_match(first: &Path, second: &Path) -> bool
{
    match (product_version(first), product_version(second)) {
        (Ok(a), Ok(b)) => {
            tracing::debug!(first = %first.display(), ?a, ?b, "comparing product versions");
            a == b
        }
        (Err(err), _) | (_, Err(err)) => {
            tracing::debug!(%err, "product version unavailable");
            false
        }
    }
}

fn product_version(path: &Path) -> ShimResult<(u32, u32)>
{
    let file = ModuleFile::open(path)?;
    let info = file.pe()?.fixed_file_info()?;
    Ok((info.product_version_ms, info.product_version_ls))
}
