//! # Library Resolution
//!
//! Turns a runtime identity ([`ClrInfo`]) into the locations of the DBI and
//! DAC built with that runtime.
//!
//! The debugger supplies a provider at one of three capability levels:
//!
//! - [`LibraryProviderV3`]: separate Windows (timestamp+size) and Unix
//!   (build-id) lookups, returning paths
//! - [`LibraryProviderV2`]: timestamp+size lookup returning a path
//! - [`LibraryProviderV1`]: timestamp+size lookup returning a module the
//!   provider already loaded
//!
//! The highest level offered wins. Without any provider the DBI is taken from
//! the runtime's own directory, see [`fallback`].

pub mod fallback;

use std::path::{Path, PathBuf};

use crate::error::{ShimError, ShimResult};
use crate::loader::ModuleHandle;
use crate::types::{ClrInfo, IndexType};

/// Provider level 3
pub trait LibraryProviderV3: Send + Sync
{
    /// Locate a Windows DBI or DAC by timestamp and image size
    ///
    /// `Ok(None)` means the provider succeeded but produced no path.
    fn provide_windows_library(
        &self,
        name: &str,
        runtime_module_path: Option<&Path>,
        index_type: IndexType,
        timestamp: u32,
        size_of_image: u32,
    ) -> ShimResult<Option<PathBuf>>;

    /// Locate a Unix DBI or DAC by build-id
    fn provide_unix_library(
        &self,
        name: &str,
        runtime_module_path: Option<&Path>,
        index_type: IndexType,
        build_id: Option<&[u8]>,
    ) -> ShimResult<Option<PathBuf>>;
}

/// Provider level 2
pub trait LibraryProviderV2: Send + Sync
{
    fn provide_library2(&self, name: &str, timestamp: u32, size_of_image: u32) -> ShimResult<Option<PathBuf>>;
}

/// Provider level 1
pub trait LibraryProviderV1: Send + Sync
{
    fn provide_library(&self, name: &str, timestamp: u32, size_of_image: u32) -> ShimResult<Option<ModuleHandle>>;
}

/// A debugger's library provider, exposing the levels it supports
///
/// All levels default to absent; implement the accessors for the ones the
/// provider offers.
pub trait LibraryProvider: Send + Sync
{
    fn v3(&self) -> Option<&dyn LibraryProviderV3>
    {
        None
    }

    fn v2(&self) -> Option<&dyn LibraryProviderV2>
    {
        None
    }

    fn v1(&self) -> Option<&dyn LibraryProviderV1>
    {
        None
    }
}

/// What a provider handed back for the DBI and DAC
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvidedLibraries
{
    Paths
    {
        dbi: PathBuf, dac: PathBuf
    },
    /// Modules a level-1 provider already loaded
    Handles
    {
        dbi: ModuleHandle, dac: ModuleHandle
    },
}

/// `(timestamp, size)` of known-bad DAC builds and the timestamp of their fixed replacement
const DAC_RETARGETS: [((u32, u32), u32); 6] = [
    ((0x4d53_6868, 0x0017_b000), 0x4d71_a160),
    ((0x4d53_68f2, 0x0012_0000), 0x4d71_a14f),
    ((0x4ba2_1fa7, 0x0017_b000), 0x4d71_a13c),
    ((0x4ba1_da25, 0x0012_0000), 0x4d71_a128),
    ((0x4da4_28c7, 0x0017_b000), 0x4e4b_7bc2),
    ((0x4da3_fe52, 0x0012_0000), 0x4e4b_7bb1),
];

/// Swap the index of a known-bad DAC build for its fixed replacement
///
/// The image size never changes; only the timestamp is rewritten.
///
/// ```rust
/// use clrshim_core::provider::retarget_dac;
///
/// assert_eq!(retarget_dac(0x4d53_6868, 0x17_b000), (0x4d71_a160, 0x17_b000));
/// assert_eq!(retarget_dac(0x1234_5678, 0x17_b000), (0x1234_5678, 0x17_b000));
/// ```
#[must_use]
pub fn retarget_dac(timestamp: u32, size_of_image: u32) -> (u32, u32)
{
    DAC_RETARGETS
        .iter()
        .find(|(from, _)| *from == (timestamp, size_of_image))
        .map_or((timestamp, size_of_image), |(_, to)| {
            tracing::debug!(from = format_args!("{timestamp:08x}"), to = format_args!("{to:08x}"), "retargeting DAC");
            (*to, size_of_image)
        })
}

fn missing(what: &str) -> ShimError
{
    ShimError::LibraryProviderError(format!("provider returned no {what}"))
}

fn provider_failed(what: &str, err: &ShimError) -> ShimError
{
    tracing::debug!(%err, what, "library provider failed");
    ShimError::LibraryProviderError(format!("provider failed for {what}: {err}"))
}

fn require<T>(result: ShimResult<Option<T>>, what: &str) -> ShimResult<T>
{
    match result {
        Ok(Some(value)) => Ok(value),
        Ok(None) => Err(missing(what)),
        Err(err) => Err(provider_failed(what, &err)),
    }
}

fn provide_v3(info: &ClrInfo, provider: &dyn LibraryProviderV3) -> ShimResult<ProvidedLibraries>
{
    let runtime = info.runtime_module_path.as_deref();

    if info.target_is_windows {
        let dbi = provider.provide_windows_library(
            &info.dbi.name,
            runtime,
            info.index_type,
            info.dbi.timestamp,
            info.dbi.size_of_image,
        );
        let dbi = require(dbi, &info.dbi.name)?;
        let dac = provider.provide_windows_library(
            &info.dac.name,
            runtime,
            info.index_type,
            info.dac.timestamp,
            info.dac.size_of_image,
        );
        let dac = require(dac, &info.dac.name)?;
        return Ok(ProvidedLibraries::Paths { dbi, dac });
    }

    fn non_empty(bytes: &[u8]) -> Option<&[u8]> { (!bytes.is_empty()).then_some(bytes) }
    let (dbi_id, dac_id) = match info.index_type {
        IndexType::Identity => (non_empty(info.dbi.build_id.as_bytes()), non_empty(info.dac.build_id.as_bytes())),
        IndexType::Runtime => {
            let runtime_id = non_empty(info.runtime_build_id.as_bytes());
            (runtime_id, runtime_id)
        }
        IndexType::Unknown => {
            return Err(ShimError::LibraryProviderError("no index to resolve libraries with".into()));
        }
    };
    let dbi = require(provider.provide_unix_library(&info.dbi.name, runtime, info.index_type, dbi_id), &info.dbi.name)?;
    let dac = require(provider.provide_unix_library(&info.dac.name, runtime, info.index_type, dac_id), &info.dac.name)?;
    Ok(ProvidedLibraries::Paths { dbi, dac })
}

/// Ask `provider` for the DBI and DAC of the runtime described by `info`
///
/// ## Errors
///
/// - `IncompatibleProtocol` when `info` is not valid
/// - `LibraryProviderError` when the provider offers no known level, fails,
///   or returns an empty result for either library
pub fn provide_libraries(info: &ClrInfo, provider: &dyn LibraryProvider) -> ShimResult<ProvidedLibraries>
{
    if !info.is_valid() {
        return Err(ShimError::IncompatibleProtocol("runtime identity is incomplete".into()));
    }

    if let Some(v3) = provider.v3() {
        tracing::debug!(dbi = %info.dbi.name, dac = %info.dac.name, "resolving libraries through provider v3");
        return provide_v3(info, v3);
    }

    let (dac_timestamp, dac_size) = retarget_dac(info.dac.timestamp, info.dac.size_of_image);

    if let Some(v2) = provider.v2() {
        tracing::debug!(dbi = %info.dbi.name, dac = %info.dac.name, "resolving libraries through provider v2");
        let dbi = require(v2.provide_library2(&info.dbi.name, info.dbi.timestamp, info.dbi.size_of_image), &info.dbi.name)?;
        let dac = require(v2.provide_library2(&info.dac.name, dac_timestamp, dac_size), &info.dac.name)?;
        return Ok(ProvidedLibraries::Paths { dbi, dac });
    }

    if let Some(v1) = provider.v1() {
        tracing::debug!(dbi = %info.dbi.name, dac = %info.dac.name, "resolving libraries through provider v1");
        let dbi = require(v1.provide_library(&info.dbi.name, info.dbi.timestamp, info.dbi.size_of_image), &info.dbi.name)?;
        let dac = require(v1.provide_library(&info.dac.name, dac_timestamp, dac_size), &info.dac.name)?;
        return Ok(ProvidedLibraries::Handles { dbi, dac });
    }

    Err(ShimError::LibraryProviderError("provider implements no known interface".into()))
}

/// [`provide_libraries`] for callers that can only use paths
///
/// ## Errors
///
/// As [`provide_libraries`], plus `InvalidArgument` when the provider only
/// offers level 1 and returned module handles.
pub fn provide_library_paths(info: &ClrInfo, provider: &dyn LibraryProvider) -> ShimResult<(PathBuf, PathBuf)>
{
    match provide_libraries(info, provider)? {
        ProvidedLibraries::Paths { dbi, dac } => Ok((dbi, dac)),
        ProvidedLibraries::Handles { .. } => {
            Err(ShimError::InvalidArgument("provider returned module handles where paths are required".into()))
        }
    }
}
