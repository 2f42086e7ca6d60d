//! Linux process host over procfs.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::PathBuf;

use super::ProcessHost;
use crate::error::{ShimError, ShimResult};
use crate::target::{DataTarget, ProcessTarget};
use crate::types::{Address, LoadedModule, ProcessId};

/// Reads module lists from `/proc/<pid>/maps`
///
/// Linux has no named kernel events, so the startup rendezvous runs through
/// [`crate::startup::ProcMapsMonitor`] instead and the event methods keep
/// their `NotImplemented` defaults.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxHost;

impl LinuxHost
{
    pub fn new() -> Self
    {
        LinuxHost
    }
}

/// File-backed modules in a maps listing, each at its lowest mapping
pub fn parse_maps(text: &str) -> Vec<LoadedModule>
{
    let mut seen = HashSet::new();
    let mut modules = Vec::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let (Some(range), Some(_perms), Some(offset), Some(_dev), Some(_inode)) =
            (fields.next(), fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let path = fields.collect::<Vec<_>>().join(" ");
        let path = path.strip_suffix(" (deleted)").unwrap_or(&path);
        if !path.starts_with('/') || seen.contains(path) {
            continue;
        }
        let Some((start, _)) = range.split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(offset)) = (u64::from_str_radix(start, 16), u64::from_str_radix(offset, 16)) else {
            continue;
        };
        seen.insert(path.to_string());
        modules.push(LoadedModule::new(Address::new(start.saturating_sub(offset)), PathBuf::from(path)));
    }
    modules
}

impl ProcessHost for LinuxHost
{
    fn modules(&self, pid: ProcessId) -> ShimResult<Vec<LoadedModule>>
    {
        let text = std::fs::read_to_string(format!("/proc/{}/maps", pid.0)).map_err(|err| match err.kind() {
            ErrorKind::NotFound => ShimError::ProcessNotFound(pid.0),
            _ => ShimError::Io(err),
        })?;
        Ok(parse_maps(&text))
    }

    fn read_memory(&self, pid: ProcessId, address: Address, buffer: &mut [u8]) -> ShimResult<usize>
    {
        ProcessTarget::open(pid)?.read_virtual(address, buffer)
    }
}
