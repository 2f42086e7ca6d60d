//! # Runtime Identification
//!
//! Decides whether a module is a managed runtime and, if so, which DBI and
//! DAC builds belong to it.
//!
//! - [`RuntimeIdentifier`]: a module loaded in a target, read through a
//!   [`DataTarget`](crate::target::DataTarget)
//! - [`target_clr_metrics`]: a module file on disk, plus its engine metrics
//! - [`names`]: file names of the runtime and its companions

mod identify;
mod metrics;
pub mod names;

pub use identify::RuntimeIdentifier;
pub use metrics::{target_clr_metrics, TargetMetrics, METRICS_ORDINAL};

use crate::types::{ClrDebuggingVersion, ClrInfo};

/// Result of identifying a runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identification
{
    pub info: ClrInfo,
    /// Product version; zero for Unix runtimes, which carry none
    pub version: ClrDebuggingVersion,
}
