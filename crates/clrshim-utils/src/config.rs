//! Shim timings from the environment.
//!
//! | Variable | Field |
//! |----------|-------|
//! | `CLRSHIM_POLL_ATTEMPTS` | [`ShimConfig::poll_attempts`] |
//! | `CLRSHIM_POLL_INTERVAL_MS` | [`ShimConfig::poll_interval`] |
//! | `CLRSHIM_JOIN_TIMEOUT_MS` | [`ShimConfig::join_timeout`] |
//!
//! Unset or empty variables keep the core's defaults.

use std::env;
use std::time::Duration;

use clrshim_core::ShimConfig;

pub const POLL_ATTEMPTS_VAR: &str = "CLRSHIM_POLL_ATTEMPTS";
pub const POLL_INTERVAL_VAR: &str = "CLRSHIM_POLL_INTERVAL_MS";
pub const JOIN_TIMEOUT_VAR: &str = "CLRSHIM_JOIN_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError
{
    #[error("{variable}={value:?} is not a non-negative integer")]
    InvalidNumber
    {
        variable: &'static str, value: String
    },
}

fn number(lookup: &impl Fn(&str) -> Option<String>, variable: &'static str) -> Result<Option<u64>, ConfigError>
{
    let Some(value) = lookup(variable).filter(|v| !v.trim().is_empty()) else {
        return Ok(None);
    };
    value.trim().parse().map(Some).map_err(|_| ConfigError::InvalidNumber { variable, value })
}

/// Build a [`ShimConfig`] through `lookup`, which maps a variable name to its value
///
/// ## Errors
///
/// `InvalidNumber` for a set variable that isn't a number.
pub fn shim_config_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<ShimConfig, ConfigError>
{
    let mut config = ShimConfig::default();
    if let Some(attempts) = number(&lookup, POLL_ATTEMPTS_VAR)? {
        config = config.with_poll_attempts(u32::try_from(attempts).unwrap_or(u32::MAX));
    }
    if let Some(millis) = number(&lookup, POLL_INTERVAL_VAR)? {
        config = config.with_poll_interval(Duration::from_millis(millis));
    }
    if let Some(millis) = number(&lookup, JOIN_TIMEOUT_VAR)? {
        config = config.with_join_timeout(Duration::from_millis(millis));
    }
    tracing::debug!(?config, "shim configuration");
    Ok(config)
}

/// [`shim_config_from_lookup`] over the process environment
///
/// ## Errors
///
/// `InvalidNumber` for a set variable that isn't a number.
pub fn shim_config_from_env() -> Result<ShimConfig, ConfigError>
{
    shim_config_from_lookup(|name| env::var(name).ok())
}
