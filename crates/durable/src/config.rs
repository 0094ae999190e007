//! Environment-driven configuration helpers
//!
//! Config structs read `STEPWISE_*` variables through a lookup function so
//! tests can supply variables without touching the process environment.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable present but unparsable
    #[error("invalid value for {name}: {value:?} ({reason})")]
    InvalidEnv {
        name: String,
        value: String,
        reason: String,
    },

    /// Values parse but do not make sense together
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Parse `name` if set, otherwise use `default`
pub fn var_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(name) {
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
            name: name.to_string(),
            value: value.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Parse a millisecond duration from `name` if set
pub(crate) fn millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let millis = var_or(lookup, name, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

/// Process environment lookup
pub(crate) fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_missing_var_uses_default() {
        let lookup = vars(&[]);
        assert_eq!(var_or(&lookup, "STEPWISE_POOL_SIZE", 8usize), Ok(8));
    }

    #[test]
    fn test_parses_and_trims() {
        let lookup = vars(&[("STEPWISE_LEASE_MS", " 1500 ")]);
        assert_eq!(
            millis_or(&lookup, "STEPWISE_LEASE_MS", Duration::from_secs(30)),
            Ok(Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_unparsable_value_names_variable() {
        let lookup = vars(&[("STEPWISE_POOL_SIZE", "lots")]);
        let err = var_or(&lookup, "STEPWISE_POOL_SIZE", 8usize).unwrap_err();
        assert!(err.to_string().contains("STEPWISE_POOL_SIZE"));
    }
}
