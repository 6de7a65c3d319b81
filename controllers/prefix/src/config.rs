//! Controller configuration from environment variables.

use crate::error::ControllerError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Tunables of the prefix controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Namespace to watch and write in
    pub namespace: String,
    /// Time after which a bound, unresolved allocation counts as failed
    pub allocation_timeout: Duration,
    /// First retry wait
    pub backoff_base: Duration,
    /// Longest retry wait
    pub backoff_max: Duration,
    /// Requesters tracked by the backoff ledger
    pub ledger_capacity: usize,
    /// Quiet period before a burst of changes is reconciled
    pub debounce: Duration,
    /// Concurrent reconciliations per controller
    pub concurrency: u16,
    /// Requeue delay after a failed reconciliation
    pub error_requeue: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            allocation_timeout: Duration::from_secs(60),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
            ledger_capacity: 4096,
            debounce: Duration::from_secs(1),
            concurrency: 4,
            error_requeue: Duration::from_secs(30),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults for unset keys
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| -> Result<Duration, ControllerError> {
            Ok(parse_var::<u64>(&lookup, key)?.map_or(default, Duration::from_secs))
        };

        let config = Self {
            namespace: lookup("WATCH_NAMESPACE")
                .filter(|ns| !ns.trim().is_empty())
                .unwrap_or(defaults.namespace),
            allocation_timeout: secs("PREFIX_ALLOCATION_TIMEOUT_SECS", defaults.allocation_timeout)?,
            backoff_base: secs("PREFIX_BACKOFF_BASE_SECS", defaults.backoff_base)?,
            backoff_max: secs("PREFIX_BACKOFF_MAX_SECS", defaults.backoff_max)?,
            ledger_capacity: parse_var(&lookup, "PREFIX_BACKOFF_LEDGER_CAPACITY")?
                .unwrap_or(defaults.ledger_capacity),
            debounce: secs("PREFIX_DEBOUNCE_SECS", defaults.debounce)?,
            concurrency: parse_var(&lookup, "PREFIX_CONCURRENCY")?.unwrap_or(defaults.concurrency),
            error_requeue: secs("PREFIX_ERROR_REQUEUE_SECS", defaults.error_requeue)?,
        };

        if config.backoff_base > config.backoff_max {
            return Err(ControllerError::InvalidConfig(format!(
                "PREFIX_BACKOFF_BASE_SECS ({}) exceeds PREFIX_BACKOFF_MAX_SECS ({})",
                config.backoff_base.as_secs(),
                config.backoff_max.as_secs()
            )));
        }
        if config.ledger_capacity == 0 {
            return Err(ControllerError::InvalidConfig(
                "PREFIX_BACKOFF_LEDGER_CAPACITY must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ControllerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| {
                ControllerError::InvalidConfig(format!("{key}={raw:?} is not valid: {e}"))
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ControllerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ControllerConfig::default());
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = ControllerConfig::from_lookup(lookup(&[
            ("WATCH_NAMESPACE", "ipam"),
            ("PREFIX_ALLOCATION_TIMEOUT_SECS", "120"),
            ("PREFIX_BACKOFF_MAX_SECS", "600"),
            ("PREFIX_CONCURRENCY", "8"),
        ]))
        .unwrap();
        assert_eq!(config.namespace, "ipam");
        assert_eq!(config.allocation_timeout, Duration::from_secs(120));
        assert_eq!(config.backoff_max, Duration::from_secs(600));
        assert_eq!(config.concurrency, 8);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = ControllerConfig::from_lookup(lookup(&[("PREFIX_CONCURRENCY", "many")])).unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));

        let err = ControllerConfig::from_lookup(lookup(&[
            ("PREFIX_BACKOFF_BASE_SECS", "600"),
            ("PREFIX_BACKOFF_MAX_SECS", "60"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
    }
}
