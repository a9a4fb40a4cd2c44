//! Dispatch configuration and `DISPATCH_*` environment overrides

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{DispatchError, Result};
use crate::logging::LoggingConfig;
use crate::retry::RetryConfig;

pub const DEFAULT_OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Upper bound for `cache_ttl`
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(365 * 24 * 3600);
/// Upper bound for the discovery scheduler tick
pub const MAX_DISCOVERY_INTERVAL: Duration = Duration::from_secs(30 * 24 * 3600);
/// Upper bound for the requeue delay unit
pub const MAX_RETRY_DELAY_UNIT: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// The façade only builds a discovery service when set
    #[serde(default)]
    pub enabled: bool,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Scheduler tick
    pub interval: Duration,
    /// Requeues allowed per task before it is dropped
    pub max_task_retries: u32,
    /// Requeue delay is `retry_count^2` of this unit
    pub retry_delay_unit: Duration,
    pub openrouter_base_url: String,
    pub request_timeout: Duration,
    /// Retry policy for listing calls
    pub retry: RetryConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            workers: 3,
            queue_capacity: 1000,
            interval: Duration::from_secs(3600),
            max_task_retries: 3,
            retry_delay_unit: Duration::from_secs(60),
            openrouter_base_url: DEFAULT_OPENROUTER_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::conservative(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub retry: RetryConfig,
    pub breaker: CircuitBreakerConfig,
    pub discovery: DiscoveryConfig,
    /// Freshness window for availability and performance entries
    pub cache_ttl: Duration,
    pub logging: LoggingConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            discovery: DiscoveryConfig::default(),
            cache_ttl: Duration::from_secs(3600),
            logging: LoggingConfig::default(),
        }
    }
}

impl DispatchConfig {
    /// Defaults overridden by `DISPATCH_*` variables, loading `.env` first if present
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env` with a custom variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var::<u32, _>(&lookup, "DISPATCH_MAX_RETRIES")? {
            config.retry.max_retries = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "DISPATCH_BASE_DELAY_MS")? {
            config.retry.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "DISPATCH_MAX_DELAY_MS")? {
            config.retry.max_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, "DISPATCH_BREAKER_MAX_FAILURES")? {
            config.breaker.max_failures = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "DISPATCH_BREAKER_RESET_SECS")? {
            config.breaker.reset_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<bool, _>(&lookup, "DISPATCH_DISCOVERY_ENABLED")? {
            config.discovery.enabled = v;
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "DISPATCH_DISCOVERY_WORKERS")? {
            config.discovery.workers = v;
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "DISPATCH_DISCOVERY_QUEUE_CAPACITY")? {
            config.discovery.queue_capacity = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "DISPATCH_DISCOVERY_INTERVAL_SECS")? {
            config.discovery.interval = Duration::from_secs(v);
        }
        if let Some(url) = lookup("DISPATCH_OPENROUTER_URL") {
            config.discovery.openrouter_base_url = url;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "DISPATCH_CACHE_TTL_SECS")? {
            config.cache_ttl = Duration::from_secs(v);
        }
        if let Some(level) = lookup("DISPATCH_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(v) = parse_var::<bool, _>(&lookup, "DISPATCH_LOG_JSON")? {
            config.logging.json_output = v;
        }

        config.validate()?;
        debug!("Dispatch configuration loaded: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.breaker.max_failures == 0 {
            return Err(DispatchError::Config(
                "breaker max_failures must be at least 1".to_string(),
            ));
        }
        if self.discovery.workers == 0 {
            return Err(DispatchError::Config(
                "discovery workers must be at least 1".to_string(),
            ));
        }
        if self.discovery.queue_capacity == 0 {
            return Err(DispatchError::Config(
                "discovery queue capacity must be at least 1".to_string(),
            ));
        }
        if self.discovery.interval.is_zero() {
            return Err(DispatchError::Config(
                "discovery interval must be non-zero".to_string(),
            ));
        }
        if self.discovery.interval > MAX_DISCOVERY_INTERVAL {
            return Err(DispatchError::Config(format!(
                "discovery interval {:?} exceeds {:?}",
                self.discovery.interval, MAX_DISCOVERY_INTERVAL
            )));
        }
        if self.discovery.retry_delay_unit > MAX_RETRY_DELAY_UNIT {
            return Err(DispatchError::Config(format!(
                "discovery retry delay unit {:?} exceeds {:?}",
                self.discovery.retry_delay_unit, MAX_RETRY_DELAY_UNIT
            )));
        }
        if self.cache_ttl > MAX_CACHE_TTL {
            return Err(DispatchError::Config(format!(
                "cache ttl {:?} exceeds {:?}",
                self.cache_ttl, MAX_CACHE_TTL
            )));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(DispatchError::Config(format!(
                "retry base delay {:?} exceeds max delay {:?}",
                self.retry.base_delay, self.retry.max_delay
            )));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| DispatchError::Config(format!("invalid {}='{}': {}", key, raw, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = DispatchConfig::default();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.breaker.max_failures, 5);
        assert_eq!(config.discovery.workers, 3);
        assert_eq!(config.discovery.queue_capacity, 1000);
        assert_eq!(config.discovery.interval, Duration::from_secs(3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = DispatchConfig::from_lookup(lookup_from(&[
            ("DISPATCH_MAX_RETRIES", "5"),
            ("DISPATCH_DISCOVERY_WORKERS", " 8 "),
            ("DISPATCH_LOG_LEVEL", "llm_dispatch=debug"),
            ("DISPATCH_LOG_JSON", "true"),
            ("DISPATCH_OPENROUTER_URL", "http://localhost:9999"),
        ]))
        .expect("valid overrides");

        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.discovery.workers, 8);
        assert_eq!(config.logging.level, "llm_dispatch=debug");
        assert!(config.logging.json_output);
        assert_eq!(config.discovery.openrouter_base_url, "http://localhost:9999");
    }

    #[test]
    fn test_malformed_value_is_config_error() {
        let err = DispatchConfig::from_lookup(lookup_from(&[("DISPATCH_MAX_RETRIES", "lots")]))
            .expect_err("not a number");
        assert!(matches!(err, DispatchError::Config(ref msg) if msg.contains("DISPATCH_MAX_RETRIES")));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = DispatchConfig::from_lookup(lookup_from(&[("DISPATCH_DISCOVERY_WORKERS", "0")]))
            .expect_err("zero workers");
        assert!(matches!(err, DispatchError::Config(_)));
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        for (key, value) in [
            ("DISPATCH_CACHE_TTL_SECS", u64::MAX.to_string()),
            ("DISPATCH_CACHE_TTL_SECS", (MAX_CACHE_TTL.as_secs() + 1).to_string()),
            ("DISPATCH_DISCOVERY_INTERVAL_SECS", u64::MAX.to_string()),
        ] {
            let err = DispatchConfig::from_lookup(lookup_from(&[(key, value.as_str())]))
                .expect_err("duration out of range");
            assert!(matches!(err, DispatchError::Config(ref msg) if msg.contains("exceeds")));
        }

        let max_ttl = MAX_CACHE_TTL.as_secs().to_string();
        let config =
            DispatchConfig::from_lookup(lookup_from(&[("DISPATCH_CACHE_TTL_SECS", max_ttl.as_str())]))
                .expect("bound itself is accepted");
        assert_eq!(config.cache_ttl, MAX_CACHE_TTL);

        let mut config = DispatchConfig::default();
        config.discovery.retry_delay_unit = Duration::from_secs(u64::MAX);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_discovery_is_opt_in() {
        assert!(!DispatchConfig::default().discovery.enabled);
        let config =
            DispatchConfig::from_lookup(lookup_from(&[("DISPATCH_DISCOVERY_ENABLED", "true")]))
                .expect("valid flag");
        assert!(config.discovery.enabled);
    }

    #[test]
    fn test_serde_roundtrip_keeps_discovery_settings() {
        let config = DispatchConfig::default();
        let json = serde_json::to_string(&config).expect("serialize");
        let back: DispatchConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, config);
    }
}
