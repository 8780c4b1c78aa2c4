//! Configuration for the connection pool and the connection manager.
//!
//! All durations are stored as [`Duration`] and (de)serialised as integer
//! milliseconds, so a JSON config reads `"connection_ttl_ms": 3600000`.
//! Every struct has a `Default` built from the named constants below; only the
//! endpoint list has no sensible default.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::{Result, RpcError};
use crate::resilience::{CircuitBreakerConfig, RateLimitConfig};

const DEFAULT_MIN_CONNECTIONS: usize = 2;
const DEFAULT_MAX_CONNECTIONS: usize = 10;
const DEFAULT_CONNECTION_TTL: Duration = Duration::from_millis(3_600_000);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(300_000);
const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(60_000);
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1_000);
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(30_000);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(5_000);
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(30_000);
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RATE_LIMIT_SWITCH_THRESHOLD: u32 = 3;
const DEFAULT_MAX_CONNECTION_SWITCHES: u32 = 3;

/// Serde helper for `Duration` fields expressed in milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Pool sizing, lifetimes and maintenance cadence. Immutable after construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Candidate endpoints, in order of preference.
    pub endpoints: Vec<String>,
    pub min_connections: usize,
    pub max_connections: usize,
    /// Connections older than this are replaced by maintenance.
    #[serde(with = "duration_ms", rename = "connection_ttl_ms")]
    pub connection_ttl: Duration,
    /// Idle connections above `min_connections` are dropped after this long.
    #[serde(with = "duration_ms", rename = "idle_timeout_ms")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_ms", rename = "health_check_interval_ms")]
    pub health_check_interval: Duration,
    /// Pause between probe attempts within one health check.
    #[serde(with = "duration_ms", rename = "retry_delay_ms")]
    pub retry_delay: Duration,
    /// Longest `acquire()` waits for a busy pool before failing.
    #[serde(with = "duration_ms", rename = "acquire_timeout_ms")]
    pub acquire_timeout: Duration,
    /// Hard timeout for a single liveness probe or connect.
    #[serde(with = "duration_ms", rename = "probe_timeout_ms")]
    pub probe_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_ttl: DEFAULT_CONNECTION_TTL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            retry_delay: DEFAULT_RETRY_DELAY,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl PoolConfig {
    /// Default configuration for the given endpoints.
    pub fn with_endpoints<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(RpcError::InvalidConfig(
                "at least one endpoint is required".to_string(),
            ));
        }
        for endpoint in &self.endpoints {
            Url::parse(endpoint).map_err(|e| {
                RpcError::InvalidConfig(format!("invalid endpoint '{}': {}", endpoint, e))
            })?;
        }
        if self.max_connections == 0 {
            return Err(RpcError::InvalidConfig(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(RpcError::InvalidConfig(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.health_check_interval.is_zero() {
            return Err(RpcError::InvalidConfig(
                "health_check_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Full configuration for a [`ConnectionManager`](crate::ConnectionManager).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub pool: PoolConfig,
    #[serde(flatten)]
    pub manager: ManagerConfig,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

/// Call-level settings for `with_connection`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Per-attempt timeout for caller operations.
    #[serde(with = "duration_ms", rename = "connection_timeout_ms")]
    pub connection_timeout: Duration,
    /// Default retry ceiling for `with_connection`.
    pub max_retries: u32,
    /// Consecutive rate-limit hits on one connection before switching.
    pub rate_limit_switch_threshold: u32,
    /// Connection switches allowed per call, on top of `max_retries`.
    pub max_connection_switches: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            rate_limit_switch_threshold: DEFAULT_RATE_LIMIT_SWITCH_THRESHOLD,
            max_connection_switches: DEFAULT_MAX_CONNECTION_SWITCHES,
        }
    }
}

impl RpcConfig {
    /// Default configuration for the given endpoints.
    pub fn with_endpoints<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pool: PoolConfig::with_endpoints(endpoints),
            ..Self::default()
        }
    }

    /// Parse a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| RpcError::InvalidConfig(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        if self.rate_limit.max_requests_per_second == 0 {
            return Err(RpcError::InvalidConfig(
                "rate_limit.max_requests_per_second must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.retry_delay_base > self.rate_limit.retry_delay_max {
            return Err(RpcError::InvalidConfig(
                "rate_limit.retry_delay_base exceeds retry_delay_max".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(RpcError::InvalidConfig(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.health_check_interval, Duration::from_secs(60));
        assert_eq!(config.connection_ttl, Duration::from_secs(3600));
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        assert!(RpcConfig::default().validate().is_err());

        let mut config = RpcConfig::with_endpoints(["https://a.example", "not a url"]);
        assert!(config.validate().is_err());

        config.pool.endpoints = vec!["https://a.example".to_string()];
        assert!(config.validate().is_ok());

        config.pool.min_connections = 5;
        config.pool.max_connections = 2;
        assert!(config.validate().is_err());

        config.pool.min_connections = 1;
        config.rate_limit.max_requests_per_second = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_uses_milliseconds() {
        let config = RpcConfig::from_json(
            r#"{
                "pool": {
                    "endpoints": ["https://a.example", "https://b.example"],
                    "min_connections": 1,
                    "max_connections": 4,
                    "idle_timeout_ms": 1500
                },
                "connection_timeout_ms": 2500,
                "max_retries": 5,
                "rate_limit": { "max_requests_per_second": 20 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.pool.endpoints.len(), 2);
        assert_eq!(config.pool.idle_timeout, Duration::from_millis(1500));
        assert_eq!(config.pool.connection_ttl, DEFAULT_CONNECTION_TTL);
        assert_eq!(config.manager.connection_timeout, Duration::from_millis(2500));
        assert_eq!(config.manager.max_retries, 5);
        assert_eq!(config.rate_limit.max_requests_per_second, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(matches!(
            RpcConfig::from_json("{ not json"),
            Err(RpcError::InvalidConfig(_))
        ));
    }
}
