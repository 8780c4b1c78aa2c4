//! Liveness probing of pooled connections.
//!
//! Probes run through [`Connector::probe`] under a hard timeout. Timing out
//! drops the probe future, so a late answer never touches connection stats.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::time::Instant;

use super::connection::{Connector, PooledConnection};
use crate::config::PoolConfig;
use crate::errors::{classify, Result, RpcError};

/// Unresolved failures after which a connection is removed from the pool.
pub const MAX_ERROR_COUNT: u32 = 5;

/// Probe attempts within one health check.
const DEFAULT_PROBE_ATTEMPTS: u32 = 3;

/// Outcome of one health check.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HealthCheck {
    /// The probe answered within the attempt bound.
    pub passed: bool,
    /// The connection is still fit to stay in the pool.
    pub healthy: bool,
    pub latency: Option<Duration>,
}

pub struct HealthChecker<C: Connector> {
    connector: Arc<C>,
    probe_timeout: Duration,
    max_attempts: u32,
    retry_delay: Duration,
}

impl<C: Connector> HealthChecker<C> {
    pub fn new(connector: Arc<C>, config: &PoolConfig) -> Self {
        Self {
            connector,
            probe_timeout: config.probe_timeout,
            max_attempts: DEFAULT_PROBE_ATTEMPTS,
            retry_delay: config.retry_delay,
        }
    }

    /// Override the number of probe attempts per check.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Run one timed probe and return its latency.
    async fn probe_once(&self, conn: &PooledConnection<C::Handle>) -> Result<Duration> {
        let started = Instant::now();
        match tokio::time::timeout(self.probe_timeout, self.connector.probe(conn.handle())).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RpcError::Timeout {
                endpoint: conn.endpoint().to_string(),
                after: self.probe_timeout,
            }),
        }
    }

    /// Probe `conn` up to the attempt bound and fold the outcome into its stats.
    pub async fn check(&self, conn: &PooledConnection<C::Handle>) -> HealthCheck {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            match self.probe_once(conn).await {
                Ok(latency) => {
                    conn.record_success(latency);
                    return HealthCheck {
                        passed: true,
                        healthy: true,
                        latency: Some(latency),
                    };
                }
                Err(e) => {
                    debug!(
                        "Health check: probe {}/{} of connection {} to {} failed: {}",
                        attempt,
                        self.max_attempts,
                        conn.id(),
                        conn.endpoint(),
                        e
                    );
                    last_error = Some(e);
                }
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        let error_count = conn.record_failure();
        let healthy = error_count <= MAX_ERROR_COUNT;
        if let Some(e) = last_error {
            warn!(
                "Health check: connection {} to {} failed {} probes (error count {}): {}",
                conn.id(),
                conn.endpoint(),
                self.max_attempts,
                error_count,
                e
            );
        }
        HealthCheck {
            passed: false,
            healthy,
            latency: None,
        }
    }

    /// Returns false once the connection should be removed from the pool.
    pub async fn check_connection_health(&self, conn: &PooledConnection<C::Handle>) -> bool {
        self.check(conn).await.healthy
    }

    /// Fail-fast probe of a freshly created connection.
    ///
    /// Returns `Ok(true)` when the probe passed and `Ok(false)` when it failed
    /// with a tolerable error, which is logged and counted against the
    /// connection. A CRITICAL failure is returned as an error and the
    /// connection must be discarded.
    pub async fn validate_connection(&self, conn: &PooledConnection<C::Handle>) -> Result<bool> {
        match self.probe_once(conn).await {
            Ok(latency) => {
                conn.record_success(latency);
                Ok(true)
            }
            Err(e) => {
                let classified = classify(&e, conn.endpoint(), "validate_connection", None);
                classified.log(&e);
                if classified.is_critical() {
                    return Err(e);
                }
                conn.record_failure();
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::pool::connection::Endpoint;

    /// Fails the first `failures` probes with the given message, then succeeds.
    struct FlakyConnector {
        failures: AtomicU32,
        message: &'static str,
        hang: bool,
    }

    impl FlakyConnector {
        fn new(failures: u32, message: &'static str) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                message,
                hang: false,
            }
        }
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        type Handle = ();

        async fn connect(&self, _endpoint: &Endpoint) -> Result<()> {
            Ok(())
        }

        async fn probe(&self, _handle: &()) -> Result<()> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(RpcError::operation(self.message));
            }
            Ok(())
        }
    }

    fn checker(connector: FlakyConnector) -> HealthChecker<FlakyConnector> {
        let config = PoolConfig {
            probe_timeout: Duration::from_millis(100),
            retry_delay: Duration::from_millis(10),
            ..PoolConfig::default()
        };
        HealthChecker::new(Arc::new(connector), &config)
    }

    fn conn() -> PooledConnection<()> {
        PooledConnection::new(1, Arc::from("https://a"), ())
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_within_one_check() {
        let checker = checker(FlakyConnector::new(2, "connection reset"));
        let conn = conn();

        let result = checker.check(&conn).await;
        assert!(result.passed);
        assert_eq!(result.latency, Some(Duration::from_millis(20)));
        assert_eq!(conn.stats().success_count, 1);
        assert_eq!(conn.stats().error_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_after_threshold() {
        let checker = checker(FlakyConnector::new(u32::MAX, "connection refused"));
        let conn = conn();

        for _ in 0..MAX_ERROR_COUNT {
            assert!(checker.check_connection_health(&conn).await);
        }
        assert!(!checker.check_connection_health(&conn).await);
        assert_eq!(conn.stats().error_count, MAX_ERROR_COUNT + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_probe_times_out() {
        let mut connector = FlakyConnector::new(0, "");
        connector.hang = true;
        let checker = checker(connector).with_max_attempts(1);
        let conn = conn();

        let started = Instant::now();
        let result = checker.check(&conn).await;
        assert!(!result.passed);
        assert!(result.healthy);
        assert_eq!(started.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validate_tolerates_network_failures() {
        let checker = checker(FlakyConnector::new(1, "ECONNRESET"));
        let conn = conn();

        assert!(!checker.validate_connection(&conn).await.unwrap());
        assert_eq!(conn.stats().error_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validate_rejects_critical_failures() {
        let checker = checker(FlakyConnector::new(1, "out of memory"));
        let conn = conn();

        assert!(checker.validate_connection(&conn).await.is_err());
    }
}
