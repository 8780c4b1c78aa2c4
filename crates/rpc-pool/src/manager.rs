//! Connection manager: the single entry point consumers call.
//!
//! The manager composes the pool with per-endpoint rate limiting, circuit
//! breaking and a [`RetryExecutor`] whose policy, predicate and `on_retry`
//! hook drive the attempt loop:
//! - Every attempt waits for the endpoint's rate window first
//! - Retryable failures back off exponentially on the same connection
//! - Repeated rate limiting moves the call to a different connection
//! - The connection is released exactly once, on every path

use std::future::Future;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::time::Instant;

use crate::config::{ManagerConfig, RpcConfig};
use crate::errors::{classify, ErrorCategory, Result, RpcError};
use crate::pool::{ConnectionPool, ConnectionRef, Connector, Endpoint, Lease, PoolStats};
use crate::resilience::{
    CircuitBreaker, CircuitMetrics, RateLimiter, RetryEvent, RetryExecutor, RetryPolicy,
    RetryStats,
};

/// Operation name used when classifying failures inside `with_connection`.
const OPERATION: &str = "with_connection";

/// Public façade over the pool and the failure policies.
///
/// Construct once at startup and share through `Arc`.
pub struct ConnectionManager<C: Connector> {
    pool: Arc<ConnectionPool<C>>,
    rate_limiter: RateLimiter,
    circuit_breaker: CircuitBreaker,
    retry: RetryExecutor,
    config: ManagerConfig,
}

impl<C: Connector> ConnectionManager<C> {
    /// Build a manager from a validated configuration.
    ///
    /// No connections are opened until [`start`](Self::start) or the first call.
    pub fn new(config: RpcConfig, connector: C) -> Result<Self> {
        config.validate()?;
        let RpcConfig {
            pool,
            manager,
            rate_limit,
            circuit_breaker,
        } = config;

        let backoff = RetryPolicy::exponential(
            manager.max_retries.saturating_add(1),
            rate_limit.retry_delay_base,
            rate_limit.retry_delay_max,
        );

        Ok(Self {
            pool: Arc::new(ConnectionPool::new(pool, connector)?),
            rate_limiter: RateLimiter::new(rate_limit.max_requests_per_second),
            circuit_breaker: CircuitBreaker::with_config(circuit_breaker),
            retry: RetryExecutor::new(backoff),
            config: manager,
        })
    }

    /// Open the initial connections and start background maintenance.
    pub async fn start(&self) -> Result<()> {
        self.pool.initialize().await?;
        self.pool.start_maintenance();
        Ok(())
    }

    /// Replace the classification-based retry decision inside `with_connection`.
    pub fn should_retry(mut self, f: impl Fn(&RpcError) -> bool + Send + Sync + 'static) -> Self {
        self.retry = self.retry.should_retry(f);
        self
    }

    /// Observe every backoff inside `with_connection` before it sleeps.
    pub fn on_retry(mut self, f: impl Fn(&RetryEvent<'_>) + Send + Sync + 'static) -> Self {
        self.retry = self.retry.on_retry(f);
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<C>> {
        &self.pool
    }

    /// Breaker registry shared by endpoints and named external dependencies.
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    pub async fn acquire(&self) -> Result<Lease<C::Handle>> {
        self.pool.acquire().await
    }

    pub fn release(&self, lease: Lease<C::Handle>) {
        self.pool.release(lease);
    }

    /// Run `op` on a pooled connection with the configured retry ceiling.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # async fn example() -> chainbot_rpc_pool::Result<()> {
    /// use chainbot_rpc_pool::{ConnectionManager, HttpConnector, RpcConfig};
    ///
    /// let config = RpcConfig::with_endpoints(["https://rpc-a.example", "https://rpc-b.example"]);
    /// let manager = ConnectionManager::new(config, HttpConnector::default())?;
    /// manager.start().await?;
    ///
    /// let slot = manager
    ///     .with_connection(|conn| async move {
    ///         conn.handle.call("getSlot", serde_json::json!([])).await
    ///     })
    ///     .await?;
    /// println!("slot: {}", slot);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_connection<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut(ConnectionRef<C::Handle>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.with_connection_retries(self.config.max_retries, op)
            .await
    }

    /// Run `op` on a pooled connection, retrying at most `max_retries` times.
    ///
    /// Rate-limit hits and the connection switches they trigger do not count
    /// as retries while `max_connection_switches` has room; after that a
    /// rate limit is retried like any other retryable failure. An open
    /// endpoint circuit also switches connection from the same budget.
    pub async fn with_connection_retries<T, F, Fut>(
        &self,
        max_retries: u32,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(ConnectionRef<C::Handle>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut stats = RetryStats::default();
        let mut retries = 0;
        let mut switches = 0;
        let mut avoid: Option<Endpoint> = None;

        'acquire: loop {
            let lease = self.pool.acquire_avoiding(avoid.as_deref()).await?;
            let endpoint = lease.endpoint().clone();
            let mut rate_limit_hits = 0;

            loop {
                if !self.circuit_breaker.is_allowed(&endpoint) {
                    if switches < self.config.max_connection_switches {
                        switches += 1;
                        debug!(
                            "Connection manager: circuit open for {}, switching connection ({}/{})",
                            endpoint, switches, self.config.max_connection_switches
                        );
                        avoid = Some(endpoint);
                        continue 'acquire;
                    }
                    return Err(RpcError::CircuitOpen {
                        domain: endpoint.to_string(),
                    });
                }

                self.rate_limiter.acquire(&endpoint).await;
                stats.attempts += 1;

                let attempt_started = Instant::now();
                let outcome =
                    tokio::time::timeout(self.config.connection_timeout, op(lease.connection()))
                        .await
                        .unwrap_or_else(|_| {
                            Err(RpcError::Timeout {
                                endpoint: endpoint.to_string(),
                                after: self.config.connection_timeout,
                            })
                        });

                let error = match outcome {
                    Ok(value) => {
                        lease.record_success(attempt_started.elapsed());
                        self.circuit_breaker.record_success(&endpoint);
                        self.pool.record_endpoint_success(&endpoint);
                        return Ok(value);
                    }
                    Err(e) => e,
                };

                // A breaker inside `op` refused the call; nothing reached the endpoint
                if error.is_circuit_open() {
                    return Err(error);
                }

                stats.record_error(&error);
                let classified = classify(&error, &endpoint, OPERATION, None);
                classified.log(&error);

                if !self.retry.allows_retry(&error, &classified) {
                    self.circuit_breaker.record_success(&endpoint);
                    stats.finish(started, Some(&error));
                    return Err(RpcError::NonRetryable {
                        classified,
                        error: Box::new(error),
                    });
                }

                lease.record_failure();
                self.circuit_breaker.record_failure(&endpoint);
                self.pool.record_endpoint_failure(&endpoint);

                // Throttling is paid for with connection switches while any are left
                if classified.category == ErrorCategory::RateLimit
                    && switches < self.config.max_connection_switches
                {
                    rate_limit_hits += 1;
                    if rate_limit_hits >= self.config.rate_limit_switch_threshold {
                        switches += 1;
                        info!(
                            "Connection manager: {} rate limited {} times, switching ({}/{})",
                            endpoint,
                            rate_limit_hits,
                            switches,
                            self.config.max_connection_switches
                        );
                        avoid = Some(endpoint);
                        continue 'acquire;
                    }

                    let delay = self.retry.policy().delay_for(rate_limit_hits);
                    self.retry.notify_retry(&RetryEvent {
                        attempt: stats.attempts,
                        delay,
                        error: &error,
                        classified: &classified,
                    });
                    debug!(
                        "Connection manager: {} rate limited ({}/{}), backing off {:?}",
                        endpoint, rate_limit_hits, self.config.rate_limit_switch_threshold, delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                rate_limit_hits = 0;

                if retries >= max_retries {
                    stats.finish(started, Some(&error));
                    warn!(
                        "Connection manager: giving up after {} attempts in {}ms: {}",
                        stats.attempts, stats.total_time_ms, error
                    );
                    return Err(RpcError::RetryExhausted {
                        stats: Box::new(stats),
                        last: Box::new(error),
                    });
                }

                retries += 1;
                let delay = self.retry.policy().delay_for(retries);
                self.retry.notify_retry(&RetryEvent {
                    attempt: stats.attempts,
                    delay,
                    error: &error,
                    classified: &classified,
                });
                debug!(
                    "Connection manager: retry {}/{} on {} in {:?}",
                    retries, max_retries, endpoint, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Run `op` through the breaker for `domain` before touching the pool.
    ///
    /// While the circuit is open the call fails with [`RpcError::CircuitOpen`]
    /// without acquiring a connection.
    pub async fn with_guarded_connection<T, F, Fut>(&self, domain: &str, op: F) -> Result<T>
    where
        F: FnMut(ConnectionRef<C::Handle>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.circuit_breaker
            .call(domain, || self.with_connection(op))
            .await
    }

    pub fn get_pool_stats(&self) -> PoolStats {
        self.pool.get_pool_stats()
    }

    /// Endpoints the pool considers unhealthy plus endpoints whose circuit is open.
    pub fn get_unhealthy_endpoints(&self) -> Vec<String> {
        let mut unhealthy = self.pool.get_unhealthy_endpoints();
        for domain in self.circuit_breaker.open_domains() {
            let is_endpoint = self.pool.config().endpoints.contains(&domain);
            if is_endpoint && !unhealthy.contains(&domain) {
                unhealthy.push(domain);
            }
        }
        unhealthy
    }

    pub fn circuit_metrics(&self) -> Vec<CircuitMetrics> {
        self.circuit_breaker.metrics()
    }

    /// Stop background maintenance and refuse further acquires.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}
