//! Bounded pool of connections spread across interchangeable endpoints.
//!
//! `acquire()` works through these steps until one yields a connection:
//!
//! 1. Best-scoring idle connection below the health cutoff
//! 2. A new connection, if the pool has room, to the least-used endpoint
//! 3. Any idle connection
//! 4. Replace the worst busy connection with a fresh one to another endpoint
//! 5. Wait for a release, up to `acquire_timeout`

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::connection::{ConnectionSnapshot, Connector, Endpoint, Lease, PooledConnection};
use super::endpoints::{EndpointBook, EndpointStats};
use super::health::{HealthChecker, MAX_ERROR_COUNT};
use crate::config::PoolConfig;
use crate::errors::{classify, Result, RpcError};

/// Connections at or above this error count are skipped by the first selection pass.
const HEALTH_CUTOFF: u32 = 3;

/// Score penalty per unresolved error.
const ERROR_PENALTY: f64 = 10_000.0;

/// Score bonus per successful call.
const SUCCESS_BONUS: f64 = 100.0;

struct PoolState<H> {
    connections: Vec<Arc<PooledConnection<H>>>,
    /// Slots reserved by connections still being created.
    pending: usize,
    book: EndpointBook,
}

impl<H> PoolState<H> {
    fn represented(&self) -> HashSet<&str> {
        self.connections
            .iter()
            .map(|c| c.endpoint().as_ref())
            .collect()
    }

    fn size(&self) -> usize {
        self.connections.len() + self.pending
    }
}

/// A slot reserved for a connection being created.
///
/// Dropping it unfinished gives the slot back, so a cancelled acquire cannot
/// shrink the pool's capacity.
struct Reservation<'a, C: Connector> {
    pool: &'a ConnectionPool<C>,
    active: bool,
}

impl<'a, C: Connector> Reservation<'a, C> {
    /// Release the slot and return the locked state for adding the result.
    fn complete(mut self) -> MutexGuard<'a, PoolState<C::Handle>> {
        self.active = false;
        let mut state = self.pool.lock_state();
        state.pending -= 1;
        state
    }
}

impl<C: Connector> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if self.active {
            self.pool.lock_state().pending -= 1;
            self.pool.notify.notify_one();
        }
    }
}

/// Why maintenance removed a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Eviction {
    Expired,
    Idle,
    Failing,
}

/// What one maintenance cycle did.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MaintenanceReport {
    pub evicted: usize,
    pub created: usize,
    pub probed: usize,
    pub failed_probes: usize,
}

/// Pool-wide counts plus per-connection and per-endpoint detail.
#[derive(Clone, Debug, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub pending: usize,
    pub connections: Vec<ConnectionSnapshot>,
    pub endpoints: Vec<EndpointStats>,
}

/// Owns every live connection and decides which one a caller gets.
///
/// Construct once and share through `Arc`.
pub struct ConnectionPool<C: Connector> {
    config: PoolConfig,
    connector: Arc<C>,
    health: HealthChecker<C>,
    state: Mutex<PoolState<C::Handle>>,
    notify: Arc<Notify>,
    next_id: AtomicU64,
    closed: AtomicBool,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(config: PoolConfig, connector: C) -> Result<Self> {
        config.validate()?;
        let connector = Arc::new(connector);
        let health = HealthChecker::new(connector.clone(), &config);
        let book = EndpointBook::new(&config.endpoints, config.health_check_interval);

        Ok(Self {
            config,
            connector,
            health,
            state: Mutex::new(PoolState {
                connections: Vec::new(),
                pending: 0,
                book,
            }),
            notify: Arc::new(Notify::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            maintenance: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState<C::Handle>> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Connection pool: state mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn lease(&self, conn: Arc<PooledConnection<C::Handle>>) -> Lease<C::Handle> {
        conn.touch();
        Lease::new(conn, self.notify.clone())
    }

    /// Create `min_connections` connections, spread over the endpoints in order.
    ///
    /// Fails with [`RpcError::NoHealthyEndpoints`] when not a single endpoint
    /// could be connected and validated.
    pub async fn initialize(&self) -> Result<()> {
        let target = self.config.min_connections;
        let mut created = 0;

        while created < target {
            if self.add_connection(&[], false).await.is_none() {
                break;
            }
            created += 1;
        }

        let total = self.lock_state().connections.len();
        if target > 0 && total == 0 {
            let err = RpcError::NoHealthyEndpoints {
                message: format!("none of {} endpoints validated", self.config.endpoints.len()),
            };
            error!("Connection pool: {}", err);
            return Err(err);
        }

        info!(
            "Connection pool: initialized {} of {} connections across {} endpoints",
            total,
            target,
            self.config.endpoints.len()
        );
        Ok(())
    }

    /// Reserve a slot and create a connection to the best candidate endpoint.
    ///
    /// The new connection joins the pool idle, or already claimed when
    /// `claimed` is set. Returns `None` if there was no room or every
    /// candidate failed.
    async fn add_connection(
        &self,
        avoid: &[&str],
        claimed: bool,
    ) -> Option<Arc<PooledConnection<C::Handle>>> {
        let (reservation, candidates) = {
            let mut state = self.lock_state();
            if state.size() >= self.config.max_connections {
                return None;
            }
            let candidates = state
                .book
                .candidates(&state.represented(), avoid, Instant::now());
            if candidates.is_empty() {
                return None;
            }
            state.pending += 1;
            (
                Reservation {
                    pool: self,
                    active: true,
                },
                candidates,
            )
        };

        let conn = self.create_from(candidates).await;
        let mut state = reservation.complete();
        if let Some(conn) = &conn {
            if claimed {
                conn.try_claim();
            }
            state.connections.push(conn.clone());
            debug!(
                "Connection pool: {} connections after adding {}",
                state.connections.len(),
                conn.endpoint()
            );
        }
        drop(state);
        if !claimed || conn.is_none() {
            self.notify.notify_one();
        }
        conn
    }

    /// Try each candidate in turn until a connection validates.
    async fn create_from(
        &self,
        candidates: Vec<Endpoint>,
    ) -> Option<Arc<PooledConnection<C::Handle>>> {
        for endpoint in candidates {
            if let Ok(conn) = self.create_connection(endpoint).await {
                return Some(Arc::new(conn));
            }
        }
        None
    }

    /// Connect to `endpoint` and run the fail-fast validation probe.
    async fn create_connection(&self, endpoint: Endpoint) -> Result<PooledConnection<C::Handle>> {
        self.lock_state()
            .book
            .record_attempt(&endpoint, Instant::now());

        let connect = self.connector.connect(&endpoint);
        let handle = match tokio::time::timeout(self.config.probe_timeout, connect).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(self.creation_failed(&endpoint, e)),
            Err(_) => {
                let e = RpcError::Timeout {
                    endpoint: endpoint.to_string(),
                    after: self.config.probe_timeout,
                };
                return Err(self.creation_failed(&endpoint, e));
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = PooledConnection::new(id, endpoint.clone(), handle);
        match self.health.validate_connection(&conn).await {
            Ok(true) => self.lock_state().book.record_success(&endpoint),
            Ok(false) => self.lock_state().book.record_failure(&endpoint),
            Err(e) => {
                warn!(
                    "Connection pool: quarantining {} for {:?} after critical validation failure",
                    endpoint, self.config.health_check_interval
                );
                self.lock_state().book.quarantine(&endpoint, Instant::now());
                return Err(e);
            }
        }

        debug!("Connection pool: created connection {} to {}", id, endpoint);
        Ok(conn)
    }

    fn creation_failed(&self, endpoint: &Endpoint, e: RpcError) -> RpcError {
        classify(&e, endpoint, "create_connection", None).log(&e);
        self.lock_state().book.record_failure(endpoint);
        e
    }

    /// Acquire exclusive use of a connection.
    pub async fn acquire(&self) -> Result<Lease<C::Handle>> {
        self.acquire_avoiding(None).await
    }

    /// Acquire a connection, preferring endpoints other than `avoid`.
    pub async fn acquire_avoiding(&self, avoid: Option<&str>) -> Result<Lease<C::Handle>> {
        let deadline = Instant::now() + self.config.acquire_timeout;

        loop {
            // Register for wakeups before looking, so a release in between is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.try_acquire(avoid).await? {
                return Ok(lease);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    "Connection pool: no connection freed up within {:?}",
                    self.config.acquire_timeout
                );
                return Err(RpcError::AcquireTimeout {
                    waited: self.config.acquire_timeout,
                });
            }
        }
    }

    /// One pass over the selection steps. `Ok(None)` means wait for a release.
    async fn try_acquire(&self, avoid: Option<&str>) -> Result<Option<Lease<C::Handle>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::PoolClosed);
        }

        if let Some(conn) = self.claim_idle(avoid, true) {
            return Ok(Some(self.lease(conn)));
        }

        let avoid_list: Vec<&str> = avoid.into_iter().collect();
        if let Some(conn) = self.add_connection(&avoid_list, true).await {
            return Ok(Some(self.lease(conn)));
        }

        if let Some(conn) = self.claim_idle(None, false) {
            return Ok(Some(self.lease(conn)));
        }

        if let Some(conn) = self.replace_worst(avoid).await {
            return Ok(Some(self.lease(conn)));
        }

        let state = self.lock_state();
        if state.connections.is_empty() && state.pending == 0 {
            return Err(RpcError::NoHealthyEndpoints {
                message: "no endpoint could be connected".to_string(),
            });
        }
        Ok(None)
    }

    /// Claim the highest-scoring idle connection.
    ///
    /// With `healthy_only`, connections at the health cutoff and on `avoid`
    /// are skipped.
    fn claim_idle(
        &self,
        avoid: Option<&str>,
        healthy_only: bool,
    ) -> Option<Arc<PooledConnection<C::Handle>>> {
        let state = self.lock_state();
        let mut scored: Vec<(f64, &Arc<PooledConnection<C::Handle>>)> = state
            .connections
            .iter()
            .filter(|c| !c.is_in_use())
            .filter_map(|c| {
                let stats = c.stats();
                if healthy_only
                    && (stats.error_count >= HEALTH_CUTOFF || Some(c.endpoint().as_ref()) == avoid)
                {
                    return None;
                }
                let score = stats.last_used_at.elapsed().as_secs_f64() * 1000.0
                    - f64::from(stats.error_count) * ERROR_PENALTY
                    + stats.success_count as f64 * SUCCESS_BONUS;
                Some((score, c))
            })
            .collect();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored
            .into_iter()
            .find(|(_, c)| c.try_claim())
            .map(|(_, c)| c.clone())
    }

    /// Drop the connection with the worst error ratio and hand out a fresh one
    /// to a different endpoint in its place.
    ///
    /// The evicted connection may still be leased; its holder keeps using it
    /// and it is discarded on release.
    async fn replace_worst(
        &self,
        avoid: Option<&str>,
    ) -> Option<Arc<PooledConnection<C::Handle>>> {
        let (reservation, evicted, candidates) = {
            let mut state = self.lock_state();
            if state.pending > 0 || state.connections.len() < self.config.max_connections {
                return None;
            }

            let (index, ratio) = state
                .connections
                .iter()
                .enumerate()
                .map(|(i, c)| (i, c.stats().error_ratio()))
                .max_by(|a, b| a.1.total_cmp(&b.1))?;
            if ratio <= 0.0 {
                return None;
            }

            let evicted = state.connections.swap_remove(index);
            let mut avoid_list = vec![evicted.endpoint().as_ref()];
            avoid_list.extend(avoid);
            let candidates = state
                .book
                .candidates(&state.represented(), &avoid_list, Instant::now());
            state.pending += 1;
            let reservation = Reservation {
                pool: self,
                active: true,
            };
            (reservation, evicted, candidates)
        };

        info!(
            "Connection pool: replacing connection {} to {} (error ratio {:.2})",
            evicted.id(),
            evicted.endpoint(),
            evicted.stats().error_ratio()
        );

        let conn = self.create_from(candidates).await;
        let mut state = reservation.complete();
        let conn = conn.map(|conn| {
            conn.try_claim();
            state.connections.push(conn.clone());
            conn
        });
        drop(state);
        if conn.is_none() {
            self.notify.notify_one();
        }
        conn
    }

    /// Return a connection to the pool.
    ///
    /// Equivalent to dropping the lease.
    pub fn release(&self, lease: Lease<C::Handle>) {
        drop(lease);
    }

    /// Run one maintenance cycle: evict, replace connections evicted for
    /// errors and refill to `min_connections`, then health-check every idle
    /// connection.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        let failing = self.evict();
        report.evicted = failing.len();
        let failing_endpoints: Vec<&str> = failing
            .iter()
            .filter(|(_, reason)| *reason == Eviction::Failing)
            .map(|(endpoint, _)| endpoint.as_ref())
            .collect();

        // Refill to the minimum, and replace each failing connection while there is room
        let mut owed = failing_endpoints.len();
        loop {
            let size = self.lock_state().size();
            let below_min = size < self.config.min_connections;
            if !below_min && (owed == 0 || size >= self.config.max_connections) {
                break;
            }
            match self.add_connection(&failing_endpoints, false).await {
                Some(_) => {
                    report.created += 1;
                    owed = owed.saturating_sub(1);
                }
                None => break,
            }
        }

        let (probed, failed) = self.check_idle().await;
        report.probed = probed;
        report.failed_probes = failed;

        if report.evicted > 0 || report.created > 0 || report.failed_probes > 0 {
            info!(
                "Connection pool: maintenance evicted {}, created {}, {} of {} probes failed",
                report.evicted, report.created, report.failed_probes, report.probed
            );
        } else {
            debug!("Connection pool: maintenance probed {} idle connections", report.probed);
        }
        report
    }

    /// Remove expired, long-idle and failing connections that nobody holds.
    fn evict(&self) -> Vec<(Endpoint, Eviction)> {
        let mut state = self.lock_state();
        let mut remaining = state.connections.len();
        let mut evicted = Vec::new();

        state.connections.retain(|conn| {
            let stats = conn.stats();
            let reason = if conn.age() > self.config.connection_ttl {
                Some(Eviction::Expired)
            } else if stats.error_count > MAX_ERROR_COUNT {
                Some(Eviction::Failing)
            } else if stats.last_used_at.elapsed() > self.config.idle_timeout
                && remaining > self.config.min_connections
            {
                Some(Eviction::Idle)
            } else {
                None
            };

            match reason {
                Some(reason) if conn.try_claim() => {
                    debug!(
                        "Connection pool: evicting connection {} to {} ({:?})",
                        conn.id(),
                        conn.endpoint(),
                        reason
                    );
                    remaining -= 1;
                    evicted.push((conn.endpoint().clone(), reason));
                    false
                }
                _ => true,
            }
        });

        for (endpoint, reason) in &evicted {
            if *reason == Eviction::Failing {
                state.book.record_failure(endpoint);
            }
        }
        evicted
    }

    /// Probe every idle connection concurrently. Returns (probed, failed).
    async fn check_idle(&self) -> (usize, usize) {
        let claimed: Vec<Arc<PooledConnection<C::Handle>>> = self
            .lock_state()
            .connections
            .iter()
            .filter(|c| c.try_claim())
            .cloned()
            .collect();

        let results = join_all(claimed.iter().map(|c| self.health.check(c))).await;

        let mut failed = 0;
        {
            let mut state = self.lock_state();
            for (conn, result) in claimed.iter().zip(&results) {
                if result.passed {
                    state.book.record_success(conn.endpoint());
                } else {
                    failed += 1;
                    state.book.record_failure(conn.endpoint());
                }
                conn.unclaim();
            }
        }
        self.notify.notify_waiters();
        (claimed.len(), failed)
    }

    /// Start the periodic maintenance task. Calling it again is a no-op.
    pub fn start_maintenance(self: &Arc<Self>) {
        let mut slot = self.maintenance.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            return;
        }

        let weak = Arc::downgrade(self);
        let period = self.config.health_check_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else {
                    break;
                };
                pool.run_maintenance().await;
            }
        }));
        info!("Connection pool: maintenance every {:?}", period);
    }

    /// Stop maintenance, drop idle connections and fail future acquires.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(task) = self
            .maintenance
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            task.abort();
        }
        let mut state = self.lock_state();
        let before = state.connections.len();
        state.connections.retain(|c| c.is_in_use());
        info!(
            "Connection pool: shut down, dropped {} idle connections",
            before - state.connections.len()
        );
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn get_pool_stats(&self) -> PoolStats {
        let state = self.lock_state();
        let connections: Vec<ConnectionSnapshot> =
            state.connections.iter().map(|c| c.snapshot()).collect();
        let active = connections.iter().filter(|c| c.in_use).count();
        PoolStats {
            total: connections.len(),
            active,
            idle: connections.len() - active,
            pending: state.pending,
            connections,
            endpoints: state.book.stats(Instant::now()),
        }
    }

    /// Endpoints that are quarantined or failing persistently.
    pub fn get_unhealthy_endpoints(&self) -> Vec<String> {
        self.lock_state().book.unhealthy(Instant::now())
    }

    pub fn record_endpoint_success(&self, endpoint: &str) {
        self.lock_state().book.record_success(endpoint);
    }

    pub fn record_endpoint_failure(&self, endpoint: &str) {
        self.lock_state().book.record_failure(endpoint);
    }
}

impl<C: Connector> Drop for ConnectionPool<C> {
    fn drop(&mut self) {
        if let Some(task) = self
            .maintenance
            .get_mut()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    struct EchoConnector;

    #[async_trait]
    impl Connector for EchoConnector {
        type Handle = Endpoint;

        async fn connect(&self, endpoint: &Endpoint) -> Result<Endpoint> {
            Ok(endpoint.clone())
        }

        async fn probe(&self, _handle: &Endpoint) -> Result<()> {
            Ok(())
        }
    }

    fn pool(min: usize, max: usize) -> ConnectionPool<EchoConnector> {
        let config = PoolConfig {
            min_connections: min,
            max_connections: max,
            acquire_timeout: Duration::from_millis(500),
            ..PoolConfig::with_endpoints(["https://a", "https://b"])
        };
        ConnectionPool::new(config, EchoConnector).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_spreads_over_endpoints() {
        let pool = pool(2, 4);
        pool.initialize().await.unwrap();

        let stats = pool.get_pool_stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.idle, 2);
        let endpoints: HashSet<String> =
            stats.connections.iter().map(|c| c.endpoint.clone()).collect();
        assert_eq!(endpoints.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_grows_then_times_out_at_max() {
        let pool = pool(0, 2);

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_ne!(first.endpoint(), second.endpoint());
        assert_eq!(pool.get_pool_stats().active, 2);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, RpcError::AcquireTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_gets_released_connection() {
        let pool = Arc::new(pool(0, 1));
        let held = pool.acquire().await.unwrap();
        let id = held.id();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|lease| lease.id()) })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.release(held);

        assert_eq!(waiter.await.unwrap().unwrap(), id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefers_successful_connection() {
        let pool = pool(2, 2);
        pool.initialize().await.unwrap();

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        b.record_failure();
        let a_id = a.id();
        drop(a);
        drop(b);

        assert_eq!(pool.acquire().await.unwrap().id(), a_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_eviction_keeps_minimum() {
        let pool = pool(1, 3);
        {
            let _a = pool.acquire().await.unwrap();
            let _b = pool.acquire().await.unwrap();
            let _c = pool.acquire().await.unwrap();
        }
        assert_eq!(pool.get_pool_stats().total, 3);

        tokio::time::advance(pool.config().idle_timeout + Duration::from_secs(1)).await;
        let report = pool.run_maintenance().await;
        assert_eq!(report.evicted, 2);
        assert_eq!(pool.get_pool_stats().total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_replenishes() {
        let pool = pool(1, 2);
        pool.initialize().await.unwrap();
        let before = pool.get_pool_stats().connections[0].id;

        tokio::time::advance(pool.config().connection_ttl + Duration::from_secs(1)).await;
        let report = pool.run_maintenance().await;
        assert_eq!(report.evicted, 1);
        assert_eq!(report.created, 1);

        let stats = pool.get_pool_stats();
        assert_eq!(stats.total, 1);
        assert_ne!(stats.connections[0].id, before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_acquire() {
        let pool = pool(1, 2);
        pool.initialize().await.unwrap();
        pool.shutdown();

        assert!(matches!(pool.acquire().await, Err(RpcError::PoolClosed)));
        assert_eq!(pool.get_pool_stats().total, 0);
    }
}
