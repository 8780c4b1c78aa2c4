//! Pooled connection bookkeeping and the lease handed to callers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::errors::Result;

/// Endpoint URL shared between connections, stats and logs.
pub type Endpoint = Arc<str>;

/// Weight of the previous average in the response-time EWMA.
const EWMA_PREVIOUS_WEIGHT: f64 = 0.7;

/// Opens connections to endpoints and runs liveness probes on them.
///
/// The pool never speaks the application protocol itself; everything it knows
/// about an endpoint goes through this trait.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// A reusable handle bound to one endpoint. Cloning must be cheap.
    type Handle: Clone + Send + Sync + 'static;

    /// Open a new handle to `endpoint`.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Handle>;

    /// Run a cheap, read-only call that proves the handle is usable.
    async fn probe(&self, handle: &Self::Handle) -> Result<()>;
}

/// Mutable health and usage counters of one connection.
#[derive(Clone, Debug)]
pub struct ConnectionStats {
    pub last_used_at: Instant,
    /// Unresolved failures; each success pays one back.
    pub error_count: u32,
    pub success_count: u64,
    /// Exponentially weighted average response time in milliseconds.
    pub avg_response_ms: f64,
}

impl ConnectionStats {
    fn new(now: Instant) -> Self {
        Self {
            last_used_at: now,
            error_count: 0,
            success_count: 0,
            avg_response_ms: 0.0,
        }
    }

    pub(crate) fn record_success(&mut self, latency: Duration) {
        let sample = latency.as_secs_f64() * 1000.0;
        self.avg_response_ms = if self.success_count == 0 {
            sample
        } else {
            self.avg_response_ms * EWMA_PREVIOUS_WEIGHT + sample * (1.0 - EWMA_PREVIOUS_WEIGHT)
        };
        self.error_count = self.error_count.saturating_sub(1);
        self.success_count += 1;
    }

    pub(crate) fn record_failure(&mut self) -> u32 {
        self.error_count += 1;
        self.error_count
    }

    /// Share of recorded outcomes that were failures, in `[0, 1]`.
    pub fn error_ratio(&self) -> f64 {
        let total = self.success_count + u64::from(self.error_count);
        if total == 0 {
            0.0
        } else {
            f64::from(self.error_count) / total as f64
        }
    }
}

/// A live connection owned by the pool.
///
/// `in_use` is claimed with a compare-and-swap, so at most one holder (a
/// caller's [`Lease`] or a health probe) owns the connection at any time.
pub struct PooledConnection<H> {
    id: u64,
    endpoint: Endpoint,
    handle: H,
    created_at: Instant,
    in_use: AtomicBool,
    stats: Mutex<ConnectionStats>,
}

impl<H> PooledConnection<H> {
    pub(crate) fn new(id: u64, endpoint: Endpoint, handle: H) -> Self {
        let now = Instant::now();
        Self {
            id,
            endpoint,
            handle,
            created_at: now,
            in_use: AtomicBool::new(false),
            stats: Mutex::new(ConnectionStats::new(now)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Take exclusive ownership. Returns false if someone else holds it.
    pub(crate) fn try_claim(&self) -> bool {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Give ownership back. Probes release through here without counting as use.
    pub(crate) fn unclaim(&self) {
        self.in_use.store(false, Ordering::Release);
    }

    fn lock_stats(&self) -> MutexGuard<'_, ConnectionStats> {
        self.stats.lock().unwrap_or_else(|poisoned| {
            warn!("Connection {} stats mutex was poisoned, recovering", self.id);
            poisoned.into_inner()
        })
    }

    /// Copy of the current counters.
    pub fn stats(&self) -> ConnectionStats {
        self.lock_stats().clone()
    }

    pub(crate) fn touch(&self) {
        self.lock_stats().last_used_at = Instant::now();
    }

    pub(crate) fn record_success(&self, latency: Duration) {
        self.lock_stats().record_success(latency);
    }

    pub(crate) fn record_failure(&self) -> u32 {
        self.lock_stats().record_failure()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let stats = self.stats();
        ConnectionSnapshot {
            id: self.id,
            endpoint: self.endpoint.to_string(),
            in_use: self.is_in_use(),
            age_ms: self.age().as_millis() as u64,
            idle_ms: stats.last_used_at.elapsed().as_millis() as u64,
            error_count: stats.error_count,
            success_count: stats.success_count,
            avg_response_ms: stats.avg_response_ms,
        }
    }
}

/// Point-in-time view of one connection, for observability.
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionSnapshot {
    pub id: u64,
    pub endpoint: String,
    pub in_use: bool,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub error_count: u32,
    pub success_count: u64,
    pub avg_response_ms: f64,
}

/// What an operation running under `with_connection` gets to see.
#[derive(Clone, Debug)]
pub struct ConnectionRef<H> {
    pub id: u64,
    pub endpoint: Endpoint,
    pub handle: H,
}

/// Exclusive use of a pooled connection.
///
/// Dropping the lease releases the connection back to the pool, so every
/// acquire is matched by exactly one release on every path.
pub struct Lease<H> {
    conn: Arc<PooledConnection<H>>,
    notify: Arc<Notify>,
}

impl<H> Lease<H> {
    pub(crate) fn new(conn: Arc<PooledConnection<H>>, notify: Arc<Notify>) -> Self {
        Self { conn, notify }
    }

    pub fn id(&self) -> u64 {
        self.conn.id()
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.conn.endpoint()
    }

    pub fn handle(&self) -> &H {
        self.conn.handle()
    }

    pub fn record_success(&self, latency: Duration) {
        self.conn.record_success(latency);
    }

    /// Returns the connection's error count after the failure.
    pub fn record_failure(&self) -> u32 {
        self.conn.record_failure()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.conn.stats()
    }
}

impl<H: Clone> Lease<H> {
    pub fn connection(&self) -> ConnectionRef<H> {
        ConnectionRef {
            id: self.conn.id(),
            endpoint: self.conn.endpoint().clone(),
            handle: self.conn.handle().clone(),
        }
    }
}

impl<H> Drop for Lease<H> {
    fn drop(&mut self) {
        self.conn.touch();
        self.conn.unclaim();
        self.notify.notify_one();
    }
}

impl<H> std::fmt::Debug for Lease<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.conn.id())
            .field("endpoint", &self.conn.endpoint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let conn = PooledConnection::new(1, Arc::from("https://a"), ());
        assert!(conn.try_claim());
        assert!(!conn.try_claim());
        conn.unclaim();
        assert!(conn.try_claim());
    }

    #[tokio::test]
    async fn test_success_pays_back_errors_and_updates_ewma() {
        let conn = PooledConnection::new(1, Arc::from("https://a"), ());
        conn.record_failure();
        conn.record_failure();

        conn.record_success(Duration::from_millis(100));
        let stats = conn.stats();
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.success_count, 1);
        assert!((stats.avg_response_ms - 100.0).abs() < 1e-6);

        conn.record_success(Duration::from_millis(200));
        let stats = conn.stats();
        assert_eq!(stats.error_count, 0);
        assert!((stats.avg_response_ms - 130.0).abs() < 1e-6);

        // Floor at zero
        conn.record_success(Duration::from_millis(200));
        assert_eq!(conn.stats().error_count, 0);
    }

    #[tokio::test]
    async fn test_error_ratio() {
        let mut stats = ConnectionStats::new(Instant::now());
        assert_eq!(stats.error_ratio(), 0.0);
        stats.success_count = 3;
        stats.error_count = 1;
        assert!((stats.error_ratio() - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_lease_drop_releases() {
        let conn = Arc::new(PooledConnection::new(7, Arc::from("https://a"), 5u8));
        let notify = Arc::new(Notify::new());
        assert!(conn.try_claim());

        let lease = Lease::new(conn.clone(), notify);
        assert_eq!(lease.connection().handle, 5);
        assert!(conn.is_in_use());

        drop(lease);
        assert!(!conn.is_in_use());
    }
}
