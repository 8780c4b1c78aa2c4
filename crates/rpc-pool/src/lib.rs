//! Chainbot RPC Pool Crate
//!
//! This crate provides the resilient connection layer the trading bot uses
//! for every call to its blockchain RPC endpoints.
//!
//! # Overview
//!
//! The connection layer supports:
//! - A bounded pool of reusable connections across interchangeable endpoints
//! - Health scoring, adaptive endpoint selection and self-healing replacement
//! - Per-endpoint rate limiting and circuit breaking
//! - Retry with backoff driven by a shared error classification
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |    Consumer      |  (price feeds, swaps, risk checks)
//! +------------------+
//!          |
//!          v  with_connection(op)
//! +------------------+     +------------------+
//! |ConnectionManager | --> |  CircuitBreaker  |  (per endpoint / data source)
//! +------------------+     +------------------+
//!          |           \
//!          |            \  +------------------+
//!          |             ->|   RateLimiter    |  (fixed 1s window)
//!          v               +------------------+
//! +------------------+     +------------------+
//! | ConnectionPool   | --> |  HealthChecker   |  (probes, rolling stats)
//! +------------------+     +------------------+
//!          |
//!          v
//! +------------------+
//! |    Connector     |  (JSON-RPC over HTTP, or any custom transport)
//! +------------------+
//! ```
//!
//! # Core Types
//!
//! - [`ConnectionManager`] - The façade consumers call
//! - [`ConnectionPool`] - Owns connections and picks one per call
//! - [`Connector`] - How connections are opened and probed
//! - [`RpcError`] - Every failure, classifiable via [`classify`]
//! - [`RpcConfig`] - Pool, manager, rate limit and breaker settings

pub mod config;
pub mod errors;
pub mod manager;
pub mod pool;
pub mod resilience;
pub mod transport;

pub use config::{ManagerConfig, PoolConfig, RpcConfig};
pub use errors::{
    classify, ClassifiedError, ErrorCategory, ErrorMetadata, ErrorSeverity, Result, RpcError,
    Verdict,
};
pub use manager::ConnectionManager;
pub use pool::{
    ConnectionPool, ConnectionRef, ConnectionSnapshot, Connector, Endpoint, HealthChecker,
    Lease, PoolStats,
};
pub use resilience::{
    with_retry, Backoff, CircuitBreaker, CircuitBreakerConfig, CircuitState, RateLimitConfig,
    RateLimiter, RetryExecutor, RetryPolicy, RetryStats,
};
pub use transport::{HttpConnector, HttpRpcClient};
