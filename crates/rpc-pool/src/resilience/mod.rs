//! Failure-policy building blocks shared by the pool and the manager.
//!
//! This module provides:
//! - Circuit breaking per named failure domain
//! - Fixed-window rate limiting per endpoint
//! - A generic retry loop with exponential, linear or constant backoff

mod circuit_breaker;
mod rate_limiter;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitState};
pub use rate_limiter::{RateLimitConfig, RateLimiter, RATE_LIMIT_WINDOW};
pub use retry::{with_retry, Backoff, RetryEvent, RetryExecutor, RetryPolicy, RetryStats};
