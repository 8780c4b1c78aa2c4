//! Fixed-window rate limiter for RPC endpoints.
//!
//! Each endpoint gets a request counter that resets every second. A request
//! that would exceed the per-second cap waits until the next window boundary.
//! The window is deliberately coarse and may admit up to twice the cap across
//! a boundary.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::duration_ms;

/// Length of one counting window.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);

/// Default per-endpoint request cap.
const DEFAULT_MAX_REQUESTS_PER_SECOND: u32 = 10;

/// Default base delay for exponential backoff between retries.
const DEFAULT_RETRY_DELAY_BASE: Duration = Duration::from_millis(500);

/// Default ceiling for backoff delays.
const DEFAULT_RETRY_DELAY_MAX: Duration = Duration::from_millis(10_000);

/// Rate limit and backoff bounds applied per endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests_per_second: u32,
    #[serde(with = "duration_ms", rename = "retry_delay_base_ms")]
    pub retry_delay_base: Duration,
    #[serde(with = "duration_ms", rename = "retry_delay_max_ms")]
    pub retry_delay_max: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second: DEFAULT_MAX_REQUESTS_PER_SECOND,
            retry_delay_base: DEFAULT_RETRY_DELAY_BASE,
            retry_delay_max: DEFAULT_RETRY_DELAY_MAX,
        }
    }
}

/// Counter for a single endpoint.
#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

impl Window {
    fn new(now: Instant) -> Self {
        Self {
            started: now,
            count: 0,
        }
    }

    /// Start a fresh window if the current one has expired.
    fn roll(&mut self, now: Instant) {
        if now.duration_since(self.started) >= RATE_LIMIT_WINDOW {
            self.started = now;
            self.count = 0;
        }
    }

    fn time_until_reset(&self, now: Instant) -> Duration {
        RATE_LIMIT_WINDOW.saturating_sub(now.duration_since(self.started))
    }
}

/// Per-endpoint fixed-window rate limiter.
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
    max_per_window: u32,
}

impl RateLimiter {
    pub fn new(max_requests_per_second: u32) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_per_window: max_requests_per_second.max(1),
        }
    }

    fn lock_windows(&self) -> MutexGuard<'_, HashMap<String, Window>> {
        self.windows.lock().unwrap_or_else(|poisoned| {
            warn!("Rate limiter mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Try to admit one request for `endpoint`.
    ///
    /// Returns `Ok(())` and counts the request when the window has room,
    /// otherwise returns the time left until the window resets.
    pub fn try_acquire(&self, endpoint: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut windows = self.lock_windows();
        let window = windows
            .entry(endpoint.to_string())
            .or_insert_with(|| Window::new(now));

        window.roll(now);
        if window.count < self.max_per_window {
            window.count += 1;
            Ok(())
        } else {
            Err(window.time_until_reset(now))
        }
    }

    /// Wait until a request for `endpoint` is admitted.
    pub async fn acquire(&self, endpoint: &str) {
        loop {
            match self.try_acquire(endpoint) {
                Ok(()) => return,
                Err(wait) => {
                    debug!(
                        "Rate limiter: '{}' at {} req/s, waiting {:?}",
                        endpoint, self.max_per_window, wait
                    );
                    tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    /// Requests admitted in the current window.
    pub fn current_count(&self, endpoint: &str) -> u32 {
        let now = Instant::now();
        let mut windows = self.lock_windows();
        match windows.get_mut(endpoint) {
            Some(window) => {
                window.roll(now);
                window.count
            }
            None => 0,
        }
    }

    /// Reset the rate limiter for an endpoint.
    pub fn reset(&self, endpoint: &str) {
        self.lock_windows().remove(endpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_window_caps_requests() {
        let limiter = RateLimiter::new(3);

        for _ in 0..3 {
            assert!(limiter.try_acquire("https://a").is_ok());
        }
        let wait = limiter.try_acquire("https://a").unwrap_err();
        assert!(wait <= RATE_LIMIT_WINDOW);
        assert_eq!(limiter.current_count("https://a"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_one_second() {
        let limiter = RateLimiter::new(1);

        assert!(limiter.try_acquire("https://a").is_ok());
        assert!(limiter.try_acquire("https://a").is_err());

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(limiter.try_acquire("https://a").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoint_isolation() {
        let limiter = RateLimiter::new(1);

        assert!(limiter.try_acquire("https://a").is_ok());
        assert!(limiter.try_acquire("https://a").is_err());
        assert!(limiter.try_acquire("https://b").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_sleeps_until_boundary() {
        let limiter = RateLimiter::new(2);
        let start = Instant::now();

        limiter.acquire("https://a").await;
        limiter.acquire("https://a").await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.acquire("https://a").await;
        assert!(start.elapsed() >= RATE_LIMIT_WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let limiter = RateLimiter::new(1);

        assert!(limiter.try_acquire("https://a").is_ok());
        limiter.reset("https://a");
        assert!(limiter.try_acquire("https://a").is_ok());
    }
}
