//! Generic retry loop with configurable backoff.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::duration_ms;
use crate::errors::{classify, ClassifiedError, Result, RpcError};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1000);
const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);
const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Jitter applied on top of the computed delay, as a fraction (±10%).
const DEFAULT_JITTER: f64 = 0.1;

/// How the delay grows between attempts.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// `initial_delay * factor^(attempt - 1)`
    Exponential,
    /// `initial_delay * attempt`
    Linear,
    /// `initial_delay` every time
    None,
}

/// Retry policy configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    #[serde(with = "duration_ms", rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    pub backoff: Backoff,
    pub backoff_factor: f64,
    /// Fraction of the delay used as symmetric random jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff: Backoff::Exponential,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Exponential policy between `base` and `max`, doubling each retry.
    pub fn exponential(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: base,
            max_delay: max,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let initial = self.initial_delay.as_secs_f64();
        let secs = match self.backoff {
            Backoff::Exponential => initial * self.backoff_factor.powi(retry as i32 - 1),
            Backoff::Linear => initial * retry as f64,
            Backoff::None => initial,
        };
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Delay before retry number `retry` (1-based), with jitter applied.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64((1.0 + spread).max(0.0))
    }
}

/// Accumulated history of one retried invocation.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RetryStats {
    pub attempts: u32,
    pub total_time_ms: u64,
    /// Messages of every failed attempt, oldest first.
    pub errors: Vec<String>,
    pub successful: bool,
    pub final_error: Option<String>,
}

impl RetryStats {
    pub(crate) fn record_error(&mut self, error: &RpcError) {
        self.errors.push(error.to_string());
    }

    pub(crate) fn finish(&mut self, started: Instant, final_error: Option<&RpcError>) {
        self.total_time_ms = started.elapsed().as_millis() as u64;
        self.successful = final_error.is_none();
        self.final_error = final_error.map(|e| e.to_string());
    }
}

/// Information handed to the `on_retry` callback before sleeping.
pub struct RetryEvent<'a> {
    /// The attempt that just failed (1-based).
    pub attempt: u32,
    pub delay: Duration,
    pub error: &'a RpcError,
    pub classified: &'a ClassifiedError,
}

type ShouldRetry = dyn Fn(&RpcError) -> bool + Send + Sync;
type OnRetry = dyn Fn(&RetryEvent<'_>) + Send + Sync;

/// Runs an operation until it succeeds, the policy refuses a retry, or the
/// attempt budget is spent.
///
/// By default an error is retried when its classification is retryable.
pub struct RetryExecutor {
    policy: RetryPolicy,
    should_retry: Option<Box<ShouldRetry>>,
    on_retry: Option<Box<OnRetry>>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            should_retry: None,
            on_retry: None,
        }
    }

    /// Replace the default classification-based retry predicate.
    pub fn should_retry(mut self, f: impl Fn(&RpcError) -> bool + Send + Sync + 'static) -> Self {
        self.should_retry = Some(Box::new(f));
        self
    }

    /// Observe every retry before its backoff sleep.
    pub fn on_retry(mut self, f: impl Fn(&RetryEvent<'_>) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Box::new(f));
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Whether the configured predicate, or else the classification, allows a retry.
    pub(crate) fn allows_retry(&self, error: &RpcError, classified: &ClassifiedError) -> bool {
        match &self.should_retry {
            Some(predicate) => predicate(error),
            None => classified.retryable,
        }
    }

    pub(crate) fn notify_retry(&self, event: &RetryEvent<'_>) {
        if let Some(callback) = &self.on_retry {
            callback(event);
        }
    }

    /// Run `op` under the retry policy.
    ///
    /// A refused retry returns [`RpcError::NonRetryable`] immediately; an
    /// exhausted budget returns [`RpcError::RetryExhausted`] carrying the stats.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut stats = RetryStats::default();
        let mut attempt = 0;

        loop {
            attempt += 1;
            stats.attempts = attempt;

            let error = match op().await {
                Ok(value) => {
                    stats.finish(started, None);
                    if attempt > 1 {
                        debug!("'{}' succeeded after {} attempts", operation, attempt);
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            stats.record_error(&error);
            let classified = classify(&error, "retry_executor", operation, None);
            if !self.allows_retry(&error, &classified) {
                stats.finish(started, Some(&error));
                classified.log(&error);
                return Err(RpcError::NonRetryable {
                    classified,
                    error: Box::new(error),
                });
            }

            if attempt == max_attempts {
                stats.finish(started, Some(&error));
                warn!(
                    "'{}' failed after {} attempts in {}ms: {}",
                    operation, stats.attempts, stats.total_time_ms, error
                );
                return Err(RpcError::RetryExhausted {
                    stats: Box::new(stats),
                    last: Box::new(error),
                });
            }

            let delay = self.policy.delay_for(attempt);
            self.notify_retry(&RetryEvent {
                attempt,
                delay,
                error: &error,
                classified: &classified,
            });
            debug!(
                "'{}' attempt {}/{} failed ({}), retrying in {:?}",
                operation, attempt, max_attempts, classified.category, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Run `op` with `policy` and the default classification-based retry predicate.
pub async fn with_retry<T, F, Fut>(operation: &str, policy: RetryPolicy, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    RetryExecutor::new(policy).run(operation, op).await
}
