//! Per-domain circuit breaker for fault tolerance.
//!
//! Implements the circuit breaker pattern to stop cascading failures when an
//! endpoint or external data source is misbehaving. Each failure domain is
//! registered by name and has three states:
//!
//! - **Closed**: Normal operation, calls are allowed through.
//! - **Open**: Domain is failing, calls are rejected without being invoked.
//! - **HalfOpen**: Testing recovery with a bounded number of trial calls.
//!
//! Only retryable failures count against a domain. Permanent failures such as
//! authentication or validation errors say nothing about the dependency's health.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::duration_ms;
use crate::errors::{Result, RpcError};

/// Default number of failures before opening the circuit.
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time to wait before transitioning from Open to HalfOpen.
const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of trial calls allowed while HalfOpen.
const DEFAULT_HALF_OPEN_MAX_ATTEMPTS: u32 = 1;

/// Circuit breaker state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - calls are allowed.
    Closed,
    /// Domain is failing - calls are rejected.
    Open,
    /// Testing recovery - limited calls allowed.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Internal circuit state for a single failure domain.
#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    /// Failures recorded since the circuit last closed or went HalfOpen.
    failure_count: u32,
    /// Trial calls let through since entering HalfOpen.
    half_open_attempts: u32,
    last_failure: Option<Instant>,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_attempts: 0,
            last_failure: None,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening the circuit.
    pub failure_threshold: u32,
    /// Time to wait in Open before allowing a trial call.
    #[serde(with = "duration_ms", rename = "reset_timeout_ms")]
    pub reset_timeout: Duration,
    /// Trial calls allowed while HalfOpen.
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
            half_open_max_attempts: DEFAULT_HALF_OPEN_MAX_ATTEMPTS,
        }
    }
}

/// Circuit breaker registry keyed by failure domain.
///
/// Thread-safe. Domains are created lazily on first use and live for the
/// lifetime of the breaker, which is normally the lifetime of the process.
pub struct CircuitBreaker {
    circuits: Mutex<HashMap<String, Circuit>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with default settings.
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    /// Create a circuit breaker with custom configuration.
    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Lock the circuits mutex, recovering from poison if necessary.
    ///
    /// The worst case after a poisoned lock is a slightly stale circuit state,
    /// which is better than panicking in every caller.
    fn lock_circuits(&self) -> MutexGuard<'_, HashMap<String, Circuit>> {
        self.circuits.lock().unwrap_or_else(|poisoned| {
            warn!("Circuit breaker mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Check if a call is allowed for a domain.
    ///
    /// Handles the Open -> HalfOpen transition once the reset timeout has
    /// elapsed, and counts HalfOpen trial calls against the configured budget.
    pub fn is_allowed(&self, domain: &str) -> bool {
        let mut circuits = self.lock_circuits();
        let circuit = circuits
            .entry(domain.to_string())
            .or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                if circuit.half_open_attempts < self.config.half_open_max_attempts {
                    circuit.half_open_attempts += 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::Open => {
                let elapsed = circuit
                    .last_failure
                    .map(|at| at.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    info!(
                        "Circuit breaker: transitioning '{}' from Open to HalfOpen",
                        domain
                    );
                    circuit.state = CircuitState::HalfOpen;
                    circuit.failure_count = 0;
                    circuit.half_open_attempts = 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call for a domain.
    ///
    /// In Closed state the failure count is left alone, so the threshold
    /// counts cumulative recent failures. In HalfOpen a success closes the circuit.
    pub fn record_success(&self, domain: &str) {
        let mut circuits = self.lock_circuits();
        let circuit = circuits
            .entry(domain.to_string())
            .or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                info!("Circuit breaker: closing circuit for '{}'", domain);
                circuit.state = CircuitState::Closed;
                circuit.failure_count = 0;
                circuit.half_open_attempts = 0;
                circuit.last_failure = None;
            }
            CircuitState::Open => {
                debug!(
                    "Circuit breaker: late success for '{}' while Open, ignoring",
                    domain
                );
            }
        }
    }

    /// Record a failed call for a domain.
    ///
    /// In HalfOpen state any failure immediately reopens the circuit.
    pub fn record_failure(&self, domain: &str) {
        let mut circuits = self.lock_circuits();
        let circuit = circuits
            .entry(domain.to_string())
            .or_insert_with(Circuit::new);

        circuit.failure_count += 1;
        circuit.last_failure = Some(Instant::now());

        match circuit.state {
            CircuitState::Closed => {
                if circuit.failure_count >= self.config.failure_threshold {
                    warn!(
                        "Circuit breaker: opening circuit for '{}' after {} failures",
                        domain, circuit.failure_count
                    );
                    circuit.state = CircuitState::Open;
                } else {
                    debug!(
                        "Circuit breaker: failure for '{}' ({}/{})",
                        domain, circuit.failure_count, self.config.failure_threshold
                    );
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    "Circuit breaker: reopening circuit for '{}' after failure in HalfOpen",
                    domain
                );
                circuit.state = CircuitState::Open;
                circuit.half_open_attempts = 0;
            }
            CircuitState::Open => {
                debug!(
                    "Circuit breaker: additional failure for '{}' (already open)",
                    domain
                );
            }
        }
    }

    /// Run `op` under the breaker for `domain`.
    ///
    /// When the circuit rejects the call, `op` is never invoked and
    /// [`RpcError::CircuitOpen`] is returned. Outcomes are recorded using the
    /// shared classification: retryable failures count against the domain,
    /// permanent failures prove the dependency answered and count as liveness.
    pub async fn call<T, F, Fut>(&self, domain: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.is_allowed(domain) {
            debug!("Circuit breaker: rejecting call to '{}'", domain);
            return Err(RpcError::CircuitOpen {
                domain: domain.to_string(),
            });
        }

        match op().await {
            Ok(value) => {
                self.record_success(domain);
                Ok(value)
            }
            Err(e) => {
                if e.is_circuit_open() {
                    // A nested breaker rejected the call; nothing was attempted here
                } else if e.verdict().retryable {
                    self.record_failure(domain);
                } else {
                    self.record_success(domain);
                }
                Err(e)
            }
        }
    }

    /// Get the current state for a domain.
    pub fn state(&self, domain: &str) -> CircuitState {
        self.lock_circuits()
            .get(domain)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Get the failure count for a domain.
    pub fn failure_count(&self, domain: &str) -> u32 {
        self.lock_circuits()
            .get(domain)
            .map(|c| c.failure_count)
            .unwrap_or(0)
    }

    /// Domains whose circuit is currently Open.
    pub fn open_domains(&self) -> Vec<String> {
        self.lock_circuits()
            .iter()
            .filter(|(_, c)| c.state == CircuitState::Open)
            .map(|(domain, _)| domain.clone())
            .collect()
    }

    /// Reset the circuit for a domain to Closed state.
    pub fn reset(&self, domain: &str) {
        if let Some(circuit) = self.lock_circuits().get_mut(domain) {
            info!("Circuit breaker: manually resetting circuit for '{}'", domain);
            *circuit = Circuit::new();
        }
    }

    /// Reset all circuits to their initial state.
    pub fn reset_all(&self) {
        self.lock_circuits().clear();
        info!("Circuit breaker: all circuits reset");
    }

    /// Get metrics for all tracked domains.
    pub fn metrics(&self) -> Vec<CircuitMetrics> {
        self.lock_circuits()
            .iter()
            .map(|(domain, circuit)| CircuitMetrics {
                domain: domain.clone(),
                state: circuit.state,
                failure_count: circuit.failure_count,
                half_open_attempts: circuit.half_open_attempts,
                since_last_failure: circuit.last_failure.map(|at| at.elapsed()),
            })
            .collect()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics for a single circuit.
#[derive(Clone, Debug)]
pub struct CircuitMetrics {
    pub domain: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_attempts: u32,
    pub since_last_failure: Option<Duration>,
}
