//! Error types and failure classification for the RPC connection layer.
//!
//! This module provides:
//! - [`RpcError`]: The main error enum for every pool, manager and transport operation
//! - [`ClassifiedError`]: A normalized category/severity/retryable verdict for a failure
//! - [`classify`]: The shared policy used by retries, circuit breakers and the pool

mod classify;

pub use classify::{
    classify, ClassifiedError, ErrorCategory, ErrorMetadata, ErrorSeverity, Verdict,
};

use std::io::ErrorKind;
use std::time::Duration;

use thiserror::Error;

use crate::resilience::RetryStats;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RpcError>;

/// JSON-RPC error code that nodes use to signal throttling.
const RPC_RATE_LIMIT_CODE: i64 = 429;

/// JSON-RPC error code for a node that has fallen behind the cluster.
const RPC_NODE_BEHIND_CODE: i64 = -32005;

/// Errors that can occur while acquiring connections or running operations on them.
///
/// Each variant maps to a [`Verdict`] via [`verdict`](Self::verdict). Structured
/// signals (HTTP status, I/O error kind, transport flags) are preferred; free text
/// is only pattern-matched when nothing structured is available.
#[derive(Error, Debug)]
pub enum RpcError {
    /// The endpoint answered with a non-success HTTP status.
    #[error("HTTP {status} from {endpoint}: {message}")]
    Http {
        endpoint: String,
        status: u16,
        message: String,
    },

    /// The endpoint answered with a JSON-RPC error object.
    #[error("RPC error {code} from {endpoint}: {message}")]
    Rpc {
        endpoint: String,
        code: i64,
        message: String,
    },

    /// The HTTP client failed before a response was available.
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A socket-level failure reported by the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation or probe did not finish within its time budget.
    #[error("Timeout after {after:?}: {endpoint}")]
    Timeout { endpoint: String, after: Duration },

    /// The endpoint rejected the request because of its request rate.
    #[error("Rate limited: {endpoint}")]
    RateLimited { endpoint: String },

    /// The circuit breaker for this failure domain is open.
    /// The operation was never invoked.
    #[error("Circuit open: {domain}")]
    CircuitOpen { domain: String },

    /// No pooled connection became free before the acquire deadline.
    #[error("Timed out after {waited:?} waiting for a pooled connection")]
    AcquireTimeout { waited: Duration },

    /// Not a single endpoint could be connected and validated.
    #[error("No healthy endpoints: {message}")]
    NoHealthyEndpoints { message: String },

    /// The pool was shut down and hands out no more connections.
    #[error("Connection pool is shut down")]
    PoolClosed,

    /// The supplied configuration is unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A caller-supplied operation failed with an unstructured message.
    #[error("{0}")]
    Operation(String),

    /// A failure that the retry policy refused to retry.
    #[error("Non-retryable {} failure: {}", .classified.category, .error)]
    NonRetryable {
        classified: ClassifiedError,
        #[source]
        error: Box<RpcError>,
    },

    /// Every allowed attempt failed.
    #[error("Retries exhausted after {} attempts: {}", .stats.attempts, .last)]
    RetryExhausted {
        stats: Box<RetryStats>,
        #[source]
        last: Box<RpcError>,
    },
}

impl RpcError {
    /// Shorthand for [`RpcError::Operation`].
    pub fn operation(message: impl Into<String>) -> Self {
        Self::Operation(message.into())
    }

    /// Returns the classification verdict for this error.
    ///
    /// # Examples
    ///
    /// ```
    /// use chainbot_rpc_pool::errors::{ErrorCategory, RpcError};
    ///
    /// let error = RpcError::Http {
    ///     endpoint: "https://rpc.example".to_string(),
    ///     status: 429,
    ///     message: String::new(),
    /// };
    /// assert_eq!(error.verdict().category, ErrorCategory::RateLimit);
    /// assert!(error.verdict().retryable);
    ///
    /// let error = RpcError::operation("insufficient funds for transfer");
    /// assert_eq!(error.verdict().category, ErrorCategory::Business);
    /// assert!(!error.verdict().retryable);
    /// ```
    pub fn verdict(&self) -> Verdict {
        match self {
            Self::Http {
                status, message, ..
            } => {
                if Verdict::is_rate_limit_message(message) {
                    Verdict::RATE_LIMIT
                } else {
                    Verdict::from_status(*status).unwrap_or_else(|| Verdict::from_message(message))
                }
            }

            Self::Rpc { code, message, .. } => {
                if *code == RPC_RATE_LIMIT_CODE || Verdict::is_rate_limit_message(message) {
                    Verdict::RATE_LIMIT
                } else if *code == RPC_NODE_BEHIND_CODE {
                    Verdict::NETWORK
                } else {
                    Verdict::from_message(message)
                }
            }

            Self::Transport(e) => {
                if Verdict::is_rate_limit_message(&e.to_string()) {
                    Verdict::RATE_LIMIT
                } else if e.is_timeout() {
                    Verdict::TIMEOUT
                } else if let Some(verdict) = e.status().and_then(|s| Verdict::from_status(s.as_u16()))
                {
                    verdict
                } else if e.is_connect() {
                    Verdict::NETWORK
                } else if e.is_decode() {
                    Verdict::VALIDATION
                } else {
                    Verdict::from_message(&e.to_string())
                }
            }

            Self::Io(e) => match e.kind() {
                ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected
                | ErrorKind::BrokenPipe
                | ErrorKind::AddrNotAvailable
                | ErrorKind::UnexpectedEof => Verdict::NETWORK,
                ErrorKind::TimedOut | ErrorKind::WouldBlock => Verdict::TIMEOUT,
                ErrorKind::OutOfMemory => Verdict::SYSTEM,
                ErrorKind::InvalidInput | ErrorKind::InvalidData | ErrorKind::NotFound => {
                    Verdict::VALIDATION
                }
                _ => Verdict::from_message(&e.to_string()),
            },

            Self::Timeout { .. } | Self::AcquireTimeout { .. } => Verdict::TIMEOUT,
            Self::RateLimited { .. } => Verdict::RATE_LIMIT,

            // Rejections are not failures of the dependency itself
            Self::CircuitOpen { .. } => Verdict {
                category: ErrorCategory::Network,
                severity: ErrorSeverity::Medium,
                retryable: false,
            },

            Self::NoHealthyEndpoints { .. } => Verdict::SYSTEM,
            Self::PoolClosed => Verdict {
                category: ErrorCategory::System,
                severity: ErrorSeverity::High,
                retryable: false,
            },
            Self::InvalidConfig(_) => Verdict::VALIDATION,
            Self::Operation(message) => Verdict::from_message(message),
            Self::NonRetryable { classified, .. } => classified.verdict(),
            Self::RetryExhausted { last, .. } => last.verdict(),
        }
    }

    /// Returns true if this error is a circuit breaker rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}
