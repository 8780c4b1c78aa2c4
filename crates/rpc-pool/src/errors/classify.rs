use std::fmt;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;

use super::RpcError;

/// Broad failure category.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Network,
    RateLimit,
    Timeout,
    Auth,
    Validation,
    System,
    Business,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "NETWORK",
            Self::RateLimit => "RATE_LIMIT",
            Self::Timeout => "TIMEOUT",
            Self::Auth => "AUTH",
            Self::Validation => "VALIDATION",
            Self::System => "SYSTEM",
            Self::Business => "BUSINESS",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// How bad a failure is for the dependency path that produced it.
///
/// Ordered, so `severity >= ErrorSeverity::High` reads naturally.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Category, severity and retryability of a failure, without metadata.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Verdict {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub retryable: bool,
}

/// Lowercase fragments that mark a message as throttling.
const RATE_LIMIT_MARKERS: &[&str] = &["429", "too many requests", "rate limit"];

impl Verdict {
    pub const RATE_LIMIT: Self = Self::new(ErrorCategory::RateLimit, ErrorSeverity::High, true);
    pub const SERVER: Self = Self::new(ErrorCategory::Network, ErrorSeverity::High, true);
    pub const AUTH: Self = Self::new(ErrorCategory::Auth, ErrorSeverity::High, false);
    pub const NETWORK: Self = Self::new(ErrorCategory::Network, ErrorSeverity::High, true);
    pub const TIMEOUT: Self = Self::new(ErrorCategory::Timeout, ErrorSeverity::Medium, true);
    pub const SYSTEM: Self = Self::new(ErrorCategory::System, ErrorSeverity::Critical, false);
    pub const BUSINESS: Self = Self::new(ErrorCategory::Business, ErrorSeverity::High, false);
    pub const VALIDATION: Self = Self::new(ErrorCategory::Validation, ErrorSeverity::Low, false);
    pub const UNKNOWN: Self = Self::new(ErrorCategory::Unknown, ErrorSeverity::Medium, false);

    const fn new(category: ErrorCategory, severity: ErrorSeverity, retryable: bool) -> Self {
        Self {
            category,
            severity,
            retryable,
        }
    }

    /// Verdict for an HTTP status code, if the status alone decides it.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            429 => Some(Self::RATE_LIMIT),
            401 | 403 => Some(Self::AUTH),
            s if s >= 500 => Some(Self::SERVER),
            _ => None,
        }
    }

    /// Whether `message` names throttling, whatever else it says.
    pub fn is_rate_limit_message(message: &str) -> bool {
        let message = message.to_lowercase();
        RATE_LIMIT_MARKERS.iter().any(|p| message.contains(p))
    }

    /// Verdict for an unstructured error message. First matching rule wins.
    pub fn from_message(message: &str) -> Self {
        let message = message.to_lowercase();
        let has = |patterns: &[&str]| patterns.iter().any(|p| message.contains(p));

        if has(RATE_LIMIT_MARKERS) {
            Self::RATE_LIMIT
        } else if has(&[
            "internal server error",
            "bad gateway",
            "service unavailable",
            "gateway timeout",
        ]) {
            Self::SERVER
        } else if has(&[
            "econnrefused",
            "econnreset",
            "enotfound",
            "connection refused",
            "connection reset",
            "dns",
            "socket hang up",
        ]) {
            Self::NETWORK
        } else if has(&["etimedout", "timed out", "timeout"]) {
            Self::TIMEOUT
        } else if has(&["out of memory", "stack overflow"]) {
            Self::SYSTEM
        } else if has(&["insufficient funds", "unauthorized", "forbidden"]) {
            Self::BUSINESS
        } else if has(&["validation", "invalid", "not found"]) {
            Self::VALIDATION
        } else {
            Self::UNKNOWN
        }
    }
}

/// Where and when a failure happened.
#[derive(Clone, Debug, Serialize)]
pub struct ErrorMetadata {
    /// Endpoint URL or data-source name.
    pub source: String,
    /// Logical operation, e.g. `health_check` or `with_connection`.
    pub operation: String,
    pub timestamp: DateTime<Utc>,
    pub details: Option<serde_json::Value>,
}

/// A normalized verdict derived from a raw failure.
#[derive(Clone, Debug, Serialize)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub retryable: bool,
    pub metadata: ErrorMetadata,
}

impl ClassifiedError {
    pub fn verdict(&self) -> Verdict {
        Verdict {
            category: self.category,
            severity: self.severity,
            retryable: self.retryable,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.severity == ErrorSeverity::Critical
    }

    /// Log the failure at a level matching its severity.
    pub fn log(&self, error: &RpcError) {
        let source = &self.metadata.source;
        let operation = &self.metadata.operation;
        match self.severity {
            ErrorSeverity::Low => debug!(
                "{} failure in '{}' on '{}': {}",
                self.category, operation, source, error
            ),
            ErrorSeverity::Medium => info!(
                "{} failure in '{}' on '{}': {}",
                self.category, operation, source, error
            ),
            ErrorSeverity::High => warn!(
                "{} failure in '{}' on '{}' (retryable: {}): {}",
                self.category, operation, source, self.retryable, error
            ),
            ErrorSeverity::Critical => error!(
                "Critical {} failure in '{}' on '{}': {}",
                self.category, operation, source, error
            ),
        }
    }
}

/// Classify a failure raised by `operation` against `source`.
///
/// This is the single policy source for retry decisions, circuit breaker
/// failure counting and connection validation.
pub fn classify(
    error: &RpcError,
    source: &str,
    operation: &str,
    details: Option<serde_json::Value>,
) -> ClassifiedError {
    let verdict = error.verdict();
    ClassifiedError {
        category: verdict.category,
        severity: verdict.severity,
        retryable: verdict.retryable,
        metadata: ErrorMetadata {
            source: source.to_string(),
            operation: operation.to_string(),
            timestamp: Utc::now(),
            details,
        },
    }
}
