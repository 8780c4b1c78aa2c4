//! Per-endpoint failure history used to steer connection creation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::connection::Endpoint;

/// Consecutive failures after which an endpoint is reported unhealthy.
pub(crate) const UNHEALTHY_AFTER_FAILURES: u32 = 5;

#[derive(Debug)]
struct EndpointRecord {
    endpoint: Endpoint,
    consecutive_failures: u32,
    total_failures: u64,
    total_successes: u64,
    last_attempt: Option<Instant>,
    quarantined_until: Option<Instant>,
}

impl EndpointRecord {
    fn is_quarantined(&self, now: Instant) -> bool {
        self.quarantined_until.is_some_and(|until| now < until)
    }
}

/// Health summary of one configured endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct EndpointStats {
    pub endpoint: String,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub quarantined: bool,
}

/// Creation, probe and operation outcomes per endpoint, in configuration order.
#[derive(Debug)]
pub(crate) struct EndpointBook {
    records: Vec<EndpointRecord>,
    quarantine: Duration,
}

impl EndpointBook {
    pub(crate) fn new(endpoints: &[String], quarantine: Duration) -> Self {
        let mut seen = HashSet::new();
        let records = endpoints
            .iter()
            .filter(|e| seen.insert(e.as_str()))
            .map(|e| EndpointRecord {
                endpoint: Arc::from(e.as_str()),
                consecutive_failures: 0,
                total_failures: 0,
                total_successes: 0,
                last_attempt: None,
                quarantined_until: None,
            })
            .collect();
        Self {
            records,
            quarantine,
        }
    }

    fn record_mut(&mut self, endpoint: &str) -> Option<&mut EndpointRecord> {
        self.records
            .iter_mut()
            .find(|r| r.endpoint.as_ref() == endpoint)
    }

    pub(crate) fn record_attempt(&mut self, endpoint: &str, now: Instant) {
        if let Some(record) = self.record_mut(endpoint) {
            record.last_attempt = Some(now);
        }
    }

    pub(crate) fn record_success(&mut self, endpoint: &str) {
        if let Some(record) = self.record_mut(endpoint) {
            record.consecutive_failures = 0;
            record.total_successes += 1;
        }
    }

    pub(crate) fn record_failure(&mut self, endpoint: &str) {
        if let Some(record) = self.record_mut(endpoint) {
            record.consecutive_failures += 1;
            record.total_failures += 1;
        }
    }

    /// Stop creating connections to `endpoint` for one quarantine period.
    pub(crate) fn quarantine(&mut self, endpoint: &str, now: Instant) {
        let until = now + self.quarantine;
        if let Some(record) = self.record_mut(endpoint) {
            record.consecutive_failures += 1;
            record.total_failures += 1;
            record.quarantined_until = Some(until);
        }
    }

    /// Endpoints eligible for a new connection, best first.
    ///
    /// Quarantined endpoints are left out. The rest are ordered by: not in
    /// `avoid`, not yet represented in the pool, fewest consecutive failures,
    /// least recently tried, then configuration order.
    pub(crate) fn candidates(
        &self,
        represented: &HashSet<&str>,
        avoid: &[&str],
        now: Instant,
    ) -> Vec<Endpoint> {
        let mut eligible: Vec<(usize, &EndpointRecord)> = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.is_quarantined(now))
            .collect();

        eligible.sort_by_key(|(index, r)| {
            (
                avoid.contains(&r.endpoint.as_ref()),
                represented.contains(r.endpoint.as_ref()),
                r.consecutive_failures,
                r.last_attempt,
                *index,
            )
        });

        eligible
            .into_iter()
            .map(|(_, r)| r.endpoint.clone())
            .collect()
    }

    pub(crate) fn unhealthy(&self, now: Instant) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| {
                r.is_quarantined(now) || r.consecutive_failures >= UNHEALTHY_AFTER_FAILURES
            })
            .map(|r| r.endpoint.to_string())
            .collect()
    }

    pub(crate) fn stats(&self, now: Instant) -> Vec<EndpointStats> {
        self.records
            .iter()
            .map(|r| EndpointStats {
                endpoint: r.endpoint.to_string(),
                consecutive_failures: r.consecutive_failures,
                total_failures: r.total_failures,
                total_successes: r.total_successes,
                quarantined: r.is_quarantined(now),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> EndpointBook {
        EndpointBook::new(
            &[
                "https://a".to_string(),
                "https://b".to_string(),
                "https://c".to_string(),
            ],
            Duration::from_secs(60),
        )
    }

    fn names(endpoints: Vec<Endpoint>) -> Vec<String> {
        endpoints.iter().map(|e| e.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_order_when_fresh() {
        let book = book();
        let now = Instant::now();
        assert_eq!(
            names(book.candidates(&HashSet::new(), &[], now)),
            vec!["https://a", "https://b", "https://c"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresented_endpoints_come_first() {
        let book = book();
        let represented: HashSet<&str> = ["https://a"].into_iter().collect();
        let first = book.candidates(&represented, &[], Instant::now())[0].clone();
        assert_eq!(first.as_ref(), "https://b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_and_recency_break_ties() {
        let mut book = book();
        let now = Instant::now();
        book.record_failure("https://a");
        book.record_attempt("https://b", now);

        assert_eq!(
            names(book.candidates(&HashSet::new(), &[], now)),
            vec!["https://c", "https://b", "https://a"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_avoided_endpoint_is_last_resort() {
        let book = book();
        let candidates = book.candidates(&HashSet::new(), &["https://a"], Instant::now());
        assert_eq!(candidates.last().map(|e| e.as_ref()), Some("https://a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quarantine_expires() {
        let mut book = book();
        book.quarantine("https://b", Instant::now());

        let now = Instant::now();
        let candidates = names(book.candidates(&HashSet::new(), &[], now));
        assert!(!candidates.contains(&"https://b".to_string()));
        assert_eq!(book.unhealthy(now), vec!["https://b"]);

        tokio::time::advance(Duration::from_secs(61)).await;
        let now = Instant::now();
        assert_eq!(book.candidates(&HashSet::new(), &[], now).len(), 3);
        assert!(book.unhealthy(now).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_failures_mark_unhealthy_until_success() {
        let mut book = book();
        for _ in 0..UNHEALTHY_AFTER_FAILURES {
            book.record_failure("https://c");
        }
        assert_eq!(book.unhealthy(Instant::now()), vec!["https://c"]);

        book.record_success("https://c");
        assert!(book.unhealthy(Instant::now()).is_empty());
        assert_eq!(book.stats(Instant::now())[2].total_failures, 5);
    }

    #[test]
    fn test_duplicate_endpoints_collapse() {
        let book = EndpointBook::new(
            &["https://a".to_string(), "https://a".to_string()],
            Duration::from_secs(1),
        );
        assert_eq!(book.records.len(), 1);
    }
}
