//! In-memory connector and config helpers shared by the scenario tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chainbot_rpc_pool::{Connector, Endpoint, Result, RpcConfig, RpcError};

pub const A: &str = "https://rpc-a.example";
pub const B: &str = "https://rpc-b.example";
pub const C: &str = "https://rpc-c.example";

/// How a mock endpoint responds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Behavior {
    #[default]
    Healthy,
    /// Connects fine, every probe fails with a connection reset.
    FailProbes,
    /// Refuses every connection attempt.
    RefuseConnect,
    /// Probes fail with a critical system error.
    Critical,
}

#[derive(Default)]
struct MockState {
    behaviors: Mutex<HashMap<String, Behavior>>,
    connects: Mutex<Vec<String>>,
    probes: AtomicUsize,
}

/// Connector whose handles are just the endpoint URL.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn set(&self, endpoint: &str, behavior: Behavior) {
        self.state
            .behaviors
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), behavior);
    }

    fn behavior(&self, endpoint: &str) -> Behavior {
        self.state
            .behaviors
            .lock()
            .unwrap()
            .get(endpoint)
            .copied()
            .unwrap_or_default()
    }

    /// Endpoints passed to `connect`, in order.
    pub fn connects(&self) -> Vec<String> {
        self.state.connects.lock().unwrap().clone()
    }

    pub fn probes(&self) -> usize {
        self.state.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Handle = Endpoint;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Endpoint> {
        self.state.connects.lock().unwrap().push(endpoint.to_string());
        match self.behavior(endpoint) {
            Behavior::RefuseConnect => {
                Err(std::io::Error::from(ErrorKind::ConnectionRefused).into())
            }
            _ => Ok(endpoint.clone()),
        }
    }

    async fn probe(&self, handle: &Endpoint) -> Result<()> {
        self.state.probes.fetch_add(1, Ordering::SeqCst);
        match self.behavior(handle) {
            Behavior::Healthy => Ok(()),
            Behavior::FailProbes | Behavior::RefuseConnect => {
                Err(std::io::Error::from(ErrorKind::ConnectionReset).into())
            }
            Behavior::Critical => Err(RpcError::operation("out of memory")),
        }
    }
}

/// Config with short timings so paused-clock tests stay quick.
pub fn config(endpoints: &[&str], min: usize, max: usize) -> RpcConfig {
    let mut config = RpcConfig::with_endpoints(endpoints.iter().copied());
    config.pool.min_connections = min;
    config.pool.max_connections = max;
    config.pool.acquire_timeout = Duration::from_secs(2);
    config.pool.retry_delay = Duration::from_millis(10);
    config.pool.probe_timeout = Duration::from_millis(100);
    config.manager.connection_timeout = Duration::from_millis(500);
    config.rate_limit.max_requests_per_second = 1_000;
    config.rate_limit.retry_delay_base = Duration::from_millis(10);
    config.rate_limit.retry_delay_max = Duration::from_millis(100);
    config
}

pub fn rate_limited(endpoint: &str) -> RpcError {
    RpcError::RateLimited {
        endpoint: endpoint.to_string(),
    }
}

pub fn connection_reset() -> RpcError {
    std::io::Error::from(ErrorKind::ConnectionReset).into()
}
