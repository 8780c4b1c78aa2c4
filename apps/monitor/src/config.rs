use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chainbot_rpc_pool::RpcConfig;

const DEFAULT_CALL_METHOD: &str = "getSlot";
const DEFAULT_PROBE_METHOD: &str = "getHealth";
const DEFAULT_REPORT_INTERVAL_MS: u64 = 30_000;

pub struct Config {
    pub rpc: RpcConfig,
    /// Method the connector uses for liveness probes.
    pub probe_method: String,
    /// Method the monitor calls through `with_connection` every report.
    pub call_method: String,
    pub report_interval: Duration,
}

impl Config {
    /// Load `CHAINBOT_RPC_CONFIG` (a JSON file) if set, then apply
    /// `CHAINBOT_*` overrides on top.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut rpc = match std::env::var("CHAINBOT_RPC_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read CHAINBOT_RPC_CONFIG at {}", path))?;
                RpcConfig::from_json(&raw)?
            }
            Err(_) => RpcConfig::default(),
        };

        if let Ok(endpoints) = std::env::var("CHAINBOT_RPC_ENDPOINTS") {
            rpc.pool.endpoints = endpoints
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(min) = parse_env("CHAINBOT_MIN_CONNECTIONS")? {
            rpc.pool.min_connections = min;
        }
        if let Some(max) = parse_env("CHAINBOT_MAX_CONNECTIONS")? {
            rpc.pool.max_connections = max;
        }
        if let Some(ms) = parse_env("CHAINBOT_HEALTH_CHECK_INTERVAL_MS")? {
            rpc.pool.health_check_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env("CHAINBOT_CONNECTION_TIMEOUT_MS")? {
            rpc.manager.connection_timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = parse_env("CHAINBOT_MAX_RETRIES")? {
            rpc.manager.max_retries = retries;
        }
        if let Some(rps) = parse_env("CHAINBOT_MAX_REQUESTS_PER_SECOND")? {
            rpc.rate_limit.max_requests_per_second = rps;
        }
        rpc.validate()?;

        let probe_method = std::env::var("CHAINBOT_PROBE_METHOD")
            .unwrap_or_else(|_| DEFAULT_PROBE_METHOD.to_string());
        let call_method = std::env::var("CHAINBOT_CALL_METHOD")
            .unwrap_or_else(|_| DEFAULT_CALL_METHOD.to_string());
        let report_interval = report_interval(
            parse_env("CHAINBOT_REPORT_INTERVAL_MS")?.unwrap_or(DEFAULT_REPORT_INTERVAL_MS),
        )?;

        Ok(Self {
            rpc,
            probe_method,
            call_method,
            report_interval,
        })
    }
}

fn report_interval(ms: u64) -> anyhow::Result<Duration> {
    anyhow::ensure!(ms > 0, "CHAINBOT_REPORT_INTERVAL_MS must be greater than zero");
    Ok(Duration::from_millis(ms))
}

/// `Ok(None)` when unset, an error when set but unparseable.
fn parse_env<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid {}: '{}'", name, raw)),
        Err(_) => Ok(None),
    }
}
