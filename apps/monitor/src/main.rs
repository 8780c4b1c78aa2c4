mod config;

use chainbot_rpc_pool::{ConnectionManager, HttpConnector};
use config::Config;
use serde_json::json;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

fn init_tracing() {
    let log_format = std::env::var("CHAINBOT_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if log_format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_current_span(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_line_number(true))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing();

    let connector = HttpConnector::default()
        .with_request_timeout(config.rpc.manager.connection_timeout)
        .with_probe_method(config.probe_method.as_str());
    let manager = ConnectionManager::new(config.rpc.clone(), connector)?;
    manager.start().await?;
    info!(
        "Monitoring {} endpoints, reporting every {:?}",
        config.rpc.pool.endpoints.len(),
        config.report_interval
    );

    let mut ticker = tokio::time::interval(config.report_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => report(&manager, &config.call_method).await,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    manager.shutdown();
    Ok(())
}

/// Make one call through the pool and log what the layer looks like.
async fn report(manager: &ConnectionManager<HttpConnector>, method: &str) {
    let result = manager
        .with_connection(|conn| async move { conn.handle.call(method, json!([])).await })
        .await;
    match result {
        Ok(value) => info!("{} -> {}", method, value),
        Err(e) => warn!("{} failed: {}", method, e),
    }

    let stats = manager.get_pool_stats();
    info!(
        total = stats.total,
        active = stats.active,
        idle = stats.idle,
        pending = stats.pending,
        "Pool stats"
    );
    if let Ok(detail) = serde_json::to_string(&stats) {
        debug!("Pool detail: {}", detail);
    }

    let unhealthy = manager.get_unhealthy_endpoints();
    if !unhealthy.is_empty() {
        warn!("Unhealthy endpoints: {}", unhealthy.join(", "));
    }
    for circuit in manager.circuit_metrics() {
        debug!(
            "Circuit {}: {} ({} failures)",
            circuit.domain, circuit.state, circuit.failure_count
        );
    }
}
