//! Connection pooling across interchangeable endpoints.
//!
//! This module provides:
//! - [`Connector`]: How connections are opened and probed
//! - [`ConnectionPool`]: Selection, growth, replacement and maintenance
//! - [`HealthChecker`]: Liveness probes with rolling stats
//! - [`Lease`]: Exclusive use of a connection, released on drop

mod connection;
mod endpoints;
mod health;
#[allow(clippy::module_inception)]
mod pool;

pub use connection::{
    ConnectionRef, ConnectionSnapshot, ConnectionStats, Connector, Endpoint, Lease,
    PooledConnection,
};
pub use endpoints::EndpointStats;
pub use health::{HealthCheck, HealthChecker, MAX_ERROR_COUNT};
pub use pool::{ConnectionPool, MaintenanceReport, PoolStats};
