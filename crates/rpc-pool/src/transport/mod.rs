//! Concrete [`Connector`](crate::pool::Connector) implementations.

mod http;

pub use http::{HttpConnector, HttpRpcClient, DEFAULT_PROBE_METHOD};
