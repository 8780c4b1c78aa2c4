//! JSON-RPC 2.0 over HTTP.
//!
//! Each pooled connection owns its own `reqwest::Client`, so keep-alive
//! sockets are never shared between pooled connections. The connector only
//! frames requests and maps failures; method semantics stay with callers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::errors::{Result, RpcError};
use crate::pool::{Connector, Endpoint};

/// Default probe method; a cheap read-only call on Solana-style nodes.
pub const DEFAULT_PROBE_METHOD: &str = "getHealth";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest error body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

// ============================================================================
// Wire Structures
// ============================================================================

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

// ============================================================================
// Client
// ============================================================================

/// A JSON-RPC client bound to one endpoint. Cheap to clone.
#[derive(Clone, Debug)]
pub struct HttpRpcClient {
    client: Client,
    endpoint: Endpoint,
    url: Url,
    next_id: Arc<AtomicU64>,
}

impl HttpRpcClient {
    pub fn new(client: Client, endpoint: Endpoint) -> Result<Self> {
        let url = Url::parse(&endpoint).map_err(|e| {
            RpcError::InvalidConfig(format!("invalid endpoint '{}': {}", endpoint, e))
        })?;
        Ok(Self {
            client,
            endpoint,
            url,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send one JSON-RPC request and return its `result`.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        debug!("RPC request: {} {} (id {})", self.endpoint, method, request.id);

        let response = self
            .client
            .post(self.url.clone())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            truncate(&mut body, MAX_ERROR_BODY);
            return Err(RpcError::Http {
                endpoint: self.endpoint.to_string(),
                status: status.as_u16(),
                message: body,
            });
        }

        let envelope: RpcResponse = response.json().await?;
        if let Some(error) = envelope.error {
            return Err(RpcError::Rpc {
                endpoint: self.endpoint.to_string(),
                code: error.code,
                message: error.message,
            });
        }
        Ok(envelope.result.unwrap_or(Value::Null))
    }
}

fn truncate(body: &mut String, max: usize) {
    if body.len() > max {
        let mut end = max;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Opens [`HttpRpcClient`]s and probes them with a read-only method.
#[derive(Clone, Debug)]
pub struct HttpConnector {
    request_timeout: Duration,
    probe_method: String,
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            probe_method: DEFAULT_PROBE_METHOD.to_string(),
        }
    }
}

impl HttpConnector {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_probe_method(mut self, method: impl Into<String>) -> Self {
        self.probe_method = method.into();
        self
    }
}

#[async_trait]
impl Connector for HttpConnector {
    type Handle = HttpRpcClient;

    async fn connect(&self, endpoint: &Endpoint) -> Result<HttpRpcClient> {
        let client = Client::builder()
            .timeout(self.request_timeout)
            .pool_max_idle_per_host(1)
            .build()?;
        HttpRpcClient::new(client, endpoint.clone())
    }

    async fn probe(&self, handle: &HttpRpcClient) -> Result<()> {
        handle
            .call(&self.probe_method, Value::Array(Vec::new()))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_framing() {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: 7,
            method: "getSlot",
            params: json!([{ "commitment": "confirmed" }]),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": "getSlot",
                "params": [{ "commitment": "confirmed" }]
            })
        );
    }

    #[test]
    fn test_response_parsing() {
        let ok: RpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":42}"#).unwrap();
        assert_eq!(ok.result, Some(json!(42)));
        assert!(ok.error.is_none());

        let err: RpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32005,"message":"Node is behind"}}"#,
        )
        .unwrap();
        let error = err.error.unwrap();
        assert_eq!(error.code, -32005);
        assert_eq!(error.message, "Node is behind");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let mut body = "ééé".to_string();
        truncate(&mut body, 3);
        assert_eq!(body, "é");
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let connector = HttpConnector::default();
        let result = connector.connect(&Arc::from("not a url")).await;
        assert!(matches!(result, Err(RpcError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_connect_builds_client() {
        let connector = HttpConnector::default().with_probe_method("getVersion");
        let client = connector
            .connect(&Arc::from("https://rpc.example"))
            .await
            .unwrap();
        assert_eq!(client.endpoint().as_ref(), "https://rpc.example");
        assert_eq!(connector.probe_method, "getVersion");
    }
}
