//! HTTP send seam between the orchestrator and upstream JSON-RPC servers.

use super::builder::OutboundRequest;
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::debug;

/// Default per-request timeout for upstream calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Raw upstream answer, whatever its status.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    /// HTTP status code.
    pub status: u16,
    /// `Content-Type` header, if any.
    pub content_type: Option<String>,
    /// Response body.
    pub body: Bytes,
}

impl UpstreamResponse {
    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends outbound requests.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Send `request` and return the upstream's response.
    ///
    /// Only failures that produced no response are errors; non-2xx statuses
    /// are returned as responses.
    async fn send(&self, request: &OutboundRequest) -> Result<UpstreamResponse>;
}

/// [`UpstreamClient`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    /// Client whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Config`] if the HTTP client cannot be initialized.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProxyError::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstream {
    async fn send(&self, request: &OutboundRequest) -> Result<UpstreamResponse> {
        let body = serde_json::to_vec(&request.body)?;
        let response = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone())
            .body(body)
            .send()
            .await
            .map_err(|e| ProxyError::Network(format!("{} ({})", e, request.url)))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| ProxyError::Network(format!("Failed to read response body: {e}")))?;

        debug!(url = %request.url, status, bytes = body.len(), "Upstream responded");
        Ok(UpstreamResponse {
            status,
            content_type,
            body,
        })
    }
}
