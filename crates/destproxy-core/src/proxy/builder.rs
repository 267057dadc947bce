//! Outbound request construction: target URL, injected credentials and the
//! SAP header allow-list.

use super::messages::JsonRpcRequest;
use super::redact::{redact_headers, redact_json};
use crate::auth::{ConnectionConfig, TokenCache};
use crate::error::{ProxyError, Result};
use crate::routing::{RoutingDecision, RoutingStrategy};
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Path segment identifying a streaming JSON-RPC endpoint.
pub const STREAM_SEGMENT: &str = "/mcp/stream";
/// Path appended to bare service URLs.
pub const STREAM_HTTP_PATH: &str = "/mcp/stream/http";
/// Accept header sent on every outbound request.
pub const OUTBOUND_ACCEPT: &str = "application/json, application/x-ndjson, text/event-stream";
/// SAP headers copied from the inbound request unchanged.
pub const PRESERVED_SAP_HEADERS: [&str; 3] = ["x-sap-client", "x-sap-language", "x-sap-tenant"];

const SAP_CLIENT_HEADER: &str = "x-sap-client";

/// What the proxy knows about the inbound HTTP request.
#[derive(Debug, Clone, Default)]
pub struct InboundContext {
    /// Request path, appended to explicit target URLs.
    pub path: String,
    /// Inbound headers.
    pub headers: HeaderMap,
}

impl InboundContext {
    /// Context for `path` and `headers`.
    pub fn new(path: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            path: path.into(),
            headers,
        }
    }
}

/// A fully resolved upstream request.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// HTTP method (always POST for JSON-RPC).
    pub method: Method,
    /// Absolute target URL.
    pub url: String,
    /// Headers to send.
    pub headers: HeaderMap,
    /// JSON-RPC request body.
    pub body: Value,
}

impl OutboundRequest {
    /// Headers with credentials masked, for logging only.
    pub fn redacted_headers(&self) -> BTreeMap<String, String> {
        redact_headers(&self.headers)
    }

    /// Body with credential fields masked, for logging only.
    pub fn redacted_body(&self) -> Value {
        redact_json(&self.body)
    }
}

/// Join `base` and `path` with exactly one slash between them.
///
/// An empty path yields `base` unchanged.
pub fn join_url(base: &str, path: &str) -> String {
    if path.is_empty() {
        return base.to_string();
    }
    let base = base.strip_suffix('/').unwrap_or(base);
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// Streaming endpoint for a destination's service URL.
pub fn streaming_endpoint(service_url: &str) -> String {
    if has_stream_segment(service_url) {
        service_url.strip_suffix('/').unwrap_or(service_url).to_string()
    } else {
        join_url(service_url, STREAM_HTTP_PATH)
    }
}

/// Whether `url` contains [`STREAM_SEGMENT`] as whole path segments.
fn has_stream_segment(url: &str) -> bool {
    url.match_indices(STREAM_SEGMENT).any(|(start, segment)| {
        let rest = &url[start + segment.len()..];
        rest.is_empty() || rest.starts_with('/')
    })
}

/// Builds [`OutboundRequest`]s from routing decisions.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    tokens: Arc<TokenCache>,
}

impl RequestBuilder {
    /// Builder drawing tokens and connection metadata from `tokens`.
    pub fn new(tokens: Arc<TokenCache>) -> Self {
        Self { tokens }
    }

    /// The token cache in use.
    pub fn tokens(&self) -> &Arc<TokenCache> {
        &self.tokens
    }

    /// Build the outbound request for one attempt.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::TokenAcquisition`] when a destination token cannot be
    /// obtained, or [`ProxyError::TargetUrlUndetermined`] when neither an
    /// explicit URL nor a destination service URL is available.
    pub async fn build(
        &self,
        request: &JsonRpcRequest,
        decision: &RoutingDecision,
        inbound: &InboundContext,
        force_token_refresh: bool,
    ) -> Result<OutboundRequest> {
        if decision.strategy() == RoutingStrategy::Unknown {
            return Err(ProxyError::TargetUrlUndetermined(decision.reason().to_string()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static(OUTBOUND_ACCEPT));

        let explicit_url = decision.explicit_target_url();
        let mut connection = None;

        if let Some(destination) = decision.destination() {
            let token = self.tokens.get_token(destination, force_token_refresh).await?;
            headers.insert(AUTHORIZATION, bearer(destination, &token)?);
            connection = self.connection_config(destination, explicit_url.is_some()).await?;
        } else if let Some(auth) = inbound.headers.get(AUTHORIZATION) {
            headers.insert(AUTHORIZATION, auth.clone());
        }

        let url = match (explicit_url, connection.as_ref().and_then(|c| c.service_url.as_deref())) {
            (Some(explicit), _) => join_url(explicit, &inbound.path),
            (None, Some(service_url)) => streaming_endpoint(service_url),
            (None, None) => {
                let reason = match decision.destination() {
                    Some(destination) => {
                        format!("destination '{destination}' has no service URL and no x-mcp-url was supplied")
                    }
                    None => "no destination or x-mcp-url header and no configured target".to_string(),
                };
                return Err(ProxyError::TargetUrlUndetermined(reason));
            }
        };

        for name in PRESERVED_SAP_HEADERS {
            if let Some(value) = inbound.headers.get(name) {
                headers.insert(HeaderName::from_static(name), value.clone());
            }
        }
        if !headers.contains_key(SAP_CLIENT_HEADER) {
            let client = connection.as_ref().and_then(|c| c.sap_client.as_deref());
            if let Some(value) = client.and_then(|c| HeaderValue::from_str(c).ok()) {
                headers.insert(HeaderName::from_static(SAP_CLIENT_HEADER), value);
            }
        }

        let outbound = OutboundRequest {
            method: Method::POST,
            url,
            headers,
            body: serde_json::to_value(request)?,
        };
        debug!(
            url = %outbound.url,
            strategy = ?decision.strategy(),
            headers = ?outbound.redacted_headers(),
            "Built outbound request"
        );
        Ok(outbound)
    }

    /// Connection metadata for `destination`. With an explicit URL the
    /// metadata is optional and lookup failures are ignored.
    async fn connection_config(
        &self,
        destination: &str,
        has_explicit_url: bool,
    ) -> Result<Option<ConnectionConfig>> {
        let lookup = async {
            let broker = self.tokens.registry().get_or_create(destination).await?;
            broker.get_connection_config(destination).await
        };
        match lookup.await {
            Ok(config) => Ok(Some(config)),
            Err(e) if has_explicit_url => {
                debug!(destination = %destination, error = %e, "Connection config unavailable");
                Ok(None)
            }
            Err(e) => Err(ProxyError::TargetUrlUndetermined(format!(
                "connection config for destination '{destination}' unavailable: {e}"
            ))),
        }
    }
}

fn bearer(destination: &str, token: &str) -> Result<HeaderValue> {
    let mut value =
        HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| ProxyError::TokenAcquisition {
            destination: destination.to_string(),
            message: "token contains characters not allowed in an HTTP header".to_string(),
            status: None,
        })?;
    value.set_sensitive(true);
    Ok(value)
}
