//! Top-level request handling: circuit breaker, retries, forced token refresh
//! and error normalization.

use super::builder::{InboundContext, RequestBuilder};
use super::messages::{CIRCUIT_OPEN_CODE, GENERIC_ERROR_CODE, JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use super::upstream::{UpstreamClient, UpstreamResponse};
use crate::auth::TokenCache;
use crate::error::{ProxyError, Result};
use crate::resilience::{CircuitBreaker, RetryExecutor, RetryPolicy};
use crate::routing::RoutingDecision;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Longest upstream body excerpt carried in an error message.
const MAX_BODY_EXCERPT: usize = 200;

/// Forwards JSON-RPC requests and always answers with a JSON-RPC envelope.
pub struct ProxyOrchestrator {
    builder: RequestBuilder,
    upstream: Arc<dyn UpstreamClient>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryExecutor,
}

impl std::fmt::Debug for ProxyOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyOrchestrator")
            .field("builder", &self.builder)
            .field("upstream", &"<UpstreamClient>")
            .field("breaker", &self.breaker)
            .field("retry", &self.retry)
            .finish()
    }
}

impl ProxyOrchestrator {
    /// Create an orchestrator.
    ///
    /// # Arguments
    ///
    /// * `tokens` - Token cache for destination credentials
    /// * `upstream` - HTTP send implementation
    /// * `breaker` - Breaker shared by every request of this proxy
    /// * `retry` - Policy applied to each build-and-send attempt
    pub fn new(
        tokens: Arc<TokenCache>,
        upstream: Arc<dyn UpstreamClient>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            builder: RequestBuilder::new(tokens),
            upstream,
            breaker,
            retry: RetryExecutor::new(retry),
        }
    }

    /// The shared circuit breaker.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// The token cache used for destination credentials.
    pub fn token_cache(&self) -> &Arc<TokenCache> {
        self.builder.tokens()
    }

    /// Forward `request` according to `decision`.
    ///
    /// Never fails: every outcome, including an open circuit, is expressed as
    /// a JSON-RPC response.
    pub async fn proxy_request(
        &self,
        request: &JsonRpcRequest,
        decision: &RoutingDecision,
        inbound: &InboundContext,
    ) -> JsonRpcResponse {
        if !self.breaker.can_proceed() {
            let snapshot = self.breaker.snapshot();
            warn!(method = %request.method, state = %snapshot.state, "Circuit open, rejecting request");
            return JsonRpcResponse::failure(
                request.id.clone(),
                JsonRpcError::new(
                    CIRCUIT_OPEN_CODE,
                    "Service temporarily unavailable",
                    Some(json!({ "circuitBreaker": snapshot })),
                ),
            );
        }

        if let (Some(destination), Some(url)) = (decision.destination(), decision.explicit_target_url()) {
            self.token_cache()
                .registry()
                .ensure_session_service_url(destination, url)
                .await;
        }

        let result = self
            .retry
            .run(|| self.attempt(request, decision, inbound, false))
            .await;

        let err = match result {
            Ok(response) => {
                self.breaker.record_success();
                return response;
            }
            Err(err) => err,
        };

        self.breaker.record_failure();
        let err = if err.is_token_expiry() {
            info!(
                method = %request.method,
                destination = decision.destination().unwrap_or("-"),
                error = %err,
                "Retrying once with a refreshed token"
            );
            match self.attempt(request, decision, inbound, true).await {
                Ok(response) => {
                    self.breaker.record_success();
                    return response;
                }
                Err(refresh_err) => refresh_err,
            }
        } else {
            err
        };

        warn!(
            method = %request.method,
            strategy = ?decision.strategy(),
            error = %err,
            "Proxy request failed"
        );
        self.error_response(request, &err)
    }

    /// One build-and-send attempt. Non-2xx answers become [`ProxyError::Upstream`].
    async fn attempt(
        &self,
        request: &JsonRpcRequest,
        decision: &RoutingDecision,
        inbound: &InboundContext,
        force_token_refresh: bool,
    ) -> Result<JsonRpcResponse> {
        let outbound = self
            .builder
            .build(request, decision, inbound, force_token_refresh)
            .await?;
        debug!(url = %outbound.url, body = %outbound.redacted_body(), "Forwarding request");

        let response = self.upstream.send(&outbound).await?;
        if !response.is_success() {
            return Err(status_error(&response));
        }
        decode_body(&response, request.id.clone())
    }

    fn error_response(&self, request: &JsonRpcRequest, err: &ProxyError) -> JsonRpcResponse {
        let code = err.status_code().map_or(GENERIC_ERROR_CODE, i32::from);
        let mut data = Map::new();
        data.insert("circuitBreaker".to_string(), json!(self.breaker.snapshot()));
        if let Some(body) = err.upstream_body() {
            data.insert("upstreamError".to_string(), body.clone());
        }
        JsonRpcResponse::failure(
            request.id.clone(),
            JsonRpcError::new(code, err.to_string(), Some(Value::Object(data))),
        )
    }
}

fn status_error(response: &UpstreamResponse) -> ProxyError {
    let reason = http::StatusCode::from_u16(response.status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Upstream error");
    let text = String::from_utf8_lossy(&response.body);
    let text = text.trim();

    let message = if text.is_empty() {
        reason.to_string()
    } else {
        let excerpt: String = text.chars().take(MAX_BODY_EXCERPT).collect();
        format!("{reason}: {excerpt}")
    };
    let body = if text.is_empty() {
        None
    } else {
        Some(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())))
    };

    ProxyError::Upstream {
        status: response.status,
        message,
        body,
    }
}

/// Decode a successful upstream body into a response envelope.
///
/// NDJSON bodies contribute their last non-empty line and event streams their
/// last `data:` payload. An empty body is a `null` result.
///
/// # Errors
///
/// Returns [`ProxyError::InvalidResponse`] if the payload is not JSON.
pub fn decode_body(response: &UpstreamResponse, fallback_id: Option<Value>) -> Result<JsonRpcResponse> {
    let text = std::str::from_utf8(&response.body)
        .map_err(|e| ProxyError::InvalidResponse(format!("body is not UTF-8: {e}")))?;
    let content_type = response.content_type.as_deref().unwrap_or("").to_lowercase();

    let payload = if content_type.contains("text/event-stream") {
        text.lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(str::trim)
            .filter(|data| !data.is_empty())
            .last()
    } else if content_type.contains("application/x-ndjson") {
        text.lines().map(str::trim).filter(|line| !line.is_empty()).last()
    } else {
        Some(text.trim()).filter(|t| !t.is_empty())
    };

    let Some(payload) = payload else {
        return Ok(JsonRpcResponse::success(fallback_id, Value::Null));
    };
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| ProxyError::InvalidResponse(format!("upstream body is not JSON: {e}")))?;
    Ok(JsonRpcResponse::from_upstream(value, fallback_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::builder::OutboundRequest;
    use crate::proxy::test_support::{FakeBroker, token_cache, token_cache_with_policy};
    use crate::resilience::CircuitState;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::HeaderMap;
    use http::header::AUTHORIZATION;
    use std::sync::Mutex;
    use std::time::Duration;

    type Responder = Box<dyn Fn(usize) -> Result<UpstreamResponse> + Send + Sync>;

    /// Upstream answering call `n` with `respond(n)` and recording every request.
    struct ScriptedUpstream {
        respond: Responder,
        seen: Mutex<Vec<OutboundRequest>>,
    }

    impl ScriptedUpstream {
        fn new(respond: impl Fn(usize) -> Result<UpstreamResponse> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                respond: Box::new(respond),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<OutboundRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UpstreamClient for ScriptedUpstream {
        async fn send(&self, request: &OutboundRequest) -> Result<UpstreamResponse> {
            let call = {
                let mut seen = self.seen.lock().unwrap();
                seen.push(request.clone());
                seen.len() - 1
            };
            (self.respond)(call)
        }
    }

    fn json_response(status: u16, body: Value) -> UpstreamResponse {
        UpstreamResponse {
            status,
            content_type: Some("application/json".to_string()),
            body: Bytes::from(body.to_string()),
        }
    }

    fn ok_result() -> UpstreamResponse {
        json_response(200, json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": []}}))
    }

    fn orchestrator(
        broker: &Arc<FakeBroker>,
        upstream: Arc<ScriptedUpstream>,
        breaker: Arc<CircuitBreaker>,
    ) -> ProxyOrchestrator {
        let policy = RetryPolicy {
            max_retries: 2,
            retry_delay: Duration::from_millis(100),
            ..RetryPolicy::default()
        };
        ProxyOrchestrator::new(token_cache(broker), upstream, breaker, policy)
    }

    fn request() -> JsonRpcRequest {
        JsonRpcRequest::new("tools/list", None, Some(json!(1)))
    }

    fn destination_decision() -> RoutingDecision {
        RoutingDecision::proxy(Some("btp-cloud".to_string()), None, "x-btp-destination header")
    }

    #[tokio::test]
    async fn test_destination_request_is_forwarded_with_bearer() {
        let broker = FakeBroker::new("btp-token-123", Some("https://target.example.com"));
        let upstream = ScriptedUpstream::new(|_| Ok(ok_result()));
        let proxy = orchestrator(&broker, Arc::clone(&upstream), Arc::new(CircuitBreaker::default()));

        let response = proxy
            .proxy_request(&request(), &destination_decision(), &InboundContext::default())
            .await;

        assert_eq!(response.result, Some(json!({"tools": []})));
        assert_eq!(response.id, Some(json!(1)));
        let sent = upstream.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].url, "https://target.example.com/mcp/stream/http");
        assert_eq!(sent[0].headers[AUTHORIZATION], "Bearer btp-token-123");
    }

    #[tokio::test]
    async fn test_repeated_requests_share_cached_token() {
        let broker = FakeBroker::new("btp-token-123", Some("https://target.example.com"));
        let upstream = ScriptedUpstream::new(|_| Ok(ok_result()));
        let proxy = orchestrator(&broker, Arc::clone(&upstream), Arc::new(CircuitBreaker::default()));

        for _ in 0..2 {
            let response = proxy
                .proxy_request(&request(), &destination_decision(), &InboundContext::default())
                .await;
            assert!(!response.is_error());
        }

        assert_eq!(broker.calls(), 1);
        assert_eq!(upstream.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_failure_exhausts_retries() {
        let broker = FakeBroker::new("tok", Some("https://target.example.com"));
        let upstream = ScriptedUpstream::new(|_| Err(ProxyError::Network("connection refused".to_string())));
        let breaker = Arc::new(CircuitBreaker::default());
        let proxy = orchestrator(&broker, Arc::clone(&upstream), Arc::clone(&breaker));

        let response = proxy
            .proxy_request(&request(), &destination_decision(), &InboundContext::default())
            .await;

        let error = response.error.unwrap();
        assert_eq!(error.code, GENERIC_ERROR_CODE);
        assert!(error.message.contains("connection refused"));
        assert_eq!(error.data.unwrap()["circuitBreaker"]["consecutiveFailures"], 1);
        assert_eq!(upstream.requests().len(), 3);
        assert_eq!(breaker.snapshot().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_endpoint_failure_is_generic_and_not_retried_twice() {
        let broker = FakeBroker::failing(503, "https://target.example.com");
        let upstream = ScriptedUpstream::new(|_| Ok(ok_result()));
        let policy = RetryPolicy {
            max_retries: 1,
            retry_delay: Duration::from_millis(100),
            ..RetryPolicy::default()
        };
        let proxy = ProxyOrchestrator::new(
            token_cache_with_policy(&broker, policy.clone()),
            Arc::clone(&upstream) as Arc<dyn UpstreamClient>,
            Arc::new(CircuitBreaker::default()),
            policy,
        );

        let response = proxy
            .proxy_request(&request(), &destination_decision(), &InboundContext::default())
            .await;

        let error = response.error.unwrap();
        assert_eq!(error.code, GENERIC_ERROR_CODE);
        assert!(error.message.contains("HTTP 503"));
        assert_eq!(broker.calls(), 2);
        assert!(upstream.requests().is_empty());
    }

    #[tokio::test]
    async fn test_open_circuit_short_circuits() {
        let broker = FakeBroker::new("tok", Some("https://target.example.com"));
        let upstream = ScriptedUpstream::new(|_| Ok(ok_result()));
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(60)));
        breaker.record_failure();
        let proxy = orchestrator(&broker, Arc::clone(&upstream), breaker);

        let response = proxy
            .proxy_request(&request(), &destination_decision(), &InboundContext::default())
            .await;

        let error = response.error.unwrap();
        assert_eq!(error.code, CIRCUIT_OPEN_CODE);
        assert_eq!(error.message, "Service temporarily unavailable");
        assert_eq!(error.data.unwrap()["circuitBreaker"]["state"], "open");
        assert_eq!(broker.calls(), 0);
        assert!(upstream.requests().is_empty());
    }

    #[tokio::test]
    async fn test_expired_token_gets_one_forced_refresh() {
        let broker = FakeBroker::new("tok", Some("https://target.example.com"));
        let upstream = ScriptedUpstream::new(|call| {
            if call == 0 {
                Ok(json_response(401, json!({"error": "invalid_token"})))
            } else {
                Ok(ok_result())
            }
        });
        let breaker = Arc::new(CircuitBreaker::default());
        let proxy = orchestrator(&broker, Arc::clone(&upstream), Arc::clone(&breaker));

        let response = proxy
            .proxy_request(&request(), &destination_decision(), &InboundContext::default())
            .await;

        assert!(!response.is_error());
        let sent = upstream.requests();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].headers[AUTHORIZATION], "Bearer tok");
        assert_eq!(sent[1].headers[AUTHORIZATION], "Bearer tok-1");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_persistent_unauthorized_refreshes_only_once() {
        let broker = FakeBroker::new("tok", Some("https://target.example.com"));
        let upstream = ScriptedUpstream::new(|_| Ok(json_response(401, json!({"error": "invalid_token"}))));
        let proxy = orchestrator(&broker, Arc::clone(&upstream), Arc::new(CircuitBreaker::default()));

        let response = proxy
            .proxy_request(&request(), &destination_decision(), &InboundContext::default())
            .await;

        let error = response.error.unwrap();
        assert_eq!(error.code, 401);
        assert_eq!(upstream.requests().len(), 2);
        assert_eq!(broker.calls(), 2);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried_and_body_is_forwarded() {
        let broker = FakeBroker::new("tok", Some("https://target.example.com"));
        let upstream = ScriptedUpstream::new(|_| Ok(json_response(404, json!({"detail": "no such endpoint"}))));
        let proxy = orchestrator(&broker, Arc::clone(&upstream), Arc::new(CircuitBreaker::default()));

        let response = proxy
            .proxy_request(&request(), &destination_decision(), &InboundContext::default())
            .await;

        let error = response.error.unwrap();
        assert_eq!(error.code, 404);
        assert_eq!(
            error.data.unwrap()["upstreamError"],
            json!({"detail": "no such endpoint"})
        );
        assert_eq!(upstream.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_upstream_jsonrpc_error_passes_through() {
        let broker = FakeBroker::new("tok", Some("https://target.example.com"));
        let upstream = ScriptedUpstream::new(|_| {
            Ok(json_response(
                200,
                json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32601, "message": "Method not found"}}),
            ))
        });
        let breaker = Arc::new(CircuitBreaker::default());
        let proxy = orchestrator(&broker, upstream, Arc::clone(&breaker));

        let response = proxy
            .proxy_request(&request(), &destination_decision(), &InboundContext::default())
            .await;

        assert_eq!(response.error.unwrap().code, -32601);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_unroutable_request_yields_generic_error() {
        let broker = FakeBroker::new("tok", None);
        let upstream = ScriptedUpstream::new(|_| Ok(ok_result()));
        let proxy = orchestrator(&broker, Arc::clone(&upstream), Arc::new(CircuitBreaker::default()));

        let response = proxy
            .proxy_request(
                &request(),
                &RoutingDecision::unknown("no destination"),
                &InboundContext::default(),
            )
            .await;

        let error = response.error.unwrap();
        assert_eq!(error.code, GENERIC_ERROR_CODE);
        assert!(error.message.contains("no destination"));
        assert!(upstream.requests().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_url_seeds_broker_session() {
        let broker = FakeBroker::new("tok", None);
        let upstream = ScriptedUpstream::new(|_| Ok(ok_result()));
        let proxy = orchestrator(&broker, Arc::clone(&upstream), Arc::new(CircuitBreaker::default()));
        let decision = RoutingDecision::proxy(
            Some("dest".to_string()),
            Some("https://explicit.example.com".to_string()),
            "headers",
        );

        let response = proxy
            .proxy_request(&request(), &decision, &InboundContext::new("/mcp", HeaderMap::new()))
            .await;

        assert!(!response.is_error());
        assert_eq!(upstream.requests()[0].url, "https://explicit.example.com/mcp");
        let sessions = broker.sessions.lock().unwrap();
        assert_eq!(sessions[0].service_url, "https://explicit.example.com");
    }

    #[test]
    fn test_decode_event_stream_takes_last_data() {
        let response = UpstreamResponse {
            status: 200,
            content_type: Some("text/event-stream".to_string()),
            body: Bytes::from(
                "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":\"partial\"}\n\n\
                 event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":\"final\"}\n\n",
            ),
        };
        let decoded = decode_body(&response, Some(json!(1))).unwrap();
        assert_eq!(decoded.result, Some(json!("final")));
    }

    #[test]
    fn test_decode_ndjson_takes_last_line() {
        let response = UpstreamResponse {
            status: 200,
            content_type: Some("application/x-ndjson".to_string()),
            body: Bytes::from("{\"progress\":1}\n{\"jsonrpc\":\"2.0\",\"id\":5,\"result\":42}\n\n"),
        };
        let decoded = decode_body(&response, Some(json!(1))).unwrap();
        assert_eq!(decoded.result, Some(json!(42)));
        assert_eq!(decoded.id, Some(json!(5)));
    }

    #[test]
    fn test_decode_rejects_non_json() {
        let response = UpstreamResponse {
            status: 200,
            content_type: Some("text/html".to_string()),
            body: Bytes::from("<html></html>"),
        };
        let err = decode_body(&response, None).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidResponse(_)));
    }

    #[test]
    fn test_decode_empty_body_is_null_result() {
        let response = UpstreamResponse {
            status: 202,
            content_type: None,
            body: Bytes::new(),
        };
        let decoded = decode_body(&response, Some(json!(4))).unwrap();
        assert_eq!(decoded.result, Some(Value::Null));
        assert_eq!(decoded.id, Some(json!(4)));
    }
}
