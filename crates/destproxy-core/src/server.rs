//! HTTP/1.1 listener that feeds JSON-RPC requests into the orchestrator.
//!
//! `POST` on any path is a JSON-RPC call; `GET /health` reports the circuit
//! breaker; everything else is rejected with 405.

use crate::auth::{AuthBrokerRegistry, ServiceKeyBrokerFactory, TokenCache};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::proxy::{
    HttpUpstream, InboundContext, JsonRpcError, JsonRpcRequest, JsonRpcResponse, PARSE_ERROR_CODE,
    ProxyOrchestrator,
};
use crate::resilience::CircuitBreaker;
use crate::routing::RoutingResolver;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast};
use tokio::task::{JoinHandle, JoinSet};

/// Path of the health endpoint.
pub const HEALTH_PATH: &str = "/health";

/// Shared per-request handlers.
struct Handlers {
    resolver: RoutingResolver,
    orchestrator: ProxyOrchestrator,
}

/// The proxy's HTTP front end.
pub struct ProxyServer {
    handlers: Arc<Handlers>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: Option<JoinHandle<()>>,
    connections: Arc<Mutex<JoinSet<()>>>,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("resolver", &self.handlers.resolver)
            .field("orchestrator", &self.handlers.orchestrator)
            .field("local_addr", &self.local_addr)
            .field("accept_task", &self.accept_task.is_some())
            .finish()
    }
}

impl ProxyServer {
    /// Server for an already wired resolver and orchestrator.
    pub fn new(resolver: RoutingResolver, orchestrator: ProxyOrchestrator) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            handlers: Arc::new(Handlers {
                resolver,
                orchestrator,
            }),
            local_addr: None,
            shutdown_tx,
            accept_task: None,
            connections: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// Wire the full proxy from configuration: service-key brokers, token
    /// cache, reqwest upstream and one shared circuit breaker.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream HTTP client cannot be built.
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let factory = ServiceKeyBrokerFactory::new(config.service_key_dirs());
        let registry = Arc::new(AuthBrokerRegistry::new(Arc::new(factory)));
        let tokens = Arc::new(TokenCache::new(registry, config.retry_policy(), config.token_ttl()));
        let upstream = Arc::new(HttpUpstream::new(config.request_timeout())?);
        let orchestrator = ProxyOrchestrator::new(
            tokens,
            upstream,
            Arc::new(config.circuit_breaker()),
            config.retry_policy(),
        );
        let resolver = RoutingResolver::new(config.routing_overrides(), config.routing.policy);
        Ok(Self::new(resolver, orchestrator))
    }

    /// The shared circuit breaker.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.handlers.orchestrator.breaker()
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Connections still being served. Finished ones are reaped first.
    pub async fn open_connections(&self) -> usize {
        let mut connections = self.connections.lock().await;
        while connections.try_join_next().is_some() {}
        connections.len()
    }

    /// Bind `host:port` and start accepting connections in the background.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Io`] if the address cannot be bound.
    pub async fn start(&mut self, host: &str, port: u16) -> Result<SocketAddr> {
        let listener = TcpListener::bind((host, port)).await.map_err(|e| {
            ProxyError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to bind {host}:{port}: {e}"),
            ))
        })?;
        let addr = listener.local_addr()?;
        self.local_addr = Some(addr);
        tracing::info!(%addr, "Proxy listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handlers = Arc::clone(&self.handlers);
        let connections = Arc::clone(&self.connections);

        let accept_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                tracing::debug!(%peer, "New client connection");
                                let handlers = Arc::clone(&handlers);
                                let mut connections = connections.lock().await;
                                while connections.try_join_next().is_some() {}
                                connections.spawn(Self::handle_connection(stream, handlers));
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "Error accepting connection");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Shutdown signal received, stopping accept loop");
                        break;
                    }
                }
            }
        });

        self.accept_task = Some(accept_handle);
        Ok(addr)
    }

    /// Run until `shutdown` resolves, then stop.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn serve_until<F>(&mut self, host: &str, port: u16, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        self.start(host, port).await?;
        shutdown.await;
        self.stop().await;
        Ok(())
    }

    /// Stop accepting and abort open connections.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(accept_task) = self.accept_task.take() {
            accept_task.abort();
        }
        self.connections.lock().await.shutdown().await;
        self.local_addr = None;
        tracing::info!("Proxy stopped");
    }

    async fn handle_connection(stream: TcpStream, handlers: Arc<Handlers>) {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req: Request<Incoming>| {
            let handlers = Arc::clone(&handlers);
            async move { Ok::<_, Infallible>(handlers.handle(req).await) }
        });

        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
            tracing::warn!(error = %e, "Error serving connection");
        }
    }
}

impl Handlers {
    async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        match (req.method(), req.uri().path()) {
            (&Method::GET, HEALTH_PATH) => json_response(
                StatusCode::OK,
                &json!({
                    "status": "ok",
                    "circuitBreaker": self.orchestrator.breaker().snapshot(),
                }),
            ),
            (&Method::POST, _) => self.handle_rpc(req).await,
            _ => {
                let mut response = Response::new(Full::new(Bytes::from(
                    "Method not allowed. Use POST for JSON-RPC requests.",
                )));
                *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
                response
            }
        }
    }

    async fn handle_rpc(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let (parts, body) = req.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map_or_else(|| parts.uri.path().to_string(), |pq| pq.as_str().to_string());

        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read request body");
                return parse_error(&e.to_string());
            }
        };

        let request: JsonRpcRequest = match serde_json::from_slice(&bytes) {
            Ok(request) => request,
            Err(e) => return parse_error(&e.to_string()),
        };

        let decision = self.resolver.resolve(&parts.headers);
        let inbound = InboundContext::new(path, parts.headers);
        tracing::debug!(
            method = %request.method,
            strategy = ?decision.strategy(),
            reason = decision.reason(),
            "Handling JSON-RPC request"
        );

        let response = self.orchestrator.proxy_request(&request, &decision, &inbound).await;
        json_response(StatusCode::OK, &response)
    }
}

fn parse_error(detail: &str) -> Response<Full<Bytes>> {
    let body = JsonRpcResponse::failure(
        None,
        JsonRpcError::new(PARSE_ERROR_CODE, "Parse error", Some(json!({ "error": detail }))),
    );
    json_response(StatusCode::BAD_REQUEST, &body)
}

fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(bytes)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
