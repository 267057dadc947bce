//! destproxy core - authenticating reverse proxy for JSON-RPC upstreams.
//!
//! Clients name a *destination* in request headers (or the operator pins one
//! on the command line); the proxy resolves it into a bearer token, injects
//! it, forwards the call and hands back the upstream's JSON-RPC response.
//!
//! This crate provides:
//! - Routing decisions from headers and process-level overrides
//! - A per-destination broker registry and fixed-TTL token cache
//! - Retry with exponential backoff and a shared circuit breaker
//! - Outbound request construction and log redaction
//! - A hyper listener and TOML configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use destproxy_core::{ProxyConfig, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> destproxy_core::Result<()> {
//!     let config = ProxyConfig::default();
//!     let mut server = ProxyServer::from_config(&config)?;
//!     server
//!         .serve_until(&config.server.host, config.server.port, async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//! }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod proxy;
pub mod resilience;
pub mod routing;
pub mod server;

pub use auth::{AuthBroker, AuthBrokerFactory, AuthBrokerRegistry, BrokerError, TokenCache};
pub use config::{ConfigOverrides, ProxyConfig};
pub use error::{ProxyError, Result};
pub use proxy::{InboundContext, JsonRpcRequest, JsonRpcResponse, ProxyOrchestrator};
pub use resilience::{CircuitBreaker, RetryExecutor, RetryPolicy};
pub use routing::{RoutingDecision, RoutingPolicy, RoutingResolver, RoutingStrategy};
pub use server::ProxyServer;
