//! Proxy configuration file support.
//!
//! Every section and field is optional; missing values take the defaults
//! below. Command-line flags are layered on top with [`ProxyConfig::apply_overrides`].
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3001
//!
//! [routing]
//! policy = "passthrough"
//! destination = "btp-cloud"
//!
//! [upstream]
//! request_timeout_secs = 60
//! max_retries = 3
//! retry_delay_ms = 1000
//! retryable_status_codes = [500, 502, 503, 504]
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! timeout_secs = 60
//!
//! [auth]
//! token_ttl_secs = 1800
//! service_key_dirs = ["/etc/destproxy/keys"]
//! ```

use crate::auth::default_service_key_dirs;
use crate::error::{ProxyError, Result};
use crate::resilience::{CircuitBreaker, DEFAULT_RETRYABLE_STATUS_CODES, RetryPolicy};
use crate::routing::{RoutingOverrides, RoutingPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 3001;

/// Complete proxy configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener settings.
    pub server: ServerConfig,
    /// Routing policy and overrides.
    pub routing: RoutingConfig,
    /// Upstream call settings.
    pub upstream: UpstreamConfig,
    /// Circuit breaker settings.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Token and service-key settings.
    pub auth: AuthConfig,
}

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind.
    pub host: String,
    /// Port to bind; 0 picks an ephemeral port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// `[routing]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Behavior for requests without routing headers.
    pub policy: RoutingPolicy,
    /// Destination applied to every request.
    pub destination: Option<String>,
    /// Target URL applied to every request.
    pub mcp_url: Option<String>,
}

/// `[upstream]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base backoff delay in milliseconds.
    pub retry_delay_ms: u64,
    /// Optional ceiling on a single backoff delay.
    pub max_retry_delay_ms: Option<u64>,
    /// Statuses that trigger a retry.
    pub retryable_status_codes: Vec<u16>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
            max_retries: 3,
            retry_delay_ms: 1000,
            max_retry_delay_ms: None,
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES.to_vec(),
        }
    }
}

/// `[circuit_breaker]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Seconds after the last failure before a probe is allowed.
    pub timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_secs: 60,
        }
    }
}

/// `[auth]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Lifetime of a cached token in seconds.
    pub token_ttl_secs: u64,
    /// Service-key search directories; empty means the platform defaults.
    pub service_key_dirs: Vec<PathBuf>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: 30 * 60,
            service_key_dirs: Vec::new(),
        }
    }
}

/// Values given on the command line, applied over the file configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    /// `--host`
    pub host: Option<String>,
    /// `--port`
    pub port: Option<u16>,
    /// `--destination`
    pub destination: Option<String>,
    /// `--mcp-url`
    pub mcp_url: Option<String>,
}

impl ProxyConfig {
    /// Load and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML or fails validation.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ProxyConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the rest of the proxy relies on.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Config`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(ProxyError::Config("server.host must not be empty".to_string()));
        }
        if self.upstream.request_timeout_secs == 0 {
            return Err(ProxyError::Config(
                "upstream.request_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ProxyError::Config(
                "circuit_breaker.failure_threshold must be greater than 0".to_string(),
            ));
        }
        if let Some(code) = self
            .upstream
            .retryable_status_codes
            .iter()
            .find(|code| !(100..=599).contains(*code))
        {
            return Err(ProxyError::Config(format!(
                "upstream.retryable_status_codes contains invalid HTTP status {code}"
            )));
        }
        Ok(())
    }

    /// Layer command-line values over this configuration.
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(host) = overrides.host {
            self.server.host = host;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if overrides.destination.is_some() {
            self.routing.destination = overrides.destination;
        }
        if overrides.mcp_url.is_some() {
            self.routing.mcp_url = overrides.mcp_url;
        }
    }

    /// Process-level routing overrides.
    pub fn routing_overrides(&self) -> RoutingOverrides {
        RoutingOverrides {
            destination: self.routing.destination.clone(),
            mcp_url: self.routing.mcp_url.clone(),
        }
    }

    /// Retry policy for upstream and token endpoint calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.upstream.max_retries,
            retry_delay: Duration::from_millis(self.upstream.retry_delay_ms),
            max_delay: self.upstream.max_retry_delay_ms.map(Duration::from_millis),
            retryable_status_codes: self.upstream.retryable_status_codes.clone(),
        }
    }

    /// Upstream request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.request_timeout_secs)
    }

    /// A fresh breaker with the configured threshold and timeout.
    pub fn circuit_breaker(&self) -> CircuitBreaker {
        CircuitBreaker::new(
            self.circuit_breaker.failure_threshold,
            Duration::from_secs(self.circuit_breaker.timeout_secs),
        )
    }

    /// Cached token lifetime.
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.auth.token_ttl_secs)
    }

    /// Directories searched for service keys.
    pub fn service_key_dirs(&self) -> Vec<PathBuf> {
        if self.auth.service_key_dirs.is_empty() {
            default_service_key_dirs()
        } else {
            self.auth.service_key_dirs.clone()
        }
    }
}
