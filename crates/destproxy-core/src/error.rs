//! Error types for proxy operations.

use std::io;
use thiserror::Error;

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur while forwarding a request.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Neither an explicit target URL nor a destination service URL is available.
    #[error("Cannot determine target URL: {0}")]
    TargetUrlUndetermined(String),

    /// The auth broker could not issue a token for a destination.
    #[error("Failed to acquire token for destination '{destination}': {message}")]
    TokenAcquisition {
        /// Destination name.
        destination: String,
        /// Broker failure, possibly rewritten.
        message: String,
        /// HTTP status reported by the token endpoint, if any.
        status: Option<u16>,
    },

    /// The upstream answered with a non-success HTTP status.
    #[error("Upstream returned HTTP {status}: {message}")]
    Upstream {
        /// HTTP status code.
        status: u16,
        /// Short description (reason phrase or body excerpt).
        message: String,
        /// Upstream error body, forwarded for diagnostics.
        body: Option<serde_json::Value>,
    },

    /// The request never produced a response (connect, DNS, timeout).
    #[error("Network error: {0}")]
    Network(String),

    /// The upstream body could not be decoded.
    #[error("Invalid upstream response: {0}")]
    InvalidResponse(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl ProxyError {
    /// HTTP status of the upstream response, if one was received.
    ///
    /// Token endpoint statuses are not included; see [`Self::token_endpoint_status`].
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ProxyError::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// HTTP status reported by the token endpoint for a failed acquisition.
    pub fn token_endpoint_status(&self) -> Option<u16> {
        match self {
            ProxyError::TokenAcquisition { status, .. } => *status,
            _ => None,
        }
    }

    /// Whether the broker retry budget was already spent producing this error.
    pub fn is_token_acquisition(&self) -> bool {
        matches!(self, ProxyError::TokenAcquisition { .. })
    }

    /// Whether the failure happened before any response was received.
    pub fn is_network(&self) -> bool {
        matches!(self, ProxyError::Network(_))
    }

    /// Whether this error indicates an expired or rejected bearer token.
    pub fn is_token_expiry(&self) -> bool {
        if matches!(self.status_code().or_else(|| self.token_endpoint_status()), Some(401 | 403)) {
            return true;
        }
        mentions_token_expiry(&self.to_string())
    }

    /// Upstream error body, if one was captured.
    pub fn upstream_body(&self) -> Option<&serde_json::Value> {
        match self {
            ProxyError::Upstream { body, .. } => body.as_ref(),
            _ => None,
        }
    }
}

/// Heuristic match for messages about expired, invalid or unauthorized tokens.
pub fn mentions_token_expiry(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("token expired")
        || lower.contains("expired token")
        || lower.contains("invalid token")
        || lower.contains("jwt expired")
        || (lower.contains("unauthorized") && lower.contains("token"))
}
