//! The auth broker seam: issues bearer tokens and connection metadata per destination.

use crate::resilience::RetryableError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by an auth broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// No credential file for the destination in any search directory.
    #[error("Service key file '{file_name}' not found. Searched: {}", format_paths(.searched))]
    CredentialFileNotFound {
        /// Expected file name.
        file_name: String,
        /// Directories that were searched.
        searched: Vec<PathBuf>,
    },

    /// The credential file exists but cannot be used.
    #[error("Invalid service key: {0}")]
    InvalidCredentials(String),

    /// The destination requires an interactive (browser) login.
    #[error("Interactive authentication required for destination '{0}'")]
    InteractiveAuthRequired(String),

    /// The token endpoint answered with a non-success status.
    #[error("Token endpoint returned HTTP {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response excerpt.
        message: String,
    },

    /// The token endpoint answered with a body that is not a token response.
    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    /// The token endpoint could not be reached.
    #[error("Token endpoint unreachable: {0}")]
    Network(String),

    /// The broker's session store rejected an update.
    #[error("Session store error: {0}")]
    Session(String),
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl BrokerError {
    /// HTTP status of the failed token call, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            BrokerError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl RetryableError for BrokerError {
    fn status_code(&self) -> Option<u16> {
        self.status()
    }

    fn is_network(&self) -> bool {
        matches!(self, BrokerError::Network(_))
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => BrokerError::Status {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => BrokerError::Network(err.to_string()),
        }
    }
}

/// Connection metadata bound to a destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Base URL of the upstream service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    /// SAP client number, for ABAP systems.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sap_client: Option<String>,
    /// Logon language.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Values pre-seeded into a broker session when the target URL is supplied out of band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSeed {
    /// Target URL to report as the destination's service URL.
    pub service_url: String,
    /// Placeholder credential stored alongside the URL.
    pub placeholder_token: String,
}

impl SessionSeed {
    /// Placeholder token value used for seeded sessions.
    pub const PLACEHOLDER_TOKEN: &'static str = "placeholder";

    /// Seed carrying only a service URL.
    pub fn for_url(service_url: impl Into<String>) -> Self {
        Self {
            service_url: service_url.into(),
            placeholder_token: Self::PLACEHOLDER_TOKEN.to_string(),
        }
    }
}

/// Token and connection source for one destination.
#[async_trait]
pub trait AuthBroker: Send + Sync {
    /// Fetch a bearer token for the destination.
    async fn get_token(&self, destination: &str) -> std::result::Result<String, BrokerError>;

    /// Connection metadata for the destination; fields may be absent.
    async fn get_connection_config(
        &self,
        destination: &str,
    ) -> std::result::Result<ConnectionConfig, BrokerError>;

    /// Pre-seed the destination's session. Brokers without a session store ignore it.
    async fn save_session(
        &self,
        _destination: &str,
        _seed: SessionSeed,
    ) -> std::result::Result<(), BrokerError> {
        Ok(())
    }
}

/// Creates broker handles for destinations on first use.
pub trait AuthBrokerFactory: Send + Sync {
    /// Build the broker for `destination`.
    fn create(&self, destination: &str) -> std::result::Result<Arc<dyn AuthBroker>, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message_lists_paths() {
        let err = BrokerError::CredentialFileNotFound {
            file_name: "dev.json".to_string(),
            searched: vec![PathBuf::from("/a"), PathBuf::from("/b")],
        };
        let message = err.to_string();
        assert!(message.contains("dev.json"));
        assert!(message.contains("/a, /b"));
    }

    #[test]
    fn test_retry_classification() {
        let err = BrokerError::Status {
            status: 503,
            message: "unavailable".to_string(),
        };
        assert_eq!(RetryableError::status_code(&err), Some(503));
        assert!(RetryableError::is_network(&BrokerError::Network("refused".to_string())));
        assert!(!RetryableError::is_network(&BrokerError::InvalidCredentials("x".to_string())));
    }

    #[test]
    fn test_connection_config_serialization() {
        let config = ConnectionConfig {
            service_url: Some("https://target.example.com".to_string()),
            sap_client: Some("100".to_string()),
            language: None,
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["serviceUrl"], "https://target.example.com");
        assert_eq!(json["sapClient"], "100");
        assert!(json.get("language").is_none());
    }
}
