//! Service-key backed auth broker.
//!
//! Each destination is described by a JSON service key `<destination>.json`
//! found in one of the configured search directories. The key carries the
//! client credentials for its token endpoint and the target service URL,
//! either at the top level (BTP destinations) or below `abap` (ABAP systems).

use super::broker::{AuthBroker, AuthBrokerFactory, BrokerError, ConnectionConfig, SessionSeed};
use super::key_paths::service_key_file_name;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::debug;

/// Longest token-endpoint error body kept in a [`BrokerError::Status`] message.
const MAX_ERROR_EXCERPT: usize = 200;

/// OAuth client credentials from a service key.
#[derive(Debug, Clone, Deserialize)]
pub struct UaaCredentials {
    /// Base URL of the token issuer.
    pub url: String,
    /// OAuth client id.
    pub clientid: String,
    /// OAuth client secret.
    pub clientsecret: String,
}

/// ABAP system section of a service key.
#[derive(Debug, Clone, Deserialize)]
pub struct AbapSystem {
    /// Base URL of the ABAP system.
    pub url: String,
    /// SAP client number.
    #[serde(default)]
    pub client: Option<String>,
}

/// A parsed service key file.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceKey {
    /// Token issuer credentials.
    pub uaa: UaaCredentials,
    /// Service URL for BTP destinations.
    #[serde(default)]
    pub url: Option<String>,
    /// System section for ABAP destinations.
    #[serde(default)]
    pub abap: Option<AbapSystem>,
    /// Logon language.
    #[serde(default)]
    pub language: Option<String>,
}

/// Kind of system a destination points at, selected from the key's shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationKind {
    /// BTP service; the key's top-level `url` is the service URL.
    Btp {
        /// Service URL, if the key names one.
        service_url: Option<String>,
    },
    /// ABAP system; service URL and SAP client come from the `abap` section.
    Abap {
        /// System URL.
        service_url: String,
        /// SAP client number.
        sap_client: Option<String>,
    },
}

impl ServiceKey {
    /// Parse a service key from its JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidCredentials`] if the text is not a service key.
    pub fn parse(content: &str) -> Result<Self, BrokerError> {
        let key: ServiceKey = serde_json::from_str(content)
            .map_err(|e| BrokerError::InvalidCredentials(e.to_string()))?;
        if key.uaa.url.trim().is_empty() {
            return Err(BrokerError::InvalidCredentials("uaa.url is empty".to_string()));
        }
        Ok(key)
    }

    /// Destination kind implied by this key.
    pub fn kind(&self) -> DestinationKind {
        match &self.abap {
            Some(abap) => DestinationKind::Abap {
                service_url: abap.url.clone(),
                sap_client: abap.client.clone(),
            },
            None => DestinationKind::Btp {
                service_url: self.url.clone(),
            },
        }
    }

    fn token_url(&self) -> String {
        format!("{}/oauth/token", self.uaa.url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Broker that exchanges a destination's service-key credentials for tokens.
pub struct ServiceKeyBroker {
    destination: String,
    search_dirs: Vec<PathBuf>,
    client: reqwest::Client,
    /// Loaded on first use.
    key: OnceCell<ServiceKey>,
    sessions: RwLock<HashMap<String, SessionSeed>>,
}

impl std::fmt::Debug for ServiceKeyBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceKeyBroker")
            .field("destination", &self.destination)
            .field("search_dirs", &self.search_dirs)
            .field("key_loaded", &self.key.initialized())
            .finish_non_exhaustive()
    }
}

impl ServiceKeyBroker {
    /// Create a broker for `destination` searching `search_dirs` in order.
    pub fn new(destination: impl Into<String>, search_dirs: Vec<PathBuf>, client: reqwest::Client) -> Self {
        Self {
            destination: destination.into(),
            search_dirs,
            client,
            key: OnceCell::new(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// The destination's service key, read from disk on first call.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::CredentialFileNotFound`] when no search directory
    /// holds the key, or [`BrokerError::InvalidCredentials`] when it cannot be parsed.
    pub async fn service_key(&self) -> Result<&ServiceKey, BrokerError> {
        self.key.get_or_try_init(|| self.load_key()).await
    }

    async fn load_key(&self) -> Result<ServiceKey, BrokerError> {
        let file_name = service_key_file_name(&self.destination);
        for dir in &self.search_dirs {
            let path = dir.join(&file_name);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                continue;
            }
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| BrokerError::InvalidCredentials(format!("{}: {e}", path.display())))?;
            debug!(destination = %self.destination, path = %path.display(), "Loaded service key");
            return ServiceKey::parse(&content);
        }

        Err(BrokerError::CredentialFileNotFound {
            file_name,
            searched: self.search_dirs.clone(),
        })
    }
}

#[async_trait]
impl AuthBroker for ServiceKeyBroker {
    async fn get_token(&self, destination: &str) -> Result<String, BrokerError> {
        let key = self.service_key().await?;
        let token_url = key.token_url();
        debug!(destination = %destination, url = %token_url, "Requesting client-credentials token");

        let response = self
            .client
            .post(&token_url)
            .basic_auth(&key.uaa.clientid, Some(&key.uaa.clientsecret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = if body.trim().is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                body.chars().take(MAX_ERROR_EXCERPT).collect()
            };
            return Err(BrokerError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::InvalidResponse(e.to_string()))?;
        Ok(token.access_token)
    }

    async fn get_connection_config(&self, destination: &str) -> Result<ConnectionConfig, BrokerError> {
        let key = self.service_key().await?;
        let session_url = self
            .sessions
            .read()
            .await
            .get(destination)
            .map(|seed| seed.service_url.clone());

        let (key_url, sap_client) = match key.kind() {
            DestinationKind::Btp { service_url } => (service_url, None),
            DestinationKind::Abap { service_url, sap_client } => (Some(service_url), sap_client),
        };

        Ok(ConnectionConfig {
            service_url: session_url.or(key_url),
            sap_client,
            language: key.language.clone(),
        })
    }

    async fn save_session(&self, destination: &str, seed: SessionSeed) -> Result<(), BrokerError> {
        debug!(destination = %destination, service_url = %seed.service_url, "Seeding broker session");
        self.sessions.write().await.insert(destination.to_string(), seed);
        Ok(())
    }
}

/// Creates a [`ServiceKeyBroker`] per destination, sharing one HTTP client.
#[derive(Debug, Clone)]
pub struct ServiceKeyBrokerFactory {
    search_dirs: Vec<PathBuf>,
    client: reqwest::Client,
}

impl ServiceKeyBrokerFactory {
    /// Factory searching `search_dirs` for service keys.
    pub fn new(search_dirs: Vec<PathBuf>) -> Self {
        Self {
            search_dirs,
            client: reqwest::Client::new(),
        }
    }
}

impl AuthBrokerFactory for ServiceKeyBrokerFactory {
    fn create(&self, destination: &str) -> Result<Arc<dyn AuthBroker>, BrokerError> {
        Ok(Arc::new(ServiceKeyBroker::new(
            destination,
            self.search_dirs.clone(),
            self.client.clone(),
        )))
    }
}
