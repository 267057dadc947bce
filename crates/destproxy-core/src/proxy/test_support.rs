//! Scripted brokers shared by the proxy unit tests.

use crate::auth::{
    AuthBroker, AuthBrokerFactory, AuthBrokerRegistry, BrokerError, ConnectionConfig, DEFAULT_TOKEN_TTL,
    SessionSeed, TokenCache,
};
use crate::resilience::RetryPolicy;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Broker issuing `token` on the first call and `token-N` on later calls,
/// or failing every call with `fail_status` when set.
pub(crate) struct FakeBroker {
    pub token: String,
    pub fail_status: Option<u16>,
    pub config: ConnectionConfig,
    pub token_calls: AtomicU32,
    pub sessions: Mutex<Vec<SessionSeed>>,
}

impl FakeBroker {
    pub fn new(token: &str, service_url: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            token: token.to_string(),
            fail_status: None,
            config: ConnectionConfig {
                service_url: service_url.map(str::to_string),
                sap_client: None,
                language: None,
            },
            token_calls: AtomicU32::new(0),
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn with_sap_client(token: &str, service_url: &str, sap_client: &str) -> Arc<Self> {
        Arc::new(Self {
            token: token.to_string(),
            fail_status: None,
            config: ConnectionConfig {
                service_url: Some(service_url.to_string()),
                sap_client: Some(sap_client.to_string()),
                language: None,
            },
            token_calls: AtomicU32::new(0),
            sessions: Mutex::new(Vec::new()),
        })
    }

    /// Broker whose token endpoint always answers `status`.
    pub fn failing(status: u16, service_url: &str) -> Arc<Self> {
        Arc::new(Self {
            token: String::new(),
            fail_status: Some(status),
            config: ConnectionConfig {
                service_url: Some(service_url.to_string()),
                sap_client: None,
                language: None,
            },
            token_calls: AtomicU32::new(0),
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> u32 {
        self.token_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthBroker for FakeBroker {
    async fn get_token(&self, _destination: &str) -> Result<String, BrokerError> {
        let call = self.token_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.fail_status {
            return Err(BrokerError::Status {
                status,
                message: "uaa maintenance".to_string(),
            });
        }
        if call == 0 {
            Ok(self.token.clone())
        } else {
            Ok(format!("{}-{call}", self.token))
        }
    }

    async fn get_connection_config(&self, _destination: &str) -> Result<ConnectionConfig, BrokerError> {
        Ok(self.config.clone())
    }

    async fn save_session(&self, _destination: &str, seed: SessionSeed) -> Result<(), BrokerError> {
        self.sessions.lock().unwrap().push(seed);
        Ok(())
    }
}

struct SharedFactory(Arc<FakeBroker>);

impl AuthBrokerFactory for SharedFactory {
    fn create(&self, _destination: &str) -> Result<Arc<dyn AuthBroker>, BrokerError> {
        Ok(Arc::clone(&self.0) as Arc<dyn AuthBroker>)
    }
}

/// Token cache whose every destination resolves to `broker`, without broker retries.
pub(crate) fn token_cache(broker: &Arc<FakeBroker>) -> Arc<TokenCache> {
    let policy = RetryPolicy {
        max_retries: 0,
        retry_delay: Duration::from_millis(1),
        ..RetryPolicy::default()
    };
    token_cache_with_policy(broker, policy)
}

pub(crate) fn token_cache_with_policy(broker: &Arc<FakeBroker>, policy: RetryPolicy) -> Arc<TokenCache> {
    let registry = Arc::new(AuthBrokerRegistry::new(Arc::new(SharedFactory(Arc::clone(broker)))));
    Arc::new(TokenCache::new(registry, policy, DEFAULT_TOKEN_TTL))
}
