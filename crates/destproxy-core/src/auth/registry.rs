//! Per-destination broker handles, created lazily and kept for the process lifetime.

use super::broker::{AuthBroker, AuthBrokerFactory, BrokerError, SessionSeed};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Registry owning exactly one broker handle per destination.
pub struct AuthBrokerRegistry {
    factory: Arc<dyn AuthBrokerFactory>,
    /// Map of destination name to broker handle.
    brokers: RwLock<HashMap<String, Arc<dyn AuthBroker>>>,
}

impl std::fmt::Debug for AuthBrokerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthBrokerRegistry")
            .field("factory", &"<AuthBrokerFactory>")
            .field("brokers", &"<RwLock<HashMap>>")
            .finish()
    }
}

impl AuthBrokerRegistry {
    /// Create an empty registry backed by `factory`.
    pub fn new(factory: Arc<dyn AuthBrokerFactory>) -> Self {
        Self {
            factory,
            brokers: RwLock::new(HashMap::new()),
        }
    }

    /// Return the destination's broker, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns the factory's error if the broker cannot be constructed.
    pub async fn get_or_create(&self, destination: &str) -> Result<Arc<dyn AuthBroker>, BrokerError> {
        if let Some(broker) = self.brokers.read().await.get(destination) {
            return Ok(Arc::clone(broker));
        }

        let mut brokers = self.brokers.write().await;
        // Another task may have inserted while we waited for the write lock.
        if let Some(broker) = brokers.get(destination) {
            return Ok(Arc::clone(broker));
        }

        let broker = self.factory.create(destination)?;
        debug!(destination = %destination, "Created auth broker");
        brokers.insert(destination.to_string(), Arc::clone(&broker));
        Ok(broker)
    }

    /// Seed the destination's session with an out-of-band service URL.
    ///
    /// Best effort: failures are logged and swallowed.
    pub async fn ensure_session_service_url(&self, destination: &str, service_url: &str) {
        let broker = match self.get_or_create(destination).await {
            Ok(broker) => broker,
            Err(e) => {
                warn!(destination = %destination, error = %e, "Could not create broker for session seeding");
                return;
            }
        };

        if let Err(e) = broker.save_session(destination, SessionSeed::for_url(service_url)).await {
            warn!(destination = %destination, error = %e, "Failed to seed broker session");
        }
    }

    /// Number of destinations with a live broker handle.
    pub async fn len(&self) -> usize {
        self.brokers.read().await.len()
    }

    /// Whether no broker has been created yet.
    pub async fn is_empty(&self) -> bool {
        self.brokers.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::broker::ConnectionConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBroker {
        sessions: Mutex<Vec<SessionSeed>>,
        fail_sessions: bool,
    }

    #[async_trait]
    impl AuthBroker for RecordingBroker {
        async fn get_token(&self, _destination: &str) -> Result<String, BrokerError> {
            Ok("token".to_string())
        }

        async fn get_connection_config(&self, _destination: &str) -> Result<ConnectionConfig, BrokerError> {
            Ok(ConnectionConfig::default())
        }

        async fn save_session(&self, _destination: &str, seed: SessionSeed) -> Result<(), BrokerError> {
            if self.fail_sessions {
                return Err(BrokerError::Session("read-only store".to_string()));
            }
            self.sessions.lock().unwrap().push(seed);
            Ok(())
        }
    }

    struct CountingFactory {
        created: AtomicUsize,
        broker: Arc<RecordingBroker>,
    }

    impl AuthBrokerFactory for CountingFactory {
        fn create(&self, _destination: &str) -> Result<Arc<dyn AuthBroker>, BrokerError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::clone(&self.broker) as Arc<dyn AuthBroker>)
        }
    }

    fn factory(fail_sessions: bool) -> Arc<CountingFactory> {
        Arc::new(CountingFactory {
            created: AtomicUsize::new(0),
            broker: Arc::new(RecordingBroker {
                sessions: Mutex::new(Vec::new()),
                fail_sessions,
            }),
        })
    }

    #[tokio::test]
    async fn test_broker_created_once_per_destination() {
        let factory = factory(false);
        let registry = AuthBrokerRegistry::new(Arc::clone(&factory) as Arc<dyn AuthBrokerFactory>);

        registry.get_or_create("dest-a").await.unwrap();
        registry.get_or_create("dest-a").await.unwrap();
        registry.get_or_create("dest-b").await.unwrap();

        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_creates_single_handle() {
        let factory = factory(false);
        let registry = Arc::new(AuthBrokerRegistry::new(Arc::clone(&factory) as Arc<dyn AuthBrokerFactory>));

        let mut handles = vec![];
        for _ in 0..10 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.get_or_create("shared").await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_session_seeding_reuses_handle() {
        let factory = factory(false);
        let registry = AuthBrokerRegistry::new(Arc::clone(&factory) as Arc<dyn AuthBrokerFactory>);

        registry.get_or_create("dest").await.unwrap();
        registry
            .ensure_session_service_url("dest", "https://override.example.com")
            .await;

        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        let sessions = factory.broker.sessions.lock().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].service_url, "https://override.example.com");
        assert_eq!(sessions[0].placeholder_token, SessionSeed::PLACEHOLDER_TOKEN);
    }

    #[tokio::test]
    async fn test_session_seeding_failure_is_not_fatal() {
        let registry = AuthBrokerRegistry::new(factory(true) as Arc<dyn AuthBrokerFactory>);
        registry
            .ensure_session_service_url("dest", "https://override.example.com")
            .await;
        assert!(!registry.is_empty().await);
    }
}
