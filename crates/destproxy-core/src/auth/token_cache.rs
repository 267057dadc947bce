//! Per-destination bearer token cache with a fixed time-to-live.

use super::key_paths::describe_broker_failure;
use super::registry::AuthBrokerRegistry;
use super::broker::BrokerError;
use crate::error::{ProxyError, Result};
use crate::resilience::{RetryExecutor, RetryPolicy};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Lifetime of a cached token, counted from issuance. Token expiry claims are ignored.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

/// A cached token.
#[derive(Debug, Clone)]
pub struct TokenCacheEntry {
    /// Bearer token value.
    pub token: String,
    /// Instant after which the entry is no longer served.
    pub expires_at: Instant,
}

impl TokenCacheEntry {
    /// Usable iff it has not reached its expiry.
    pub fn is_valid(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Token cache backed by the broker registry for misses.
///
/// Concurrent misses for the same destination each call the broker; the
/// last writer wins.
pub struct TokenCache {
    registry: Arc<AuthBrokerRegistry>,
    retry: RetryExecutor,
    ttl: Duration,
    entries: RwLock<HashMap<String, TokenCacheEntry>>,
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("ttl", &self.ttl)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl TokenCache {
    /// Create a cache.
    ///
    /// # Arguments
    /// * `registry` - Source of broker handles on a miss
    /// * `retry` - Policy wrapped around each broker token call
    /// * `ttl` - Entry lifetime from issuance
    pub fn new(registry: Arc<AuthBrokerRegistry>, retry: RetryPolicy, ttl: Duration) -> Self {
        Self {
            registry,
            retry: RetryExecutor::new(retry),
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// The registry this cache draws brokers from.
    pub fn registry(&self) -> &Arc<AuthBrokerRegistry> {
        &self.registry
    }

    /// Return a token for `destination`, calling the broker on a miss, an
    /// expired entry, or when `force_refresh` is set.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::TokenAcquisition`] once broker retries are exhausted.
    pub async fn get_token(&self, destination: &str, force_refresh: bool) -> Result<String> {
        if !force_refresh {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(destination) {
                if entry.is_valid(Instant::now()) {
                    debug!(destination = %destination, "Token cache hit");
                    return Ok(entry.token.clone());
                }
            }
        }

        self.invalidate(destination).await;

        let broker = self
            .registry
            .get_or_create(destination)
            .await
            .map_err(|e| acquisition_error(destination, &e))?;

        let token = self
            .retry
            .run(|| broker.get_token(destination))
            .await
            .map_err(|e| {
                warn!(destination = %destination, error = %e, "Token acquisition failed");
                acquisition_error(destination, &e)
            })?;

        let entry = TokenCacheEntry {
            token: token.clone(),
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.write().await.insert(destination.to_string(), entry);
        debug!(
            destination = %destination,
            forced = force_refresh,
            ttl_secs = self.ttl.as_secs(),
            "Cached new token"
        );

        Ok(token)
    }

    /// Drop the cached token for `destination`, if any.
    pub async fn invalidate(&self, destination: &str) {
        self.entries.write().await.remove(destination);
    }

    /// Cached entry for `destination`, expired or not.
    pub async fn entry(&self, destination: &str) -> Option<TokenCacheEntry> {
        self.entries.read().await.get(destination).cloned()
    }
}

fn acquisition_error(destination: &str, err: &BrokerError) -> ProxyError {
    ProxyError::TokenAcquisition {
        destination: destination.to_string(),
        message: describe_broker_failure(destination, err),
        status: err.status(),
    }
}
