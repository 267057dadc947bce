//! Exponential-backoff retry executor.

use crate::error::{ProxyError, mentions_token_expiry};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Status codes retried by default (transient gateway/server failures).
pub const DEFAULT_RETRYABLE_STATUS_CODES: [u16; 4] = [500, 502, 503, 504];

/// Classification hooks the retry executor needs from an error type.
pub trait RetryableError: std::fmt::Display {
    /// HTTP status of the failed response, if one was received.
    fn status_code(&self) -> Option<u16>;

    /// Whether the failure happened with no response at all.
    fn is_network(&self) -> bool;

    /// Whether a lower layer already spent its own retry budget on this error.
    fn retries_exhausted(&self) -> bool {
        false
    }
}

impl RetryableError for ProxyError {
    fn status_code(&self) -> Option<u16> {
        ProxyError::status_code(self)
    }

    fn is_network(&self) -> bool {
        ProxyError::is_network(self)
    }

    fn retries_exhausted(&self) -> bool {
        self.is_token_acquisition()
    }
}

/// Retry settings for one class of operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    /// Base delay; attempt `n` (0-based) waits `retry_delay * 2^n`.
    pub retry_delay: Duration,
    /// Optional ceiling on a single backoff delay. `None` keeps pure doubling.
    pub max_delay: Option<Duration>,
    /// HTTP statuses that are worth another attempt.
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            max_delay: None,
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES.to_vec(),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the attempt following `attempt_index` (0-based).
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt_index);
        let delay = self.retry_delay.saturating_mul(factor);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Whether `err` should consume another attempt.
    ///
    /// Errors whose retries were already spent further down are never retried.
    /// Errors carrying an HTTP status are judged by status alone; the token
    /// message heuristic only applies to errors without a response status.
    pub fn is_retryable<E: RetryableError>(&self, err: &E) -> bool {
        if err.retries_exhausted() {
            return false;
        }
        match err.status_code() {
            Some(status) => self.retryable_status_codes.contains(&status),
            None => err.is_network() || mentions_token_expiry(&err.to_string()),
        }
    }
}

/// Runs async operations under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create an executor for the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The policy this executor applies.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned unchanged.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> std::result::Result<T, E>
    where
        E: RetryableError,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt = attempt + 1, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if attempt >= self.policy.max_retries || !self.policy.is_retryable(&err) {
                        return Err(err);
                    }
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.policy.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
