//! Circuit breaker guarding the proxy's outbound HTTP path.
//!
//! One breaker is shared by every destination served by a proxy instance: a
//! failure against any upstream counts toward the same threshold.

use serde::Serialize;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing fast until the timeout elapses.
    Open,
    /// Timeout elapsed; traffic is let through to probe recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        };
        f.write_str(label)
    }
}

/// Point-in-time view of the breaker, used in error envelopes and health output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Failures recorded since the last success.
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
}

/// Tri-state failure gate.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: RwLock<BreakerInner>,
    /// Consecutive failures that open the circuit.
    failure_threshold: u32,
    /// Time after the last failure before a probe is allowed.
    timeout: Duration,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    ///
    /// # Arguments
    /// * `failure_threshold` - Consecutive failures that open the circuit
    /// * `timeout` - Cooldown measured from the last recorded failure
    #[must_use]
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
            }),
            failure_threshold,
            timeout,
        }
    }

    /// Whether a request may go out. Moves `Open` to `HalfOpen` once the
    /// timeout has elapsed since the last failure.
    pub fn can_proceed(&self) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.state != CircuitState::Open {
            return true;
        }

        let elapsed = inner
            .last_failure_at
            .map_or(self.timeout, |at| at.elapsed());
        if elapsed >= self.timeout {
            inner.state = CircuitState::HalfOpen;
            debug!("Circuit breaker: Open -> HalfOpen (timeout elapsed)");
            true
        } else {
            false
        }
    }

    /// Records a successful upstream exchange.
    pub fn record_success(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            debug!("Circuit breaker: HalfOpen -> Closed (recovery successful)");
        }
    }

    /// Records a failed upstream exchange.
    pub fn record_failure(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_at = Some(Instant::now());

        if inner.consecutive_failures >= self.failure_threshold && inner.state != CircuitState::Open {
            let previous = inner.state;
            inner.state = CircuitState::Open;
            warn!(
                from = %previous,
                failures = inner.consecutive_failures,
                threshold = self.failure_threshold,
                "Circuit breaker opened"
            );
        }
    }

    /// Current state without triggering the lazy timeout transition.
    pub fn state(&self) -> CircuitState {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).state
    }

    /// Current state and failure counter.
    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}
