//! Failure isolation for outbound calls: retry with backoff and a shared circuit breaker.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use retry::{DEFAULT_RETRYABLE_STATUS_CODES, RetryExecutor, RetryPolicy, RetryableError};
