//! Failure-isolation and retry policies for downstream calls.
//!
//! Both are composable wrappers. When a call site uses both, the breaker goes
//! outside the retry loop so an exhausted retry counts as one breaker failure.

pub mod breaker;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerError, CircuitBreaker, CircuitMetrics};
pub use retry::{Backoff, RetryAttempt, RetryPolicy};
