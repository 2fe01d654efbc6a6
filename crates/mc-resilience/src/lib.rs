//! Resilience layer: per-target circuit breakers and bounded jittered retry.
//!
//! The retry wrapper always routes attempts through the breaker, so a
//! successful half-open probe counts toward closing and an open circuit
//! fails fast before any network activity.

pub mod breaker;
pub mod retry;

pub use breaker::{
    CallPermit, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitOpenError, CircuitPhase,
    CircuitState, CircuitsState, CIRCUITS_FILE,
};
pub use retry::{
    backoff_delay_ms, retry_with_breaker, should_retry_status, RetryError, RetryPolicy,
};
