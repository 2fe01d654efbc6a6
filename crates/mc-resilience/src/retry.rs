//! Bounded retry with exponential backoff and jitter, routed through the
//! circuit breaker.

use std::future::Future;

use rand::Rng;
use tracing::debug;

use mc_core::current_unix_timestamp_ms;

use crate::breaker::{CircuitBreakerRegistry, CircuitOpenError};

/// Retry tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 5_000,
        }
    }
}

/// HTTP statuses that are worth retrying.
pub fn should_retry_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// Jittered backoff for the given zero-based attempt index.
///
/// `min(max_delay, base << attempt)` scaled by a uniform factor in
/// `[0.7, 1.3]`.
pub fn backoff_delay_ms(policy: RetryPolicy, attempt: u32) -> u64 {
    let shift = attempt.min(16);
    let exponential = policy
        .base_delay_ms
        .saturating_mul(1_u64 << shift)
        .min(policy.max_delay_ms);
    let jitter: f64 = rand::thread_rng().gen_range(0.7..=1.3);
    (exponential as f64 * jitter) as u64
}

/// Failure surfaced by [`retry_with_breaker`].
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The breaker refused the attempt.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
    /// The final attempt failed with the operation's own error.
    #[error(transparent)]
    Exhausted(E),
}

/// Runs `operation` with bounded retries, consulting the breaker before
/// every attempt and reporting each outcome back to it.
///
/// `idempotent` gates retrying entirely: non-idempotent calls get exactly
/// one attempt. `retryable` classifies the operation's error; non-retryable
/// errors end the loop immediately.
pub async fn retry_with_breaker<T, E, F, Fut>(
    breakers: &CircuitBreakerRegistry,
    circuit: &str,
    policy: RetryPolicy,
    idempotent: bool,
    retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = if idempotent { policy.max_retries + 1 } else { 1 };
    let mut attempt = 0u32;
    loop {
        breakers.check(circuit, current_unix_timestamp_ms())?;
        match operation().await {
            Ok(value) => {
                breakers.record_success(circuit);
                return Ok(value);
            }
            Err(error) => {
                breakers.record_failure(circuit, current_unix_timestamp_ms());
                attempt += 1;
                if attempt >= max_attempts || !retryable(&error) {
                    return Err(RetryError::Exhausted(error));
                }
                let delay = backoff_delay_ms(policy, attempt - 1);
                debug!(circuit, attempt, delay_ms = delay, "retrying after backoff");
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
    use mc_core::StateStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    fn registry(dir: &std::path::Path) -> CircuitBreakerRegistry {
        let store = StateStore::open(dir.join("state")).expect("open store");
        CircuitBreakerRegistry::new(
            store,
            CircuitBreakerConfig {
                failure_threshold: 10,
                ..CircuitBreakerConfig::default()
            },
        )
    }

    #[test]
    fn unit_retry_status_selection_matches_policy() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(should_retry_status(status), "{status} should retry");
        }
        for status in [200, 201, 400, 401, 403, 404, 409, 418, 501] {
            assert!(!should_retry_status(status), "{status} should not retry");
        }
    }

    #[test]
    fn unit_backoff_delays_stay_within_jitter_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 0..6 {
            let nominal = policy
                .base_delay_ms
                .saturating_mul(1 << attempt)
                .min(policy.max_delay_ms);
            for _ in 0..50 {
                let delay = backoff_delay_ms(policy, attempt);
                let lower = (nominal as f64 * 0.7) as u64;
                let upper = (nominal as f64 * 1.3) as u64;
                assert!(
                    (lower..=upper).contains(&delay),
                    "attempt {attempt}: delay {delay} outside [{lower}, {upper}]"
                );
            }
        }
    }

    #[test]
    fn unit_backoff_is_capped_at_max_delay() {
        let policy = RetryPolicy::default();
        let delay = backoff_delay_ms(policy, 12);
        assert!(delay <= (policy.max_delay_ms as f64 * 1.3) as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn functional_retry_attempts_are_bounded() {
        let dir = tempdir().expect("tempdir");
        let breakers = registry(dir.path());
        let attempts = AtomicU32::new(0);

        let result: Result<(), RetryError<&str>> = retry_with_breaker(
            &breakers,
            "flaky",
            RetryPolicy::default(),
            true,
            |_| true,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err("boom") }
            },
        )
        .await;

        assert!(matches!(result, Err(RetryError::Exhausted("boom"))));
        assert_eq!(attempts.load(Ordering::SeqCst), 4, "max_retries + 1 attempts");
    }

    #[tokio::test]
    async fn functional_non_idempotent_operations_get_one_attempt() {
        let dir = tempdir().expect("tempdir");
        let breakers = registry(dir.path());
        let attempts = AtomicU32::new(0);

        let result: Result<(), RetryError<&str>> = retry_with_breaker(
            &breakers,
            "post-once",
            RetryPolicy::default(),
            false,
            |_| true,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err("boom") }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn functional_non_retryable_error_short_circuits() {
        let dir = tempdir().expect("tempdir");
        let breakers = registry(dir.path());
        let attempts = AtomicU32::new(0);

        let result: Result<(), RetryError<&str>> = retry_with_breaker(
            &breakers,
            "fatal",
            RetryPolicy::default(),
            true,
            |error| *error != "fatal",
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal") }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn functional_retry_succeeds_after_transient_failures() {
        let dir = tempdir().expect("tempdir");
        let breakers = registry(dir.path());
        let attempts = AtomicU32::new(0);

        let result = retry_with_breaker(
            &breakers,
            "recovers",
            RetryPolicy::default(),
            true,
            |_: &&str| true,
            || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err("transient")
                    } else {
                        Ok("recovered")
                    }
                }
            },
        )
        .await
        .expect("third attempt succeeds");

        assert_eq!(result, "recovered");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn regression_open_circuit_fails_fast_without_attempts() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::open(dir.path().join("state")).expect("open store");
        let breakers = CircuitBreakerRegistry::new(store, CircuitBreakerConfig::default());
        let now = current_unix_timestamp_ms();
        for _ in 0..3 {
            breakers.record_failure("down", now);
        }

        let attempts = AtomicU32::new(0);
        let result: Result<(), RetryError<&str>> = retry_with_breaker(
            &breakers,
            "down",
            RetryPolicy::default(),
            true,
            |_| true,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        )
        .await;

        assert!(matches!(result, Err(RetryError::CircuitOpen(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }
}
