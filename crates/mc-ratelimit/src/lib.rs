//! Sliding-window rate limiting per `(user identity, command category)`.
//!
//! Admission state lives in `rate-limits.json` under the state directory;
//! the category is the first token of the command path. Corrupt or
//! tampered state resets to empty rather than failing the command.

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use mc_core::{dangerous_key, StateStore};

/// File name of the persisted window map inside the state directory.
pub const RATE_LIMITS_FILE: &str = "rate-limits.json";

/// Hard cap on stored timestamps per `(user, category)` bucket.
pub const MAX_WINDOW_ENTRIES: usize = 200;

/// Admission policy for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub max: usize,
    pub window_ms: u64,
}

/// Policy table keyed by command category.
///
/// Categories not listed fall back to the default of 30 requests per
/// minute.
pub fn policy_for_category(category: &str) -> RateLimitPolicy {
    match category {
        "restore" => RateLimitPolicy {
            max: 3,
            window_ms: 300_000,
        },
        "config-fix" | "exec" => RateLimitPolicy {
            max: 5,
            window_ms: 60_000,
        },
        "deploy" => RateLimitPolicy {
            max: 5,
            window_ms: 300_000,
        },
        "update" | "import" => RateLimitPolicy {
            max: 10,
            window_ms: 60_000,
        },
        "status" | "logs" | "validate" => RateLimitPolicy {
            max: 60,
            window_ms: 60_000,
        },
        _ => RateLimitPolicy {
            max: 30,
            window_ms: 60_000,
        },
    }
}

/// On-disk window map: `user:category` to ordered unix-ms timestamps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitState {
    #[serde(default)]
    pub windows: HashMap<String, Vec<u64>>,
}

/// Structural validation applied on every load.
///
/// Rejection resets the state to empty; the caller records the reset as a
/// security event.
pub fn validate_rate_limit_state(state: &RateLimitState) -> Result<(), String> {
    for (key, timestamps) in &state.windows {
        if key.is_empty() || dangerous_key(key) {
            return Err(format!("forbidden window key (len {})", key.len()));
        }
        if timestamps.len() > MAX_WINDOW_ENTRIES {
            return Err(format!(
                "window '{key}' holds {} entries, cap is {MAX_WINDOW_ENTRIES}",
                timestamps.len()
            ));
        }
        let mut previous = 0u64;
        for &timestamp in timestamps {
            if timestamp == 0 {
                return Err(format!("window '{key}' holds a non-positive timestamp"));
            }
            if timestamp < previous {
                return Err(format!("window '{key}' is not monotonically ordered"));
            }
            previous = timestamp;
        }
    }
    Ok(())
}

/// Denial carrying the wait until the oldest entry leaves the window.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rate limit for '{category}' exceeded; retry in {retry_after_ms} ms")]
pub struct RateLimitExceeded {
    pub category: String,
    pub retry_after_ms: u64,
}

/// Successful admission summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub used: usize,
    pub max: usize,
}

/// Usage snapshot for one bucket, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct BucketUsage {
    pub category: String,
    pub used: usize,
    pub max: usize,
    pub window_ms: u64,
}

/// Sliding-window rate limiter over the persisted state file.
pub struct RateLimiter {
    store: StateStore,
}

impl RateLimiter {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Admits or denies one invocation at `now_ms`.
    ///
    /// Admission appends the timestamp and persists the pruned window under
    /// the store's advisory lock, so concurrent commands serialize here.
    pub fn admit(
        &self,
        user_identity: &str,
        category: &str,
        now_ms: u64,
    ) -> Result<Result<Admission, RateLimitExceeded>> {
        let policy = policy_for_category(category);
        let key = bucket_key(user_identity, category);

        let mut denial: Option<RateLimitExceeded> = None;
        let mut admitted_used = 0usize;
        self.store.atomic_update(
            RATE_LIMITS_FILE,
            validate_rate_limit_state,
            |mut state: RateLimitState| {
                let window = state.windows.entry(key.clone()).or_default();
                prune_window(window, policy, now_ms);
                if window.len() >= policy.max {
                    let oldest = window.first().copied().unwrap_or(now_ms);
                    denial = Some(RateLimitExceeded {
                        category: category.to_string(),
                        retry_after_ms: (oldest + policy.window_ms).saturating_sub(now_ms),
                    });
                } else {
                    window.push(now_ms);
                    admitted_used = window.len();
                }
                Ok(state)
            },
        )?;

        match denial {
            Some(denied) => {
                warn!(
                    category,
                    retry_after_ms = denied.retry_after_ms,
                    reason_code = "rate_limit_denied",
                    "rate limit denied admission"
                );
                Ok(Err(denied))
            }
            None => {
                debug!(category, used = admitted_used, max = policy.max, "rate limit admitted");
                Ok(Ok(Admission {
                    used: admitted_used,
                    max: policy.max,
                }))
            }
        }
    }

    /// Current usage for every bucket belonging to `user_identity`.
    pub fn usage(&self, user_identity: &str, now_ms: u64) -> Vec<BucketUsage> {
        let state: RateLimitState = self
            .store
            .load_state(RATE_LIMITS_FILE, validate_rate_limit_state);
        let prefix = format!("{user_identity}:");
        let mut usage: Vec<BucketUsage> = state
            .windows
            .iter()
            .filter_map(|(key, timestamps)| {
                let category = key.strip_prefix(&prefix)?;
                let policy = policy_for_category(category);
                let live = timestamps
                    .iter()
                    .filter(|&&timestamp| timestamp + policy.window_ms > now_ms)
                    .count();
                Some(BucketUsage {
                    category: category.to_string(),
                    used: live,
                    max: policy.max,
                    window_ms: policy.window_ms,
                })
            })
            .collect();
        usage.sort_by(|a, b| a.category.cmp(&b.category));
        usage
    }

    /// Clears one category bucket (or every bucket) for the user.
    pub fn reset(&self, user_identity: &str, category: Option<&str>) -> Result<()> {
        let prefix = format!("{user_identity}:");
        self.store.atomic_update(
            RATE_LIMITS_FILE,
            validate_rate_limit_state,
            |mut state: RateLimitState| {
                match category {
                    Some(category) => {
                        state.windows.remove(&bucket_key(user_identity, category));
                    }
                    None => {
                        state.windows.retain(|key, _| !key.starts_with(&prefix));
                    }
                }
                Ok(state)
            },
        )?;
        Ok(())
    }
}

fn bucket_key(user_identity: &str, category: &str) -> String {
    format!("{user_identity}:{category}")
}

fn prune_window(window: &mut Vec<u64>, policy: RateLimitPolicy, now_ms: u64) {
    window.retain(|&timestamp| timestamp + policy.window_ms > now_ms);
    if window.len() > MAX_WINDOW_ENTRIES {
        let excess = window.len() - MAX_WINDOW_ENTRIES;
        window.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn limiter(dir: &std::path::Path) -> RateLimiter {
        RateLimiter::new(StateStore::open(dir.join("state")).expect("open store"))
    }

    #[test]
    fn functional_window_admits_up_to_max_then_denies() {
        let dir = tempdir().expect("tempdir");
        let limiter = limiter(dir.path());
        let now = 1_700_000_000_000;

        for attempt in 0..5 {
            let admission = limiter
                .admit("u-alpha", "deploy", now + attempt)
                .expect("store io")
                .expect("within budget");
            assert_eq!(admission.used, attempt as usize + 1);
            assert_eq!(admission.max, 5);
        }

        let denied = limiter
            .admit("u-alpha", "deploy", now + 10_000)
            .expect("store io")
            .expect_err("sixth call denied");
        assert_eq!(denied.category, "deploy");
        assert!(
            denied.retry_after_ms >= 290_000,
            "retry-after {} should be close to the 300s window",
            denied.retry_after_ms
        );
    }

    #[test]
    fn functional_expired_entries_free_the_window() {
        let dir = tempdir().expect("tempdir");
        let limiter = limiter(dir.path());
        let now = 1_700_000_000_000;
        for _ in 0..5 {
            limiter
                .admit("u-alpha", "exec", now)
                .expect("store io")
                .expect("admitted");
        }
        limiter
            .admit("u-alpha", "exec", now + 1)
            .expect("store io")
            .expect_err("window full");

        limiter
            .admit("u-alpha", "exec", now + 60_001)
            .expect("store io")
            .expect("window rolled over");
    }

    #[test]
    fn unit_users_and_categories_have_independent_buckets() {
        let dir = tempdir().expect("tempdir");
        let limiter = limiter(dir.path());
        let now = 1_700_000_000_000;
        for _ in 0..3 {
            limiter
                .admit("u-alpha", "restore", now)
                .expect("store io")
                .expect("admitted");
        }
        limiter
            .admit("u-alpha", "restore", now)
            .expect("store io")
            .expect_err("alpha restore exhausted");
        limiter
            .admit("u-beta", "restore", now)
            .expect("store io")
            .expect("beta has its own bucket");
        limiter
            .admit("u-alpha", "status", now)
            .expect("store io")
            .expect("other category unaffected");
    }

    #[test]
    fn unit_policy_table_matches_category_classes() {
        assert_eq!(policy_for_category("restore"), RateLimitPolicy { max: 3, window_ms: 300_000 });
        assert_eq!(policy_for_category("exec"), RateLimitPolicy { max: 5, window_ms: 60_000 });
        assert_eq!(policy_for_category("deploy"), RateLimitPolicy { max: 5, window_ms: 300_000 });
        assert_eq!(policy_for_category("update"), RateLimitPolicy { max: 10, window_ms: 60_000 });
        assert_eq!(policy_for_category("status"), RateLimitPolicy { max: 60, window_ms: 60_000 });
        assert_eq!(policy_for_category("anything"), RateLimitPolicy { max: 30, window_ms: 60_000 });
    }

    #[test]
    fn regression_state_validation_rejects_tampered_shapes() {
        let mut state = RateLimitState::default();
        state.windows.insert("u-1:__proto__".into(), vec![1]);
        assert!(validate_rate_limit_state(&state).is_err());

        let mut state = RateLimitState::default();
        state.windows.insert("u-1:deploy".into(), vec![5, 3]);
        assert!(validate_rate_limit_state(&state).is_err());

        let mut state = RateLimitState::default();
        state.windows.insert("u-1:deploy".into(), vec![0]);
        assert!(validate_rate_limit_state(&state).is_err());

        let mut state = RateLimitState::default();
        state
            .windows
            .insert("u-1:deploy".into(), vec![1; MAX_WINDOW_ENTRIES + 1]);
        assert!(validate_rate_limit_state(&state).is_err());
    }

    #[test]
    fn regression_corrupt_state_resets_instead_of_blocking() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::open(dir.path().join("state")).expect("open store");
        store
            .save_state(
                RATE_LIMITS_FILE,
                &serde_json::json!({"windows": {"u-alpha:deploy": [9, 3, 1]}}),
            )
            .expect("write tampered state");

        let limiter = RateLimiter::new(store);
        limiter
            .admit("u-alpha", "deploy", 1_700_000_000_000)
            .expect("store io")
            .expect("tampered state resets to empty and admits");
    }

    #[test]
    fn unit_usage_reports_live_entries_per_category() {
        let dir = tempdir().expect("tempdir");
        let limiter = limiter(dir.path());
        let now = 1_700_000_000_000;
        for _ in 0..2 {
            limiter
                .admit("u-alpha", "deploy", now)
                .expect("store io")
                .expect("admitted");
        }
        limiter
            .admit("u-alpha", "status", now)
            .expect("store io")
            .expect("admitted");

        let usage = limiter.usage("u-alpha", now);
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].category, "deploy");
        assert_eq!(usage[0].used, 2);
        assert_eq!(usage[1].category, "status");
        assert_eq!(usage[1].used, 1);
    }

    #[test]
    fn functional_reset_clears_one_or_all_buckets() {
        let dir = tempdir().expect("tempdir");
        let limiter = limiter(dir.path());
        let now = 1_700_000_000_000;
        for _ in 0..3 {
            limiter
                .admit("u-alpha", "restore", now)
                .expect("store io")
                .expect("admitted");
        }
        limiter.reset("u-alpha", Some("restore")).expect("reset one");
        limiter
            .admit("u-alpha", "restore", now)
            .expect("store io")
            .expect("bucket cleared");

        limiter.reset("u-alpha", None).expect("reset all");
        assert!(limiter.usage("u-alpha", now).is_empty());
    }

    #[test]
    fn regression_window_file_never_exceeds_entry_cap() {
        let dir = tempdir().expect("tempdir");
        let limiter = limiter(dir.path());
        let now = 1_700_000_000_000;
        // status allows 60/min; run several windows' worth of admissions
        for index in 0..240u64 {
            let _ = limiter
                .admit("u-alpha", "status", now + index * 1_500)
                .expect("store io");
        }
        let state: RateLimitState = StateStore::open(dir.path().join("state"))
            .expect("reopen")
            .load_state(RATE_LIMITS_FILE, validate_rate_limit_state);
        let window = state.windows.get("u-alpha:status").expect("bucket exists");
        assert!(window.len() <= MAX_WINDOW_ENTRIES);
    }
}
