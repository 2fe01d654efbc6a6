//! Correlation-ID generation, validation, and process-wide propagation.
//!
//! The dispatcher mints or inherits one ID per command; HTTP, subprocess,
//! and audit helpers pick up the current ID implicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::time_utils::current_unix_timestamp_ms;
use crate::validate::{validate_identifier, ValidationError};

/// Environment variable carrying an inherited correlation ID.
pub const CORRELATION_ENV: &str = "MC_CORRELATION_ID";

/// HTTP header used for cross-service propagation.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

const MAX_ID_LEN: usize = 64;

static SEQUENCE: AtomicU64 = AtomicU64::new(1);
static CURRENT: RwLock<Option<CorrelationId>> = RwLock::new(None);

/// Opaque identifier threaded through logs, audit records, and HTTP headers.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Accepts an externally supplied ID after validating its shape.
    ///
    /// Inbound IDs are restricted to `[A-Za-z0-9_-]{1,64}`; the `:` used by
    /// derived child IDs is only ever produced internally.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        validate_identifier(raw, MAX_ID_LEN, "_-")?;
        Ok(Self(raw.to_string()))
    }

    /// Mints a fresh process-unique ID.
    pub fn generate() -> Self {
        let millis = current_unix_timestamp_ms();
        let count = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Self(format!("mc-{millis}-{count}"))
    }

    /// Resolves the command ID: environment first, otherwise generated.
    pub fn resolve_or_generate() -> Self {
        match std::env::var(CORRELATION_ENV) {
            Ok(raw) if !raw.trim().is_empty() => {
                Self::parse(raw.trim()).unwrap_or_else(|_| Self::generate())
            }
            _ => Self::generate(),
        }
    }

    /// Derives a child ID for a sub-operation as `parent:suffix`, truncated
    /// back into the 64-character budget.
    pub fn child(&self, suffix: &str) -> Self {
        let cleaned: String = suffix
            .chars()
            .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '_' || *ch == '-')
            .take(16)
            .collect();
        let mut derived = format!("{}:{}", self.0, cleaned);
        if derived.len() > MAX_ID_LEN {
            derived.truncate(MAX_ID_LEN);
        }
        Self(derived)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Installs the process-wide current correlation ID.
pub fn set_current_correlation_id(id: CorrelationId) {
    if let Ok(mut slot) = CURRENT.write() {
        *slot = Some(id);
    }
}

/// Returns the current correlation ID, if the dispatcher installed one.
pub fn current_correlation_id() -> Option<CorrelationId> {
    CURRENT.read().ok().and_then(|slot| slot.clone())
}
