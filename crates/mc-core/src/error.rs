//! Operational error taxonomy and the fixed process exit-code enumeration.
//!
//! Components bubble a kind; the dispatcher converts kind to exit code and
//! user-visible text exactly once at the top of the process.

use crate::validate::ValidationError;

/// Fixed exit-code enumeration shared by human and JSON output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    Ok = 0,
    Generic = 1,
    Usage = 2,
    Validation = 3,
    NotFound = 4,
    RateLimited = 5,
    CircuitOpen = 6,
    SsrfViolation = 7,
    ResourceLimit = 8,
    Cancelled = 9,
    Integrity = 10,
    Budget = 11,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Stable screaming-snake name used in JSON error payloads.
    pub fn name(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Generic => "GENERIC",
            Self::Usage => "USAGE",
            Self::Validation => "VALIDATION",
            Self::NotFound => "NOT_FOUND",
            Self::RateLimited => "RATE_LIMITED",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::SsrfViolation => "SSRF_VIOLATION",
            Self::ResourceLimit => "RESOURCE_LIMIT",
            Self::Cancelled => "CANCELLED",
            Self::Integrity => "INTEGRITY",
            Self::Budget => "BUDGET",
        }
    }
}

/// Top-level error kinds surfaced by command handlers.
#[derive(Debug, thiserror::Error)]
pub enum OpsError {
    /// Input refused by a safety check before any side-effect ran.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// A security control fired (SSRF, shell escape, pollution, tampering).
    #[error("security rule '{rule}' blocked the operation: {detail}")]
    Security { rule: &'static str, detail: String },

    /// A dependency is reachable but misbehaving.
    #[error("{0}")]
    Dependency(String),

    /// The referenced resource does not exist.
    #[error("{0}")]
    Absent(String),

    /// Lock contention exceeded the retry budget.
    #[error("{0}")]
    Concurrency(String),

    /// On-disk state failed structural validation.
    #[error("{0}")]
    Integrity(String),

    /// Throttled by a cost or budget policy.
    #[error("{0}")]
    Budget(String),

    /// Argument or flag error detected after parse.
    #[error("{0}")]
    Usage(String),

    /// Admission denied by the rate limiter.
    #[error("rate limit for '{category}' exceeded")]
    RateLimited { category: String, retry_after_ms: u64 },

    /// Fail-fast from an open circuit breaker.
    #[error("circuit '{name}' is open")]
    CircuitOpen { name: String, retry_after_ms: u64 },

    /// The secure HTTP client refused the destination.
    #[error("request blocked: {detail}")]
    Ssrf { detail: String },

    /// A subprocess hit a resource cap.
    #[error("command exceeded resource limits: {description}")]
    ResourceLimit {
        kind: &'static str,
        description: String,
        hint: String,
    },

    /// Interrupted by SIGINT/SIGTERM.
    #[error("command cancelled")]
    Cancelled,

    /// Unclassified failure.
    #[error(transparent)]
    Generic(#[from] anyhow::Error),
}

impl OpsError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Validation(_) => ExitCode::Validation,
            Self::Security { .. } => ExitCode::Validation,
            Self::Dependency(_) => ExitCode::Generic,
            Self::Absent(_) => ExitCode::NotFound,
            Self::Concurrency(_) => ExitCode::Generic,
            Self::Integrity(_) => ExitCode::Integrity,
            Self::Budget(_) => ExitCode::Budget,
            Self::Usage(_) => ExitCode::Usage,
            Self::RateLimited { .. } => ExitCode::RateLimited,
            Self::CircuitOpen { .. } => ExitCode::CircuitOpen,
            Self::Ssrf { .. } => ExitCode::SsrfViolation,
            Self::ResourceLimit { .. } => ExitCode::ResourceLimit,
            Self::Cancelled => ExitCode::Cancelled,
            Self::Generic(_) => ExitCode::Generic,
        }
    }

    /// Stable category label for JSON output and audit details.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Security { .. } => "security",
            Self::Dependency(_) => "dependency",
            Self::Absent(_) => "absent",
            Self::Concurrency(_) => "concurrency",
            Self::Integrity(_) => "integrity",
            Self::Budget(_) => "budget",
            Self::Usage(_) => "usage",
            Self::RateLimited { .. } => "rate_limited",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Ssrf { .. } => "ssrf",
            Self::ResourceLimit { .. } => "resource_limit",
            Self::Cancelled => "cancelled",
            Self::Generic(_) => "generic",
        }
    }

    /// Operator-facing message for human output mode.
    pub fn human_message(&self) -> String {
        match self {
            Self::CircuitOpen { retry_after_ms, .. } => format!(
                "Service is temporarily unavailable. Retry in {} seconds.",
                retry_after_ms.div_ceil(1_000)
            ),
            Self::Ssrf { .. } => "Request blocked: destination not permitted.".to_string(),
            Self::RateLimited { retry_after_ms, .. } => format!(
                "Too many requests; next attempt in {} seconds.",
                retry_after_ms.div_ceil(1_000)
            ),
            Self::ResourceLimit { hint, .. } => format!(
                "Command exceeded resource limits (memory/process count). {hint}"
            ),
            Self::Integrity(_) => {
                "On-disk state failed integrity check; reset required.".to_string()
            }
            other => other.to_string(),
        }
    }
}
