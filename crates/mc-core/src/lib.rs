//! Foundational safety and state primitives shared across MasterClaw crates.
//!
//! Provides input sanitizers and validators, the owner-only persistent state
//! store with atomic writes and advisory locking, structured logging
//! bootstrap, correlation-ID plumbing, and the operational error taxonomy
//! that the dispatcher maps to exit codes.

pub mod correlation;
pub mod error;
pub mod identity;
pub mod lock;
pub mod logging;
pub mod sanitize;
pub mod state;
pub mod time_utils;
pub mod validate;

pub use correlation::{current_correlation_id, set_current_correlation_id, CorrelationId};
pub use error::{ExitCode, OpsError};
pub use identity::user_identity;
pub use sanitize::{mask_secret, mask_sensitive, sanitize_for_log};
pub use state::{StateStore, STATE_FILE_MODE};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms};
pub use validate::{
    dangerous_key, safe_deep_merge, strip_dangerous_keys, validate_identifier, validate_path,
    PathPolicy, ValidationError,
};
