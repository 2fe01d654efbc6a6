//! Per-invocation command context and shared subsystem handles.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use mc_audit::AuditLog;
use mc_core::{CorrelationId, StateStore};
use mc_ratelimit::RateLimiter;
use mc_resilience::{CircuitBreakerConfig, CircuitBreakerRegistry};

/// Output rendering mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

/// Everything a handler needs for one command invocation.
///
/// Built by the dispatcher after subcommand resolution; dropped when the
/// handler returns.
pub struct CommandContext {
    pub correlation_id: CorrelationId,
    pub user_identity: String,
    pub started_at_ms: u64,
    pub command_path: Vec<String>,
    pub output_mode: OutputMode,
    pub quiet: bool,
    pub debug_enabled: bool,
    pub state_dir: PathBuf,
}

/// Shared subsystem handles wired once per invocation.
pub struct AppHandles {
    pub store: StateStore,
    pub audit: AuditLog,
    pub limiter: RateLimiter,
    pub breakers: Arc<CircuitBreakerRegistry>,
}

impl AppHandles {
    pub fn open(state_dir: &std::path::Path) -> Result<Self> {
        let store = StateStore::open(state_dir)?;
        let audit = AuditLog::open(state_dir)?;
        let limiter = RateLimiter::new(store.clone());
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            store.clone(),
            CircuitBreakerConfig::default(),
        ));
        Ok(Self {
            store,
            audit,
            limiter,
            breakers,
        })
    }
}

/// True when the environment opts into machine-readable output.
pub fn env_json_output() -> bool {
    matches!(
        std::env::var("MC_JSON_OUTPUT").as_deref(),
        Ok("1") | Ok("true")
    )
}

/// True when the environment opts into debug logging.
pub fn env_debug() -> bool {
    matches!(std::env::var("MC_DEBUG").as_deref(), Ok("1") | Ok("true"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn functional_app_handles_open_creates_the_substrate() {
        let dir = tempdir().expect("tempdir");
        let handles = AppHandles::open(&dir.path().join("state")).expect("open handles");
        assert!(handles.store.root().exists());
        assert!(dir.path().join("state").join("audit.key").exists());
    }
}
