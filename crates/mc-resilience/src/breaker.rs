//! Per-target circuit breaker state machine with persisted state.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use mc_core::StateStore;

/// File name of the persisted circuit map inside the state directory.
pub const CIRCUITS_FILE: &str = "circuits.json";

/// Breaker tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout_ms: 10_000,
            success_threshold: 2,
        }
    }
}

/// The three breaker phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

impl Default for CircuitPhase {
    fn default() -> Self {
        Self::Closed
    }
}

impl CircuitPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Persisted per-circuit state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitState {
    #[serde(default)]
    pub phase: CircuitPhase,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub consecutive_successes: u32,
    #[serde(default)]
    pub opened_at_ms: Option<u64>,
}

/// On-disk circuit map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitsState {
    #[serde(default)]
    pub circuits: HashMap<String, CircuitState>,
}

fn validate_circuits(state: &CircuitsState) -> Result<(), String> {
    for (name, circuit) in &state.circuits {
        if name.is_empty() {
            return Err("circuit name cannot be empty".to_string());
        }
        if circuit.phase == CircuitPhase::Open && circuit.opened_at_ms.is_none() {
            return Err(format!("open circuit '{name}' is missing opened_at_ms"));
        }
    }
    Ok(())
}

/// Fail-fast denial carrying the remaining open window.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit '{name}' is open; retry in {retry_after_ms} ms")]
pub struct CircuitOpenError {
    pub name: String,
    pub retry_after_ms: u64,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPermit {
    /// Normal closed-circuit call.
    Normal,
    /// The single half-open probe.
    Probe,
}

/// Registry of breakers backed by `circuits.json`.
///
/// The single-probe guarantee is enforced with an in-process mutex only;
/// cross-process coordination is best-effort by design.
pub struct CircuitBreakerRegistry {
    store: StateStore,
    config: CircuitBreakerConfig,
    probes_in_flight: Mutex<HashSet<String>>,
}

impl CircuitBreakerRegistry {
    pub fn new(store: StateStore, config: CircuitBreakerConfig) -> Self {
        Self {
            store,
            config,
            probes_in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Checks whether a call to `name` may proceed at `now_ms`.
    pub fn check(&self, name: &str, now_ms: u64) -> Result<CallPermit, CircuitOpenError> {
        let state = self.load();
        let circuit = state.circuits.get(name).cloned().unwrap_or_default();
        match circuit.phase {
            CircuitPhase::Closed => Ok(CallPermit::Normal),
            CircuitPhase::Open => {
                let opened_at = circuit.opened_at_ms.unwrap_or(now_ms);
                let elapsed = now_ms.saturating_sub(opened_at);
                if elapsed >= self.config.reset_timeout_ms {
                    self.begin_probe(name)?;
                    let _ = self.mutate(name, |circuit| {
                        circuit.phase = CircuitPhase::HalfOpen;
                        circuit.consecutive_successes = 0;
                    });
                    info!(circuit = name, "circuit transitioned open -> half_open");
                    Ok(CallPermit::Probe)
                } else {
                    Err(CircuitOpenError {
                        name: name.to_string(),
                        retry_after_ms: self.config.reset_timeout_ms - elapsed,
                    })
                }
            }
            CircuitPhase::HalfOpen => {
                self.begin_probe(name)?;
                Ok(CallPermit::Probe)
            }
        }
    }

    fn begin_probe(&self, name: &str) -> Result<(), CircuitOpenError> {
        let mut probes = self
            .probes_in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !probes.insert(name.to_string()) {
            return Err(CircuitOpenError {
                name: name.to_string(),
                retry_after_ms: self.config.reset_timeout_ms,
            });
        }
        Ok(())
    }

    fn end_probe(&self, name: &str) {
        let mut probes = self
            .probes_in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        probes.remove(name);
    }

    /// Records a successful call against `name`.
    pub fn record_success(&self, name: &str) {
        self.end_probe(name);
        let config = self.config;
        let _ = self.mutate(name, |circuit| match circuit.phase {
            CircuitPhase::Closed => {
                circuit.consecutive_failures = 0;
            }
            CircuitPhase::HalfOpen => {
                circuit.consecutive_successes += 1;
                if circuit.consecutive_successes >= config.success_threshold {
                    info!("circuit closed after successful probes");
                    *circuit = CircuitState::default();
                }
            }
            CircuitPhase::Open => {
                // A success while open means the window elapsed elsewhere;
                // treat it as the first half-open probe result.
                circuit.phase = CircuitPhase::HalfOpen;
                circuit.consecutive_successes = 1;
            }
        });
    }

    /// Records a failed call against `name` at `now_ms`.
    pub fn record_failure(&self, name: &str, now_ms: u64) {
        self.end_probe(name);
        let config = self.config;
        let _ = self.mutate(name, |circuit| match circuit.phase {
            CircuitPhase::Closed => {
                circuit.consecutive_failures += 1;
                if circuit.consecutive_failures >= config.failure_threshold {
                    warn!(
                        failures = circuit.consecutive_failures,
                        "circuit opened after consecutive failures"
                    );
                    circuit.phase = CircuitPhase::Open;
                    circuit.opened_at_ms = Some(now_ms);
                }
            }
            CircuitPhase::HalfOpen => {
                warn!("probe failed; circuit re-opened");
                circuit.phase = CircuitPhase::Open;
                circuit.opened_at_ms = Some(now_ms);
                circuit.consecutive_successes = 0;
            }
            CircuitPhase::Open => {
                circuit.opened_at_ms = Some(now_ms);
            }
        });
    }

    /// Resets one circuit to closed.
    pub fn reset(&self, name: &str) -> Result<()> {
        self.end_probe(name);
        self.store
            .atomic_update(CIRCUITS_FILE, validate_circuits, |mut state: CircuitsState| {
                state.circuits.remove(name);
                Ok(state)
            })?;
        debug!(circuit = name, "circuit reset to closed");
        Ok(())
    }

    /// Snapshot of every known circuit for status output.
    pub fn snapshot(&self) -> HashMap<String, CircuitState> {
        self.load().circuits
    }

    /// Names of circuits currently not closed.
    pub fn open_circuits(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .load()
            .circuits
            .into_iter()
            .filter(|(_, circuit)| circuit.phase != CircuitPhase::Closed)
            .map(|(name, _)| name)
            .collect();
        names.sort();
        names
    }

    fn load(&self) -> CircuitsState {
        self.store.load_state(CIRCUITS_FILE, validate_circuits)
    }

    fn mutate(&self, name: &str, apply: impl FnOnce(&mut CircuitState)) -> Result<()> {
        self.store
            .atomic_update(CIRCUITS_FILE, validate_circuits, |mut state: CircuitsState| {
                let circuit = state.circuits.entry(name.to_string()).or_default();
                apply(circuit);
                Ok(state)
            })?;
        Ok(())
    }
}
