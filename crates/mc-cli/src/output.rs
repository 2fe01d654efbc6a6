//! Rendering of command results and errors in human or JSON mode.

use serde_json::{json, Value};

use mc_core::{mask_sensitive, CorrelationId, OpsError};

use crate::context::OutputMode;

/// One successful command outcome, renderable both ways.
#[derive(Debug, Clone)]
pub struct CommandReport {
    pub human: String,
    pub json: Value,
}

impl CommandReport {
    pub fn new(human: impl Into<String>, json: Value) -> Self {
        Self {
            human: human.into(),
            json,
        }
    }
}

/// Prints a success report to stdout.
pub fn render_success(report: &CommandReport, mode: OutputMode, quiet: bool) {
    match mode {
        OutputMode::Json => {
            println!("{}", mask_sensitive(&report.json));
        }
        OutputMode::Human => {
            if !quiet && !report.human.is_empty() {
                println!("{}", report.human);
            }
        }
    }
}

/// Structured error shape for JSON mode.
pub fn error_payload(error: &OpsError, correlation_id: &CorrelationId) -> Value {
    let exit = error.exit_code();
    let details = error_details(error);
    json!({
        "ts": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        "category": error.category(),
        "exit_code": exit.as_i32(),
        "code": exit.name(),
        "message": error.human_message(),
        "correlation_id": correlation_id.as_str(),
        "details": mask_sensitive(&details),
    })
}

fn error_details(error: &OpsError) -> Value {
    match error {
        OpsError::Validation(validation) => json!({ "rule": validation.rule }),
        OpsError::Security { rule, .. } => json!({ "rule": rule }),
        OpsError::RateLimited {
            category,
            retry_after_ms,
        } => json!({ "category": category, "retry_after_ms": retry_after_ms }),
        OpsError::CircuitOpen {
            name,
            retry_after_ms,
        } => json!({ "circuit": name, "retry_after_ms": retry_after_ms }),
        OpsError::ResourceLimit {
            kind,
            description,
            hint,
        } => json!({
            "resource_violation": { "kind": kind, "description": description, "hint": hint }
        }),
        _ => Value::Null,
    }
}

/// Prints an error in the selected mode: JSON shape to stdout, human text
/// to stderr.
pub fn render_error(error: &OpsError, correlation_id: &CorrelationId, mode: OutputMode) {
    match mode {
        OutputMode::Json => {
            println!("{}", error_payload(error, correlation_id));
        }
        OutputMode::Human => {
            eprintln!("error: {}", error.human_message());
        }
    }
}
