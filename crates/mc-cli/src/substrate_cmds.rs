//! Operator commands over the state substrate: audit, circuits, rate
//! limits, and service logs.

use serde_json::json;

use mc_audit::AuditVerification;
use mc_core::{current_unix_timestamp_ms, OpsError};

use crate::context::{AppHandles, CommandContext};
use crate::exec::CONTAINER_WHITELIST;
use crate::output::CommandReport;

/// `audit verify`.
pub fn handle_audit_verify(handles: &AppHandles) -> Result<CommandReport, OpsError> {
    match handles.audit.verify().map_err(OpsError::Generic)? {
        AuditVerification::Valid { records } => Ok(CommandReport::new(
            format!("audit chain intact over {records} record(s)"),
            json!({ "valid": true, "records": records }),
        )),
        AuditVerification::TamperedAt { index } => Err(OpsError::Integrity(format!(
            "audit chain broken at record index {index}"
        ))),
    }
}

/// `audit tail --count N`.
pub fn handle_audit_tail(handles: &AppHandles, count: usize) -> Result<CommandReport, OpsError> {
    let records = handles.audit.tail(count).map_err(OpsError::Generic)?;
    let human = if records.is_empty() {
        "audit log is empty".to_string()
    } else {
        records
            .iter()
            .map(|record| {
                format!(
                    "{} {} {} {}",
                    record.timestamp,
                    record.event_type.as_str(),
                    record.subject,
                    record.correlation_id
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    Ok(CommandReport::new(human, json!({ "records": records })))
}

/// `circuits status`.
pub fn handle_circuits_status(handles: &AppHandles) -> Result<CommandReport, OpsError> {
    let snapshot = handles.breakers.snapshot();
    let mut names: Vec<&String> = snapshot.keys().collect();
    names.sort();
    let human = if names.is_empty() {
        "no circuits recorded".to_string()
    } else {
        names
            .iter()
            .map(|name| {
                let state = &snapshot[*name];
                format!(
                    "{name}: {} (failures {})",
                    state.phase.as_str(),
                    state.consecutive_failures
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    Ok(CommandReport::new(human, json!({ "circuits": snapshot })))
}

/// `circuits reset <name>` (requires `--force`).
pub fn handle_circuits_reset(
    handles: &AppHandles,
    name: &str,
    force: bool,
) -> Result<CommandReport, OpsError> {
    require_force(force, "circuits reset")?;
    if !handles.breakers.snapshot().contains_key(name) {
        return Err(OpsError::Absent(format!("circuit '{name}' is not recorded")));
    }
    handles.breakers.reset(name).map_err(OpsError::Generic)?;
    Ok(CommandReport::new(
        format!("circuit '{name}' reset to closed"),
        json!({ "circuit": name, "ok": true }),
    ))
}

/// `rate-limit status`.
pub fn handle_rate_limit_status(
    context: &CommandContext,
    handles: &AppHandles,
) -> Result<CommandReport, OpsError> {
    let usage = handles
        .limiter
        .usage(&context.user_identity, current_unix_timestamp_ms());
    let human = if usage.is_empty() {
        "no rate-limit activity in the current windows".to_string()
    } else {
        usage
            .iter()
            .map(|bucket| {
                format!(
                    "{}: {}/{} in {}s window",
                    bucket.category,
                    bucket.used,
                    bucket.max,
                    bucket.window_ms / 1_000
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    Ok(CommandReport::new(human, json!({ "buckets": usage })))
}

/// `rate-limit reset [category]` (requires `--force`).
pub fn handle_rate_limit_reset(
    context: &CommandContext,
    handles: &AppHandles,
    category: Option<&str>,
    force: bool,
) -> Result<CommandReport, OpsError> {
    require_force(force, "rate-limit reset")?;
    handles
        .limiter
        .reset(&context.user_identity, category)
        .map_err(OpsError::Generic)?;
    Ok(CommandReport::new(
        match category {
            Some(category) => format!("rate-limit bucket '{category}' cleared"),
            None => "all rate-limit buckets cleared".to_string(),
        },
        json!({ "ok": true, "category": category }),
    ))
}

/// `logs <service> --tail N`: container logs through the validated runner.
pub async fn handle_logs(service: &str, tail: usize) -> Result<CommandReport, OpsError> {
    if !CONTAINER_WHITELIST.contains(&service) {
        return Err(OpsError::Validation(mc_core::ValidationError::new(
            "container_whitelist",
            format!(
                "service is not whitelisted; allowed: {}",
                CONTAINER_WHITELIST.join(", ")
            ),
        )));
    }
    let result = crate::docker::container_logs(service, tail)
        .await
        .map_err(OpsError::Generic)?;
    if !result.success() {
        return Err(OpsError::Dependency(format!(
            "failed to read logs for '{service}': {}",
            result.stderr.trim()
        )));
    }
    Ok(CommandReport::new(
        result.stdout.trim_end().to_string(),
        json!({
            "service": service,
            "lines": result.stdout.lines().count(),
            "stdout": result.stdout,
            "truncated": result.stdout_truncated,
        }),
    ))
}

fn require_force(force: bool, operation: &str) -> Result<(), OpsError> {
    if force {
        Ok(())
    } else {
        Err(OpsError::Usage(format!(
            "'{operation}' is destructive; pass --force to confirm"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AppHandles;
    use tempfile::tempdir;

    fn handles(dir: &std::path::Path) -> AppHandles {
        AppHandles::open(&dir.join("state")).expect("open handles")
    }

    fn context(dir: &std::path::Path) -> CommandContext {
        CommandContext {
            correlation_id: mc_core::CorrelationId::generate(),
            user_identity: "u-test".to_string(),
            started_at_ms: 0,
            command_path: vec![],
            output_mode: crate::context::OutputMode::Human,
            quiet: false,
            debug_enabled: false,
            state_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn functional_audit_verify_reports_the_chain_state() {
        let dir = tempdir().expect("tempdir");
        let handles = handles(dir.path());
        handles
            .audit
            .append(mc_audit::AuditCategory::Auth, "probe", json!({}))
            .expect("append");
        let report = handle_audit_verify(&handles).expect("verify");
        assert_eq!(report.json["valid"], true);
        assert_eq!(report.json["records"], 1);
    }

    #[test]
    fn regression_tampered_audit_is_an_integrity_error() {
        let dir = tempdir().expect("tempdir");
        let handles = handles(dir.path());
        handles
            .audit
            .append(mc_audit::AuditCategory::Auth, "probe", json!({}))
            .expect("append");
        let raw = std::fs::read_to_string(handles.audit.path()).expect("read");
        std::fs::write(handles.audit.path(), raw.replace("probe", "PROBE")).expect("tamper");
        let error = handle_audit_verify(&handles).expect_err("integrity");
        assert_eq!(error.exit_code(), mc_core::ExitCode::Integrity);
    }

    #[test]
    fn unit_destructive_resets_require_force() {
        let dir = tempdir().expect("tempdir");
        let handles = handles(dir.path());
        let context = context(dir.path());
        let error = handle_rate_limit_reset(&context, &handles, None, false)
            .expect_err("force required");
        assert_eq!(error.exit_code(), mc_core::ExitCode::Usage);

        let error =
            handle_circuits_reset(&handles, "x", false).expect_err("force required");
        assert_eq!(error.exit_code(), mc_core::ExitCode::Usage);
    }

    #[test]
    fn unit_circuits_reset_of_unknown_circuit_is_absent() {
        let dir = tempdir().expect("tempdir");
        let handles = handles(dir.path());
        let error = handle_circuits_reset(&handles, "ghost", true).expect_err("absent");
        assert_eq!(error.exit_code(), mc_core::ExitCode::NotFound);
    }

    #[test]
    fn functional_circuits_status_renders_the_snapshot() {
        let dir = tempdir().expect("tempdir");
        let handles = handles(dir.path());
        let now = mc_core::current_unix_timestamp_ms();
        for _ in 0..3 {
            handles.breakers.record_failure("gateway:health", now);
        }
        let report = handle_circuits_status(&handles).expect("status");
        assert!(report.human.contains("gateway:health: open"));

        let reset = handle_circuits_reset(&handles, "gateway:health", true).expect("reset");
        assert_eq!(reset.json["ok"], true);
    }

    #[tokio::test]
    async fn regression_logs_refuses_non_whitelisted_services() {
        let error = handle_logs("postgres", 10).await.expect_err("not whitelisted");
        assert_eq!(error.exit_code(), mc_core::ExitCode::Validation);
    }

    #[test]
    fn functional_rate_limit_status_shows_live_buckets() {
        let dir = tempdir().expect("tempdir");
        let handles = handles(dir.path());
        let context = context(dir.path());
        let now = mc_core::current_unix_timestamp_ms();
        handles
            .limiter
            .admit("u-test", "status", now)
            .expect("io")
            .expect("admitted");
        let report = handle_rate_limit_status(&context, &handles).expect("status");
        assert!(report.human.contains("status: 1/60"));

        handle_rate_limit_reset(&context, &handles, Some("status"), true).expect("reset");
        let report = handle_rate_limit_status(&context, &handles).expect("status");
        assert!(report.human.contains("no rate-limit activity"));
    }
}
