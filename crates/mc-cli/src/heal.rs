//! Self-heal orchestration: scan categories, plan fixes, apply, verify.
//!
//! The scan turns raw observations into an ordered issue list; planning is
//! pure over that list; apply executes the fixable actions in a fixed
//! order and aborts if a protected artifact ever reaches its prune step.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use mc_core::{OpsError, StateStore};
use mc_gateway::{GatewayClient, GatewayConfig};
use mc_resilience::CircuitBreakerRegistry;

use crate::docker::{self, PruneTarget};
use crate::output::CommandReport;
use crate::sysinfo;

/// Issue categories, in scan order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    Docker,
    Services,
    Disk,
    Memory,
    Config,
    Circuits,
    Artifacts,
}

/// Issue severities, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

/// The concrete fix the applier knows how to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealAction {
    RestartService { name: String },
    FixPermission { path: PathBuf, mode: u32 },
    ResetCircuit { name: String },
    PruneArtifact { target: PruneTarget },
    None,
}

/// One detected operational issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub category: IssueCategory,
    pub severity: Severity,
    pub summary: String,
    pub fixable: bool,
    pub action: HealAction,
}

/// Raw observations collected before the pure scan step.
#[derive(Debug, Clone, Default)]
pub struct ScanObservations {
    pub docker_reachable: bool,
    /// `(service, healthy)` pairs from the gateway health fan-out.
    pub service_health: Vec<(String, bool)>,
    pub disk_free_bytes: Option<u64>,
    pub memory_available_bytes: Option<u64>,
    /// `(path, mode)` for config files that should be owner-only.
    pub config_file_modes: Vec<(PathBuf, u32)>,
    pub open_circuits: Vec<String>,
    pub artifacts: Vec<PruneTarget>,
}

/// Well-known services whose `/health` endpoints the scan probes.
pub const HEALTH_CHECKED_SERVICES: &[(&str, &str)] =
    &[("gateway", "/health")];

/// Protected docker prefixes when config does not override them.
pub fn default_protected_prefixes() -> Vec<String> {
    ["mc-chroma", "mc-postgres", "mc-data", "masterclaw_"]
        .iter()
        .map(|prefix| prefix.to_string())
        .collect()
}

/// Resolves the protected set: config key `heal.protected` is authoritative
/// when present.
pub fn protected_prefixes(config: &serde_json::Value) -> Vec<String> {
    config
        .pointer("/heal/protected")
        .and_then(|value| value.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_else(default_protected_prefixes)
}

/// Collects every observation the scan needs.
pub async fn gather_observations(
    store: &StateStore,
    breakers: &CircuitBreakerRegistry,
    gateway_config: GatewayConfig,
    protected: &[String],
) -> ScanObservations {
    let docker_reachable = docker::daemon_reachable().await;

    let mut service_health = Vec::new();
    let gateway = GatewayClient::new(breakers, gateway_config);
    for (service, _path) in HEALTH_CHECKED_SERVICES {
        let healthy = matches!(
            gateway.health().await,
            Ok(report) if report.status == "healthy" || report.status == "ok"
        );
        service_health.push((service.to_string(), healthy));
    }

    let disk_free_bytes = sysinfo::disk_free_bytes("/").await.ok();
    let memory_available_bytes = sysinfo::memory_available_bytes().ok();

    let mut config_file_modes = Vec::new();
    for name in ["config.json", "rate-limits.json", "circuits.json", "events.json"] {
        let path = store.file_path(name);
        if let Some(mode) = file_mode(&path) {
            config_file_modes.push((path, mode));
        }
    }
    if let Ok(infra_dir) = std::env::var("MC_INFRA_DIR") {
        let env_file = PathBuf::from(infra_dir).join(".env");
        if let Some(mode) = file_mode(&env_file) {
            config_file_modes.push((env_file, mode));
        }
    }

    let open_circuits = breakers.open_circuits();

    let mut artifacts = Vec::new();
    if docker_reachable {
        for collected in [
            docker::dangling_images(protected).await,
            docker::exited_containers(protected).await,
            docker::dangling_volumes(protected).await,
        ] {
            if let Ok(mut targets) = collected {
                artifacts.append(&mut targets);
            }
        }
    }

    ScanObservations {
        docker_reachable,
        service_health,
        disk_free_bytes,
        memory_available_bytes,
        config_file_modes,
        open_circuits,
        artifacts,
    }
}

fn file_mode(path: &std::path::Path) -> Option<u32> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .ok()
            .map(|metadata| metadata.permissions().mode() & 0o777)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        None
    }
}

/// Pure scan: observations in, ordered issue list out.
pub fn scan(observations: &ScanObservations) -> Vec<Issue> {
    let mut issues = Vec::new();

    if !observations.docker_reachable {
        issues.push(Issue {
            category: IssueCategory::Docker,
            severity: Severity::Critical,
            summary: "docker daemon is not reachable".to_string(),
            fixable: false,
            action: HealAction::None,
        });
    }

    for (service, healthy) in &observations.service_health {
        if !healthy {
            issues.push(Issue {
                category: IssueCategory::Services,
                severity: Severity::High,
                summary: format!("service '{service}' failed its health check"),
                fixable: observations.docker_reachable,
                action: if observations.docker_reachable {
                    HealAction::RestartService {
                        name: format!("mc-{service}"),
                    }
                } else {
                    HealAction::None
                },
            });
        }
    }

    if let Some(free) = observations.disk_free_bytes {
        if free <= sysinfo::DISK_CRITICAL_BYTES {
            issues.push(Issue {
                category: IssueCategory::Disk,
                severity: Severity::Critical,
                summary: format!("critically low disk space: {} MiB free", free >> 20),
                fixable: false,
                action: HealAction::None,
            });
        } else if free <= sysinfo::DISK_WARNING_BYTES {
            issues.push(Issue {
                category: IssueCategory::Disk,
                severity: Severity::Medium,
                summary: format!("low disk space: {} GiB free", free >> 30),
                fixable: false,
                action: HealAction::None,
            });
        }
    }

    if let Some(available) = observations.memory_available_bytes {
        if available <= sysinfo::MEMORY_CRITICAL_BYTES {
            issues.push(Issue {
                category: IssueCategory::Memory,
                severity: Severity::Critical,
                summary: format!("critically low memory: {} MiB available", available >> 20),
                fixable: false,
                action: HealAction::None,
            });
        } else if available <= sysinfo::MEMORY_WARNING_BYTES {
            issues.push(Issue {
                category: IssueCategory::Memory,
                severity: Severity::Medium,
                summary: format!("low memory: {} MiB available", available >> 20),
                fixable: false,
                action: HealAction::None,
            });
        }
    }

    for (path, mode) in &observations.config_file_modes {
        if *mode != mc_core::STATE_FILE_MODE {
            issues.push(Issue {
                category: IssueCategory::Config,
                severity: Severity::High,
                summary: format!(
                    "{} has mode {mode:o}, expected {:o}",
                    path.display(),
                    mc_core::STATE_FILE_MODE
                ),
                fixable: true,
                action: HealAction::FixPermission {
                    path: path.clone(),
                    mode: mc_core::STATE_FILE_MODE,
                },
            });
        }
    }

    for circuit in &observations.open_circuits {
        issues.push(Issue {
            category: IssueCategory::Circuits,
            severity: Severity::Medium,
            summary: format!("circuit '{circuit}' is open"),
            fixable: true,
            action: HealAction::ResetCircuit {
                name: circuit.clone(),
            },
        });
    }

    for target in &observations.artifacts {
        issues.push(Issue {
            category: IssueCategory::Artifacts,
            severity: Severity::Low,
            summary: format!(
                "{} '{}' is unused{}",
                target.kind.as_str(),
                target.id,
                if target.protected { " (protected)" } else { "" }
            ),
            fixable: !target.protected,
            action: if target.protected {
                HealAction::None
            } else {
                HealAction::PruneArtifact {
                    target: target.clone(),
                }
            },
        });
    }

    issues
}

/// Dry-run rendering of a scan: fixable and manual actions, no mutation.
#[derive(Debug, Clone, Serialize)]
pub struct HealPlan {
    pub fixable: Vec<Issue>,
    pub manual: Vec<Issue>,
}

pub fn plan(issues: Vec<Issue>) -> HealPlan {
    let (fixable, manual) = issues.into_iter().partition(|issue| issue.fixable);
    HealPlan { fixable, manual }
}

/// Outcome of one applied action.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedAction {
    pub summary: String,
    pub ok: bool,
    pub detail: String,
}

/// Executes the fixable actions in their fixed order: service restarts,
/// permission fixes, circuit resets, artifact pruning.
///
/// A protected artifact inside the fixable list is a planner bug: apply
/// aborts with an integrity error before touching anything else.
pub async fn apply(
    plan: &HealPlan,
    breakers: &CircuitBreakerRegistry,
) -> Result<Vec<AppliedAction>, OpsError> {
    for issue in &plan.fixable {
        if let HealAction::PruneArtifact { target } = &issue.action {
            if target.protected {
                return Err(OpsError::Integrity(format!(
                    "protected artifact '{}' reached the apply stage; aborting",
                    target.id
                )));
            }
        }
    }

    let mut applied = Vec::new();

    for issue in ordered_fixables(&plan.fixable) {
        let outcome = match &issue.action {
            HealAction::RestartService { name } => {
                docker::restart_service(name).await.map(|_| "restarted".to_string())
            }
            HealAction::FixPermission { path, mode } => fix_permission(path, *mode),
            HealAction::ResetCircuit { name } => breakers
                .reset(name)
                .map(|_| "reset to closed".to_string()),
            HealAction::PruneArtifact { target } => {
                docker::remove_artifact(target).await.map(|_| "removed".to_string())
            }
            HealAction::None => Ok("nothing to do".to_string()),
        };
        match outcome {
            Ok(detail) => {
                info!(summary = %issue.summary, "heal action applied");
                applied.push(AppliedAction {
                    summary: issue.summary.clone(),
                    ok: true,
                    detail,
                });
            }
            Err(error) => {
                warn!(summary = %issue.summary, error = %error, "heal action failed");
                applied.push(AppliedAction {
                    summary: issue.summary.clone(),
                    ok: false,
                    detail: error.to_string(),
                });
            }
        }
    }

    Ok(applied)
}

/// Applies the fixed ordering: restarts, permissions, circuits, prunes.
fn ordered_fixables(fixable: &[Issue]) -> Vec<&Issue> {
    let rank = |issue: &Issue| match issue.action {
        HealAction::RestartService { .. } => 0,
        HealAction::FixPermission { .. } => 1,
        HealAction::ResetCircuit { .. } => 2,
        HealAction::PruneArtifact { .. } => 3,
        HealAction::None => 4,
    };
    let mut ordered: Vec<&Issue> = fixable.iter().collect();
    ordered.sort_by_key(|issue| rank(issue));
    ordered
}

fn fix_permission(path: &std::path::Path, mode: u32) -> anyhow::Result<String> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        Ok(format!("mode restored to {mode:o}"))
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
        Ok("permission fix skipped on this platform".to_string())
    }
}

/// Renders a plan for command output.
pub fn plan_report(plan: &HealPlan) -> CommandReport {
    let mut human = String::new();
    if plan.fixable.is_empty() && plan.manual.is_empty() {
        human.push_str("no issues found");
    } else {
        human.push_str(&format!(
            "{} fixable, {} manual\n",
            plan.fixable.len(),
            plan.manual.len()
        ));
        for issue in &plan.fixable {
            human.push_str(&format!("  fix: {}\n", issue.summary));
        }
        for issue in &plan.manual {
            human.push_str(&format!("  manual: {}\n", issue.summary));
        }
        human.pop();
    }
    CommandReport::new(
        human,
        json!({
            "fixable": plan.fixable,
            "manual": plan.manual,
        }),
    )
}

/// Renders apply results, including a category histogram.
pub fn apply_report(applied: &[AppliedAction]) -> CommandReport {
    let mut histogram: BTreeMap<&str, usize> = BTreeMap::new();
    for action in applied {
        *histogram.entry(if action.ok { "applied" } else { "failed" }).or_default() += 1;
    }
    let human = if applied.is_empty() {
        "nothing to apply".to_string()
    } else {
        applied
            .iter()
            .map(|action| {
                format!(
                    "{} {} ({})",
                    if action.ok { "ok:" } else { "failed:" },
                    action.summary,
                    action.detail
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    CommandReport::new(
        human,
        json!({
            "applied": applied,
            "summary": histogram,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::ArtifactKind;

    fn observations_with_artifacts(artifacts: Vec<PruneTarget>) -> ScanObservations {
        ScanObservations {
            docker_reachable: true,
            service_health: vec![("gateway".to_string(), true)],
            disk_free_bytes: Some(50 << 30),
            memory_available_bytes: Some(8 << 30),
            config_file_modes: vec![],
            open_circuits: vec![],
            artifacts,
        }
    }

    fn target(kind: ArtifactKind, id: &str, protected: bool) -> PruneTarget {
        PruneTarget {
            kind,
            id: id.to_string(),
            size_bytes: 0,
            protected,
        }
    }

    #[test]
    fn functional_healthy_observations_scan_to_no_issues() {
        let issues = scan(&observations_with_artifacts(vec![]));
        assert!(issues.is_empty());
    }

    #[test]
    fn functional_scan_covers_every_category() {
        let observations = ScanObservations {
            docker_reachable: false,
            service_health: vec![("gateway".to_string(), false)],
            disk_free_bytes: Some(512 << 20),
            memory_available_bytes: Some(256 << 20),
            config_file_modes: vec![(PathBuf::from("/state/config.json"), 0o644)],
            open_circuits: vec!["gateway:health".to_string()],
            artifacts: vec![target(ArtifactKind::Volume, "dangling", false)],
        };
        let issues = scan(&observations);
        let categories: Vec<IssueCategory> =
            issues.iter().map(|issue| issue.category).collect();
        assert!(categories.contains(&IssueCategory::Docker));
        assert!(categories.contains(&IssueCategory::Services));
        assert!(categories.contains(&IssueCategory::Disk));
        assert!(categories.contains(&IssueCategory::Memory));
        assert!(categories.contains(&IssueCategory::Config));
        assert!(categories.contains(&IssueCategory::Circuits));
        assert!(categories.contains(&IssueCategory::Artifacts));
    }

    #[test]
    fn unit_unhealthy_service_is_unfixable_without_docker() {
        let observations = ScanObservations {
            docker_reachable: false,
            service_health: vec![("gateway".to_string(), false)],
            ..ScanObservations::default()
        };
        let issues = scan(&observations);
        let service_issue = issues
            .iter()
            .find(|issue| issue.category == IssueCategory::Services)
            .expect("service issue");
        assert!(!service_issue.fixable);
    }

    #[test]
    fn functional_plan_keeps_protected_artifacts_out_of_the_fixable_list() {
        let observations = observations_with_artifacts(vec![
            target(ArtifactKind::Container, "mc-core.bak-123", false),
            target(ArtifactKind::Volume, "dangling", false),
            target(ArtifactKind::Volume, "mc-chroma-data", true),
        ]);
        let plan = plan(scan(&observations));
        assert_eq!(plan.fixable.len(), 2);
        assert_eq!(plan.manual.len(), 1);
        assert!(plan.manual[0].summary.contains("protected"));
        assert!(plan
            .fixable
            .iter()
            .all(|issue| matches!(issue.action, HealAction::PruneArtifact { .. })));
    }

    #[tokio::test]
    async fn regression_apply_aborts_when_a_protected_target_slips_into_the_plan() {
        let tampered = HealPlan {
            fixable: vec![Issue {
                category: IssueCategory::Artifacts,
                severity: Severity::Low,
                summary: "volume 'mc-chroma-data' is unused (protected)".to_string(),
                fixable: true,
                action: HealAction::PruneArtifact {
                    target: target(ArtifactKind::Volume, "mc-chroma-data", true),
                },
            }],
            manual: vec![],
        };
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::open(dir.path().join("state")).expect("store");
        let breakers = CircuitBreakerRegistry::new(store, Default::default());
        let error = apply(&tampered, &breakers).await.expect_err("must abort");
        assert_eq!(error.exit_code(), mc_core::ExitCode::Integrity);
    }

    #[tokio::test]
    async fn functional_apply_resets_open_circuits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::open(dir.path().join("state")).expect("store");
        let breakers = CircuitBreakerRegistry::new(store, Default::default());
        let now = mc_core::current_unix_timestamp_ms();
        for _ in 0..3 {
            breakers.record_failure("gateway:health", now);
        }
        assert_eq!(breakers.open_circuits().len(), 1);

        let heal_plan = plan(scan(&ScanObservations {
            docker_reachable: true,
            open_circuits: breakers.open_circuits(),
            ..ScanObservations::default()
        }));
        let applied = apply(&heal_plan, &breakers).await.expect("apply");
        assert_eq!(applied.len(), 1);
        assert!(applied[0].ok);
        assert!(breakers.open_circuits().is_empty());

        // Idempotence: a rescan finds nothing fixable.
        let rescan = plan(scan(&ScanObservations {
            docker_reachable: true,
            open_circuits: breakers.open_circuits(),
            ..ScanObservations::default()
        }));
        assert!(rescan.fixable.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn functional_apply_fixes_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("config.json");
        std::fs::write(&file, "{}").expect("write");
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o644)).expect("chmod");

        let observations = ScanObservations {
            docker_reachable: true,
            config_file_modes: vec![(file.clone(), 0o644)],
            ..ScanObservations::default()
        };
        let heal_plan = plan(scan(&observations));
        assert_eq!(heal_plan.fixable.len(), 1);

        let store = StateStore::open(dir.path().join("state")).expect("store");
        let breakers = CircuitBreakerRegistry::new(store, Default::default());
        let applied = apply(&heal_plan, &breakers).await.expect("apply");
        assert!(applied[0].ok);
        let mode = std::fs::metadata(&file).expect("metadata").permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn unit_apply_order_is_restart_permission_circuit_prune() {
        let issues = vec![
            Issue {
                category: IssueCategory::Artifacts,
                severity: Severity::Low,
                summary: "prune".into(),
                fixable: true,
                action: HealAction::PruneArtifact {
                    target: target(ArtifactKind::Volume, "v", false),
                },
            },
            Issue {
                category: IssueCategory::Circuits,
                severity: Severity::Medium,
                summary: "circuit".into(),
                fixable: true,
                action: HealAction::ResetCircuit { name: "c".into() },
            },
            Issue {
                category: IssueCategory::Services,
                severity: Severity::High,
                summary: "restart".into(),
                fixable: true,
                action: HealAction::RestartService { name: "s".into() },
            },
        ];
        let ordered = ordered_fixables(&issues);
        assert_eq!(ordered[0].summary, "restart");
        assert_eq!(ordered[1].summary, "circuit");
        assert_eq!(ordered[2].summary, "prune");
    }

    #[test]
    fn unit_protected_prefixes_prefer_config_override() {
        let config = serde_json::json!({"heal": {"protected": ["custom-"]}});
        assert_eq!(protected_prefixes(&config), vec!["custom-".to_string()]);
        assert_eq!(
            protected_prefixes(&serde_json::json!({})),
            default_protected_prefixes()
        );
    }
}
