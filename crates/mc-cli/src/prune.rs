//! Prune command: list unused docker artifacts and remove the unprotected
//! ones.

use serde_json::json;
use tracing::info;

use mc_core::OpsError;

use crate::docker::{self, PruneTarget};
use crate::output::CommandReport;

/// Everything the prune command found, split by protection.
#[derive(Debug, Clone, Default)]
pub struct PruneSurvey {
    pub prunable: Vec<PruneTarget>,
    pub protected: Vec<PruneTarget>,
}

/// Collects dangling images, exited containers, unused volumes, and custom
/// networks, split by the protected-prefix rule.
pub async fn survey(protected_prefixes: &[String]) -> Result<PruneSurvey, OpsError> {
    if !docker::daemon_reachable().await {
        return Err(OpsError::Dependency(
            "docker daemon is not reachable".to_string(),
        ));
    }
    let mut all = Vec::new();
    for collected in [
        docker::dangling_images(protected_prefixes).await,
        docker::exited_containers(protected_prefixes).await,
        docker::dangling_volumes(protected_prefixes).await,
        docker::custom_networks(protected_prefixes).await,
    ] {
        let mut targets = collected.map_err(OpsError::Generic)?;
        all.append(&mut targets);
    }
    Ok(split_by_protection(all))
}

/// Pure split of a target list by its protection flag.
pub fn split_by_protection(targets: Vec<PruneTarget>) -> PruneSurvey {
    let (protected, prunable) = targets.into_iter().partition(|target| target.protected);
    PruneSurvey { prunable, protected }
}

/// Removes every unprotected target, returning `(removed, failed)` ids.
///
/// The protected list is never touched; a protected target in the prunable
/// list would already have aborted in the heal applier, and the same
/// invariant is re-checked here.
pub async fn apply(survey: &PruneSurvey) -> Result<(Vec<String>, Vec<String>), OpsError> {
    if let Some(offender) = survey.prunable.iter().find(|target| target.protected) {
        return Err(OpsError::Integrity(format!(
            "protected artifact '{}' listed as prunable; aborting",
            offender.id
        )));
    }
    let mut removed = Vec::new();
    let mut failed = Vec::new();
    for target in &survey.prunable {
        match docker::remove_artifact(target).await {
            Ok(()) => {
                info!(id = %target.id, kind = target.kind.as_str(), "pruned artifact");
                removed.push(target.id.clone());
            }
            Err(error) => {
                tracing::warn!(id = %target.id, error = %error, "prune failed");
                failed.push(target.id.clone());
            }
        }
    }
    Ok((removed, failed))
}

/// Renders the dry-run listing.
pub fn survey_report(survey: &PruneSurvey) -> CommandReport {
    let mut human = String::new();
    if survey.prunable.is_empty() && survey.protected.is_empty() {
        human.push_str("nothing to prune");
    } else {
        for target in &survey.prunable {
            human.push_str(&format!(
                "prunable: {} '{}'\n",
                target.kind.as_str(),
                target.id
            ));
        }
        for target in &survey.protected {
            human.push_str(&format!(
                "protected: {} '{}'\n",
                target.kind.as_str(),
                target.id
            ));
        }
        human.pop();
    }
    CommandReport::new(
        human,
        json!({
            "prunable": survey.prunable,
            "protected": survey.protected,
        }),
    )
}

/// Renders the apply outcome.
pub fn apply_report(removed: &[String], failed: &[String], protected: &[PruneTarget]) -> CommandReport {
    let human = format!(
        "removed {} artifact(s), {} failed, {} protected left untouched",
        removed.len(),
        failed.len(),
        protected.len()
    );
    CommandReport::new(
        human,
        json!({
            "removed": removed,
            "failed": failed,
            "protected": protected.iter().map(|target| target.id.clone()).collect::<Vec<_>>(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::ArtifactKind;

    fn target(kind: ArtifactKind, id: &str, protected: bool) -> PruneTarget {
        PruneTarget {
            kind,
            id: id.to_string(),
            size_bytes: 0,
            protected,
        }
    }

    #[test]
    fn unit_split_by_protection_partitions_targets() {
        let survey = split_by_protection(vec![
            target(ArtifactKind::Container, "mc-core.bak-123", false),
            target(ArtifactKind::Volume, "dangling", false),
            target(ArtifactKind::Volume, "mc-chroma-data", true),
        ]);
        assert_eq!(survey.prunable.len(), 2);
        assert_eq!(survey.protected.len(), 1);
        assert_eq!(survey.protected[0].id, "mc-chroma-data");
    }

    #[tokio::test]
    async fn regression_apply_refuses_a_protected_target_in_the_prunable_list() {
        let tampered = PruneSurvey {
            prunable: vec![target(ArtifactKind::Volume, "mc-chroma-data", true)],
            protected: vec![],
        };
        let error = apply(&tampered).await.expect_err("must abort");
        assert_eq!(error.exit_code(), mc_core::ExitCode::Integrity);
    }

    #[test]
    fn unit_survey_report_lists_both_groups() {
        let survey = split_by_protection(vec![
            target(ArtifactKind::Container, "mc-core.bak-123", false),
            target(ArtifactKind::Volume, "mc-chroma-data", true),
        ]);
        let report = survey_report(&survey);
        assert!(report.human.contains("prunable: container 'mc-core.bak-123'"));
        assert!(report.human.contains("protected: volume 'mc-chroma-data'"));
        assert_eq!(report.json["prunable"][0]["id"], "mc-core.bak-123");
        assert_eq!(report.json["protected"][0]["id"], "mc-chroma-data");
    }

    #[test]
    fn unit_empty_survey_renders_a_quiet_message() {
        let report = survey_report(&PruneSurvey::default());
        assert_eq!(report.human, "nothing to prune");
    }
}
