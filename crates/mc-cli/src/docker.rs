//! Container-runtime helpers used by heal, prune, and logs.
//!
//! Everything goes through the validated subprocess layer; these functions
//! only build argv vectors and parse the line-oriented output formats.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use mc_process::{run, ProcessResult, SubprocessDescriptor};

/// Artifact kinds the prune path understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Image,
    Container,
    Volume,
    Network,
    Cache,
}

impl ArtifactKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Container => "container",
            Self::Volume => "volume",
            Self::Network => "network",
            Self::Cache => "cache",
        }
    }
}

/// One prunable docker object with its protection flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneTarget {
    pub kind: ArtifactKind,
    pub id: String,
    pub size_bytes: u64,
    pub protected: bool,
}

/// Built-in docker networks that are never prunable.
const BUILTIN_NETWORKS: &[&str] = &["bridge", "host", "none"];

async fn docker(args: &[&str], timeout_ms: u64) -> Result<ProcessResult> {
    let descriptor = SubprocessDescriptor::new(
        "docker",
        args.iter().map(|arg| arg.to_string()).collect(),
    )
    .with_timeout_ms(timeout_ms);
    let result = run(&descriptor).await?;
    Ok(result)
}

/// True when the docker daemon answers `docker info`.
pub async fn daemon_reachable() -> bool {
    match docker(&["info", "--format", "{{.ServerVersion}}"], 5_000).await {
        Ok(result) => result.success(),
        Err(_) => false,
    }
}

/// Dangling images as prune targets.
pub async fn dangling_images(protected: &[String]) -> Result<Vec<PruneTarget>> {
    let result = docker(
        &[
            "images",
            "--filter",
            "dangling=true",
            "--format",
            "{{.ID}}\t{{.Repository}}",
        ],
        15_000,
    )
    .await?;
    Ok(parse_artifact_lines(
        &result.stdout,
        ArtifactKind::Image,
        protected,
    ))
}

/// Exited containers as prune targets.
pub async fn exited_containers(protected: &[String]) -> Result<Vec<PruneTarget>> {
    let result = docker(
        &[
            "ps",
            "--all",
            "--filter",
            "status=exited",
            "--format",
            "{{.Names}}",
        ],
        15_000,
    )
    .await?;
    Ok(parse_artifact_lines(
        &result.stdout,
        ArtifactKind::Container,
        protected,
    ))
}

/// Dangling volumes as prune targets.
pub async fn dangling_volumes(protected: &[String]) -> Result<Vec<PruneTarget>> {
    let result = docker(
        &[
            "volume",
            "ls",
            "--filter",
            "dangling=true",
            "--format",
            "{{.Name}}",
        ],
        15_000,
    )
    .await?;
    Ok(parse_artifact_lines(
        &result.stdout,
        ArtifactKind::Volume,
        protected,
    ))
}

/// Custom networks (built-ins excluded) as prune targets.
pub async fn custom_networks(protected: &[String]) -> Result<Vec<PruneTarget>> {
    let result = docker(&["network", "ls", "--format", "{{.Name}}"], 15_000).await?;
    let mut targets = parse_artifact_lines(&result.stdout, ArtifactKind::Network, protected);
    targets.retain(|target| !BUILTIN_NETWORKS.contains(&target.id.as_str()));
    Ok(targets)
}

/// Parses one artifact id per line, tagging protection by prefix match.
pub fn parse_artifact_lines(
    stdout: &str,
    kind: ArtifactKind,
    protected: &[String],
) -> Vec<PruneTarget> {
    stdout
        .lines()
        .filter_map(|line| {
            let id = line.split('\t').next().unwrap_or(line).trim();
            if id.is_empty() {
                return None;
            }
            Some(PruneTarget {
                kind,
                id: id.to_string(),
                size_bytes: 0,
                protected: is_protected(id, protected),
            })
        })
        .collect()
}

/// Prefix match against the protected set.
pub fn is_protected(id: &str, protected: &[String]) -> bool {
    protected.iter().any(|prefix| id.starts_with(prefix.as_str()))
}

/// Removes one artifact; the caller has already checked the protection flag.
pub async fn remove_artifact(target: &PruneTarget) -> Result<()> {
    let args: Vec<&str> = match target.kind {
        ArtifactKind::Image => vec!["rmi", target.id.as_str()],
        ArtifactKind::Container => vec!["rm", target.id.as_str()],
        ArtifactKind::Volume => vec!["volume", "rm", target.id.as_str()],
        ArtifactKind::Network => vec!["network", "rm", target.id.as_str()],
        ArtifactKind::Cache => vec!["builder", "prune", "--force"],
    };
    let result = docker(&args, 30_000).await?;
    if !result.success() {
        anyhow::bail!(
            "failed to remove {} '{}': {}",
            target.kind.as_str(),
            target.id,
            result.stderr.trim()
        );
    }
    debug!(kind = target.kind.as_str(), id = %target.id, "removed docker artifact");
    Ok(())
}

/// Restarts a service container and polls until it reports running.
pub async fn restart_service(name: &str) -> Result<()> {
    let result = docker(&["restart", name], 60_000).await?;
    if !result.success() {
        anyhow::bail!("failed to restart '{name}': {}", result.stderr.trim());
    }
    for _ in 0..10 {
        let state = docker(
            &["inspect", "--format", "{{.State.Running}}", name],
            5_000,
        )
        .await?;
        if state.success() && state.stdout.trim() == "true" {
            return Ok(());
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
    anyhow::bail!("service '{name}' did not report running after restart")
}

/// Tails a container's logs.
pub async fn container_logs(name: &str, tail: usize) -> Result<ProcessResult> {
    let tail_spec = tail.to_string();
    docker(&["logs", "--tail", tail_spec.as_str(), name], 30_000).await
}
