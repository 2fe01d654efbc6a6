//! Container-exec subsystem: whitelisting, command-safety validation,
//! resource envelope, and resource-violation decoding.

use serde_json::json;
use tracing::{debug, warn};

use mc_audit::{AuditCategory, AuditLog};
use mc_core::OpsError;
use mc_process::{ProcessResult, SubprocessDescriptor};

use crate::output::CommandReport;

/// Build-time whitelist of service containers.
pub const CONTAINER_WHITELIST: &[&str] =
    &["mc-core", "mc-backend", "mc-gateway", "mc-proxy", "mc-chroma"];

/// Commands that are never allowed inside a container, in any position.
pub const BLOCKED_COMMANDS: &[&str] = &[
    "rm", "dd", "mkfs", "fdisk", "mount", "umount", "shutdown", "reboot",
];

const SHELL_NAMES: &[&str] = &["sh", "bash", "zsh", "ksh", "dash"];

/// Joined-command byte budget.
pub const MAX_COMMAND_BYTES: usize = 4_096;

/// Default resource envelope applied to non-interactive invocations.
/// nproc 128 soft / 256 hard, address space 512 MiB soft / 1 GiB hard
/// (in KiB), fsize 100 MiB (in KiB blocks), no core dumps.
const RESOURCE_ENVELOPE: &str = "ulimit -S -u 128 2>/dev/null; ulimit -H -u 256 2>/dev/null; \
ulimit -S -v 524288 2>/dev/null; ulimit -H -v 1048576 2>/dev/null; \
ulimit -f 102400 2>/dev/null; ulimit -c 0 2>/dev/null";

/// One validated exec request.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub container: String,
    pub command: Vec<String>,
    pub shell: bool,
    pub timeout_ms: u64,
    pub resource_limits: bool,
}

/// A refused exec request, carrying the rule that fired.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("exec validation rule '{rule}' rejected the request: {detail}")]
pub struct ExecViolation {
    pub rule: &'static str,
    pub detail: String,
}

fn violation(rule: &'static str, detail: impl Into<String>) -> ExecViolation {
    ExecViolation {
        rule,
        detail: detail.into(),
    }
}

/// Validates container, tokens, and the combined command string.
///
/// Every rule fires before any subprocess is spawned; a rejection is also
/// the caller's cue to append a `SECURITY_VIOLATION` audit record.
pub fn validate_exec_request(request: &ExecRequest) -> Result<(), ExecViolation> {
    if !CONTAINER_WHITELIST.contains(&request.container.as_str()) {
        return Err(violation(
            "CONTAINER_WHITELIST",
            format!(
                "container is not whitelisted; allowed: {}",
                CONTAINER_WHITELIST.join(", ")
            ),
        ));
    }
    if request.command.is_empty() {
        return Err(violation("COMMAND_EMPTY", "command must be a non-empty vector"));
    }
    for token in &request.command {
        let lowered = token.to_ascii_lowercase();
        if BLOCKED_COMMANDS.contains(&lowered.as_str()) {
            return Err(violation(
                "BLOCKED_COMMAND",
                format!("token '{lowered}' is on the blocked-command list"),
            ));
        }
    }
    let joined = request.command.join(" ");
    if joined.len() > MAX_COMMAND_BYTES {
        return Err(violation(
            "COMMAND_TOO_LONG",
            format!("joined command exceeds {MAX_COMMAND_BYTES} bytes"),
        ));
    }
    validate_combined_command(&joined)?;
    if request.shell || is_shell_form(&request.command) {
        // The string handed to `-c` gets the same scrutiny on its own.
        if let Some(body) = shell_body(&request.command) {
            validate_combined_command(&body)?;
            validate_shell_body_subcommands(&body)?;
        }
    }
    Ok(())
}

/// Metacharacter scan applied to every combined command, shell-form or not.
fn validate_combined_command(joined: &str) -> Result<(), ExecViolation> {
    if joined.contains(';') || joined.contains("&&") || joined.contains("||") || joined.contains('|')
    {
        return Err(violation(
            "SHELL_CHAINING",
            "command chaining is not permitted inside containers",
        ));
    }
    if joined.contains('`') || joined.contains("$(") || joined.contains("${") {
        return Err(violation(
            "SHELL_SUBSTITUTION",
            "command substitution is not permitted inside containers",
        ));
    }
    if joined.contains('>') || joined.contains('<') {
        return Err(violation(
            "SHELL_REDIRECTION",
            "redirection is not permitted inside containers",
        ));
    }
    if joined.contains("../") || joined.contains("~/") {
        return Err(violation(
            "SHELL_TRAVERSAL",
            "path traversal is not permitted inside containers",
        ));
    }
    Ok(())
}

fn validate_shell_body_subcommands(body: &str) -> Result<(), ExecViolation> {
    for word in body.split_ascii_whitespace() {
        let lowered = word.to_ascii_lowercase();
        if BLOCKED_COMMANDS.contains(&lowered.as_str()) {
            return Err(violation(
                "BLOCKED_COMMAND",
                format!("shell body invokes blocked command '{lowered}'"),
            ));
        }
    }
    Ok(())
}

/// True when the tokens spell `sh -c …` (or another known shell).
pub fn is_shell_form(command: &[String]) -> bool {
    match command.first() {
        Some(first) => {
            SHELL_NAMES.contains(&first.as_str())
                && command.iter().any(|token| token == "-c")
        }
        None => false,
    }
}

fn shell_body(command: &[String]) -> Option<String> {
    let position = command.iter().position(|token| token == "-c")?;
    let body = command[position + 1..].join(" ");
    if body.is_empty() {
        None
    } else {
        Some(body)
    }
}

/// Builds the `docker exec` descriptor for a validated request.
///
/// Without the resource envelope the tokens pass straight through as argv.
/// With it, the already-validated tokens are shell-quoted and wrapped in a
/// `sh -c 'ulimit …; exec …'` prelude; the quoting is safe precisely
/// because validation already refused every metacharacter.
pub fn build_subprocess(request: &ExecRequest) -> SubprocessDescriptor {
    let mut argv = vec!["exec".to_string(), request.container.clone()];
    if request.resource_limits {
        let quoted = shell_words::join(request.command.iter().map(String::as_str));
        argv.push("sh".to_string());
        argv.push("-c".to_string());
        argv.push(format!("{RESOURCE_ENVELOPE}; exec {quoted}"));
    } else {
        argv.extend(request.command.iter().cloned());
    }
    SubprocessDescriptor::new("docker", argv).with_timeout_ms(request.timeout_ms)
}

/// Runs a request end-to-end: validate, audit, execute, decode.
pub async fn run_exec(request: &ExecRequest, audit: &AuditLog) -> Result<CommandReport, OpsError> {
    if let Err(refused) = validate_exec_request(request) {
        warn!(
            rule = refused.rule,
            container = %request.container,
            "exec request refused before spawn"
        );
        audit
            .append(
                AuditCategory::SecurityViolation,
                "exec",
                json!({
                    "rule": refused.rule,
                    "container": request.container,
                    "detail": refused.detail,
                }),
            )
            .map_err(OpsError::Generic)?;
        return Err(OpsError::Security {
            rule: refused.rule,
            detail: refused.detail,
        });
    }

    let descriptor = build_subprocess(request);
    debug!(container = %request.container, argc = descriptor.argv.len(), "executing in container");
    let result = mc_process::run(&descriptor).await.map_err(map_process_error)?;

    exec_outcome(request, &result, audit)
}

/// Converts a completed process into the command outcome, auditing
/// resource violations.
pub fn exec_outcome(
    request: &ExecRequest,
    result: &ProcessResult,
    audit: &AuditLog,
) -> Result<CommandReport, OpsError> {
    if let Some(kind) = result.error_kind {
        if kind.is_resource_violation() {
            audit
                .append(
                    AuditCategory::SecurityViolation,
                    "exec",
                    json!({
                        "rule": "RESOURCE_VIOLATION",
                        "container": request.container,
                        "kind": kind.as_str(),
                        "exit_code": result.exit_code,
                    }),
                )
                .map_err(OpsError::Generic)?;
            return Err(OpsError::ResourceLimit {
                kind: kind.as_str(),
                description: kind.description().to_string(),
                hint: kind.hint().to_string(),
            });
        }
    }

    let human = if result.success() {
        result.stdout.trim_end().to_string()
    } else {
        format!(
            "exit code {}: {}",
            result.exit_code.unwrap_or(-1),
            result.stderr.trim_end()
        )
    };
    let report = CommandReport::new(
        human,
        json!({
            "container": request.container,
            "exit_code": result.exit_code,
            "stdout": result.stdout,
            "stderr": result.stderr,
            "stdout_truncated": result.stdout_truncated,
            "stderr_truncated": result.stderr_truncated,
            "duration_ms": result.duration_ms,
        }),
    );
    if result.success() {
        Ok(report)
    } else {
        Err(OpsError::Dependency(format!(
            "container command failed with exit code {}",
            result.exit_code.unwrap_or(-1)
        )))
    }
}

fn map_process_error(error: mc_process::ProcessError) -> OpsError {
    use mc_process::ProcessError;
    match error {
        ProcessError::ProgramNotAllowed { program } => OpsError::Security {
            rule: "PROGRAM_ALLOWLIST",
            detail: format!("program '{program}' is not allowlisted"),
        },
        ProcessError::InvalidEnv { name } => OpsError::Security {
            rule: "ENV_VALIDATION",
            detail: format!("environment entry '{name}' failed validation"),
        },
        ProcessError::InvalidWorkingDir { rule } => OpsError::Security {
            rule: "WORKDIR_VALIDATION",
            detail: format!("working directory rejected by rule '{rule}'"),
        },
        ProcessError::Timeout { timeout_ms } => {
            OpsError::Dependency(format!("container command timed out after {timeout_ms} ms"))
        }
        ProcessError::Spawn { detail } => {
            OpsError::Dependency(format!("failed to reach the container runtime: {detail}"))
        }
    }
}
