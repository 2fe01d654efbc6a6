//! Secure subprocess execution for the MasterClaw core.
//!
//! Programs are resolved against a basename allowlist, arguments pass as a
//! vector (the spawn never touches a shell), the environment is rebuilt
//! from an explicit allowlist, and exit codes are decoded into resource-
//! violation kinds so callers can audit and explain them.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use mc_core::validate::{validate_path, PathPolicy};

/// Basenames the core is allowed to spawn.
pub const ALLOWED_PROGRAMS: &[&str] = &["docker", "git", "tar", "curl", "df", "free"];

/// Environment variables forwarded from the parent process.
const SAFE_ENV_VARS: &[&str] = &["PATH", "HOME", "LANG", "LC_ALL", "TZ", "TMPDIR"];

/// Default per-stream output cap.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Default subprocess timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

const OOM_STDERR_MARKERS: &[&str] = &[
    "killed process",
    "out of memory",
    "oom-kill",
    "cannot allocate memory",
    "memory cgroup out of memory",
];

/// One subprocess invocation, fully specified before the spawn.
#[derive(Debug, Clone)]
pub struct SubprocessDescriptor {
    pub program: String,
    pub argv: Vec<String>,
    /// Extra environment entries beyond the safe allowlist.
    pub env: BTreeMap<String, String>,
    pub timeout_ms: u64,
    pub working_dir: Option<String>,
    pub max_output_bytes: usize,
}

impl SubprocessDescriptor {
    pub fn new(program: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            program: program.into(),
            argv,
            env: BTreeMap::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            working_dir: None,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// Resource-violation classification derived from exit codes and stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessErrorKind {
    /// Exit 137: SIGKILL, usually the OOM killer or an nproc cap.
    ResourceLimit,
    /// Generic exit upgraded by an OOM marker on stderr.
    Oom,
    /// Exit 143: SIGTERM.
    Terminated,
    /// Exit 152: SIGXCPU.
    CpuLimit,
    /// Exit 153: SIGXFSZ.
    FileSizeLimit,
    /// Exit 159: SIGSYS (seccomp).
    BlockedSyscall,
    /// Any other non-zero exit.
    Generic,
}

impl ProcessErrorKind {
    /// True for kinds that represent a resource-cap violation.
    pub fn is_resource_violation(self) -> bool {
        matches!(
            self,
            Self::ResourceLimit | Self::Oom | Self::CpuLimit | Self::FileSizeLimit | Self::BlockedSyscall
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ResourceLimit => "resource_limit",
            Self::Oom => "oom",
            Self::Terminated => "terminated",
            Self::CpuLimit => "cpu_limit",
            Self::FileSizeLimit => "file_size_limit",
            Self::BlockedSyscall => "blocked_syscall",
            Self::Generic => "generic",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::ResourceLimit => "process was killed, likely by the OOM killer or a process-count cap",
            Self::Oom => "process ran out of memory",
            Self::Terminated => "process was terminated",
            Self::CpuLimit => "process exceeded its CPU time limit",
            Self::FileSizeLimit => "process exceeded its file size limit",
            Self::BlockedSyscall => "process attempted a blocked syscall",
            Self::Generic => "process exited with a non-zero status",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            Self::ResourceLimit | Self::Oom => {
                "retry with a smaller workload or raise the memory/nproc caps via the operator override"
            }
            Self::CpuLimit => "split the work into shorter invocations or raise the CPU cap",
            Self::FileSizeLimit => "write less output or raise the fsize cap",
            Self::BlockedSyscall => "the container's seccomp profile refused a syscall; review the command",
            Self::Terminated | Self::Generic => "inspect stderr for the underlying failure",
        }
    }
}

/// Completed subprocess outcome with decoded error kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration_ms: u64,
    pub error_kind: Option<ProcessErrorKind>,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Failures that prevent a spawn or abort one in flight.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    #[error("program '{program}' is not on the subprocess allowlist")]
    ProgramNotAllowed { program: String },

    #[error("environment entry '{name}' failed validation")]
    InvalidEnv { name: String },

    #[error("working directory rejected by rule '{rule}'")]
    InvalidWorkingDir { rule: &'static str },

    #[error("subprocess timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("failed to spawn subprocess: {detail}")]
    Spawn { detail: String },
}

/// Decodes an exit status plus stderr into a violation kind.
///
/// Exit 0 decodes to `None`; signal-style codes map per the table in the
/// type docs; other codes are `Generic` unless stderr carries an OOM marker.
pub fn decode_exit_status(exit_code: Option<i32>, stderr: &str) -> Option<ProcessErrorKind> {
    let kind = match exit_code {
        Some(0) => return None,
        Some(137) => ProcessErrorKind::ResourceLimit,
        Some(143) => ProcessErrorKind::Terminated,
        Some(152) => ProcessErrorKind::CpuLimit,
        Some(153) => ProcessErrorKind::FileSizeLimit,
        Some(159) => ProcessErrorKind::BlockedSyscall,
        _ => ProcessErrorKind::Generic,
    };
    if kind == ProcessErrorKind::Generic && stderr_indicates_oom(stderr) {
        return Some(ProcessErrorKind::Oom);
    }
    Some(kind)
}

fn stderr_indicates_oom(stderr: &str) -> bool {
    let lowered = stderr.to_ascii_lowercase();
    OOM_STDERR_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

fn validate_program(program: &str) -> Result<(), ProcessError> {
    if !ALLOWED_PROGRAMS.contains(&program) {
        return Err(ProcessError::ProgramNotAllowed {
            program: mc_core::sanitize_for_log(program),
        });
    }
    Ok(())
}

fn valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|ch| ch == '_' || ch.is_ascii_alphanumeric())
}

/// Runs a descriptor to completion.
///
/// On timeout the child is killed (`kill_on_drop` covers the cancellation
/// path as well) and [`ProcessError::Timeout`] is returned.
pub async fn run(descriptor: &SubprocessDescriptor) -> Result<ProcessResult, ProcessError> {
    validate_program(&descriptor.program)?;

    for (name, value) in &descriptor.env {
        if !valid_env_name(name) || value.contains(['\r', '\n']) {
            return Err(ProcessError::InvalidEnv {
                name: mc_core::sanitize_for_log(name),
            });
        }
    }

    if let Some(dir) = &descriptor.working_dir {
        validate_path(dir, PathPolicy { allow_absolute: true }).map_err(|error| {
            ProcessError::InvalidWorkingDir { rule: error.rule }
        })?;
    }

    let mut command = Command::new(&descriptor.program);
    command
        .args(&descriptor.argv)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .env_clear();
    for key in SAFE_ENV_VARS {
        if let Ok(value) = std::env::var(key) {
            command.env(key, value);
        }
    }
    for (name, value) in &descriptor.env {
        command.env(name, value);
    }
    if let Some(dir) = &descriptor.working_dir {
        command.current_dir(dir);
    }

    debug!(
        program = %descriptor.program,
        argc = descriptor.argv.len(),
        timeout_ms = descriptor.timeout_ms,
        "spawning subprocess"
    );

    let started = Instant::now();
    let mut child = command.spawn().map_err(|error| ProcessError::Spawn {
        detail: error.to_string(),
    })?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let cap = descriptor.max_output_bytes;

    let timeout = Duration::from_millis(descriptor.timeout_ms.max(1));
    let io_and_wait = async {
        let stdout_task = read_capped(&mut stdout_pipe, cap);
        let stderr_task = read_capped(&mut stderr_pipe, cap);
        let (stdout, stderr) = tokio::join!(stdout_task, stderr_task);
        let status = child.wait().await;
        (stdout, stderr, status)
    };

    let (stdout, stderr, status) = match tokio::time::timeout(timeout, io_and_wait).await {
        Ok(done) => done,
        Err(_) => {
            warn!(
                program = %descriptor.program,
                timeout_ms = descriptor.timeout_ms,
                "subprocess timed out; killing child"
            );
            return Err(ProcessError::Timeout {
                timeout_ms: descriptor.timeout_ms,
            });
        }
    };

    let status = status.map_err(|error| ProcessError::Spawn {
        detail: format!("failed to reap child: {error}"),
    })?;
    let exit_code = status.code();
    let error_kind = decode_exit_status(exit_code, &stderr.text);

    Ok(ProcessResult {
        exit_code,
        stdout: stdout.text,
        stderr: stderr.text,
        stdout_truncated: stdout.truncated,
        stderr_truncated: stderr.truncated,
        duration_ms: started.elapsed().as_millis() as u64,
        error_kind,
    })
}

struct CappedStream {
    text: String,
    truncated: bool,
}

async fn read_capped<R>(pipe: &mut Option<R>, cap: usize) -> CappedStream
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(reader) = pipe.as_mut() else {
        return CappedStream {
            text: String::new(),
            truncated: false,
        };
    };
    let mut collected: Vec<u8> = Vec::new();
    let mut truncated = false;
    let mut buffer = [0u8; 8_192];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(read) => {
                if collected.len() < cap {
                    let take = read.min(cap - collected.len());
                    collected.extend_from_slice(&buffer[..take]);
                    if take < read {
                        truncated = true;
                    }
                } else {
                    // Keep draining so the child never blocks on a full pipe.
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    CappedStream {
        text: String::from_utf8_lossy(&collected).into_owned(),
        truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_decode_exit_status_maps_signal_codes() {
        assert_eq!(decode_exit_status(Some(0), ""), None);
        assert_eq!(
            decode_exit_status(Some(137), ""),
            Some(ProcessErrorKind::ResourceLimit)
        );
        assert_eq!(
            decode_exit_status(Some(143), ""),
            Some(ProcessErrorKind::Terminated)
        );
        assert_eq!(
            decode_exit_status(Some(152), ""),
            Some(ProcessErrorKind::CpuLimit)
        );
        assert_eq!(
            decode_exit_status(Some(153), ""),
            Some(ProcessErrorKind::FileSizeLimit)
        );
        assert_eq!(
            decode_exit_status(Some(159), ""),
            Some(ProcessErrorKind::BlockedSyscall)
        );
        assert_eq!(
            decode_exit_status(Some(1), ""),
            Some(ProcessErrorKind::Generic)
        );
        assert_eq!(
            decode_exit_status(None, ""),
            Some(ProcessErrorKind::Generic)
        );
    }

    #[test]
    fn unit_decode_exit_status_upgrades_generic_to_oom_from_stderr() {
        for marker in [
            "Killed process 1234",
            "fork: Cannot allocate memory",
            "Memory cgroup out of memory: task killed",
            "oom-kill event",
        ] {
            assert_eq!(
                decode_exit_status(Some(1), marker),
                Some(ProcessErrorKind::Oom),
                "for {marker:?}"
            );
        }
        // Signal-style codes keep their specific decoding.
        assert_eq!(
            decode_exit_status(Some(137), "Killed process 1234"),
            Some(ProcessErrorKind::ResourceLimit)
        );
    }

    #[test]
    fn unit_resource_violation_kinds_are_classified() {
        assert!(ProcessErrorKind::ResourceLimit.is_resource_violation());
        assert!(ProcessErrorKind::Oom.is_resource_violation());
        assert!(ProcessErrorKind::CpuLimit.is_resource_violation());
        assert!(!ProcessErrorKind::Terminated.is_resource_violation());
        assert!(!ProcessErrorKind::Generic.is_resource_violation());
    }

    #[test]
    fn unit_env_name_validation() {
        assert!(valid_env_name("PATH"));
        assert!(valid_env_name("_PRIVATE"));
        assert!(valid_env_name("MC_STATE_DIR"));
        assert!(!valid_env_name("1LEADING"));
        assert!(!valid_env_name("WITH-DASH"));
        assert!(!valid_env_name(""));
    }

    #[tokio::test]
    async fn regression_disallowed_program_is_refused_before_spawn() {
        let descriptor = SubprocessDescriptor::new("bash", vec!["-c".into(), "true".into()]);
        let error = run(&descriptor).await.expect_err("bash is not allowlisted");
        assert!(matches!(error, ProcessError::ProgramNotAllowed { .. }));
    }

    #[tokio::test]
    async fn regression_invalid_env_value_is_refused_before_spawn() {
        let mut descriptor = SubprocessDescriptor::new("git", vec!["--version".into()]);
        descriptor
            .env
            .insert("GIT_TRACE".into(), "1\r\nLD_PRELOAD=evil".into());
        let error = run(&descriptor).await.expect_err("CRLF env must be refused");
        assert_eq!(
            error,
            ProcessError::InvalidEnv {
                name: "GIT_TRACE".into()
            }
        );
    }

    #[tokio::test]
    async fn regression_traversal_working_dir_is_refused_before_spawn() {
        let mut descriptor = SubprocessDescriptor::new("git", vec!["--version".into()]);
        descriptor.working_dir = Some("/tmp/../etc".into());
        let error = run(&descriptor).await.expect_err("traversal dir refused");
        assert_eq!(
            error,
            ProcessError::InvalidWorkingDir {
                rule: "path_traversal"
            }
        );
    }

    #[tokio::test]
    async fn functional_git_version_runs_and_decodes_clean_exit() {
        let descriptor = SubprocessDescriptor::new("git", vec!["--version".into()]);
        match run(&descriptor).await {
            Ok(result) => {
                assert!(result.success());
                assert!(result.error_kind.is_none());
                assert!(result.stdout.contains("git version"));
                assert!(!result.stdout_truncated);
            }
            // Hosts without git still exercise the spawn path.
            Err(ProcessError::Spawn { .. }) => {}
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn functional_output_cap_truncates_without_aborting() {
        let mut descriptor = SubprocessDescriptor::new(
            "git",
            vec!["help".into(), "--all".into()],
        );
        descriptor.max_output_bytes = 64;
        match run(&descriptor).await {
            Ok(result) => {
                assert!(result.stdout.len() <= 64);
                if result.stdout_truncated {
                    assert!(result.exit_code.is_some());
                }
            }
            Err(ProcessError::Spawn { .. }) => {}
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
}
