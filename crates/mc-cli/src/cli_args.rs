//! clap-backed command tree for the `masterclaw` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "masterclaw",
    about = "Operations toolkit for the MasterClaw AI service stack",
    version
)]
pub struct Cli {
    #[arg(long, global = true, help = "Emit machine-readable JSON output")]
    pub json: bool,

    #[arg(long, global = true, help = "Suppress non-essential human output")]
    pub quiet: bool,

    #[arg(long, global = true, help = "Enable debug logging")]
    pub debug: bool,

    #[arg(
        long,
        global = true,
        value_name = "DIR",
        help = "Override the state directory (default: $MC_STATE_DIR or ~/.masterclaw)"
    )]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Aggregate gateway health, circuits, and rate-limit usage
    Status,

    /// Query the AI-service health endpoint
    Health,

    /// Read and write the configuration tree
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run a validated command inside a whitelisted service container
    Exec {
        /// Target container name (must be on the service whitelist)
        container: String,

        /// Command tokens passed verbatim to the container
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,

        /// Treat the command as an explicit shell-form invocation
        #[arg(long)]
        shell: bool,

        #[arg(long, default_value_t = 30_000, value_name = "MS")]
        timeout_ms: u64,

        /// Operator override: drop the default resource envelope
        #[arg(long)]
        no_limits: bool,
    },

    /// Scan for operational issues and optionally repair them
    Heal {
        /// Execute the fixable actions instead of planning only
        #[arg(long)]
        apply: bool,

        /// Required alongside --apply in non-interactive use
        #[arg(long)]
        force: bool,
    },

    /// Remove unused docker artifacts, honoring protected prefixes
    Prune {
        /// Delete the unprotected artifacts instead of listing them
        #[arg(long)]
        apply: bool,

        /// Required alongside --apply in non-interactive use
        #[arg(long)]
        force: bool,
    },

    /// Operator event feed
    Events {
        #[command(subcommand)]
        action: EventsAction,
    },

    /// Tamper-evident audit log
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },

    /// Sliding-window rate limiter state
    RateLimit {
        #[command(subcommand)]
        action: RateLimitAction,
    },

    /// Circuit breaker state
    Circuits {
        #[command(subcommand)]
        action: CircuitsAction,
    },

    /// Tail a service container's logs
    Logs {
        /// Service container name (must be on the service whitelist)
        service: String,

        #[arg(long, default_value_t = 200)]
        tail: usize,
    },
}

impl Command {
    /// Rate-limit category: the first token of the command path, with the
    /// high-sensitivity `config fix` split out per policy.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Health => "health",
            Self::Config {
                action: ConfigAction::Fix,
            } => "config-fix",
            Self::Config { .. } => "config",
            Self::Exec { .. } => "exec",
            Self::Heal { .. } => "heal",
            Self::Prune { .. } => "prune",
            Self::Events { .. } => "events",
            Self::Audit { .. } => "audit",
            Self::RateLimit { .. } => "rate-limit",
            Self::Circuits { .. } => "circuits",
            Self::Logs { .. } => "logs",
        }
    }

    /// Ordered command-path tokens for context and audit records.
    pub fn path_tokens(&self) -> Vec<String> {
        match self {
            Self::Status => vec!["status".into()],
            Self::Health => vec!["health".into()],
            Self::Config { action } => vec!["config".into(), action.token().into()],
            Self::Exec { container, .. } => vec!["exec".into(), container.clone()],
            Self::Heal { apply, .. } => {
                vec!["heal".into(), if *apply { "apply" } else { "plan" }.into()]
            }
            Self::Prune { apply, .. } => {
                vec!["prune".into(), if *apply { "apply" } else { "plan" }.into()]
            }
            Self::Events { action } => vec!["events".into(), action.token().into()],
            Self::Audit { action } => vec!["audit".into(), action.token().into()],
            Self::RateLimit { action } => vec!["rate-limit".into(), action.token().into()],
            Self::Circuits { action } => vec!["circuits".into(), action.token().into()],
            Self::Logs { service, .. } => vec!["logs".into(), service.clone()],
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Print one value by dotted key
    Get { key: String },

    /// Set one value by dotted key (JSON literal or bare string)
    Set { key: String, value: String },

    /// Print the whole sanitized tree (secrets masked)
    List,

    /// Restore owner-only permissions and strip dangerous keys in place
    Fix,
}

impl ConfigAction {
    fn token(&self) -> &'static str {
        match self {
            Self::Get { .. } => "get",
            Self::Set { .. } => "set",
            Self::List => "list",
            Self::Fix => "fix",
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum EventsAction {
    /// List recent events, newest first
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Only show unacknowledged events
        #[arg(long)]
        unacked: bool,
    },

    /// Record an operator event
    Add {
        title: String,

        #[arg(long, default_value = "info")]
        severity: String,

        #[arg(long, default_value = "")]
        message: String,
    },

    /// Acknowledge one event by id
    Ack { id: String },
}

impl EventsAction {
    fn token(&self) -> &'static str {
        match self {
            Self::List { .. } => "list",
            Self::Add { .. } => "add",
            Self::Ack { .. } => "ack",
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum AuditAction {
    /// Recompute the signature chain and report the first mismatch
    Verify,

    /// Show the newest records with masked details
    Tail {
        #[arg(long, default_value_t = 20)]
        count: usize,
    },
}

impl AuditAction {
    fn token(&self) -> &'static str {
        match self {
            Self::Verify => "verify",
            Self::Tail { .. } => "tail",
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum RateLimitAction {
    /// Show current per-category usage
    Status,

    /// Clear one category bucket, or all of them
    Reset {
        category: Option<String>,

        /// Required in non-interactive use
        #[arg(long)]
        force: bool,
    },
}

impl RateLimitAction {
    fn token(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Reset { .. } => "reset",
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum CircuitsAction {
    /// Show every known circuit and its phase
    Status,

    /// Force one circuit back to closed
    Reset {
        name: String,

        /// Required in non-interactive use
        #[arg(long)]
        force: bool,
    },
}

impl CircuitsAction {
    fn token(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Reset { .. } => "reset",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn unit_cli_tree_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn unit_categories_follow_the_policy_table() {
        let exec = Command::Exec {
            container: "mc-backend".into(),
            command: vec!["echo".into()],
            shell: false,
            timeout_ms: 1,
            no_limits: false,
        };
        assert_eq!(exec.category(), "exec");
        assert_eq!(
            Command::Config {
                action: ConfigAction::Fix
            }
            .category(),
            "config-fix"
        );
        assert_eq!(
            Command::Config {
                action: ConfigAction::List
            }
            .category(),
            "config"
        );
        assert_eq!(Command::Status.category(), "status");
    }

    #[test]
    fn functional_exec_parses_trailing_command_tokens() {
        let cli = Cli::parse_from([
            "masterclaw", "exec", "mc-backend", "sh", "-c", "echo hi",
        ]);
        match cli.command {
            Command::Exec {
                container, command, ..
            } => {
                assert_eq!(container, "mc-backend");
                assert_eq!(command, vec!["sh", "-c", "echo hi"]);
            }
            other => panic!("unexpected parse {other:?}"),
        }
    }

    #[test]
    fn regression_unknown_flags_fail_parse() {
        assert!(Cli::try_parse_from(["masterclaw", "status", "--bogus"]).is_err());
        assert!(Cli::try_parse_from(["masterclaw", "nonsense"]).is_err());
    }

    #[test]
    fn unit_path_tokens_reflect_the_resolved_subcommand() {
        let cli = Cli::parse_from(["masterclaw", "heal", "--apply"]);
        assert_eq!(cli.command.path_tokens(), vec!["heal", "apply"]);
        let cli = Cli::parse_from(["masterclaw", "config", "get", "gateway.url"]);
        assert_eq!(cli.command.path_tokens(), vec!["config", "get"]);
    }
}
