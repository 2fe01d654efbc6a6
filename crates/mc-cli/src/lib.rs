//! MasterClaw operations CLI.
//!
//! The dispatcher (`dispatch`) is the only entry point: it builds the
//! command context, applies the rate-limit gate, audits the invocation,
//! runs the handler under signal-driven cancellation, and maps error kinds
//! to exit codes exactly once.

pub mod cli_args;
pub mod config_cmds;
pub mod context;
pub mod dispatch;
pub mod docker;
pub mod events;
pub mod exec;
pub mod heal;
pub mod output;
pub mod prune;
pub mod status_cmds;
pub mod substrate_cmds;
pub mod sysinfo;

pub use cli_args::Cli;
pub use dispatch::run;
