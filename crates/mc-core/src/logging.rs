//! Structured logging bootstrap shared by every MasterClaw binary.
//!
//! Human mode uses the compact formatter; JSON mode emits one JSON object
//! per line so log shippers can ingest stderr directly. Either way the
//! subscriber writes line-buffered to stderr and must be installed before
//! any command logic runs.

use std::io::Write;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Output style for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

/// Initializes the global tracing subscriber.
///
/// `debug` lowers the default level from `info` to `debug`; `MC_LOG` (an
/// `EnvFilter` directive string) overrides both. Calling this twice is a
/// no-op rather than a panic so tests can initialize freely.
pub fn init_logging(debug: bool, format: LogFormat) {
    let default_level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let env_filter = EnvFilter::builder()
        .with_env_var("MC_LOG")
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let result = match format {
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    // A second init (tests, nested runtimes) keeps the first subscriber.
    let _ = result;
}

/// Flushes both standard streams; called on every exit path.
pub fn flush_output_streams() {
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
}
