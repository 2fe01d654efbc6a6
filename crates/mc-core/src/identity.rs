//! Stable operator identity used for rate-limit bucketing and audit records.

use sha2::{Digest, Sha256};

/// Stable hash of the OS user plus host, shaped as `u-<16 hex chars>`.
///
/// The raw user and host names never leave the process; only the digest is
/// persisted or logged.
pub fn user_identity() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "operator".to_string());
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|raw| raw.trim().to_string())
        })
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "localhost".to_string());

    let digest = Sha256::digest(format!("{user}@{host}").as_bytes());
    let short: String = digest[..8]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect();
    format!("u-{short}")
}
