//! Append-only, tamper-evident audit log.
//!
//! Each record carries an HMAC-SHA-256 signature chained over the previous
//! record's signature, so truncation and in-place edits are both detectable.
//! Sensitive detail fields are masked before hashing and writing; the raw
//! values never touch disk.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;

use mc_core::lock::{acquire_lock, LOCK_STALE_AFTER, LOCK_TIMEOUT};
use mc_core::{current_correlation_id, mask_sensitive, sanitize_for_log, user_identity};

type HmacSha256 = Hmac<Sha256>;

/// File name of the audit log inside the state directory.
pub const AUDIT_LOG_FILE: &str = "audit.log";

/// File name of the operator signing key inside the state directory.
pub const AUDIT_KEY_FILE: &str = "audit.key";

/// Separator between the previous signature and the canonical record in the
/// signed byte stream.
const CHAIN_SEPARATOR: u8 = 0x1E;

const AUDIT_KEY_BYTES: usize = 32;

/// Security-relevant event categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditCategory {
    #[serde(rename = "AUTH")]
    Auth,
    #[serde(rename = "SECURITY_VIOLATION")]
    SecurityViolation,
    #[serde(rename = "CONFIG_CHANGE")]
    ConfigChange,
    #[serde(rename = "SECRET_OP")]
    SecretOp,
    #[serde(rename = "COMMAND_EXEC")]
    CommandExec,
    #[serde(rename = "RATE_LIMIT_DENIED")]
    RateLimitDenied,
    #[serde(rename = "BACKUP_OP")]
    BackupOp,
    #[serde(rename = "RESTORE_OP")]
    RestoreOp,
}

impl AuditCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "AUTH",
            Self::SecurityViolation => "SECURITY_VIOLATION",
            Self::ConfigChange => "CONFIG_CHANGE",
            Self::SecretOp => "SECRET_OP",
            Self::CommandExec => "COMMAND_EXEC",
            Self::RateLimitDenied => "RATE_LIMIT_DENIED",
            Self::BackupOp => "BACKUP_OP",
            Self::RestoreOp => "RESTORE_OP",
        }
    }
}

/// One signed audit record as stored on disk.
///
/// Field order is the canonical serialization order; the signature covers
/// every field above it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: String,
    pub correlation_id: String,
    pub user_identity: String,
    pub event_type: AuditCategory,
    pub subject: String,
    pub details: Value,
    pub signature: String,
}

/// Outcome of walking the signature chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditVerification {
    /// Every signature matched; carries the record count.
    Valid { records: usize },
    /// First mismatch, by zero-based record index.
    TamperedAt { index: usize },
}

/// Handle to the chained audit log and its signing key.
#[derive(Debug, Clone)]
pub struct AuditLog {
    log_path: PathBuf,
    key_path: PathBuf,
    lock_path: PathBuf,
}

impl AuditLog {
    /// Opens the audit log under a state directory, bootstrapping the
    /// signing key on first use.
    pub fn open(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir).with_context(|| {
            format!("failed to create audit directory {}", state_dir.display())
        })?;
        let log = Self {
            log_path: state_dir.join(AUDIT_LOG_FILE),
            key_path: state_dir.join(AUDIT_KEY_FILE),
            lock_path: state_dir.join(".audit.lock"),
        };
        log.load_or_create_key()?;
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }

    /// Appends one signed record. Detail values under sensitive keys are
    /// masked before the signature is computed.
    pub fn append(
        &self,
        category: AuditCategory,
        subject: &str,
        details: Value,
    ) -> Result<AuditRecord> {
        let key = self.load_or_create_key()?;
        let _guard = acquire_lock(&self.lock_path, LOCK_TIMEOUT, LOCK_STALE_AFTER)?;

        let previous_signature = self.last_signature()?;
        let record = build_record(category, subject, details, &previous_signature, &key)?;
        let line = serde_json::to_string(&record).context("failed to encode audit record")?;

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mc_core::STATE_FILE_MODE);
        }
        let mut file = options
            .open(&self.log_path)
            .with_context(|| format!("failed to open audit log {}", self.log_path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append to {}", self.log_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", self.log_path.display()))?;

        debug!(
            event_type = record.event_type.as_str(),
            subject = %record.subject,
            "appended audit record"
        );
        Ok(record)
    }

    /// Reads every record in order.
    pub fn records(&self) -> Result<Vec<AuditRecord>> {
        if !self.log_path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.log_path)
            .with_context(|| format!("failed to open audit log {}", self.log_path.display()))?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line.with_context(|| {
                format!(
                    "failed to read line {} from {}",
                    index + 1,
                    self.log_path.display()
                )
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(&line).with_context(|| {
                format!(
                    "failed to parse audit record at line {} in {}",
                    index + 1,
                    self.log_path.display()
                )
            })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Returns the last `count` records, newest last.
    pub fn tail(&self, count: usize) -> Result<Vec<AuditRecord>> {
        let mut records = self.records()?;
        if records.len() > count {
            records.drain(..records.len() - count);
        }
        Ok(records)
    }

    /// Recomputes the signature chain, failing fast on the first mismatch.
    pub fn verify(&self) -> Result<AuditVerification> {
        let key = self.load_or_create_key()?;
        let records = self.records()?;
        let mut previous_signature = String::new();
        for (index, record) in records.iter().enumerate() {
            let expected = sign_record(record, &previous_signature, &key)?;
            if expected != record.signature {
                return Ok(AuditVerification::TamperedAt { index });
            }
            previous_signature = record.signature.clone();
        }
        Ok(AuditVerification::Valid {
            records: records.len(),
        })
    }

    /// Short fingerprint of the signing key for operator display.
    pub fn key_fingerprint(&self) -> Result<String> {
        use sha2::Digest;
        let key = self.load_or_create_key()?;
        let digest = Sha256::digest(&key);
        Ok(hex::encode(&digest[..6]))
    }

    fn last_signature(&self) -> Result<String> {
        Ok(self
            .records()?
            .last()
            .map(|record| record.signature.clone())
            .unwrap_or_default())
    }

    fn load_or_create_key(&self) -> Result<Vec<u8>> {
        if let Ok(key) = fs::read(&self.key_path) {
            if key.len() >= AUDIT_KEY_BYTES {
                return Ok(key);
            }
            bail!(
                "audit signing key {} is shorter than {} bytes",
                self.key_path.display(),
                AUDIT_KEY_BYTES
            );
        }
        let mut key = vec![0u8; AUDIT_KEY_BYTES];
        rand::thread_rng().fill_bytes(&mut key);
        mc_core::state::write_owner_only_atomic(&self.key_path, &key)?;
        debug!(key = %self.key_path.display(), "bootstrapped audit signing key");
        Ok(key)
    }
}

fn build_record(
    category: AuditCategory,
    subject: &str,
    details: Value,
    previous_signature: &str,
    key: &[u8],
) -> Result<AuditRecord> {
    let mut record = AuditRecord {
        timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        correlation_id: current_correlation_id()
            .map(|id| id.as_str().to_string())
            .unwrap_or_else(|| "none".to_string()),
        user_identity: user_identity(),
        event_type: category,
        subject: sanitize_for_log(subject),
        details: mask_sensitive(&details),
        signature: String::new(),
    };
    record.signature = sign_record(&record, previous_signature, key)?;
    Ok(record)
}

/// Canonical bytes of a record without its signature field.
fn canonical_bytes(record: &AuditRecord) -> Result<Vec<u8>> {
    let unsigned = serde_json::json!({
        "timestamp": record.timestamp,
        "correlation_id": record.correlation_id,
        "user_identity": record.user_identity,
        "event_type": record.event_type,
        "subject": record.subject,
        "details": record.details,
    });
    Ok(serde_json::to_string(&unsigned)
        .context("failed to canonicalize audit record")?
        .into_bytes())
}

fn sign_record(record: &AuditRecord, previous_signature: &str, key: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| anyhow::anyhow!("audit signing key has invalid length"))?;
    mac.update(previous_signature.as_bytes());
    mac.update(&[CHAIN_SEPARATOR]);
    mac.update(&canonical_bytes(record)?);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn open_log(dir: &Path) -> AuditLog {
        AuditLog::open(dir).expect("open audit log")
    }

    #[test]
    fn functional_append_then_verify_succeeds() {
        let dir = tempdir().expect("tempdir");
        let log = open_log(dir.path());
        log.append(AuditCategory::CommandExec, "exec mc-backend", json!({"argv": ["echo"]}))
            .expect("first record");
        log.append(
            AuditCategory::SecurityViolation,
            "exec",
            json!({"rule": "SHELL_CHAINING"}),
        )
        .expect("second record");
        log.append(AuditCategory::ConfigChange, "config", json!({"key": "gateway.url"}))
            .expect("third record");

        assert_eq!(
            log.verify().expect("verify"),
            AuditVerification::Valid { records: 3 }
        );
    }

    #[test]
    fn regression_modified_record_flips_verification_at_its_index() {
        let dir = tempdir().expect("tempdir");
        let log = open_log(dir.path());
        for index in 0..4 {
            log.append(
                AuditCategory::CommandExec,
                &format!("command-{index}"),
                json!({"seq": index}),
            )
            .expect("append");
        }

        let raw = fs::read_to_string(log.path()).expect("read log");
        let mut lines: Vec<String> = raw.lines().map(str::to_string).collect();
        lines[1] = lines[1].replace("command-1", "command-X");
        fs::write(log.path(), format!("{}\n", lines.join("\n"))).expect("tamper");

        assert_eq!(
            log.verify().expect("verify"),
            AuditVerification::TamperedAt { index: 1 }
        );
    }

    #[test]
    fn regression_reordering_records_breaks_the_chain() {
        let dir = tempdir().expect("tempdir");
        let log = open_log(dir.path());
        log.append(AuditCategory::Auth, "login", json!({})).expect("first");
        log.append(AuditCategory::Auth, "logout", json!({})).expect("second");

        let raw = fs::read_to_string(log.path()).expect("read log");
        let mut lines: Vec<&str> = raw.lines().collect();
        lines.swap(0, 1);
        fs::write(log.path(), format!("{}\n", lines.join("\n"))).expect("reorder");

        assert_eq!(
            log.verify().expect("verify"),
            AuditVerification::TamperedAt { index: 0 }
        );
    }

    #[test]
    fn unit_sensitive_details_are_masked_before_signing() {
        let dir = tempdir().expect("tempdir");
        let log = open_log(dir.path());
        let record = log
            .append(
                AuditCategory::SecretOp,
                "secrets set",
                json!({"api_token": "tok-0123456789abcdef", "name": "gateway"}),
            )
            .expect("append");
        assert_eq!(record.details["api_token"], "tok-\u{2026}cdef");
        let raw = fs::read_to_string(log.path()).expect("read log");
        assert!(!raw.contains("tok-0123456789abcdef"));
        assert_eq!(
            log.verify().expect("verify"),
            AuditVerification::Valid { records: 1 }
        );
    }

    #[test]
    fn unit_subject_is_sanitized_for_logs() {
        let dir = tempdir().expect("tempdir");
        let log = open_log(dir.path());
        let record = log
            .append(AuditCategory::CommandExec, "line\r\nbreak", json!({}))
            .expect("append");
        assert_eq!(record.subject, "linebreak");
    }

    #[test]
    fn unit_tail_returns_newest_records() {
        let dir = tempdir().expect("tempdir");
        let log = open_log(dir.path());
        for index in 0..5 {
            log.append(AuditCategory::CommandExec, &format!("cmd-{index}"), json!({}))
                .expect("append");
        }
        let tail = log.tail(2).expect("tail");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].subject, "cmd-3");
        assert_eq!(tail[1].subject, "cmd-4");
    }

    #[cfg(unix)]
    #[test]
    fn unit_key_and_log_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().expect("tempdir");
        let log = open_log(dir.path());
        log.append(AuditCategory::Auth, "probe", json!({})).expect("append");
        for name in [AUDIT_KEY_FILE, AUDIT_LOG_FILE] {
            let mode = fs::metadata(dir.path().join(name))
                .expect("metadata")
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(mode, 0o600, "{name} must be owner-only");
        }
    }

    #[test]
    fn unit_empty_log_verifies_cleanly() {
        let dir = tempdir().expect("tempdir");
        let log = open_log(dir.path());
        assert_eq!(
            log.verify().expect("verify"),
            AuditVerification::Valid { records: 0 }
        );
        assert_eq!(log.key_fingerprint().expect("fingerprint").len(), 12);
    }
}
