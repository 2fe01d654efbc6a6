//! Configuration tree commands: get, set, list, fix.
//!
//! The tree is plain JSON under `config.json`. Loads run through an
//! explicit pollution check so a tampered file produces an audit record,
//! not just a silent strip.

use serde_json::{json, Value};
use tracing::warn;

use mc_audit::{AuditCategory, AuditLog};
use mc_core::{
    mask_sensitive, safe_deep_merge, strip_dangerous_keys, OpsError, StateStore,
};

use crate::output::CommandReport;

/// File name of the configuration tree inside the state directory.
pub const CONFIG_FILE: &str = "config.json";

/// Loads the sanitized configuration tree.
///
/// Dangerous keys are stripped before the tree is returned; when any were
/// present, a `SECURITY_VIOLATION` audit record with subject `config` is
/// appended.
pub fn load_config(store: &StateStore, audit: &AuditLog) -> Result<Value, OpsError> {
    let path = store.file_path(CONFIG_FILE);
    if !path.exists() {
        return Ok(json!({}));
    }
    let raw = std::fs::read_to_string(&path)
        .map_err(|error| OpsError::Generic(anyhow::anyhow!("failed to read config: {error}")))?;
    let mut tree: Value = match serde_json::from_str(&raw) {
        Ok(tree) => tree,
        Err(error) => {
            warn!(error = %error, reason_code = "config_corrupt_reset", "config file is not valid JSON");
            return Err(OpsError::Integrity(
                "config file is not valid JSON; run 'config fix' after restoring it".to_string(),
            ));
        }
    };
    let removed = strip_dangerous_keys(&mut tree);
    if removed > 0 {
        audit
            .append(
                AuditCategory::SecurityViolation,
                "config",
                json!({ "rule": "DANGEROUS_KEYS", "removed": removed }),
            )
            .map_err(OpsError::Generic)?;
    }
    if !tree.is_object() {
        return Err(OpsError::Integrity(
            "config root must be a JSON object".to_string(),
        ));
    }
    Ok(tree)
}

/// Reads one value by dotted key.
pub fn get_value<'a>(tree: &'a Value, dotted_key: &'a str) -> Option<&'a Value> {
    let mut cursor = tree;
    for part in dotted_key.split('.') {
        cursor = cursor.get(part)?;
    }
    Some(cursor)
}

/// Writes one value by dotted key through a safe deep merge.
pub fn set_value(tree: &mut Value, dotted_key: &str, value: Value) -> Result<(), OpsError> {
    let parts: Vec<&str> = dotted_key.split('.').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(OpsError::Usage(format!(
            "config key '{dotted_key}' has an empty segment"
        )));
    }
    if parts.iter().any(|part| mc_core::dangerous_key(part)) {
        return Err(OpsError::Security {
            rule: "DANGEROUS_KEYS",
            detail: "config keys may not contain prototype-pollution vectors".to_string(),
        });
    }
    let mut patch = value;
    for part in parts.iter().rev() {
        patch = json!({ *part: patch });
    }
    safe_deep_merge(tree, &patch);
    Ok(())
}

/// Parses a CLI value argument: JSON literal when it parses, string
/// otherwise.
pub fn parse_cli_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// `config get <key>`.
pub fn config_get(
    store: &StateStore,
    audit: &AuditLog,
    key: &str,
) -> Result<CommandReport, OpsError> {
    let tree = load_config(store, audit)?;
    match get_value(&tree, key) {
        Some(value) => {
            let masked = mask_sensitive(&json!({ key: value }));
            Ok(CommandReport::new(
                masked[key].to_string(),
                json!({ "name": key, "value": masked[key] }),
            ))
        }
        None => Err(OpsError::Absent(format!("config key '{key}' is not set"))),
    }
}

/// `config set <key> <value>`: persists and audits the change.
pub fn config_set(
    store: &StateStore,
    audit: &AuditLog,
    key: &str,
    raw_value: &str,
) -> Result<CommandReport, OpsError> {
    let mut tree = load_config(store, audit)?;
    set_value(&mut tree, key, parse_cli_value(raw_value))?;
    store
        .save_state(CONFIG_FILE, &tree)
        .map_err(OpsError::Generic)?;
    // The value itself stays out of the audit trail; a sensitive leaf would
    // otherwise land on disk before masking could see its key.
    audit
        .append(
            AuditCategory::ConfigChange,
            "config",
            json!({ "name": key }),
        )
        .map_err(OpsError::Generic)?;
    Ok(CommandReport::new(
        format!("set {key}"),
        json!({ "name": key, "ok": true }),
    ))
}

/// `config list`: the whole tree with secrets masked.
pub fn config_list(store: &StateStore, audit: &AuditLog) -> Result<CommandReport, OpsError> {
    let tree = load_config(store, audit)?;
    let masked = mask_sensitive(&tree);
    Ok(CommandReport::new(
        serde_json::to_string_pretty(&masked).unwrap_or_else(|_| "{}".to_string()),
        masked,
    ))
}

/// `config fix`: rewrite the sanitized tree and restore owner-only modes.
pub fn config_fix(store: &StateStore, audit: &AuditLog) -> Result<CommandReport, OpsError> {
    let tree = load_config(store, audit)?;
    store
        .save_state(CONFIG_FILE, &tree)
        .map_err(OpsError::Generic)?;
    audit
        .append(
            AuditCategory::ConfigChange,
            "config",
            json!({ "operation": "fix" }),
        )
        .map_err(OpsError::Generic)?;
    Ok(CommandReport::new(
        "config rewritten with owner-only permissions",
        json!({ "ok": true }),
    ))
}
