//! Input validation primitives that refuse unsafe values before any
//! filesystem, subprocess, or network call sees them.

use serde_json::Value;

/// Maximum accepted path length in bytes.
pub const MAX_PATH_BYTES: usize = 4_096;

/// Shell metacharacters that are never allowed inside a validated path.
const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '$', '`', '(', ')', '[', ']', '{', '}', '<', '>', '\\', '\n', '\r',
];

/// Encoded traversal spellings rejected in addition to literal `..`.
const ENCODED_TRAVERSAL: &[&str] = &["%2e%2e", "%252e", "%2f", "%5c", "0x2e0x2e"];

const DANGEROUS_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

/// Structured validation failure with a stable rule code.
///
/// The detail never echoes the rejected input, so the error is safe to log
/// and to return to callers verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("validation rule '{rule}' rejected input: {detail}")]
pub struct ValidationError {
    /// Stable machine-readable rule code.
    pub rule: &'static str,
    /// Human-readable detail for logs and diagnostics.
    pub detail: String,
}

impl ValidationError {
    pub fn new(rule: &'static str, detail: impl Into<String>) -> Self {
        Self {
            rule,
            detail: detail.into(),
        }
    }
}

/// Policy knobs for [`validate_path`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PathPolicy {
    /// Allows absolute paths when true.
    pub allow_absolute: bool,
}

/// Validates a path candidate against traversal, injection, and length rules.
pub fn validate_path(path: &str, policy: PathPolicy) -> Result<(), ValidationError> {
    if path.trim().is_empty() {
        return Err(ValidationError::new("path_empty", "path cannot be empty"));
    }
    if path.len() > MAX_PATH_BYTES {
        return Err(ValidationError::new(
            "path_too_long",
            format!("path exceeds the {MAX_PATH_BYTES}-byte limit"),
        ));
    }
    if path.contains('\0') {
        return Err(ValidationError::new(
            "path_null_byte",
            "path contains a null byte",
        ));
    }
    if path.contains(SHELL_METACHARACTERS) {
        return Err(ValidationError::new(
            "path_shell_metacharacter",
            "path contains a shell metacharacter",
        ));
    }
    if path.contains("..") {
        return Err(ValidationError::new(
            "path_traversal",
            "path contains a parent-directory segment",
        ));
    }
    let lowered = path.to_ascii_lowercase();
    if ENCODED_TRAVERSAL
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        return Err(ValidationError::new(
            "path_encoded_traversal",
            "path contains an encoded traversal sequence",
        ));
    }
    if !policy.allow_absolute && is_absolute_path(path) {
        return Err(ValidationError::new(
            "path_absolute",
            "absolute paths are not allowed here",
        ));
    }
    Ok(())
}

fn is_absolute_path(path: &str) -> bool {
    if path.starts_with('/') {
        return true;
    }
    // Windows drive spellings are rejected as absolute on all platforms.
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
}

/// Validates an identifier: non-empty, bounded, leading alphanumeric, and
/// otherwise restricted to alphanumerics plus the characters in `extra`.
pub fn validate_identifier(
    candidate: &str,
    max_len: usize,
    extra: &str,
) -> Result<(), ValidationError> {
    if candidate.is_empty() {
        return Err(ValidationError::new(
            "identifier_empty",
            "identifier cannot be empty",
        ));
    }
    if candidate.len() > max_len {
        return Err(ValidationError::new(
            "identifier_too_long",
            format!("identifier exceeds the {max_len}-character limit"),
        ));
    }
    let mut chars = candidate.chars();
    let first = chars.next().unwrap_or(' ');
    if !first.is_ascii_alphanumeric() {
        return Err(ValidationError::new(
            "identifier_leading_char",
            "identifier must start with an alphanumeric character",
        ));
    }
    if chars.any(|ch| !ch.is_ascii_alphanumeric() && !extra.contains(ch)) {
        return Err(ValidationError::new(
            "identifier_charset",
            "identifier contains a disallowed character",
        ));
    }
    Ok(())
}

/// True iff the key is, or contains, a prototype-pollution vector.
pub fn dangerous_key(key: &str) -> bool {
    DANGEROUS_KEYS
        .iter()
        .any(|needle| key == *needle || key.contains(needle))
}

/// Removes dangerous keys from a JSON tree in place, returning how many
/// entries were stripped.
pub fn strip_dangerous_keys(value: &mut Value) -> usize {
    match value {
        Value::Object(map) => {
            let doomed: Vec<String> = map
                .keys()
                .filter(|key| dangerous_key(key))
                .cloned()
                .collect();
            let mut removed = doomed.len();
            for key in doomed {
                map.remove(&key);
            }
            for entry in map.values_mut() {
                removed += strip_dangerous_keys(entry);
            }
            removed
        }
        Value::Array(items) => items.iter_mut().map(strip_dangerous_keys).sum(),
        _ => 0,
    }
}

/// Recursively merges `source` into `target`, skipping dangerous keys.
///
/// Objects merge key-by-key; any other source value replaces the target
/// value. Idempotent for sources free of dangerous keys.
pub fn safe_deep_merge(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(target_map), Value::Object(source_map)) => {
            for (key, incoming) in source_map {
                if dangerous_key(key) {
                    continue;
                }
                match target_map.get_mut(key) {
                    Some(existing) if existing.is_object() && incoming.is_object() => {
                        safe_deep_merge(existing, incoming);
                    }
                    _ => {
                        let mut cleaned = incoming.clone();
                        strip_dangerous_keys(&mut cleaned);
                        target_map.insert(key.clone(), cleaned);
                    }
                }
            }
        }
        (target_slot, source_value) => {
            let mut cleaned = source_value.clone();
            strip_dangerous_keys(&mut cleaned);
            *target_slot = cleaned;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unit_validate_path_accepts_plain_relative_paths() {
        validate_path("logs/core.log", PathPolicy::default()).expect("plain path");
        validate_path("a-b_c.d/e", PathPolicy::default()).expect("punctuated path");
    }

    #[test]
    fn unit_validate_path_rejects_traversal_and_encodings() {
        for candidate in [
            "../etc/passwd",
            "a/../b",
            "a/%2e%2e/b",
            "a/%252e%252e/b",
            "0x2e0x2e/b",
        ] {
            let error =
                validate_path(candidate, PathPolicy::default()).expect_err("must be rejected");
            assert!(
                error.rule.starts_with("path_"),
                "unexpected rule {} for {candidate}",
                error.rule
            );
        }
    }

    #[test]
    fn unit_validate_path_rejects_shell_metacharacters() {
        for candidate in ["a;b", "a|b", "a&b", "a$(b)", "a`b`", "a>b", "a\\b", "a\nb"] {
            let error =
                validate_path(candidate, PathPolicy::default()).expect_err("must be rejected");
            assert_eq!(error.rule, "path_shell_metacharacter", "for {candidate:?}");
        }
    }

    #[test]
    fn unit_validate_path_honors_absolute_policy() {
        assert_eq!(
            validate_path("/etc/hosts", PathPolicy::default())
                .expect_err("absolute should be rejected")
                .rule,
            "path_absolute"
        );
        validate_path("/var/lib/mc", PathPolicy { allow_absolute: true })
            .expect("absolute allowed by policy");
        assert_eq!(
            validate_path("C:/windows", PathPolicy::default())
                .expect_err("drive letter is absolute")
                .rule,
            "path_absolute"
        );
    }

    #[test]
    fn regression_validate_path_rejects_null_byte_before_other_rules() {
        let error = validate_path("ok\0/../x", PathPolicy::default()).expect_err("null byte");
        assert_eq!(error.rule, "path_null_byte");
    }

    #[test]
    fn regression_validation_error_never_echoes_input() {
        let error = validate_path("`rm -rf /`", PathPolicy::default()).expect_err("metachar");
        assert!(!error.detail.contains("rm -rf"));
        assert!(!error.to_string().contains("rm -rf"));
    }

    #[test]
    fn unit_validate_identifier_enforces_charset_and_bounds() {
        validate_identifier("mc-backend", 64, "._-").expect("service name");
        validate_identifier("sess_01.a", 64, "._-").expect("session id");
        assert_eq!(
            validate_identifier("", 64, "._-").expect_err("empty").rule,
            "identifier_empty"
        );
        assert_eq!(
            validate_identifier("-leading", 64, "._-")
                .expect_err("leading dash")
                .rule,
            "identifier_leading_char"
        );
        assert_eq!(
            validate_identifier("a".repeat(65).as_str(), 64, "._-")
                .expect_err("too long")
                .rule,
            "identifier_too_long"
        );
        assert_eq!(
            validate_identifier("a b", 64, "._-")
                .expect_err("space")
                .rule,
            "identifier_charset"
        );
    }

    #[test]
    fn unit_dangerous_key_matches_substrings() {
        assert!(dangerous_key("__proto__"));
        assert!(dangerous_key("constructor"));
        assert!(dangerous_key("prototype"));
        assert!(dangerous_key("nested__proto__key"));
        assert!(!dangerous_key("protocol"));
        assert!(!dangerous_key("construct"));
    }

    #[test]
    fn functional_strip_dangerous_keys_walks_nested_structures() {
        let mut value = json!({
            "__proto__": {"polluted": true},
            "gateway": {"url": "http://localhost:3000", "constructor": 1},
            "list": [{"prototype": 2}, {"ok": 3}],
        });
        let removed = strip_dangerous_keys(&mut value);
        assert_eq!(removed, 3);
        assert_eq!(value["gateway"]["url"], "http://localhost:3000");
        assert!(value.get("__proto__").is_none());
        assert!(value["gateway"].get("constructor").is_none());
        assert!(value["list"][0].as_object().expect("object").is_empty());
    }

    #[test]
    fn functional_safe_deep_merge_skips_dangerous_keys() {
        let mut target = json!({"a": {"b": 1}});
        safe_deep_merge(
            &mut target,
            &json!({"a": {"c": 2, "__proto__": {"x": 1}}, "d": 3}),
        );
        assert_eq!(target, json!({"a": {"b": 1, "c": 2}, "d": 3}));
    }

    #[test]
    fn functional_safe_deep_merge_is_idempotent_for_clean_sources() {
        let source = json!({"a": {"b": 2}, "c": [1, 2]});
        let mut once = json!({"a": {"b": 1}, "z": 9});
        safe_deep_merge(&mut once, &source);
        let mut twice = once.clone();
        safe_deep_merge(&mut twice, &source);
        assert_eq!(once, twice);
    }

    #[test]
    fn regression_safe_deep_merge_strips_dangerous_keys_inside_replacements() {
        let mut target = json!({});
        safe_deep_merge(&mut target, &json!({"fresh": {"__proto__": 1, "ok": 2}}));
        assert_eq!(target, json!({"fresh": {"ok": 2}}));
    }
}
