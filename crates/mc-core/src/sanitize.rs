//! Log sanitization and secret masking primitives.

use serde_json::Value;

/// Maximum byte length of a sanitized log fragment.
pub const MAX_LOG_FRAGMENT_BYTES: usize = 2_048;

const SENSITIVE_KEY_MARKERS: &[&str] = &["token", "password", "secret", "key", "apikey"];

/// Strips ASCII control characters (including CR/LF and null bytes) and
/// truncates the result to [`MAX_LOG_FRAGMENT_BYTES`] on a char boundary.
pub fn sanitize_for_log(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|ch| !ch.is_ascii_control())
        .collect();
    if cleaned.len() <= MAX_LOG_FRAGMENT_BYTES {
        return cleaned;
    }
    let mut end = MAX_LOG_FRAGMENT_BYTES;
    while end > 0 && !cleaned.is_char_boundary(end) {
        end -= 1;
    }
    cleaned[..end].to_string()
}

/// True when a JSON key should have its value masked before logging.
pub fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SENSITIVE_KEY_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// Masks a secret as `xxxx…yyyy`, preserving the first and last four
/// characters. Inputs of eight characters or fewer are fully masked.
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}\u{2026}{tail}")
}

/// Recursively masks values under sensitive keys in a JSON tree.
///
/// Non-string sensitive values are replaced with the full mask; everything
/// else is passed through unchanged.
pub fn mask_sensitive(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut masked = serde_json::Map::with_capacity(map.len());
            for (key, entry) in map {
                if is_sensitive_key(key) {
                    let replacement = match entry {
                        Value::String(text) => Value::String(mask_secret(text)),
                        Value::Null => Value::Null,
                        _ => Value::String("****".to_string()),
                    };
                    masked.insert(key.clone(), replacement);
                } else {
                    masked.insert(key.clone(), mask_sensitive(entry));
                }
            }
            Value::Object(masked)
        }
        Value::Array(items) => Value::Array(items.iter().map(mask_sensitive).collect()),
        other => other.clone(),
    }
}
