//! Redaction of credentials in headers and JSON payloads before they are logged.

use http::HeaderMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;

/// Keys whose values must never reach a log line verbatim.
static SENSITIVE_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)token|authorization|password|secret").expect("Sensitive key regex should be valid")
});

/// Characters of a token-like value kept in logs.
pub const VISIBLE_PREFIX_CHARS: usize = 20;

/// Trailing characters of a token-like value that are always hidden.
pub const MIN_HIDDEN_CHARS: usize = 10;

/// Replacement for password and secret values.
pub const REDACTED: &str = "[REDACTED]";

/// Whether `key` names a credential-bearing field.
pub fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEY.is_match(key)
}

/// Redact `value` according to the field it belongs to.
pub fn redact_value(key: &str, value: &str) -> String {
    if !is_sensitive_key(key) {
        return value.to_string();
    }
    let lower = key.to_lowercase();
    if lower.contains("password") || lower.contains("secret") {
        return REDACTED.to_string();
    }
    let visible = value
        .chars()
        .count()
        .saturating_sub(MIN_HIDDEN_CHARS)
        .min(VISIBLE_PREFIX_CHARS);
    let prefix: String = value.chars().take(visible).collect();
    format!("{prefix}...")
}

/// Log-safe copy of a header map. Multi-valued headers are joined with `, `.
pub fn redact_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut redacted = BTreeMap::new();
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .map(|v| v.to_str().unwrap_or("<binary>"))
            .collect::<Vec<_>>()
            .join(", ");
        redacted.insert(name.as_str().to_string(), redact_value(name.as_str(), &joined));
    }
    redacted
}

/// Log-safe copy of a JSON value, redacting sensitive keys at any depth.
pub fn redact_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| {
                    let redacted = if is_sensitive_key(key) {
                        match inner {
                            Value::String(s) => Value::String(redact_value(key, s)),
                            Value::Null => Value::Null,
                            other => Value::String(redact_value(key, &other.to_string())),
                        }
                    } else {
                        redact_json(inner)
                    };
                    (key.clone(), redacted)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_json).collect()),
        other => other.clone(),
    }
}
