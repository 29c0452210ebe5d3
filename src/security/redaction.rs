//! Secrets redaction for audit events, session ledgers and structured logs.
//!
//! Walks any JSON payload and masks values stored under keys whose lowercased
//! form contains one of the secret markers. Plaintext secrets must never reach
//! `audit_events` or `structured.log`.

use serde_json::Value;

const SECRET_KEYS: &[&str] = &[
    "access_token",
    "refresh_token",
    "token",
    "authorization",
    "cookie",
    "sessionid",
    "api_key",
    "api_secret",
    "secret",
    "password",
];

fn mask(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    if value.chars().count() <= 8 {
        return "*".repeat(value.chars().count());
    }
    let chars: Vec<char> = value.chars().collect();
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

fn value_as_secret_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Return a copy of `payload` with every secret-keyed value masked.
pub fn redact_payload(payload: &Value) -> Value {
    match payload {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, value) in map {
                let lowered = key.to_lowercase();
                if SECRET_KEYS.iter().any(|marker| lowered.contains(marker)) {
                    out.insert(key.clone(), Value::String(mask(&value_as_secret_string(value))));
                } else {
                    out.insert(key.clone(), redact_payload(value));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_payload).collect()),
        other => other.clone(),
    }
}
