//! Secret redaction for anything that leaves the process as text.
//!
//! A field name matching any of the sensitive markers has its value
//! replaced before logging or display. Matching is substring-based and
//! case-insensitive, so `admin_key`, `hubToken`, and `DB_PASSWORD` are
//! all caught.

const SENSITIVE_MARKERS: &[&str] = &["key", "token", "secret", "password", "credential", "auth"];

pub const REDACTED: &str = "<redacted>";

/// Whether a field name refers to sensitive material.
pub fn is_sensitive_field(name: &str) -> bool {
    let name = name.to_lowercase();
    SENSITIVE_MARKERS.iter().any(|marker| name.contains(marker))
}

/// Recursively replace values of sensitive fields in a JSON tree.
pub fn redact_value(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (field, child) in map.iter_mut() {
                if is_sensitive_field(field) && !child.is_null() {
                    *child = serde_json::Value::String(REDACTED.to_string());
                } else {
                    redact_value(child);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                redact_value(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_name_matching() {
        assert!(is_sensitive_field("admin_key"));
        assert!(is_sensitive_field("hubToken"));
        assert!(is_sensitive_field("DB_PASSWORD"));
        assert!(is_sensitive_field("authorization"));
        assert!(is_sensitive_field("client_secret"));
        assert!(is_sensitive_field("credentials"));
        assert!(!is_sensitive_field("model_id"));
        assert!(!is_sensitive_field("temperature"));
    }

    #[test]
    fn redacts_nested_values() {
        let mut value = serde_json::json!({
            "security": {"admin_key": "s3cr3t", "inference_key": null},
            "models": {"hub_token_env": "HF_TOKEN"},
            "nodes": [{"api_key": "abc", "base_url": "http://x"}],
            "port": 1234,
        });
        redact_value(&mut value);
        assert_eq!(value["security"]["admin_key"], REDACTED);
        // Null stays null so "unset" remains visible.
        assert!(value["security"]["inference_key"].is_null());
        // The env var *name* field matches "token" and is redacted too —
        // over-redaction is the safe direction.
        assert_eq!(value["models"]["hub_token_env"], REDACTED);
        assert_eq!(value["nodes"][0]["api_key"], REDACTED);
        assert_eq!(value["nodes"][0]["base_url"], "http://x");
        assert_eq!(value["port"], 1234);
    }
}
