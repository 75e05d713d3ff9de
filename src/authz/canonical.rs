//! Canonical JSON serialization.
//!
//! Decision-cache fingerprints and audit content hashes must be reproducible
//! across hosts, so the serialized form is fixed: object keys sorted, compact
//! separators, UTF-8. Arrays keep their order; only maps are normalized.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Serialize a JSON value canonically: sorted keys, no insignificant whitespace.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    normalize(value).to_string()
}

/// Hex-encoded SHA-256 over the canonical serialization of `value`.
#[must_use]
pub fn canonical_sha256(value: &Value) -> String {
    hex::encode(Sha256::digest(canonical_json(value).as_bytes()))
}

fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(key, val)| (key, normalize(val))).collect();
            let mut out = serde_json::Map::new();
            for (key, val) in sorted {
                out.insert(key.clone(), val);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_recursively() {
        let value = json!({"b": {"z": 1, "a": 2}, "a": [{"y": 1, "x": 2}]});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":[{"x":2,"y":1}],"b":{"a":2,"z":1}}"#
        );
    }

    #[test]
    fn key_order_does_not_change_the_hash() {
        let first = json!({"tenant": {"id": "t1", "plan": "standard"}, "action": "read"});
        let second = json!({"action": "read", "tenant": {"plan": "standard", "id": "t1"}});
        assert_eq!(canonical_sha256(&first), canonical_sha256(&second));
    }

    #[test]
    fn array_order_is_significant() {
        let first = json!({"scopes": ["read", "write"]});
        let second = json!({"scopes": ["write", "read"]});
        assert_ne!(canonical_sha256(&first), canonical_sha256(&second));
    }

    #[test]
    fn value_changes_change_the_hash() {
        let first = json!({"allow": true});
        let second = json!({"allow": false});
        assert_ne!(canonical_sha256(&first), canonical_sha256(&second));
    }

    #[test]
    fn scalars_pass_through() {
        assert_eq!(canonical_json(&json!(null)), "null");
        assert_eq!(canonical_json(&json!(42)), "42");
        assert_eq!(canonical_json(&json!("x")), "\"x\"");
    }
}
