//! Content-hash identity (spec §3: "a stable 32-char content hash of its
//! canonical form; two versions with identical semantics share one id").

use sha2::{Digest, Sha256};
use serde_json::Value;

/// Canonicalise a JSON value: sort object keys, drop `null` values and empty
/// arrays/objects, so that two structurally-equivalent values produce
/// identical bytes regardless of field declaration order. `serde_json`
/// already preserves insertion order in `Value::Object` by default, which is
/// why we rebuild into a `BTreeMap`-backed ordering here instead of relying
/// on struct field order surviving refactors untouched.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: std::collections::BTreeMap<String, Value> = std::collections::BTreeMap::new();

            for (key, v) in map {
                if v.is_null() {
                    continue;
                }

                let canon = canonicalize(v);

                let drop = match &canon {
                    Value::Array(a) => a.is_empty(),
                    Value::Object(o) => o.is_empty(),
                    _ => false,
                };

                if !drop {
                    sorted.insert(key.clone(), canon);
                }
            }

            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Compute the 32-character lowercase hex content hash of a serializable
/// value's canonical form (spec §6.3).
pub fn content_hash<T: serde::Serialize>(value: &T) -> String {
    let json = serde_json::to_value(value).expect("domain values always serialize");
    let canonical = canonicalize(&json);
    let bytes = serde_json::to_vec(&canonical).expect("canonical value always serializes");

    let mut hasher = Sha256::new();
    hasher.update(&bytes);

    format!("{:x}", hasher.finalize())[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_order_does_not_affect_hash() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});

        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn null_and_empty_fields_are_excluded() {
        let a = json!({"a": 1});
        let b = json!({"a": 1, "b": null, "c": [], "d": {}});

        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn distinct_content_hashes_differently() {
        let a = json!({"a": 1});
        let b = json!({"a": 2});

        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn hash_is_32_lowercase_hex_chars() {
        let hash = content_hash(&json!({"a": 1}));
        assert_eq!(hash.len(), 32);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
