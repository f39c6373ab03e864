use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 hex digest of a canonical rendering of `value`, with object keys
/// visited in sorted order so HashMap iteration order cannot change the
/// result. Used to detect pod-template drift cheaply without diffing the
/// full struct.
pub fn compute_template_hash<T: Serialize>(value: &T) -> String {
    let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
    let mut hasher = Sha256::new();
    digest_value(&value, &mut hasher);
    format!("{:x}", hasher.finalize())
}

/// Stream one value into the hasher. Structural markers keep e.g. a key
/// named like its value from colliding with a different nesting.
fn digest_value(value: &serde_json::Value, hasher: &mut Sha256) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            hasher.update(b"{");
            for key in keys {
                hasher.update(key.as_bytes());
                hasher.update(b"=");
                digest_value(&map[key], hasher);
                hasher.update(b";");
            }
            hasher.update(b"}");
        }
        serde_json::Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                digest_value(item, hasher);
                hasher.update(b";");
            }
            hasher.update(b"]");
        }
        leaf => hasher.update(leaf.to_string().as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn hash_is_stable_across_key_order() {
        let a: HashMap<&str, u32> = [("x", 1), ("y", 2)].into_iter().collect();
        let b: HashMap<&str, u32> = [("y", 2), ("x", 1)].into_iter().collect();
        assert_eq!(compute_template_hash(&a), compute_template_hash(&b));
    }

    #[test]
    fn hash_changes_with_content() {
        let a: HashMap<&str, u32> = [("x", 1)].into_iter().collect();
        let b: HashMap<&str, u32> = [("x", 2)].into_iter().collect();
        assert_ne!(compute_template_hash(&a), compute_template_hash(&b));
    }

    #[test]
    fn nesting_is_distinguished_from_flat_values() {
        let nested = serde_json::json!({ "a": { "b": 1 } });
        let flat = serde_json::json!({ "a": "b=1" });
        assert_ne!(compute_template_hash(&nested), compute_template_hash(&flat));
    }
}
