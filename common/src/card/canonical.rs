use serde_json::Value;

use crate::crypto::{hash, Hash};

/// Recursively sort all object keys in a JSON value so that serialization
/// is deterministic regardless of the order keys arrived in.
pub fn canonicalize_json_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = std::mem::take(map).into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            for (k, mut v) in entries {
                canonicalize_json_value(&mut v);
                map.insert(k, v);
            }
        }
        Value::Array(arr) => {
            for item in arr {
                canonicalize_json_value(item);
            }
        }
        _ => {}
    }
}

/// Key-sorted, whitespace-free serialization of a JSON value.
/// serde_json already emits numbers in their minimal form.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    let mut sorted = value.clone();
    canonicalize_json_value(&mut sorted);
    // Serializing a Value cannot fail: it contains no non-string keys
    // and no non-finite numbers.
    serde_json::to_vec(&sorted).unwrap_or_default()
}

/// SHA-256 over the canonical bytes; the deduplication key for publishes.
pub fn content_hash(canonical: &[u8]) -> Hash {
    hash(canonical)
}
