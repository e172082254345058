//! Content fingerprints for message integrity
//!
//! A fingerprint is the BLAKE3 digest of the canonical JSON encoding of a
//! value: compact, with every object's keys in sorted order, so two
//! structurally equal values fingerprint identically whatever order their
//! fields were inserted in.

use crate::common::Result;
use serde::Serialize;
use serde_json::Value;

/// Compute BLAKE3 hash of data, return hex string
pub fn blake3_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    format!("{}", hash)
}

/// Rebuild `value` with every object's keys in sorted order, at every depth.
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Canonical (key-sorted, compact) encoding of a serializable value.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let value = canonicalize(serde_json::to_value(value)?);
    Ok(serde_json::to_vec(&value)?)
}

/// Stable fingerprint of `value`.
pub fn fingerprint<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(blake3_hash(&canonical_bytes(value)?))
}

/// Fingerprint of an already-parsed JSON document.
pub fn fingerprint_value(value: &Value) -> String {
    // Serializing a `Value` cannot fail: keys are always strings.
    let bytes = serde_json::to_vec(&canonicalize(value.clone())).unwrap_or_default();
    blake3_hash(&bytes)
}

/// Does `value` fingerprint to `expected`?
pub fn verify<T: Serialize + ?Sized>(value: &T, expected: &str) -> bool {
    matches!(fingerprint(value), Ok(actual) if actual == expected)
}
