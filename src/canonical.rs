//! Canonical JSON serialization shared by plan hashing, token signing,
//! and the audit chain.
//!
//! Canonical form is compact JSON with lexicographically sorted object
//! keys. `serde_json` objects are BTreeMap-backed, so building a
//! [`serde_json::Value`] tree and serializing it yields exactly that —
//! the same bytes for the same logical content, across processes.

use serde_json::Value;

/// Serialize a JSON value to its canonical byte form.
///
/// Object keys come out sorted because `serde_json::Map` preserves
/// BTreeMap ordering; output is compact (`","` / `":"` separators, no
/// whitespace).
pub fn to_canonical_bytes(value: &Value) -> Vec<u8> {
    // Value serialization cannot fail: no non-string keys, no
    // non-serializable types can appear in a Value tree.
    serde_json::to_vec(value).unwrap_or_default()
}

/// Canonical string form of a JSON value (UTF-8 of [`to_canonical_bytes`]).
pub fn to_canonical_string(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// SHA-256 of the canonical byte form, as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
