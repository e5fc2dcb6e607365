//! Canonical JSON digest computation.
//!
//! `serde_json::Value` objects are BTreeMap-backed, so serializing a value
//! tree yields sorted keys and a stable byte sequence for hashing.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// SHA-256 hex digest of the canonical JSON encoding of `value`.
pub fn compute_digest(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 hex digest of raw bytes (candidate code identity).
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
