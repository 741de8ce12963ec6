//! Canonical configuration serialization and cache-key derivation
//!
//! Cache keys identify a staging request by its observable configuration,
//! never by hash results. Mappings are rebuilt with sorted keys before
//! digesting, so two structurally equal configurations yield the same key
//! regardless of key insertion order. Sequence order is preserved; it is
//! semantically meaningful, unlike mapping key order.

use crate::{Error, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Rebuild `value` with every mapping's keys sorted lexicographically.
///
/// Sequences and scalars pass through unchanged. Total over any acyclic
/// value.
#[must_use]
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<(&String, &Value)> = map.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::with_capacity(pairs.len());
            for (key, nested) in pairs {
                out.insert(key.clone(), canonicalize(nested));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        scalar => scalar.clone(),
    }
}

/// Derive an opaque cache key from a configuration value.
///
/// Canonical JSON bytes digested with SHA-256; collision resistance
/// matters because distinct configurations must not share a key.
///
/// # Errors
///
/// Returns [`Error::Serialization`] if the canonical value cannot be
/// encoded.
pub fn cache_key(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(&canonicalize(value))
        .map_err(|e| Error::serialization(format!("Failed to encode cache-key input: {e}")))?;
    Ok(hex::encode(Sha256::digest(bytes)))
}
