//! Canonical JSON and configuration digests.
//!
//! Desired classrooms and assignments are hashed over a canonical JSON form
//! so that field order and integer-valued floats never change the digest:
//! - object keys sorted by UTF-16 code units
//! - integer-valued floats written as integers; NaN/Infinity rejected
//! - compact output, SHA-256 hex

use lmsh_state::ConfigDigest;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::domain::error::{LmshError, Result, ValidationError};

fn sort_keys_utf16(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));

            let mut sorted = serde_json::Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.to_string(), sort_keys_utf16(v));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys_utf16).collect()),
        other => other.clone(),
    }
}

fn normalize_value(value: &Value) -> Result<Value> {
    match value {
        Value::Object(map) => {
            let mut normalized = serde_json::Map::new();
            for (k, v) in map {
                normalized.insert(k.clone(), normalize_value(v)?);
            }
            Ok(Value::Object(normalized))
        }
        Value::Array(arr) => Ok(Value::Array(
            arr.iter().map(normalize_value).collect::<Result<Vec<_>>>()?,
        )),
        Value::Number(n) if !(n.is_i64() || n.is_u64()) => match n.as_f64() {
            Some(f) if !f.is_finite() => Err(LmshError::Validation(ValidationError::Other(
                "NaN/Infinity not permitted in canonical JSON".to_string(),
            ))),
            Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
                Ok(Value::Number(serde_json::Number::from(f as i64)))
            }
            _ => Ok(Value::Number(n.clone())),
        },
        other => Ok(other.clone()),
    }
}

/// Canonical compact JSON for `value`.
pub fn canonical_json(value: &Value) -> Result<String> {
    let normalized = normalize_value(value)?;
    Ok(serde_json::to_string(&sort_keys_utf16(&normalized))?)
}

/// SHA-256 hex digest of the canonical form of `value`.
pub fn compute_digest(value: &Value) -> Result<String> {
    let canonical = canonical_json(value)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Snapshot a desired configuration and digest it.
///
/// Returns the JSON snapshot stored as `applied` alongside its digest.
pub fn snapshot<T: Serialize>(desired: &T) -> Result<(Value, ConfigDigest)> {
    let value = serde_json::to_value(desired)?;
    let digest = ConfigDigest::try_from(compute_digest(&value)?)?;
    Ok((value, digest))
}
