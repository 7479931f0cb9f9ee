//! Canonical JSON encoding and structural version hashes.
//!
//! A formula's version is the SHA-256 of the canonical JSON of its term
//! list: object keys sorted, integer-valued floats written as integers,
//! non-finite numbers rejected. Two structurally equal formulas always hash
//! the same regardless of how they were built or deserialized.

use serde::Serialize;
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

use super::error::FormulaError;

fn canonicalize(value: &Value) -> Result<Value, FormulaError> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key])?);
            }
            Ok(Value::Object(sorted))
        }
        Value::Array(items) => Ok(Value::Array(
            items.iter().map(canonicalize).collect::<Result<_, _>>()?,
        )),
        Value::Number(n) if !(n.is_i64() || n.is_u64()) => {
            let f = n.as_f64().ok_or_else(|| {
                FormulaError::Encoding(format!("number {n} is not representable"))
            })?;
            if !f.is_finite() {
                return Err(FormulaError::Encoding(
                    "non-finite numbers have no canonical form".to_string(),
                ));
            }
            if f.fract() == 0.0 && f.abs() < 9.0e15 {
                Ok(Value::Number(Number::from(f as i64)))
            } else {
                Ok(Value::Number(n.clone()))
            }
        }
        other => Ok(other.clone()),
    }
}

/// Canonical compact JSON for any serializable value.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, FormulaError> {
    let raw = serde_json::to_value(value).map_err(|e| FormulaError::Encoding(e.to_string()))?;
    let canonical = canonicalize(&raw)?;
    serde_json::to_string(&canonical).map_err(|e| FormulaError::Encoding(e.to_string()))
}

/// SHA-256 hex digest of the canonical JSON of `value`.
pub fn structural_digest<T: Serialize>(value: &T) -> Result<String, FormulaError> {
    let canonical = canonical_json(value)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_digest() {
        let a = json!({"feature": "harshness", "weight": 0.5});
        let b = json!({"weight": 0.5, "feature": "harshness"});
        assert_eq!(structural_digest(&a).unwrap(), structural_digest(&b).unwrap());
    }

    #[test]
    fn integer_valued_floats_collapse() {
        assert_eq!(canonical_json(&json!({"w": 2.0})).unwrap(), r#"{"w":2}"#);
        assert_eq!(canonical_json(&json!({"w": -3.0})).unwrap(), r#"{"w":-3}"#);
        assert_eq!(canonical_json(&json!({"w": 0.25})).unwrap(), r#"{"w":0.25}"#);
    }

    #[test]
    fn term_order_is_significant() {
        let a = json!([{"f": "a"}, {"f": "b"}]);
        let b = json!([{"f": "b"}, {"f": "a"}]);
        assert_ne!(structural_digest(&a).unwrap(), structural_digest(&b).unwrap());
    }

    #[test]
    fn nan_weights_encode_as_null() {
        #[derive(Serialize)]
        struct Weight {
            w: f64,
        }
        // serde_json maps NaN to null, which is canonical but never equal to a weight
        let encoded = canonical_json(&Weight { w: f64::NAN }).unwrap();
        assert_eq!(encoded, r#"{"w":null}"#);
    }

    #[test]
    fn digest_is_hex_sha256() {
        let digest = structural_digest(&json!({"x": 1})).unwrap();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
