//! Deterministic cache-key generation
//!
//! A cache key is the hex SHA-256 of a canonical byte serialization of a
//! value tree. Canonical means: map keys sorted lexicographically, list
//! order preserved, strings UTF-8, integers and booleans in a single fixed
//! form. Floats are rejected at construction since they have no canonical
//! cross-platform encoding.

use crate::error::{CoreError, Result};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use sha2::{Digest as Sha2Digest, Sha256};
use std::collections::BTreeMap;

/// A canonicalized value tree suitable for key generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Absent/unset
    Null,
    /// Boolean
    Bool(bool),
    /// Integer; the only numeric type with a canonical form
    Int(i64),
    /// UTF-8 string
    Str(String),
    /// Ordered sequence
    List(Vec<Value>),
    /// Mapping; `BTreeMap` keeps keys sorted
    Dict(BTreeMap<String, Value>),
}

impl Value {
    /// Shorthand for a string value
    pub fn str(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    /// Build a dict from key/value pairs
    pub fn dict<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        Self::Dict(pairs.into_iter().collect())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int(i) => serializer.serialize_i64(*i),
            Self::Str(s) => serializer.serialize_str(s),
            Self::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Dict(map) => {
                let mut m = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    m.serialize_entry(k, v)?;
                }
                m.end()
            }
        }
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = CoreError;

    /// Sanitize a JSON value into canonical form.
    ///
    /// Fails on non-integral numbers; they would make keys depend on float
    /// formatting.
    fn try_from(value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Null => Ok(Self::Null),
            serde_json::Value::Bool(b) => Ok(Self::Bool(b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .ok_or_else(|| CoreError::cache_key(format!("non-integral number {n} in key input"))),
            serde_json::Value::String(s) => Ok(Self::Str(s)),
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(Self::try_from)
                .collect::<Result<Vec<_>>>()
                .map(Self::List),
            serde_json::Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| Ok((k, Self::try_from(v)?)))
                .collect::<Result<BTreeMap<_, _>>>()
                .map(Self::Dict),
        }
    }
}

/// Generate a hex SHA-256 cache key for the given value tree.
pub fn generate_key(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| CoreError::cache_key(format!("failed to serialize key input: {e}")))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        Value::dict([
            ("kind".to_string(), Value::str("script")),
            (
                "config".to_string(),
                Value::dict([
                    ("commands".to_string(), Value::List(vec![Value::str("make")])),
                    ("strict".to_string(), Value::Bool(true)),
                ]),
            ),
            ("depth".to_string(), Value::Int(3)),
        ])
    }

    #[test]
    fn key_is_stable() {
        let a = generate_key(&sample()).unwrap();
        let b = generate_key(&sample()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn key_is_insertion_order_independent() {
        let forward = Value::dict([
            ("a".to_string(), Value::Int(1)),
            ("b".to_string(), Value::Int(2)),
        ]);
        let backward = Value::dict([
            ("b".to_string(), Value::Int(2)),
            ("a".to_string(), Value::Int(1)),
        ]);
        assert_eq!(
            generate_key(&forward).unwrap(),
            generate_key(&backward).unwrap()
        );
    }

    #[test]
    fn list_order_matters() {
        let ab = Value::List(vec![Value::str("a"), Value::str("b")]);
        let ba = Value::List(vec![Value::str("b"), Value::str("a")]);
        assert_ne!(generate_key(&ab).unwrap(), generate_key(&ba).unwrap());
    }

    #[test]
    fn floats_are_rejected() {
        let json: serde_json::Value = serde_json::json!({ "x": 1.5 });
        assert!(Value::try_from(json).is_err());
    }

    #[test]
    fn integral_json_numbers_convert() {
        let json: serde_json::Value = serde_json::json!({ "x": 7 });
        let value = Value::try_from(json).unwrap();
        assert_eq!(
            value,
            Value::dict([("x".to_string(), Value::Int(7))])
        );
    }
}
