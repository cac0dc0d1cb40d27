//! Record values and the reversible byte/text codec.
//!
//! Backends never interpret field values; they store whatever the codec
//! hands them. The binary form keeps raw blobs distinguishable from
//! document values with a single marker byte, and the document side is
//! canonical JSON, so data written before the marker scheme existed
//! (plain JSON) still deserialises.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde_json::Value as Json;

use crate::error::StoreError;

/// A single field value.
///
/// Floats are required to be finite; the codec rejects NaN and the
/// infinities when serialising.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Binary(Bytes),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// Whether this value is usable as a record id.
    pub fn is_valid_id(&self) -> bool {
        matches!(self, Value::String(_) | Value::Int(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Converts to a JSON document. Binary blobs have no JSON
    /// representation and are rejected.
    pub fn to_json(&self) -> Result<Json, StoreError> {
        match self {
            Value::Null => Ok(Json::Null),
            Value::Bool(b) => Ok(Json::Bool(*b)),
            Value::Int(n) => Ok(Json::from(*n)),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .ok_or_else(|| StoreError::Codec("non-finite number".to_string())),
            Value::String(s) => Ok(Json::String(s.clone())),
            Value::Binary(_) => Err(StoreError::Codec(
                "binary values cannot be nested in documents".to_string(),
            )),
            Value::Array(items) => items
                .iter()
                .map(Value::to_json)
                .collect::<Result<Vec<_>, _>>()
                .map(Json::Array),
            Value::Object(fields) => {
                let mut map = serde_json::Map::with_capacity(fields.len());
                for (name, value) in fields {
                    map.insert(name.clone(), value.to_json()?);
                }
                Ok(Json::Object(map))
            }
        }
    }

    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    // u64 beyond i64::MAX or a fraction.
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => Value::Array(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => Value::Object(
                map.iter()
                    .map(|(name, value)| (name.clone(), Value::from_json(value)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Binary(Bytes::from(b))
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Binary(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(fields: BTreeMap<String, Value>) -> Self {
        Value::Object(fields)
    }
}

/// Marker for raw blobs in the binary form. JSON never begins with a NUL
/// byte, so unmarked document payloads stay unambiguous.
const BINARY_MARKER: u8 = 0x00;

/// Serialises a value to the binary form: `0x00 || raw` for blobs,
/// canonical JSON (object keys sorted) for everything else.
pub fn to_bytes(value: &Value) -> Result<Vec<u8>, StoreError> {
    match value {
        Value::Binary(raw) => {
            let mut out = Vec::with_capacity(raw.len() + 1);
            out.push(BINARY_MARKER);
            out.extend_from_slice(raw);
            Ok(out)
        }
        other => {
            let json = other.to_json()?;
            serde_json::to_vec(&json).map_err(|e| StoreError::Codec(e.to_string()))
        }
    }
}

/// Inverse of [`to_bytes`]. Also accepts unmarked canonical JSON written
/// by earlier versions of the codec.
pub fn from_bytes(raw: &[u8]) -> Result<Value, StoreError> {
    match raw.first() {
        None => Err(StoreError::Codec("empty payload".to_string())),
        Some(&BINARY_MARKER) => Ok(Value::Binary(Bytes::copy_from_slice(&raw[1..]))),
        Some(_) => {
            let json: Json =
                serde_json::from_slice(raw).map_err(|e| StoreError::Codec(e.to_string()))?;
            Ok(Value::from_json(&json))
        }
    }
}

/// Text form for stores that only take strings. Blobs are marked with a
/// leading NUL and carried as base64.
pub fn to_text(value: &Value) -> Result<String, StoreError> {
    match value {
        Value::Binary(raw) => Ok(format!("\u{0}{}", BASE64.encode(raw))),
        other => {
            let json = other.to_json()?;
            serde_json::to_string(&json).map_err(|e| StoreError::Codec(e.to_string()))
        }
    }
}

/// Inverse of [`to_text`], accepting unmarked JSON as well.
pub fn from_text(text: &str) -> Result<Value, StoreError> {
    match text.strip_prefix('\u{0}') {
        Some(b64) => {
            let raw = BASE64
                .decode(b64)
                .map_err(|e| StoreError::Codec(e.to_string()))?;
            Ok(Value::Binary(Bytes::from(raw)))
        }
        None => {
            let json: Json =
                serde_json::from_str(text).map_err(|e| StoreError::Codec(e.to_string()))?;
            Ok(Value::from_json(&json))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_values() -> Vec<Value> {
        vec![
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(0),
            Value::Int(-42),
            Value::Int(i64::MAX),
            Value::Float(1.5),
            Value::String(String::new()),
            Value::String("héllo \"quoted\"".to_string()),
            Value::Binary(Bytes::from_static(b"\x00\x01\xfe\xff")),
            Value::Array(vec![Value::Int(1), Value::String("two".into())]),
            Value::Object(BTreeMap::from([
                ("a".to_string(), Value::Null),
                ("b".to_string(), Value::Array(vec![Value::Bool(true)])),
            ])),
        ]
    }

    #[test]
    fn binary_round_trip() {
        for value in sample_values() {
            let encoded = to_bytes(&value).unwrap();
            assert_eq!(from_bytes(&encoded).unwrap(), value, "{value:?}");
        }
    }

    #[test]
    fn text_round_trip() {
        for value in sample_values() {
            let encoded = to_text(&value).unwrap();
            assert_eq!(from_text(&encoded).unwrap(), value, "{value:?}");
        }
    }

    #[test]
    fn accepts_unmarked_json() {
        let value = from_bytes(br#"{"id":7,"name":"x"}"#).unwrap();
        assert_eq!(
            value,
            Value::Object(BTreeMap::from([
                ("id".to_string(), Value::Int(7)),
                ("name".to_string(), Value::String("x".to_string())),
            ]))
        );
        assert_eq!(from_bytes(b"[1,2]").unwrap(), Value::Array(vec![Value::Int(1), Value::Int(2)]));
        assert_eq!(from_text("\"plain\"").unwrap(), Value::String("plain".to_string()));
    }

    #[test]
    fn rejects_non_finite_floats() {
        assert!(to_bytes(&Value::Float(f64::NAN)).is_err());
        assert!(to_bytes(&Value::Float(f64::INFINITY)).is_err());
    }

    #[test]
    fn rejects_nested_binary() {
        let nested = Value::Array(vec![Value::Binary(Bytes::from_static(b"x"))]);
        assert!(to_bytes(&nested).is_err());
    }

    #[test]
    fn object_keys_are_canonical() {
        let a = Value::Object(BTreeMap::from([
            ("z".to_string(), Value::Int(1)),
            ("a".to_string(), Value::Int(2)),
        ]));
        assert_eq!(to_bytes(&a).unwrap(), br#"{"a":2,"z":1}"#.to_vec());
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            // Finite floats only; the codec rejects the rest by contract.
            any::<f64>().prop_filter("finite", |f| f.is_finite()).prop_map(Value::Float),
            ".{0,24}".prop_map(Value::String),
            proptest::collection::vec(any::<u8>(), 0..64)
                .prop_map(|b| Value::Binary(Bytes::from(b))),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(
                    inner.clone().prop_filter("no nested binary", |v| !matches!(v, Value::Binary(_))),
                    0..4
                )
                .prop_map(Value::Array),
                proptest::collection::btree_map(
                    "[a-z]{1,6}",
                    inner.prop_filter("no nested binary", |v| !matches!(v, Value::Binary(_))),
                    0..4
                )
                .prop_map(Value::Object),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_binary_round_trip(value in arb_value()) {
            let encoded = to_bytes(&value).unwrap();
            prop_assert_eq!(from_bytes(&encoded).unwrap(), value);
        }

        #[test]
        fn prop_text_round_trip(value in arb_value()) {
            let encoded = to_text(&value).unwrap();
            prop_assert_eq!(from_text(&encoded).unwrap(), value);
        }
    }
}
