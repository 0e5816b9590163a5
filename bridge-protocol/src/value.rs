//! # Structured Values
//!
//! [`Value`] is what travels in call arguments, responses, progress callbacks
//! and update payloads. It is richer than JSON: it has a distinct missing
//! value ([`Value::Undefined`]), arbitrary-precision integers and byte
//! buffers. Structured transports carry it as is; text transports go through
//! the markers defined in [`crate::codec`].

use crate::codec::{self, BIGINT_PREFIX, BYTES_PREFIX, UNDEFINED_MARKER};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use num_bigint::BigInt;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Largest integer an f64 represents exactly (2^53).
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// A structured value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// The missing value. Distinct from `Null`.
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    BigInt(BigInt),
    String(String),
    /// A byte buffer. Moved zero-copy on structured transports.
    Bytes(Bytes),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bigint(&self) -> Option<&BigInt> {
        match self {
            Value::BigInt(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Looks up a field of an object value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// Returns the buffer that can be handed over zero-copy when this value
    /// is sent: the value itself if it is a buffer, or the `arrayBuffer`
    /// field of an object.
    pub fn transferable(&self) -> Option<Bytes> {
        match self {
            Value::Bytes(bytes) => Some(bytes.clone()),
            Value::Object(map) => match map.get("arrayBuffer") {
                Some(Value::Bytes(bytes)) => Some(bytes.clone()),
                _ => None,
            },
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<BigInt> for Value {
    fn from(n: BigInt) -> Self {
        Value::BigInt(n)
    }
}

impl From<Bytes> for Value {
    fn from(bytes: Bytes) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Object(map)
    }
}

impl From<serde_json::Value> for Value {
    /// Converts parsed JSON, decoding the text markers at any depth.
    fn from(raw: serde_json::Value) -> Self {
        codec::from_json(raw)
    }
}

// ─── Text Representation ────────────────────────────────────────
// Serde is only used on text carriers, so the impls below produce and
// consume the marker strings directly.

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Undefined => serializer.serialize_str(UNDEFINED_MARKER),
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < MAX_SAFE_INTEGER => {
                serializer.serialize_i64(*n as i64)
            }
            Value::Number(n) => serializer.serialize_f64(*n),
            Value::BigInt(n) => serializer.collect_str(&format_args!("{BIGINT_PREFIX}{n}")),
            Value::String(s) => serializer.serialize_str(s),
            Value::Bytes(bytes) => {
                serializer.collect_str(&format_args!("{BYTES_PREFIX}{}", BASE64.encode(bytes)))
            }
            Value::Array(items) => serializer.collect_seq(items),
            Value::Object(map) => serializer.collect_map(map),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(codec::from_json)
    }
}
