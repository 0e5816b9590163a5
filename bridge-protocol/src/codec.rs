//! # Text Codec
//!
//! Relay ports only carry strings, so envelopes crossing them are encoded as
//! JSON. Values JSON cannot express are replaced by marker strings:
//!
//! | value              | text form                       |
//! |--------------------|---------------------------------|
//! | `Value::Undefined` | `"__undefined__"`               |
//! | `Value::BigInt(n)` | `"bigint:<decimal digits>"`     |
//! | `Value::Bytes(b)`  | `"bytes:<standard base64>"`     |
//!
//! Decoding walks the parsed tree and turns markers back into values at any
//! depth, so `decode(encode(m)) == m` for every envelope.
//!
//! Structured transports never touch this module.

use crate::message::Envelope;
use crate::value::Value;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use num_bigint::BigInt;

/// Prefix of an arbitrary-precision integer in text form.
pub const BIGINT_PREFIX: &str = "bigint:";

/// Text form of the missing value.
pub const UNDEFINED_MARKER: &str = "__undefined__";

/// Prefix of a byte buffer in text form.
pub const BYTES_PREFIX: &str = "bytes:";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encodes an envelope for a text carrier.
pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decodes a text frame back into an envelope.
pub fn decode(text: &str) -> Result<Envelope, CodecError> {
    Ok(serde_json::from_str(text)?)
}

/// Converts parsed JSON into a [`Value`], decoding markers at any depth.
pub fn from_json(raw: serde_json::Value) -> Value {
    match raw {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => decode_string(s),
        serde_json::Value::Array(items) => Value::Array(items.into_iter().map(from_json).collect()),
        serde_json::Value::Object(map) => {
            Value::Object(map.into_iter().map(|(k, v)| (k, from_json(v))).collect())
        }
    }
}

/// A marker whose payload does not parse stays an ordinary string.
fn decode_string(s: String) -> Value {
    if s == UNDEFINED_MARKER {
        return Value::Undefined;
    }
    if let Some(digits) = s.strip_prefix(BIGINT_PREFIX) {
        if let Ok(n) = digits.parse::<BigInt>() {
            return Value::BigInt(n);
        }
    }
    if let Some(encoded) = s.strip_prefix(BYTES_PREFIX) {
        if let Ok(bytes) = BASE64.decode(encoded) {
            return Value::Bytes(bytes.into());
        }
    }
    Value::String(s)
}
