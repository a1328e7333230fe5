//! AMF0 helpers on top of `rml_amf0`.
//!
//! The value model and the marker-level encoding come from `rml_amf0`
//! (re-exported by `rml_rtmp`). This module adds the pieces the RTMP
//! command layer needs: slice-based encode/decode, a builder for command
//! objects and typed lookups on decoded replies.

use std::collections::HashMap;
use std::io::Cursor;

use bytes::Bytes;
use rml_rtmp::rml_amf0;

pub use rml_rtmp::rml_amf0::Amf0Value;

use crate::{CodecError, CodecResult};

/// Serialize a sequence of values back to back.
pub fn encode_values(values: &[Amf0Value]) -> CodecResult<Bytes> {
    let encoded = rml_amf0::serialize(&values.to_vec())
        .map_err(|e| CodecError::Amf0Encode(format!("{:?}", e)))?;
    Ok(Bytes::from(encoded))
}

/// Deserialize every value contained in `data`.
pub fn decode_values(data: &[u8]) -> CodecResult<Vec<Amf0Value>> {
    let mut cursor = Cursor::new(data);
    rml_amf0::deserialize(&mut cursor).map_err(|e| CodecError::Amf0Decode(format!("{:?}", e)))
}

/// Builds an AMF0 object property by property.
#[derive(Debug, Default, Clone)]
pub struct ObjectBuilder {
    properties: HashMap<String, Amf0Value>,
}

impl ObjectBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn string(mut self, key: &str, value: impl Into<String>) -> Self {
        self.properties
            .insert(key.to_string(), Amf0Value::Utf8String(value.into()));
        self
    }

    pub fn number(mut self, key: &str, value: f64) -> Self {
        self.properties
            .insert(key.to_string(), Amf0Value::Number(value));
        self
    }

    pub fn boolean(mut self, key: &str, value: bool) -> Self {
        self.properties
            .insert(key.to_string(), Amf0Value::Boolean(value));
        self
    }

    pub fn build(self) -> Amf0Value {
        Amf0Value::Object(self.properties)
    }
}

/// String content of a value, if it is a string.
pub fn as_str(value: &Amf0Value) -> Option<&str> {
    match value {
        Amf0Value::Utf8String(s) => Some(s.as_str()),
        _ => None,
    }
}

/// Numeric content of a value, if it is a number.
pub fn as_number(value: &Amf0Value) -> Option<f64> {
    match value {
        Amf0Value::Number(n) => Some(*n),
        _ => None,
    }
}

/// Look up `key` in an object value.
pub fn property<'a>(value: &'a Amf0Value, key: &str) -> Option<&'a Amf0Value> {
    match value {
        Amf0Value::Object(properties) => properties.get(key),
        _ => None,
    }
}

/// Encoded size of a scalar value, marker included.
pub fn primitive_size(value: &Amf0Value) -> Option<usize> {
    match value {
        Amf0Value::Number(_) => Some(9),
        Amf0Value::Boolean(_) => Some(2),
        Amf0Value::Null | Amf0Value::Undefined => Some(1),
        Amf0Value::Utf8String(s) if s.len() <= u16::MAX as usize => Some(3 + s.len()),
        Amf0Value::Utf8String(s) => Some(5 + s.len()),
        _ => None,
    }
}
