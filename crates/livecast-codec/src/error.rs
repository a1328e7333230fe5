//! Error types for the codec primitives.

use thiserror::Error;

/// Errors raised while reading or writing binary data.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Input ended before the requested field.
    #[error("Unexpected end of input: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    /// AMF0 serialization failed.
    #[error("AMF0 encode error: {0}")]
    Amf0Encode(String),

    /// AMF0 deserialization failed.
    #[error("AMF0 decode error: {0}")]
    Amf0Decode(String),

    /// A value does not fit the field it is written to.
    #[error("Value {value} does not fit in {bits} bits")]
    ValueOutOfRange { value: u64, bits: u32 },

    /// A NAL length prefix points past the end of the access unit.
    #[error("Truncated NAL unit: length {length}, {remaining} bytes remaining")]
    TruncatedNal { length: usize, remaining: usize },

    /// An AVC decoder configuration record is malformed.
    #[error("Invalid AVC decoder configuration: {0}")]
    InvalidAvcConfig(String),
}
