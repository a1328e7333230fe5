//! Byte, bit, AMF0 and CRC primitives.
//!
//! Everything that touches wire formats (RTMP chunks, AMF0 commands,
//! MPEG-TS sections, ADTS headers, H.264 framing) builds on these helpers.

pub mod amf0;
mod bits;
mod buffer;
mod crc;
mod error;
pub mod nal;

pub use bits::{BitReader, BitWriter};
pub use buffer::{put_be24, ByteReader};
pub use crc::crc32_mpeg2;
pub use error::CodecError;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Largest value representable in a 24-bit field.
pub const MAX_U24: u32 = 0x00FF_FFFF;
