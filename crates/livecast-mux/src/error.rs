//! Error types for the multiplexer.

use livecast_codec::CodecError;
use thiserror::Error;

/// Errors that can occur while muxing.
#[derive(Debug, Error)]
pub enum MuxError {
    /// No elementary streams were configured.
    #[error("No streams configured")]
    NoStreams,

    /// A stream id maps outside the PID space.
    #[error("Invalid stream id {0}, must be less than 8191")]
    InvalidStreamId(u16),

    /// Two streams (or a stream and the PMT) share a PID.
    #[error("Duplicate PID 0x{0:04X}")]
    DuplicatePid(u16),

    /// A sample referenced a stream index that does not exist.
    #[error("Unknown stream index {0}")]
    UnknownStream(usize),

    /// A PSI section exceeds the section size limit.
    #[error("Section of {0} bytes is too large")]
    SectionTooLarge(usize),

    /// A frame does not fit its container.
    #[error("Frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    /// Configuration rejected.
    #[error("Invalid mux configuration: {0}")]
    InvalidConfig(String),

    /// Malformed elementary stream data.
    #[error(transparent)]
    Codec(#[from] CodecError),
}
