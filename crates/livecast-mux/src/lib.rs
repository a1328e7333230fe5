//! MPEG-TS multiplexing for the SRT path.
//!
//! Encoded H.264/HEVC and AAC samples go through an [`AnnexbEncoder`] or
//! [`AdtsEncoder`] and then into a [`TsMuxer`], which writes 188-byte
//! transport packets to a [`TsSink`].

mod adts;
mod annexb;
mod error;
mod sink;
pub mod ts;

pub use adts::AdtsEncoder;
pub use annexb::AnnexbEncoder;
pub use error::MuxError;
pub use sink::{FnSink, TsSink};
pub use ts::{TimeBase, TsCodec, TsMuxer, TsStreamConfig};

/// Result type for muxing operations.
pub type MuxResult<T> = Result<T, MuxError>;

/// Size of one transport stream packet.
pub const TS_PACKET_SIZE: usize = 188;
