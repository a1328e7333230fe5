//! Encoded media units handed from the encoders to the core.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Kind of elementary stream a sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Video,
    Audio,
}

/// Video codec of an elementary stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoCodec {
    #[default]
    H264,
    Hevc,
}

/// One encoded access unit.
///
/// Timestamps are microseconds on the session clock. Payload bytes are
/// never modified by the core, only wrapped.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Stream kind.
    pub kind: MediaKind,

    /// Presentation timestamp in microseconds.
    pub pts: i64,

    /// Decode timestamp in microseconds, if it differs from or is known
    /// independently of `pts`.
    pub dts: Option<i64>,

    /// Whether the unit can be decoded without prior units.
    pub is_keyframe: bool,

    /// Whether the payload is a codec configuration record (SPS/PPS NAL,
    /// AudioSpecificConfig) rather than a frame.
    pub is_config: bool,

    /// Encoded bytes.
    pub payload: Bytes,
}

impl Sample {
    /// A video frame.
    pub fn video(pts: i64, dts: Option<i64>, is_keyframe: bool, payload: Bytes) -> Self {
        Self {
            kind: MediaKind::Video,
            pts,
            dts,
            is_keyframe,
            is_config: false,
            payload,
        }
    }

    /// An audio frame.
    pub fn audio(pts: i64, payload: Bytes) -> Self {
        Self {
            kind: MediaKind::Audio,
            pts,
            dts: None,
            is_keyframe: false,
            is_config: false,
            payload,
        }
    }

    /// A codec configuration unit for `kind`.
    pub fn config(kind: MediaKind, payload: Bytes) -> Self {
        Self {
            kind,
            pts: 0,
            dts: None,
            is_keyframe: false,
            is_config: true,
            payload,
        }
    }

    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }

    /// Decode timestamp, falling back to the presentation timestamp.
    pub fn decode_time(&self) -> i64 {
        self.dts.unwrap_or(self.pts)
    }

    /// Decode timestamp in whole milliseconds, as carried by RTMP.
    pub fn timestamp_ms(&self) -> u32 {
        (self.decode_time().max(0) / 1000) as u32
    }
}
