//! Elementary stream descriptions.

use livecast_ipc::{MediaKind, VideoCodec};
use serde::{Deserialize, Serialize};

/// Codec carried by an elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TsCodec {
    H264,
    Hevc,
    Aac,
    /// Anything else, signalled as private data.
    Private,
}

impl TsCodec {
    /// PMT stream_type.
    pub fn stream_type(self) -> u8 {
        match self {
            Self::H264 => 0x1B,
            Self::Hevc => 0x24,
            Self::Aac => 0x0F,
            Self::Private => 0x06,
        }
    }
}

impl From<VideoCodec> for TsCodec {
    fn from(codec: VideoCodec) -> Self {
        match codec {
            VideoCodec::H264 => Self::H264,
            VideoCodec::Hevc => Self::Hevc,
        }
    }
}

/// Duration of one tick, `num / den` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBase {
    pub num: u32,
    pub den: u32,
}

impl TimeBase {
    pub fn new(num: u32, den: u32) -> Self {
        Self {
            num: num.max(1),
            den: den.max(1),
        }
    }

    /// One tick per video frame.
    pub fn from_fps(fps: f64) -> Self {
        Self::new(1000, (fps * 1000.0).round().max(1.0) as u32)
    }

    /// One tick per audio sample.
    pub fn from_sample_rate(rate: u32) -> Self {
        Self::new(1, rate)
    }

    pub fn tick_us(self) -> i64 {
        1_000_000 * i64::from(self.num) / i64::from(self.den)
    }
}

/// One elementary stream of the program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsStreamConfig {
    /// Below 16 the PID is assigned from the start PID; otherwise the id is
    /// the PID.
    pub id: u16,
    pub kind: MediaKind,
    pub codec: TsCodec,
    pub time_base: TimeBase,
}

impl TsStreamConfig {
    pub fn video(id: u16, codec: VideoCodec, fps: f64) -> Self {
        Self {
            id,
            kind: MediaKind::Video,
            codec: codec.into(),
            time_base: TimeBase::from_fps(fps),
        }
    }

    pub fn audio(id: u16, sample_rate: u32) -> Self {
        Self {
            id,
            kind: MediaKind::Audio,
            codec: TsCodec::Aac,
            time_base: TimeBase::from_sample_rate(sample_rate),
        }
    }

    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }
}
