//! Measurements exchanged between transports, the bitrate controller and
//! the engine.

use serde::{Deserialize, Serialize};

/// Direction of a bitrate adjustment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateVector {
    Down,
    #[default]
    Hold,
    Up,
}

impl RateVector {
    /// -1, 0 or +1.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Down => -1,
            Self::Hold => 0,
            Self::Up => 1,
        }
    }

    pub fn is_hold(self) -> bool {
        matches!(self, Self::Hold)
    }
}

/// One throughput evaluation delivered to a [`crate::BandwidthListener`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ThroughputReport {
    pub vector: RateVector,

    /// Estimated link bandwidth in bytes per second.
    pub estimated_bandwidth: f64,

    /// Bytes per second actually sent over the last period.
    pub current_throughput: f64,

    /// Whether the estimate comes from the transport itself (SRT) rather
    /// than from buffer trend analysis (RTMP over TCP).
    pub measured_by_transport: bool,
}

/// Encoder bitrates after an adjustment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitrateUpdate {
    pub video_bps: u32,
    pub audio_bps: u32,

    /// At least one bitrate differs from before the adjustment.
    pub changed: bool,
}

impl BitrateUpdate {
    /// Combined rate in bytes per second.
    pub fn bytes_per_sec(&self) -> f64 {
        f64::from(self.video_bps + self.audio_bps) / 8.0
    }
}

/// Real-time stream metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamMetrics {
    /// Samples handed to the transport.
    pub samples_sent: u64,

    /// Samples dropped before reaching the transport.
    pub samples_dropped: u64,

    /// Payload bytes handed to the transport.
    pub bytes_sent: u64,

    /// Average outgoing bitrate since start, in kbps.
    pub bitrate_kbps: u32,

    /// Current encoder video bitrate, in bits per second.
    pub video_bitrate_bps: u32,

    /// Current encoder audio bitrate, in bits per second.
    pub audio_bitrate_bps: u32,

    /// Last estimated bandwidth, in bytes per second.
    pub estimated_bandwidth: f64,

    /// Stream uptime in seconds.
    pub uptime_seconds: u64,
}
