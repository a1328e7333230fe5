//! Session configuration.
//!
//! Every tunable the sessions, muxer and bitrate controller use lives here
//! so a whole session can be described by one JSON document.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::media::VideoCodec;
use crate::ConfigError;

/// Default RTMP outgoing chunk size after negotiation.
pub const DEFAULT_RTMP_CHUNK_SIZE: u32 = 4096;

/// Default SRT live payload size (7 TS packets).
pub const DEFAULT_SRT_CHUNK_SIZE: usize = 1316;

/// Largest SRT payload supported in live mode.
pub const SRT_LIVE_MAX_PAYLOAD: usize = 1456;

/// Everything needed to start one streaming session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Target URL (`rtmp://`, `rtmps://` or `srt://`).
    pub url: String,

    /// RTMP stream key, appended to the URL path. Unused for SRT.
    pub stream_key: String,

    pub video: VideoParams,
    pub audio: AudioParams,
    pub bitrate: BitrateConfig,
    pub rtmp: RtmpConfig,
    pub srt: SrtConfig,
    pub mux: MuxConfig,
}

impl SessionConfig {
    /// Parse a configuration from JSON text. Missing fields take defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and parse a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Check values that would otherwise fail deep inside a session.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.video.fps <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "video.fps must be positive, got {}",
                self.video.fps
            )));
        }
        if self.audio.channels == 0 || self.audio.channels > 2 {
            return Err(ConfigError::Invalid(format!(
                "audio.channels must be 1 or 2, got {}",
                self.audio.channels
            )));
        }
        if self.srt.chunk_size == 0 || self.srt.chunk_size > SRT_LIVE_MAX_PAYLOAD {
            return Err(ConfigError::Invalid(format!(
                "srt.chunk_size must be in 1..={}, got {}",
                SRT_LIVE_MAX_PAYLOAD, self.srt.chunk_size
            )));
        }
        if self.rtmp.out_chunk_size == 0 || self.rtmp.out_chunk_size > 0x7FFF_FFFF {
            return Err(ConfigError::Invalid(format!(
                "rtmp.out_chunk_size out of range: {}",
                self.rtmp.out_chunk_size
            )));
        }
        if self.bitrate.min_video_bps > self.video.bitrate_bps {
            return Err(ConfigError::Invalid(
                "bitrate.min_video_bps exceeds video.bitrate_bps".to_string(),
            ));
        }
        Ok(())
    }
}

/// Encoded video parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub fps: f64,

    /// Configured (ceiling) video bitrate in bits per second.
    pub bitrate_bps: u32,

    pub codec: VideoCodec,
}

impl Default for VideoParams {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30.0,
            bitrate_bps: 2_000_000,
            codec: VideoCodec::H264,
        }
    }
}

/// Encoded audio parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate_bps: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            bitrate_bps: 128_000,
        }
    }
}

/// Adaptive bitrate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BitrateConfig {
    /// Drive the encoders from throughput samples.
    pub adaptive: bool,

    /// Video bitrate floor in bits per second.
    pub min_video_bps: u32,

    /// With adaptive mode on, the session starts at
    /// `min(initial_video_bps, ceiling)`.
    pub initial_video_bps: u32,
}

impl Default for BitrateConfig {
    fn default() -> Self {
        Self {
            adaptive: true,
            min_video_bps: 32_000,
            initial_video_bps: 500_000,
        }
    }
}

/// RTMP session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtmpConfig {
    /// Chunk size announced with SetChunkSize once publishing starts.
    pub out_chunk_size: u32,

    /// Unsent bytes above which the queue is cleared up to the next keyframe.
    pub send_buffer_cap_bytes: usize,

    /// Wait per blocked write attempt, in milliseconds.
    pub write_timeout_ms: u64,

    /// Time allowed for TCP connect plus handshake, in milliseconds.
    pub connect_timeout_ms: u64,

    pub auto_reconnect: bool,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,

    /// Throughput evaluation period, in milliseconds.
    pub sample_interval_ms: u64,
}

impl Default for RtmpConfig {
    fn default() -> Self {
        Self {
            out_chunk_size: DEFAULT_RTMP_CHUNK_SIZE,
            send_buffer_cap_bytes: 10 * 1024 * 1024,
            write_timeout_ms: 1000,
            connect_timeout_ms: 5000,
            auto_reconnect: true,
            reconnect_delay_ms: 1000,
            max_reconnect_attempts: 3,
            sample_interval_ms: 2000,
        }
    }
}

/// SRT session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SrtConfig {
    /// Payload size of one socket write.
    pub chunk_size: usize,

    /// Full chunks accumulated before a burst write.
    pub burst_chunks: usize,

    /// Event loop wait per iteration, in milliseconds.
    pub poll_interval_ms: u64,

    pub auto_reconnect: bool,

    /// Delay before a new connection attempt after a drop, in milliseconds.
    pub reconnect_period_ms: u64,

    /// Statistics sampling period, in milliseconds.
    pub stats_interval_ms: u64,

    /// Statistics samples kept for decisions.
    pub stats_window: usize,

    /// Minimum spacing of lost/sent byte reports, in milliseconds.
    pub loss_report_interval_ms: u64,

    /// Wait per attempt while a write would block, in milliseconds.
    pub write_timeout_ms: u64,
}

impl Default for SrtConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_SRT_CHUNK_SIZE,
            burst_chunks: 10,
            poll_interval_ms: 100,
            auto_reconnect: true,
            reconnect_period_ms: 1000,
            stats_interval_ms: 100,
            stats_window: 30,
            loss_report_interval_ms: 5000,
            write_timeout_ms: 1000,
        }
    }
}

/// MPEG-TS multiplexer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Mux rate in bits per second; 1 selects variable bitrate.
    pub mux_rate: u64,

    /// Packets between PAT/PMT repetitions in VBR mode.
    pub pat_packet_period: u32,

    /// Packets between SDT repetitions in VBR mode.
    pub sdt_packet_period: u32,

    /// PCR retransmission time in CBR mode, in milliseconds.
    pub pcr_period_ms: u64,

    /// Optional wall-clock PAT/PMT period in milliseconds. When set, the
    /// packet-count period is disabled.
    pub pat_period_ms: Option<u64>,

    /// Optional wall-clock SDT period in milliseconds.
    pub sdt_period_ms: Option<u64>,

    /// Maximum muxing delay in milliseconds.
    pub max_delay_ms: u64,

    /// Lookahead added to every pts, in video frame durations.
    pub cts_offset_frames: u32,

    /// Do not offset timestamps by the muxing delay.
    pub copyts: bool,

    /// Prefix every packet with a 4-byte arrival timestamp (M2TS).
    pub m2ts: bool,

    /// Re-emit PAT/PMT before every video frame.
    pub pat_pmt_at_frames: bool,

    /// Mark the first packet of every PID as discontinuous.
    pub initial_discontinuity: bool,

    pub transport_stream_id: u16,
    pub original_network_id: u16,
    pub service_id: u16,
    pub pmt_pid: u16,
    pub start_pid: u16,
    pub service_name: String,
    pub provider_name: String,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            mux_rate: 1,
            pat_packet_period: 40,
            sdt_packet_period: 200,
            pcr_period_ms: 20,
            pat_period_ms: None,
            sdt_period_ms: None,
            max_delay_ms: 0,
            cts_offset_frames: 2,
            copyts: false,
            m2ts: false,
            pat_pmt_at_frames: false,
            initial_discontinuity: false,
            transport_stream_id: 0x0001,
            original_network_id: 0xFF01,
            service_id: 0x0001,
            pmt_pid: 0x1000,
            start_pid: 0x0100,
            service_name: "Service01".to_string(),
            provider_name: "livecast".to_string(),
        }
    }
}
