//! Shared types for livecast.
//!
//! This crate defines the media sample type, the session configuration,
//! the state machines and the listener interfaces shared by the transport,
//! muxer, bitrate controller and engine crates.

mod commands;
mod config;
mod events;
mod listener;
mod media;
mod state;
mod types;

pub use commands::EngineCommand;
pub use config::{
    AudioParams, BitrateConfig, MuxConfig, RtmpConfig, SessionConfig, SrtConfig, VideoParams,
    DEFAULT_RTMP_CHUNK_SIZE, DEFAULT_SRT_CHUNK_SIZE, SRT_LIVE_MAX_PAYLOAD,
};
pub use events::EngineEvent;
pub use listener::{BandwidthListener, EncoderBitrate, NoopListener, StateListener};
pub use media::{MediaKind, Sample, VideoCodec};
pub use state::{EngineState, Protocol, RtmpState, SrtState, StopReason};
pub use types::{BitrateUpdate, RateVector, StreamMetrics, ThroughputReport};

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;

/// Channel capacity for commands (owner → engine).
pub const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Channel capacity for events (engine → owner).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Channel capacity for encoded samples (encoders → engine).
pub const SAMPLE_CHANNEL_CAPACITY: usize = 120;

/// Errors loading a [`SessionConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Creates a bounded command channel.
pub fn command_channel() -> (Sender<EngineCommand>, Receiver<EngineCommand>) {
    crossbeam_channel::bounded(COMMAND_CHANNEL_CAPACITY)
}

/// Creates a bounded event channel.
pub fn event_channel() -> (Sender<EngineEvent>, Receiver<EngineEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}

/// Creates a bounded sample channel.
pub fn sample_channel() -> (Sender<Sample>, Receiver<Sample>) {
    crossbeam_channel::bounded(SAMPLE_CHANNEL_CAPACITY)
}
