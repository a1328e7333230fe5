//! Session orchestration for livecast.
//!
//! This crate wires encoded samples through the format adapters into an
//! RTMP or SRT session, applies throughput reports to the encoders and
//! reports a unified state on an event channel.

mod bitrate;
mod error;
mod metrics;
mod orchestrator;
mod pipeline;
mod state;

pub use bitrate::BitrateBridge;
pub use error::EngineError;
pub use metrics::MetricsCollector;
pub use orchestrator::{Encoders, StreamEngine};
pub use pipeline::{Pipeline, RtmpPipeline, SrtOutput, TsPipeline};
pub use state::{engine_state_for_rtmp, engine_state_for_srt, StateBridge};

use crossbeam_channel::Sender;
use livecast_ipc::EngineEvent;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Create an engine that reports on `event_tx`.
pub fn create_engine(encoders: Encoders, event_tx: Sender<EngineEvent>) -> StreamEngine {
    StreamEngine::new(encoders, event_tx)
}
