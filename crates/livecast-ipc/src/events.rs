//! Events sent from the engine to its owner.

use serde::{Deserialize, Serialize};

use crate::state::EngineState;
use crate::types::{BitrateUpdate, StreamMetrics, ThroughputReport};

/// Events that the engine emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    /// Engine state has changed.
    StateChanged {
        previous: Box<EngineState>,
        current: Box<EngineState>,
    },

    /// A throughput evaluation arrived from the transport.
    Throughput(ThroughputReport),

    /// The bitrate controller changed at least one encoder bitrate.
    BitrateChanged(BitrateUpdate),

    /// Updated stream metrics.
    Metrics(StreamMetrics),

    /// Error occurred.
    Error { recoverable: bool, message: String },

    /// Engine is ready for commands.
    Ready,

    /// Engine has shut down.
    Shutdown,
}
