//! Commands sent to the engine.

use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;

/// Commands that the engine accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineCommand {
    /// Start streaming with the given configuration.
    Start { config: Box<SessionConfig> },

    /// Stop the current stream.
    Stop,

    /// Turn adaptive bitrate on or off for the running stream.
    SetAdaptiveBitrate(bool),

    /// Request current engine state.
    GetState,

    /// Shutdown the engine completely.
    Shutdown,
}
