//! Engine error types.

use livecast_ipc::ConfigError;
use livecast_mux::MuxError;
use livecast_transport::TransportError;
use thiserror::Error;

/// Errors raised while starting or feeding a session.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("A session is already active")]
    AlreadyActive,

    #[error("No active session")]
    NotStarted,

    #[error("Unsupported URL: {0}")]
    UnsupportedUrl(String),

    #[error("Unsupported configuration: {0}")]
    Unsupported(String),

    #[error("Invalid config: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Mux error: {0}")]
    Mux(#[from] MuxError),
}
