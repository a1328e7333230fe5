//! Error types for the transport module.

use thiserror::Error;

use crate::rtmp::ChunkError;

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection lost.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Invalid target URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Invalid session configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Feature not available in this build.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Send failed.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Reconnect exhausted.
    #[error("Reconnect attempts exhausted after {0} attempts")]
    ReconnectExhausted(u32),

    /// Not connected.
    #[error("Not connected")]
    NotConnected,

    /// The socket's send buffer is full; retry once it drains.
    #[error("Send would block")]
    WouldBlock,

    /// Already started.
    #[error("Already started")]
    AlreadyStarted,

    /// Handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Chunk stream error.
    #[error(transparent)]
    Chunk(#[from] ChunkError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// RTMP protocol error.
    #[error("RTMP protocol error: {0}")]
    Protocol(String),

    /// SRT socket error.
    #[error("SRT error: {0}")]
    Srt(String),
}
