//! RTMP and SRT publishing sessions.
//!
//! Both sessions take already-encoded media, own one live connection at a
//! time, report every state change to a listener and feed throughput
//! reports to a [`livecast_ipc::BandwidthListener`].

mod connection;
mod error;
pub mod rtmp;
pub mod srt;
mod task_queue;

pub use connection::ReconnectPolicy;
pub use error::TransportError;
pub use rtmp::{RtmpSession, RtmpSessionParameters};
pub use srt::{SrtConnector, SrtSession, SrtSocket, TokioSrtConnector};
pub use task_queue::TaskQueue;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Maximum reconnection attempts.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Base reconnect delay in milliseconds.
pub const BASE_RECONNECT_DELAY_MS: u64 = 1000;

/// Transport statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStatistics {
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub packets_dropped: u64,

    /// Bytes dropped by backpressure or written while the socket was down.
    pub bytes_lost: u64,

    pub buffered_bytes: u64,
}
