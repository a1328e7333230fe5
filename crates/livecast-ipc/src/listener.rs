//! Listener interfaces between the core and its collaborators.

use crate::types::ThroughputReport;

/// Receives every state transition of a session.
pub trait StateListener<S>: Send + Sync {
    fn on_state_changed(&self, previous: S, current: S);
}

/// Receives throughput evaluations from a transport.
pub trait BandwidthListener: Send + Sync {
    /// Handle a report and return the byte rate the encoders now produce.
    /// The transport compares future bandwidth estimates against it.
    fn on_throughput(&self, report: ThroughputReport) -> f64;
}

/// Bitrate control on an external encoder.
pub trait EncoderBitrate: Send + Sync {
    /// Current target bitrate in bits per second.
    fn bitrate(&self) -> u32;

    /// Set the target bitrate in bits per second.
    fn set_bitrate(&self, bps: u32);
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl<S> StateListener<S> for NoopListener {
    fn on_state_changed(&self, _previous: S, _current: S) {}
}
