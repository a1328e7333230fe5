use std::time::Instant;

/// One measurement of the outgoing link.
///
/// Rates are in bytes per second.
#[derive(Debug, Clone, Copy)]
pub struct ThroughputSample {
    pub timestamp: Instant,

    /// Link bandwidth estimated by the transport, when it has one.
    pub estimated_bandwidth: Option<f64>,

    /// Rate at which bytes actually left over the last period.
    pub send_rate: f64,

    pub bytes_sent: u64,
    pub packets_lost: u64,
    pub packets_dropped: u64,
    pub packets_retransmitted: u64,

    /// Bytes queued but not yet written to the socket.
    pub buffered_bytes: u64,
}

impl ThroughputSample {
    /// A sample carrying only send-side counters.
    pub fn at(timestamp: Instant) -> Self {
        Self {
            timestamp,
            estimated_bandwidth: None,
            send_rate: 0.0,
            bytes_sent: 0,
            packets_lost: 0,
            packets_dropped: 0,
            packets_retransmitted: 0,
            buffered_bytes: 0,
        }
    }

    /// The link reported loss since the previous sample.
    pub fn has_loss(&self) -> bool {
        self.packets_lost > 0 || self.packets_dropped > 0
    }
}
