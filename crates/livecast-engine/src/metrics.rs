//! Metrics collection and reporting.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use tracing::debug;

use livecast_ipc::StreamMetrics;

/// Collects stream metrics from the sample path and the bitrate loop.
pub struct MetricsCollector {
    start_time: RwLock<Option<Instant>>,
    samples_sent: AtomicU64,
    samples_dropped: AtomicU64,
    bytes_sent: AtomicU64,
    video_bitrate_bps: AtomicU32,
    audio_bitrate_bps: AtomicU32,
    estimated_bandwidth: RwLock<f64>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: RwLock::new(None),
            samples_sent: AtomicU64::new(0),
            samples_dropped: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            video_bitrate_bps: AtomicU32::new(0),
            audio_bitrate_bps: AtomicU32::new(0),
            estimated_bandwidth: RwLock::new(0.0),
        }
    }

    /// Start metrics collection, clearing previous counts.
    pub fn start(&self) {
        self.samples_sent.store(0, Ordering::Relaxed);
        self.samples_dropped.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        *self.estimated_bandwidth.write() = 0.0;
        *self.start_time.write() = Some(Instant::now());
    }

    /// Stop metrics collection.
    pub fn stop(&self) {
        *self.start_time.write() = None;
    }

    pub fn is_running(&self) -> bool {
        self.start_time.read().is_some()
    }

    /// Record a sample handed to the transport.
    pub fn record_sample(&self, bytes: u64) {
        self.samples_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a sample that produced no output.
    pub fn record_drop(&self) {
        self.samples_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_bitrates(&self, video_bps: u32, audio_bps: u32) {
        self.video_bitrate_bps.store(video_bps, Ordering::Relaxed);
        self.audio_bitrate_bps.store(audio_bps, Ordering::Relaxed);
    }

    /// Last bandwidth estimate, in bytes per second.
    pub fn update_bandwidth(&self, bytes_per_sec: f64) {
        *self.estimated_bandwidth.write() = bytes_per_sec.max(0.0);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> StreamMetrics {
        let now = Instant::now();
        let start = *self.start_time.read();
        let bytes = self.bytes_sent.load(Ordering::Relaxed);

        let bitrate_kbps = match start {
            Some(start) => {
                let elapsed = now.duration_since(start).as_secs_f64();
                if elapsed > 0.0 {
                    (bytes as f64 * 8.0 / elapsed / 1000.0) as u32
                } else {
                    0
                }
            }
            None => 0,
        };
        let uptime_seconds = start.map(|s| now.duration_since(s).as_secs()).unwrap_or(0);

        let metrics = StreamMetrics {
            samples_sent: self.samples_sent.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
            bytes_sent: bytes,
            bitrate_kbps,
            video_bitrate_bps: self.video_bitrate_bps.load(Ordering::Relaxed),
            audio_bitrate_bps: self.audio_bitrate_bps.load(Ordering::Relaxed),
            estimated_bandwidth: *self.estimated_bandwidth.read(),
            uptime_seconds,
        };
        debug!(
            samples = metrics.samples_sent,
            dropped = metrics.samples_dropped,
            kbps = metrics.bitrate_kbps,
            "Metrics snapshot"
        );
        metrics
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
