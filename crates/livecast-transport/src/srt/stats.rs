//! SRT link statistics and the sampler that turns them into rate vectors.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender};
use livecast_abr::{RateDecider, RateDeciderConfig, ThroughputSample};
use livecast_ipc::{BandwidthListener, RateVector, ThroughputReport};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::socket::SocketHandle;

/// Where the sampler finds the current bandwidth listener.
pub(crate) type ListenerSlot = Arc<RwLock<Option<Arc<dyn BandwidthListener>>>>;

/// One statistics snapshot of the sending side of a socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SrtStats {
    /// Estimated link bandwidth in Mbit/s.
    pub mbps_bandwidth: f64,

    /// Sending rate in Mbit/s.
    pub mbps_send_rate: f64,

    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub packets_lost: u64,
    pub packets_dropped: u64,
    pub packets_retransmitted: u64,
    pub bytes_dropped: u64,
    pub rtt_ms: f64,

    /// Bytes accepted by the socket but not yet on the wire.
    #[serde(default)]
    pub bytes_buffered: u64,
}

impl SrtStats {
    /// Estimated bandwidth in bytes per second.
    pub fn bandwidth_bytes(&self) -> f64 {
        mbps_to_bytes(self.mbps_bandwidth)
    }

    /// Send rate in bytes per second.
    pub fn send_rate_bytes(&self) -> f64 {
        mbps_to_bytes(self.mbps_send_rate)
    }

    /// Whether the library measured the link bandwidth. Bindings without
    /// an estimate report zero and fall back to send-buffer growth.
    pub fn has_bandwidth_estimate(&self) -> bool {
        self.mbps_bandwidth > 0.0
    }

    pub fn to_sample(&self, now: Instant) -> ThroughputSample {
        ThroughputSample {
            estimated_bandwidth: self
                .has_bandwidth_estimate()
                .then(|| self.bandwidth_bytes()),
            buffered_bytes: self.bytes_buffered,
            send_rate: self.send_rate_bytes(),
            bytes_sent: self.bytes_sent,
            packets_lost: self.packets_lost,
            packets_dropped: self.packets_dropped,
            packets_retransmitted: self.packets_retransmitted,
            ..ThroughputSample::at(now)
        }
    }
}

fn mbps_to_bytes(mbps: f64) -> f64 {
    mbps * 1_000_000.0 / 8.0
}

#[derive(Debug)]
struct SamplerState {
    decider: RateDecider,
    latest: Option<SrtStats>,
}

impl SamplerState {
    /// Feed one snapshot to the decider. Returns a report unless the
    /// decision is to hold.
    fn evaluate(&mut self, stats: SrtStats, now: Instant) -> Option<ThroughputReport> {
        self.latest = Some(stats);
        let vector = self.decider.evaluate(stats.to_sample(now), now);
        if vector == RateVector::Hold {
            return None;
        }
        Some(ThroughputReport {
            vector,
            estimated_bandwidth: stats.bandwidth_bytes(),
            current_throughput: stats.send_rate_bytes(),
            measured_by_transport: stats.has_bandwidth_estimate(),
        })
    }
}

/// Periodically reads socket statistics and reports rate changes.
pub struct SrtStatsSampler {
    state: Arc<Mutex<SamplerState>>,
    interval: Duration,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl SrtStatsSampler {
    pub fn new(interval: Duration, window: usize) -> Self {
        Self::with_decider(
            interval,
            RateDecider::new(RateDeciderConfig {
                window,
                ..RateDeciderConfig::default()
            }),
        )
    }

    fn with_decider(interval: Duration, decider: RateDecider) -> Self {
        Self {
            state: Arc::new(Mutex::new(SamplerState {
                decider,
                latest: None,
            })),
            interval,
            stop_tx: None,
            handle: None,
        }
    }

    /// Evaluate `stats` directly, as the sampling thread does each period.
    pub fn evaluate(&self, stats: SrtStats, now: Instant) -> Option<ThroughputReport> {
        self.state.lock().evaluate(stats, now)
    }

    /// Hand the byte rate returned by the listener to the decider.
    pub fn set_current_rate(&self, bytes_per_sec: f64) {
        self.state.lock().decider.set_current_rate(bytes_per_sec);
    }

    /// Most recent snapshot.
    pub fn latest(&self) -> Option<SrtStats> {
        self.state.lock().latest
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Start sampling `socket`. Reports go to whatever listener `listener`
    /// holds at the time.
    pub(crate) fn start(&mut self, socket: SocketHandle, listener: ListenerSlot) {
        if self.handle.is_some() {
            return;
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let state = Arc::clone(&self.state);
        let interval = self.interval;

        let spawned = std::thread::Builder::new()
            .name("livecast-srt-stats".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }

                let stats = match socket.lock().as_mut().map(|s| s.stats(true)) {
                    Some(Ok(stats)) => stats,
                    Some(Err(e)) => {
                        trace!("Statistics unavailable: {}", e);
                        continue;
                    }
                    None => continue,
                };

                let Some(report) = state.lock().evaluate(stats, Instant::now()) else {
                    continue;
                };
                debug!(
                    vector = report.vector.as_i32(),
                    bandwidth = report.estimated_bandwidth,
                    send_rate = report.current_throughput,
                    rtt_ms = stats.rtt_ms,
                    "SRT rate change"
                );
                let current = listener.read().clone();
                if let Some(listener) = current {
                    let rate = listener.on_throughput(report);
                    state.lock().decider.set_current_rate(rate);
                }
            });

        match spawned {
            Ok(handle) => {
                debug!(interval_ms = interval.as_millis() as u64, "SRT stats sampler started");
                self.stop_tx = Some(stop_tx);
                self.handle = Some(handle);
            }
            Err(e) => warn!("Failed to spawn SRT stats sampler: {}", e),
        }
    }

    pub fn stop(&mut self) {
        self.stop_tx = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("SRT stats sampler panicked");
            }
            debug!("SRT stats sampler stopped");
        }
    }
}

impl Drop for SrtStatsSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::srt::socket::mock::MockConnector;
    use crate::srt::socket::{SocketStatus, SrtConnector};
    use crate::srt::uri::SrtTarget;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn stats(bandwidth: f64, send_rate: f64) -> SrtStats {
        SrtStats {
            mbps_bandwidth: bandwidth,
            mbps_send_rate: send_rate,
            ..SrtStats::default()
        }
    }

    fn sampler_at(start: Instant) -> SrtStatsSampler {
        SrtStatsSampler::with_decider(
            Duration::from_millis(100),
            RateDecider::starting_at(RateDeciderConfig::default(), start),
        )
    }

    #[test]
    fn test_mbps_converted_to_bytes() {
        let s = stats(8.0, 1.6);
        assert_eq!(s.bandwidth_bytes(), 1_000_000.0);
        assert_eq!(s.send_rate_bytes(), 200_000.0);
        let sample = s.to_sample(Instant::now());
        assert_eq!(sample.estimated_bandwidth, Some(1_000_000.0));
    }

    #[test]
    fn test_missing_estimate_uses_send_buffer() {
        let snapshot = SrtStats {
            bytes_buffered: 4096,
            ..stats(0.0, 1.0)
        };
        let sample = snapshot.to_sample(Instant::now());
        assert_eq!(sample.estimated_bandwidth, None);
        assert_eq!(sample.buffered_bytes, 4096);

        let start = Instant::now();
        let sampler = sampler_at(start);
        sampler.set_current_rate(100_000.0);
        let mut t = start;
        let mut reports = Vec::new();
        for buffered in [1_000, 5_000, 20_000] {
            t += Duration::from_secs(2);
            let snapshot = SrtStats {
                bytes_buffered: buffered,
                ..stats(0.0, 0.8)
            };
            reports.extend(sampler.evaluate(snapshot, t));
        }
        assert!(reports.iter().all(|r| !r.measured_by_transport));
        assert!(reports.iter().any(|r| r.vector == RateVector::Down));
    }

    #[test]
    fn test_hold_is_not_reported() {
        let start = Instant::now();
        let sampler = sampler_at(start);
        sampler.set_current_rate(1_000_000.0);
        // Headroom is there but the ramp-up delay has not passed.
        let t = start + Duration::from_millis(500);
        assert!(sampler.evaluate(stats(16.0, 8.0), t).is_none());
        assert_eq!(sampler.latest().map(|s| s.mbps_bandwidth), Some(16.0));
    }

    #[test]
    fn test_reports_up_and_down() {
        let start = Instant::now();
        let sampler = sampler_at(start);
        sampler.set_current_rate(100_000.0);

        let t = start + Duration::from_secs(3);
        let report = sampler.evaluate(stats(8.0, 0.8), t).unwrap();
        assert_eq!(report.vector, RateVector::Up);
        assert_eq!(report.estimated_bandwidth, 1_000_000.0);
        assert_eq!(report.current_throughput, 100_000.0);
        assert!(report.measured_by_transport);

        sampler.set_current_rate(2_000_000.0);
        let t = t + Duration::from_secs(2);
        let report = sampler.evaluate(stats(8.0, 8.0), t).unwrap();
        assert_eq!(report.vector, RateVector::Down);
    }

    #[test]
    fn test_dropped_packets_turn_down() {
        let start = Instant::now();
        let sampler = sampler_at(start);
        sampler.set_current_rate(10_000.0);
        let t = start + Duration::from_secs(2);
        let snapshot = SrtStats {
            packets_dropped: 4,
            ..stats(8.0, 0.1)
        };
        assert_eq!(
            sampler.evaluate(snapshot, t).map(|r| r.vector),
            Some(RateVector::Down)
        );
    }

    #[test]
    fn test_thread_reads_socket_and_reports() {
        struct Counting(AtomicUsize);
        impl BandwidthListener for Counting {
            fn on_throughput(&self, report: ThroughputReport) -> f64 {
                self.0.fetch_add(1, Ordering::SeqCst);
                report.estimated_bandwidth
            }
        }

        let connector = MockConnector::new(SocketStatus::Connected);
        {
            let mut state = connector.state.lock();
            for _ in 0..50 {
                state.stats.push_back(SrtStats {
                    packets_dropped: 1,
                    ..stats(1.0, 1.0)
                });
            }
        }
        let target = SrtTarget::parse("srt://host:9000", 1316).unwrap();
        let socket: SocketHandle = Arc::new(Mutex::new(Some(connector.open(&target).unwrap())));

        let start = Instant::now() - Duration::from_secs(5);
        let mut sampler = SrtStatsSampler::with_decider(
            Duration::from_millis(10),
            RateDecider::starting_at(RateDeciderConfig::default(), start),
        );
        let listener = Arc::new(Counting(AtomicUsize::new(0)));
        let slot: ListenerSlot = Arc::new(RwLock::new(Some(listener.clone() as Arc<dyn BandwidthListener>)));
        sampler.start(socket, slot);
        std::thread::sleep(Duration::from_millis(150));
        sampler.stop();

        assert!(!sampler.is_running());
        assert!(listener.0.load(Ordering::SeqCst) >= 1);
        assert_eq!(sampler.state.lock().decider.current_rate(), 125_000.0);
    }
}
