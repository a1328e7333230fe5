//! Throughput sampling for transports without a link estimate.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender};
use livecast_ipc::{BandwidthListener, RateVector, ThroughputReport};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{RateDecider, RateDeciderConfig, SampleWindow, ThroughputSample, SAMPLE_WINDOW_CAPACITY};

/// Bandwidth samples averaged into the pivot estimate.
const PIVOT_SAMPLES: usize = 5;

/// Samples send-queue activity and periodically reports a rate vector.
///
/// The send path records every write with [`add_sent_bytes`] and the queue
/// depth with [`add_buffer_size`]. Every interval the accumulated bytes are
/// turned into a bytes-per-second figure, the buffer trend is evaluated and
/// the listener receives a [`ThroughputReport`] whose estimated bandwidth is
/// the mean of the last pivot samples (turn points and new highs).
///
/// [`add_sent_bytes`]: TcpThroughputSampler::add_sent_bytes
/// [`add_buffer_size`]: TcpThroughputSampler::add_buffer_size
pub struct TcpThroughputSampler {
    state: Arc<Mutex<SamplerState>>,
    interval: Duration,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct SamplerState {
    decider: RateDecider,
    sent_bytes: u64,
    last_buffer_size: Option<u64>,
    bandwidth: SampleWindow<f64>,
    pivots: SampleWindow<f64>,
    previous_vector: RateVector,
    last_tick: Instant,
}

impl SamplerState {
    fn new(start: Instant) -> Self {
        Self {
            decider: RateDecider::starting_at(RateDeciderConfig::default(), start),
            sent_bytes: 0,
            last_buffer_size: None,
            bandwidth: SampleWindow::new(SAMPLE_WINDOW_CAPACITY),
            pivots: SampleWindow::new(PIVOT_SAMPLES),
            previous_vector: RateVector::Hold,
            last_tick: start,
        }
    }

    fn tick(&mut self, now: Instant) -> ThroughputReport {
        let elapsed = now.saturating_duration_since(self.last_tick).as_secs_f64();
        self.last_tick = now;

        let bytes_per_sec = if elapsed > 0.0 {
            self.sent_bytes as f64 / elapsed
        } else {
            0.0
        };
        self.bandwidth.push(bytes_per_sec);

        let mut vector = RateVector::Hold;
        let mut pivot_avg = 0.0;

        if let Some(buffered) = self.last_buffer_size {
            let sample = ThroughputSample {
                send_rate: bytes_per_sec,
                bytes_sent: self.sent_bytes,
                buffered_bytes: buffered,
                ..ThroughputSample::at(now)
            };
            vector = self.decider.evaluate(sample, now);

            // Leaving a decrease marks a turn point.
            if self.previous_vector == RateVector::Down && vector != RateVector::Down {
                if let Some(&newest) = self.bandwidth.newest() {
                    self.pivots.push(newest);
                }
            }
            pivot_avg = self.pivots.mean();
            if bytes_per_sec > pivot_avg {
                self.pivots.push(bytes_per_sec);
            }
            self.previous_vector = vector;
        }

        self.sent_bytes = 0;
        self.last_buffer_size = None;

        ThroughputReport {
            vector,
            estimated_bandwidth: pivot_avg,
            current_throughput: bytes_per_sec,
            measured_by_transport: false,
        }
    }
}

impl TcpThroughputSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(SamplerState::new(Instant::now()))),
            interval,
            stop_tx: None,
            handle: None,
        }
    }

    /// Record bytes written to the socket.
    pub fn add_sent_bytes(&self, bytes: usize) {
        self.state.lock().sent_bytes += bytes as u64;
    }

    /// Record the current send-queue depth.
    pub fn add_buffer_size(&self, bytes: usize) {
        self.state.lock().last_buffer_size = Some(bytes as u64);
    }

    /// Forget pending buffer samples, e.g. after a reconnect.
    pub fn reset(&self) {
        self.state.lock().last_buffer_size = None;
    }

    /// Evaluate immediately instead of waiting for the sampling thread.
    pub fn sample_now(&self, now: Instant) -> ThroughputReport {
        self.state.lock().tick(now)
    }

    /// Hand the byte rate returned by the listener to the decider.
    pub fn set_current_rate(&self, bytes_per_sec: f64) {
        self.state.lock().decider.set_current_rate(bytes_per_sec);
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Start the sampling thread. Each report goes to `listener`.
    pub fn start(&mut self, listener: Arc<dyn BandwidthListener>) {
        if self.handle.is_some() {
            return;
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let state = Arc::clone(&self.state);
        let interval = self.interval;
        state.lock().last_tick = Instant::now();

        let spawned = std::thread::Builder::new()
            .name("livecast-tcp-sampler".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }

                let report = state.lock().tick(Instant::now());
                trace!(
                    vector = report.vector.as_i32(),
                    bandwidth = report.estimated_bandwidth,
                    throughput = report.current_throughput,
                    "Throughput sample"
                );
                let rate = listener.on_throughput(report);
                state.lock().decider.set_current_rate(rate);
            });

        match spawned {
            Ok(handle) => {
                debug!(interval_ms = interval.as_millis() as u64, "Throughput sampler started");
                self.stop_tx = Some(stop_tx);
                self.handle = Some(handle);
            }
            Err(e) => warn!("Failed to spawn throughput sampler: {}", e),
        }
    }

    /// Stop the sampling thread and wait for it.
    pub fn stop(&mut self) {
        self.stop_tx = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Throughput sampler panicked");
            }
            debug!("Throughput sampler stopped");
        }
    }
}

impl Drop for TcpThroughputSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_rate_from_sent_bytes() {
        let sampler = TcpThroughputSampler::new(Duration::from_secs(2));
        let start = sampler.state.lock().last_tick;
        sampler.add_sent_bytes(100_000);
        sampler.add_sent_bytes(100_000);
        let report = sampler.sample_now(start + Duration::from_secs(2));
        assert_eq!(report.current_throughput, 100_000.0);
        assert!(!report.measured_by_transport);
        // Without a buffer sample no decision is made.
        assert_eq!(report.vector, RateVector::Hold);
    }

    #[test]
    fn test_growing_buffer_reports_down_and_pivots() {
        let sampler = TcpThroughputSampler::new(Duration::from_secs(2));
        let start = sampler.state.lock().last_tick;

        let mut t = start;
        let mut vectors = Vec::new();
        for buffered in [0, 50_000, 120_000, 120_000] {
            t += Duration::from_secs(2);
            sampler.add_sent_bytes(200_000);
            sampler.add_buffer_size(buffered);
            vectors.push(sampler.sample_now(t));
        }
        assert_eq!(vectors[0].vector, RateVector::Up);
        assert_eq!(vectors[1].vector, RateVector::Down);
        // 100 kB/s was recorded as a new high on the first tick.
        assert_eq!(vectors[1].estimated_bandwidth, 100_000.0);
    }

    #[test]
    fn test_thread_reports_to_listener() {
        struct Counting(AtomicUsize);
        impl BandwidthListener for Counting {
            fn on_throughput(&self, _report: ThroughputReport) -> f64 {
                self.0.fetch_add(1, Ordering::SeqCst);
                0.0
            }
        }

        let listener = Arc::new(Counting(AtomicUsize::new(0)));
        let mut sampler = TcpThroughputSampler::new(Duration::from_millis(10));
        sampler.start(listener.clone());
        assert!(sampler.is_running());
        std::thread::sleep(Duration::from_millis(100));
        sampler.stop();
        assert!(!sampler.is_running());
        assert!(listener.0.load(Ordering::SeqCst) > 0);
    }
}
