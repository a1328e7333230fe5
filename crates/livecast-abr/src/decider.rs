//! Up/down/hold decisions with hysteresis.

use std::time::{Duration, Instant};

use livecast_ipc::RateVector;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{SampleWindow, ThroughputSample, BITRATE_RATIO, SAMPLE_WINDOW_CAPACITY};

/// Number of buffer-size samples inspected for a growth trend.
const BUFFER_TREND_SAMPLES: usize = 3;

/// Timing of rate changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateDeciderConfig {
    /// Minimum spacing between two decreases.
    pub decrease_delta: Duration,

    /// Wait after a decrease before increasing again.
    pub settlement_delay: Duration,

    /// Spacing between increases once the first decrease happened.
    pub increase_delta: Duration,

    /// Spacing between increases during the initial ramp-up.
    pub ramp_up_increase_delta: Duration,

    /// Headroom the estimate needs over the current rate to step up.
    pub ratio: f64,

    /// Samples kept for inspection.
    pub window: usize,
}

impl Default for RateDeciderConfig {
    fn default() -> Self {
        Self {
            decrease_delta: Duration::from_secs(1),
            settlement_delay: Duration::from_secs(30),
            increase_delta: Duration::from_secs(10),
            ramp_up_increase_delta: Duration::from_secs(2),
            ratio: BITRATE_RATIO,
            window: SAMPLE_WINDOW_CAPACITY,
        }
    }
}

/// Turns throughput samples into rate vectors.
///
/// With a transport bandwidth estimate the decider compares it against the
/// rate the encoders currently produce. Without one (plain TCP), it watches
/// whether the send buffer keeps growing.
#[derive(Debug)]
pub struct RateDecider {
    config: RateDeciderConfig,
    samples: SampleWindow<ThroughputSample>,
    buffer_sizes: SampleWindow<u64>,
    last_turn_down: Instant,
    last_increase: Instant,
    has_first_turn_down: bool,
    current_rate: f64,
}

impl RateDecider {
    pub fn new(config: RateDeciderConfig) -> Self {
        Self::starting_at(config, Instant::now())
    }

    /// Decider whose hysteresis timers start at `start`.
    pub fn starting_at(config: RateDeciderConfig, start: Instant) -> Self {
        Self {
            samples: SampleWindow::new(config.window),
            config,
            buffer_sizes: SampleWindow::new(BUFFER_TREND_SAMPLES),
            last_turn_down: start,
            last_increase: start,
            has_first_turn_down: false,
            current_rate: 0.0,
        }
    }

    /// Byte rate the encoders produce, as returned by the bandwidth listener.
    pub fn set_current_rate(&mut self, bytes_per_sec: f64) {
        self.current_rate = bytes_per_sec;
    }

    pub fn current_rate(&self) -> f64 {
        self.current_rate
    }

    pub fn has_first_turn_down(&self) -> bool {
        self.has_first_turn_down
    }

    pub fn samples(&self) -> &SampleWindow<ThroughputSample> {
        &self.samples
    }

    /// Record `sample` and decide the next vector.
    pub fn evaluate(&mut self, sample: ThroughputSample, now: Instant) -> RateVector {
        self.samples.push(sample);
        if sample.estimated_bandwidth.is_none() {
            self.buffer_sizes.push(sample.buffered_bytes);
        }

        let since_turn_down = now.saturating_duration_since(self.last_turn_down);
        let since_increase = now.saturating_duration_since(self.last_increase);

        let vector = if self.should_turn_down(&sample, since_turn_down) {
            RateVector::Down
        } else if self.should_turn_up(&sample, since_turn_down, since_increase) {
            RateVector::Up
        } else {
            RateVector::Hold
        };

        match vector {
            RateVector::Down => {
                self.has_first_turn_down = true;
                self.last_turn_down = now;
            }
            RateVector::Up => self.last_increase = now,
            RateVector::Hold => {}
        }
        vector
    }

    fn should_turn_down(&self, sample: &ThroughputSample, since_turn_down: Duration) -> bool {
        if since_turn_down < self.config.decrease_delta {
            return false;
        }
        if let Some(bandwidth) = sample.estimated_bandwidth {
            if bandwidth < self.current_rate {
                info!(
                    bandwidth,
                    current_rate = self.current_rate,
                    "Estimated bandwidth below send rate"
                );
                return true;
            }
        }
        if sample.has_loss() {
            info!(
                lost = sample.packets_lost,
                dropped = sample.packets_dropped,
                "Detected packet loss"
            );
            return true;
        }
        if sample.estimated_bandwidth.is_none() && self.buffer_trend() > 0 {
            debug!(buffered = sample.buffered_bytes, "Send buffer growing");
            return true;
        }
        false
    }

    fn should_turn_up(
        &self,
        sample: &ThroughputSample,
        since_turn_down: Duration,
        since_increase: Duration,
    ) -> bool {
        let headroom = match sample.estimated_bandwidth {
            Some(bandwidth) => bandwidth > self.current_rate * self.config.ratio,
            None => self.buffer_trend() <= 0,
        };
        if !headroom {
            return false;
        }
        if self.has_first_turn_down {
            since_turn_down >= self.config.settlement_delay
                && since_increase >= self.config.increase_delta
        } else {
            since_increase >= self.config.ramp_up_increase_delta
        }
    }

    /// Net count of growing minus shrinking steps across the buffer samples.
    fn buffer_trend(&self) -> i32 {
        let sizes: Vec<u64> = self.buffer_sizes.iter().rev().copied().collect();
        sizes
            .windows(2)
            .map(|pair| match pair[1].cmp(&pair[0]) {
                std::cmp::Ordering::Greater => 1,
                std::cmp::Ordering::Less => -1,
                std::cmp::Ordering::Equal => 0,
            })
            .sum()
    }
}
