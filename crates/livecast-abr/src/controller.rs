//! Maps rate vectors onto encoder bitrates.

use livecast_ipc::{AudioParams, BitrateConfig, BitrateUpdate, RateVector, ThroughputReport, VideoParams};
use tracing::info;

use crate::BITRATE_RATIO;

/// Audio bitrate paired with a video bitrate.
pub fn audio_bitrate_for(video_bps: u32, stereo: bool) -> u32 {
    match (video_bps, stereo) {
        (500_001.., true) => 128_000,
        (500_001.., false) => 108_000,
        (250_001..=500_000, true) => 108_000,
        (250_001..=500_000, false) => 80_000,
        (_, true) => 78_000,
        (_, false) => 52_000,
    }
}

/// Ladder step for a video bitrate.
fn step_for(video_bps: u32) -> u32 {
    match video_bps {
        1_152_001.. => 384_000,
        512_001.. => 128_000,
        128_001.. => 64_000,
        _ => 32_000,
    }
}

/// Current encoder bitrates and their bounds.
#[derive(Debug, Clone)]
pub struct BitrateController {
    video_bps: u32,
    audio_bps: u32,
    ceiling: u32,
    floor: u32,
    stereo: bool,
    adaptive: bool,
}

impl BitrateController {
    pub fn new(bitrate: &BitrateConfig, video: &VideoParams, audio: &AudioParams) -> Self {
        let ceiling = video.bitrate_bps;
        let video_bps = if bitrate.adaptive {
            bitrate.initial_video_bps.min(ceiling)
        } else {
            ceiling
        };
        Self {
            video_bps,
            audio_bps: audio.bitrate_bps,
            ceiling,
            floor: bitrate.min_video_bps.min(ceiling),
            stereo: audio.channels > 1,
            adaptive: bitrate.adaptive,
        }
    }

    pub fn video_bps(&self) -> u32 {
        self.video_bps
    }

    pub fn audio_bps(&self) -> u32 {
        self.audio_bps
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    pub fn floor(&self) -> u32 {
        self.floor
    }

    pub fn is_adaptive(&self) -> bool {
        self.adaptive
    }

    pub fn set_adaptive(&mut self, adaptive: bool) {
        self.adaptive = adaptive;
    }

    /// Combined encoder output in bytes per second.
    pub fn bytes_per_sec(&self) -> f64 {
        f64::from(self.video_bps + self.audio_bps) / 8.0
    }

    /// Apply one throughput report.
    ///
    /// A held vector, or adaptive mode being off, leaves the bitrates
    /// untouched. When the transport measured a bandwidth below what the
    /// encoders currently produce, both rates jump straight to a discounted
    /// estimate; otherwise video moves one ladder step.
    pub fn apply(&mut self, report: &ThroughputReport) -> BitrateUpdate {
        let (old_video, old_audio) = (self.video_bps, self.audio_bps);

        if self.adaptive && !report.vector.is_hold() {
            if report.measured_by_transport && report.estimated_bandwidth < self.bytes_per_sec() {
                let target = (report.estimated_bandwidth * 8.0 / BITRATE_RATIO) as u32;
                self.audio_bps = audio_bitrate_for(target, self.stereo);
                self.video_bps = target
                    .saturating_sub(self.audio_bps)
                    .max(self.floor)
                    .min(self.ceiling);
            } else {
                self.video_bps = self.step(report.vector);
                self.audio_bps = audio_bitrate_for(self.video_bps, self.stereo);
            }
        }

        let changed = old_video != self.video_bps || old_audio != self.audio_bps;
        if changed {
            info!(
                vector = report.vector.as_i32(),
                video_bps = self.video_bps,
                audio_bps = self.audio_bps,
                bandwidth = report.estimated_bandwidth,
                "Bitrate changed"
            );
        }

        BitrateUpdate {
            video_bps: self.video_bps,
            audio_bps: self.audio_bps,
            changed,
        }
    }

    fn step(&self, vector: RateVector) -> u32 {
        let step = i64::from(step_for(self.video_bps));
        let rungs = i64::from(self.video_bps) / step + i64::from(vector.as_i32());
        let next = (rungs * step).clamp(i64::from(self.floor), i64::from(self.ceiling));
        next as u32
    }
}
