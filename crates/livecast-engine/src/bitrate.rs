//! Applies throughput reports to the encoders.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use livecast_abr::BitrateController;
use livecast_ipc::{BandwidthListener, BitrateUpdate, EncoderBitrate, EngineEvent, ThroughputReport};

use crate::metrics::MetricsCollector;
use crate::state::StateBridge;

/// Bandwidth listener handed to the transport session.
///
/// Every report goes out as an event; the bitrate controller turns it into
/// encoder bitrates and the combined byte rate is returned to the
/// transport's rate decider.
pub struct BitrateBridge {
    controller: Mutex<BitrateController>,
    video: Arc<dyn EncoderBitrate>,
    audio: Option<Arc<dyn EncoderBitrate>>,
    status: Arc<StateBridge>,
    metrics: Arc<MetricsCollector>,
}

impl BitrateBridge {
    pub fn new(
        controller: BitrateController,
        video: Arc<dyn EncoderBitrate>,
        audio: Option<Arc<dyn EncoderBitrate>>,
        status: Arc<StateBridge>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            controller: Mutex::new(controller),
            video,
            audio,
            status,
            metrics,
        }
    }

    /// Push the controller's current bitrates to the encoders.
    pub fn apply_initial(&self) -> BitrateUpdate {
        let controller = self.controller.lock();
        let update = BitrateUpdate {
            video_bps: controller.video_bps(),
            audio_bps: controller.audio_bps(),
            changed: true,
        };
        drop(controller);

        info!(
            video_bps = update.video_bps,
            audio_bps = update.audio_bps,
            "Initial encoder bitrates"
        );
        self.set_encoders(&update);
        update
    }

    pub fn set_adaptive(&self, adaptive: bool) {
        self.controller.lock().set_adaptive(adaptive);
        debug!(adaptive, "Adaptive bitrate toggled");
    }

    pub fn current(&self) -> BitrateUpdate {
        let controller = self.controller.lock();
        BitrateUpdate {
            video_bps: controller.video_bps(),
            audio_bps: controller.audio_bps(),
            changed: false,
        }
    }

    fn set_encoders(&self, update: &BitrateUpdate) {
        if self.video.bitrate() != update.video_bps {
            self.video.set_bitrate(update.video_bps);
        }
        if let Some(audio) = &self.audio {
            if audio.bitrate() != update.audio_bps {
                audio.set_bitrate(update.audio_bps);
            }
        }
        self.metrics
            .update_bitrates(update.video_bps, update.audio_bps);
    }
}

impl BandwidthListener for BitrateBridge {
    fn on_throughput(&self, report: ThroughputReport) -> f64 {
        self.status.send_event(EngineEvent::Throughput(report));
        self.metrics.update_bandwidth(report.estimated_bandwidth);

        let update = self.controller.lock().apply(&report);
        if update.changed {
            self.set_encoders(&update);
            self.status.send_event(EngineEvent::BitrateChanged(update));
        }
        update.bytes_per_sec()
    }
}
