//! Main engine orchestrator.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, instrument, trace, warn};

use livecast_abr::BitrateController;
use livecast_ipc::{
    EncoderBitrate, EngineCommand, EngineEvent, EngineState, Protocol, Sample, SessionConfig,
    StopReason, StreamMetrics,
};
use livecast_transport::{SrtConnector, TokioSrtConnector, TransportStatistics};

use crate::bitrate::BitrateBridge;
use crate::metrics::MetricsCollector;
use crate::pipeline::Pipeline;
use crate::state::StateBridge;
use crate::{EngineError, EngineResult};

/// Period of metrics events while live.
const METRICS_INTERVAL: Duration = Duration::from_secs(1);

/// Bitrate handles of the external encoders.
#[derive(Clone)]
pub struct Encoders {
    pub video: Arc<dyn EncoderBitrate>,
    pub audio: Option<Arc<dyn EncoderBitrate>>,
}

/// Drives one streaming session at a time.
///
/// The transport is chosen from the URL scheme. RTMP gets FLV tags; SRT
/// gets an MPEG-TS stream. Throughput reports from either transport adjust
/// the encoders through the bitrate controller.
pub struct StreamEngine {
    encoders: Encoders,
    status: Arc<StateBridge>,
    metrics: Arc<MetricsCollector>,
    bitrate: Option<Arc<BitrateBridge>>,
    pipeline: Option<Pipeline>,
    srt_connector: Option<Arc<dyn SrtConnector>>,
}

impl StreamEngine {
    pub fn new(encoders: Encoders, event_tx: Sender<EngineEvent>) -> Self {
        Self {
            encoders,
            status: Arc::new(StateBridge::new(event_tx)),
            metrics: Arc::new(MetricsCollector::new()),
            bitrate: None,
            pipeline: None,
            srt_connector: None,
        }
    }

    /// Socket factory used for `srt://` targets. Without one the engine
    /// creates a [`TokioSrtConnector`] on the first SRT start.
    pub fn with_srt_connector(mut self, connector: Arc<dyn SrtConnector>) -> Self {
        self.srt_connector = Some(connector);
        self
    }

    pub fn state(&self) -> EngineState {
        self.status.state()
    }

    pub fn metrics(&self) -> StreamMetrics {
        self.metrics.snapshot()
    }

    pub fn statistics(&self) -> Option<TransportStatistics> {
        self.pipeline.as_ref().map(Pipeline::statistics)
    }

    /// Start a session for `config.url`.
    ///
    /// Configuration problems are returned before any state change. A
    /// transport that fails to start leaves the engine in `Error`.
    #[instrument(name = "start_stream", skip(self, config), fields(url = %config.url))]
    pub fn start(&mut self, config: SessionConfig) -> EngineResult<()> {
        if self.pipeline.is_some() || self.status.state().is_active() {
            debug!("Already starting or live, ignoring start");
            return Err(EngineError::AlreadyActive);
        }
        config.validate()?;
        let protocol = Protocol::from_url(&config.url)
            .ok_or_else(|| EngineError::UnsupportedUrl(config.url.clone()))?;

        let mut pipeline = match protocol {
            Protocol::Rtmp => Pipeline::rtmp(&config, self.status.clone())?,
            Protocol::Srt => {
                let connector = match &self.srt_connector {
                    Some(connector) => Arc::clone(connector),
                    None => {
                        let connector: Arc<dyn SrtConnector> = Arc::new(TokioSrtConnector::new()?);
                        self.srt_connector = Some(Arc::clone(&connector));
                        connector
                    }
                };
                Pipeline::srt(&config, connector, self.status.clone())?
            }
        };

        info!(protocol = protocol.name(), "Starting stream");
        self.status
            .transition_to(EngineState::Starting { protocol });

        let controller = BitrateController::new(&config.bitrate, &config.video, &config.audio);
        let bitrate = Arc::new(BitrateBridge::new(
            controller,
            Arc::clone(&self.encoders.video),
            self.encoders.audio.clone(),
            Arc::clone(&self.status),
            Arc::clone(&self.metrics),
        ));
        bitrate.apply_initial();
        pipeline.set_bandwidth_listener(bitrate.clone());

        self.metrics.start();
        if let Err(e) = pipeline.start(&config) {
            error!("Stream start failed: {}", e);
            self.metrics.stop();
            self.status.transition_to(EngineState::Error {
                message: e.to_string(),
                recoverable: true,
            });
            return Err(e);
        }

        self.bitrate = Some(bitrate);
        self.pipeline = Some(pipeline);
        Ok(())
    }

    /// Feed one encoded sample into the active session.
    pub fn push(&mut self, sample: &Sample) -> EngineResult<()> {
        let pipeline = self.pipeline.as_mut().ok_or(EngineError::NotStarted)?;
        match pipeline.push(sample) {
            Ok(Some(bytes)) => self.metrics.record_sample(bytes),
            Ok(None) if !sample.is_config => self.metrics.record_drop(),
            Ok(None) => {}
            Err(e) => {
                warn!(kind = ?sample.kind, "Sample rejected: {}", e);
                self.metrics.record_drop();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Turn adaptive bitrate on or off for the running session.
    pub fn set_adaptive(&self, adaptive: bool) {
        match &self.bitrate {
            Some(bitrate) => bitrate.set_adaptive(adaptive),
            None => debug!("No active session, ignoring adaptive toggle"),
        }
    }

    /// Stop the session and return to `Idle`.
    #[instrument(name = "stop_stream", skip(self))]
    pub fn stop(&mut self, reason: StopReason) {
        let Some(mut pipeline) = self.pipeline.take() else {
            if !self.status.state().is_idle() {
                self.status.transition_to(EngineState::Idle);
            }
            return;
        };

        info!(?reason, "Stopping stream");
        self.status
            .transition_to(EngineState::Stopping { reason });

        if let Err(e) = pipeline.stop() {
            warn!("Error while stopping session: {}", e);
        }
        drop(pipeline);

        self.metrics.stop();
        self.bitrate = None;
        self.status.transition_to(EngineState::Idle);
        info!("Stream stopped");
    }

    /// Run the engine until `Shutdown` or until the command channel closes.
    #[instrument(name = "engine_run", skip_all)]
    pub fn run(&mut self, command_rx: Receiver<EngineCommand>, sample_rx: Receiver<Sample>) {
        info!("Engine starting");
        self.status.send_event(EngineEvent::Ready);

        let mut sample_rx = sample_rx;
        let ticker = crossbeam_channel::tick(METRICS_INTERVAL);

        loop {
            crossbeam_channel::select! {
                recv(command_rx) -> command => match command {
                    Ok(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    Err(_) => {
                        info!("Command channel disconnected, shutting down");
                        self.stop(StopReason::UserRequested);
                        break;
                    }
                },
                recv(sample_rx) -> sample => match sample {
                    Ok(sample) => {
                        if let Err(e) = self.push(&sample) {
                            trace!("Sample not sent: {}", e);
                        }
                    }
                    Err(_) => {
                        debug!("Sample channel disconnected");
                        sample_rx = crossbeam_channel::never();
                    }
                },
                recv(ticker) -> _ => {
                    if self.status.state().is_live() {
                        self.emit_metrics();
                    }
                }
            }
        }

        info!("Engine stopped");
    }

    /// Handle a command. Returns false if the engine should stop.
    fn handle_command(&mut self, command: EngineCommand) -> bool {
        debug!(?command, "Handling command");

        match command {
            EngineCommand::Start { config } => {
                if let Err(e) = self.start(*config) {
                    self.status.send_event(EngineEvent::Error {
                        recoverable: true,
                        message: e.to_string(),
                    });
                }
            }
            EngineCommand::Stop => self.stop(StopReason::UserRequested),
            EngineCommand::SetAdaptiveBitrate(adaptive) => self.set_adaptive(adaptive),
            EngineCommand::GetState => self.send_state(),
            EngineCommand::Shutdown => {
                self.stop(StopReason::UserRequested);
                self.status.send_event(EngineEvent::Shutdown);
                return false;
            }
        }

        true
    }

    fn send_state(&self) {
        let state = self.status.state();
        self.status.send_event(EngineEvent::StateChanged {
            previous: Box::new(state.clone()),
            current: Box::new(state),
        });
    }

    fn emit_metrics(&self) {
        self.status
            .send_event(EngineEvent::Metrics(self.metrics.snapshot()));
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        if let Some(mut pipeline) = self.pipeline.take() {
            let _ = pipeline.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    use bytes::{BufMut, Bytes, BytesMut};
    use livecast_ipc::MediaKind;
    use livecast_transport::srt::{SocketStatus, SrtStats, SrtTarget};
    use livecast_transport::{SrtSocket, TransportResult};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeEncoder(AtomicU32);

    impl EncoderBitrate for FakeEncoder {
        fn bitrate(&self) -> u32 {
            self.0.load(Ordering::SeqCst)
        }

        fn set_bitrate(&self, bps: u32) {
            self.0.store(bps, Ordering::SeqCst);
        }
    }

    /// Connects immediately and keeps everything written.
    #[derive(Clone, Default)]
    struct LoopbackConnector {
        written: Arc<Mutex<Vec<u8>>>,
    }

    struct LoopbackSocket {
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl SrtConnector for LoopbackConnector {
        fn open(&self, _target: &SrtTarget) -> TransportResult<Box<dyn SrtSocket>> {
            Ok(Box::new(LoopbackSocket {
                written: Arc::clone(&self.written),
            }))
        }
    }

    impl SrtSocket for LoopbackSocket {
        fn status(&self) -> SocketStatus {
            SocketStatus::Connected
        }

        fn wait_event(&mut self, _timeout: Duration) -> TransportResult<bool> {
            Ok(true)
        }

        fn accept(&mut self) -> TransportResult<Box<dyn SrtSocket>> {
            Err(livecast_transport::TransportError::Unsupported(
                "caller socket".to_string(),
            ))
        }

        fn send(&mut self, data: &[u8]) -> TransportResult<usize> {
            self.written.lock().extend_from_slice(data);
            Ok(data.len())
        }

        fn stats(&mut self, _clear: bool) -> TransportResult<SrtStats> {
            Ok(SrtStats::default())
        }

        fn close(&mut self) {}
    }

    fn encoders() -> (Encoders, Arc<FakeEncoder>) {
        let video = Arc::new(FakeEncoder::default());
        let encoders = Encoders {
            video: video.clone(),
            audio: Some(Arc::new(FakeEncoder::default())),
        };
        (encoders, video)
    }

    fn annex_b(units: &[&[u8]]) -> Bytes {
        let mut buf = BytesMut::new();
        for unit in units {
            buf.put_slice(&[0, 0, 0, 1]);
            buf.put_slice(unit);
        }
        buf.freeze()
    }

    fn wait_for_state(
        rx: &Receiver<EngineEvent>,
        wanted: fn(&EngineState) -> bool,
    ) -> Vec<&'static str> {
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            if let Ok(EngineEvent::StateChanged { current, .. }) =
                rx.recv_timeout(Duration::from_millis(50))
            {
                seen.push(current.name());
                if wanted(current.as_ref()) {
                    return seen;
                }
            }
        }
        panic!("state not reached, saw {:?}", seen);
    }

    #[test]
    fn test_unsupported_url_leaves_engine_idle() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (encoders, _) = encoders();
        let mut engine = StreamEngine::new(encoders, tx);
        let config = SessionConfig {
            url: "http://example.com/live".to_string(),
            ..SessionConfig::default()
        };
        assert!(matches!(
            engine.start(config),
            Err(EngineError::UnsupportedUrl(_))
        ));
        assert!(engine.state().is_idle());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_srt_defaults_to_tokio_connector() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let (encoders, _) = encoders();
        let mut engine = StreamEngine::new(encoders, tx);
        let config = SessionConfig {
            url: "srt://127.0.0.1:29121?timeout=200".to_string(),
            ..SessionConfig::default()
        };
        engine.start(config).unwrap();
        assert!(engine.srt_connector.is_some());
        assert!(engine.state().is_active());
        engine.stop(StopReason::UserRequested);
        assert!(engine.state().is_idle());
    }

    #[test]
    fn test_push_without_session() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let (encoders, _) = encoders();
        let mut engine = StreamEngine::new(encoders, tx);
        let sample = Sample::audio(0, Bytes::from_static(&[1]));
        assert!(matches!(engine.push(&sample), Err(EngineError::NotStarted)));
    }

    #[test]
    fn test_srt_session_end_to_end() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (encoders, video) = encoders();
        let connector = LoopbackConnector::default();
        let written = Arc::clone(&connector.written);
        let mut engine =
            StreamEngine::new(encoders, tx).with_srt_connector(Arc::new(connector));

        let mut config = SessionConfig {
            url: "srt://127.0.0.1:9000".to_string(),
            ..SessionConfig::default()
        };
        config.srt.poll_interval_ms = 5;
        engine.start(config.clone()).unwrap();
        assert_eq!(video.bitrate(), 500_000);
        assert!(matches!(engine.start(config), Err(EngineError::AlreadyActive)));

        let states = wait_for_state(&rx, EngineState::is_live);
        assert_eq!(states, vec!["Starting", "Live"]);

        let sps: &[u8] = &[0x67, 0x42, 0x00, 0x1E, 0xAB];
        let pps: &[u8] = &[0x68, 0xCE, 0x3C, 0x80];
        let idr: &[u8] = &[0x65, 0x88, 0x84, 0x00];
        engine
            .push(&Sample::config(MediaKind::Video, annex_b(&[sps, pps])))
            .unwrap();
        engine
            .push(&Sample::video(0, None, true, annex_b(&[idr])))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while written.lock().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        {
            let written = written.lock();
            assert!(!written.is_empty());
            assert_eq!(written.len() % 188, 0);
            assert!(written.chunks(188).all(|p| p[0] == 0x47));
        }
        let metrics = engine.metrics();
        assert_eq!(metrics.samples_sent, 1);
        assert_eq!(metrics.samples_dropped, 0);

        engine.stop(StopReason::UserRequested);
        let states = wait_for_state(&rx, EngineState::is_idle);
        assert_eq!(states, vec!["Stopping", "Idle"]);
        assert!(engine.statistics().is_none());
    }

    #[test]
    fn test_run_loop_answers_commands() {
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let (command_tx, command_rx) = livecast_ipc::command_channel();
        let (_sample_tx, sample_rx) = livecast_ipc::sample_channel();
        let (encoders, _) = encoders();
        let mut engine = StreamEngine::new(encoders, event_tx);

        let handle = std::thread::spawn(move || engine.run(command_rx, sample_rx));
        command_tx.send(EngineCommand::GetState).unwrap();
        command_tx.send(EngineCommand::Shutdown).unwrap();
        handle.join().unwrap();

        let events: Vec<EngineEvent> = event_rx.try_iter().collect();
        assert!(matches!(events[0], EngineEvent::Ready));
        assert!(matches!(
            &events[1],
            EngineEvent::StateChanged { current, .. } if current.is_idle()
        ));
        assert!(matches!(events.last(), Some(EngineEvent::Shutdown)));
    }
}
