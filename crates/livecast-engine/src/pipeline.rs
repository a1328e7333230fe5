//! Adapter chains from encoded samples to a transport session.

use std::sync::Arc;

use tracing::{debug, trace};

use livecast_ipc::{
    BandwidthListener, MediaKind, RtmpState, Sample, SessionConfig, SrtState, StateListener,
    VideoCodec,
};
use livecast_mux::{AdtsEncoder, AnnexbEncoder, TimeBase, TsMuxer, TsSink, TsStreamConfig};
use livecast_transport::rtmp::{AacPacketizer, H264Packetizer};
use livecast_transport::{
    RtmpSession, RtmpSessionParameters, SrtConnector, SrtSession, TransportStatistics,
};

use crate::{EngineError, EngineResult};

/// Stream index of the video elementary stream in the transport stream.
const VIDEO_STREAM_INDEX: usize = 0;
const AUDIO_STREAM_INDEX: usize = 1;

/// Composition offset applied to video timestamps, in microseconds.
fn cts_offset_us(config: &SessionConfig) -> i64 {
    TimeBase::from_fps(config.video.fps).tick_us() * i64::from(config.mux.cts_offset_frames)
}

/// FLV packetizers feeding an RTMP session.
pub struct RtmpPipeline {
    session: RtmpSession,
    video: H264Packetizer,
    audio: AacPacketizer,
}

impl RtmpPipeline {
    pub fn new(
        config: &SessionConfig,
        listener: Arc<dyn StateListener<RtmpState>>,
    ) -> EngineResult<Self> {
        if config.video.codec != VideoCodec::H264 {
            return Err(EngineError::Unsupported(format!(
                "{:?} video over RTMP",
                config.video.codec
            )));
        }
        let mut session = RtmpSession::new(config.rtmp.clone(), listener);
        session.set_session_parameters(RtmpSessionParameters::from_params(
            &config.video,
            &config.audio,
        ));
        Ok(Self {
            session,
            video: H264Packetizer::new(cts_offset_us(config)),
            audio: AacPacketizer::new(config.audio.sample_rate, config.audio.channels),
        })
    }

    pub fn session(&self) -> &RtmpSession {
        &self.session
    }

    /// Packetize and queue one sample. Returns the tag bytes queued, or
    /// `None` when the sample produced no tag.
    pub fn push(&mut self, sample: &Sample) -> EngineResult<Option<u64>> {
        let tags = match sample.kind {
            MediaKind::Video => self.video.push(sample)?,
            MediaKind::Audio => self.audio.push(sample).into_iter().collect(),
        };
        if tags.is_empty() {
            return Ok(None);
        }
        let bytes = tags.iter().map(|tag| tag.data.len() as u64).sum();
        for tag in tags {
            self.session.push(tag);
        }
        Ok(Some(bytes))
    }
}

/// [`TsSink`] writing into an SRT session. The end of every PES flushes
/// the partial chunk.
pub struct SrtOutput {
    session: SrtSession,
}

impl SrtOutput {
    pub fn new(session: SrtSession) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &SrtSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SrtSession {
        &mut self.session
    }
}

impl TsSink for SrtOutput {
    fn write(&mut self, data: &[u8]) {
        self.session.push(data);
    }

    fn end_of_pes(&mut self) {
        self.session.push(&[]);
    }
}

/// Annex B and ADTS adapters feeding an MPEG-TS muxer.
pub struct TsPipeline<S: TsSink> {
    muxer: TsMuxer<S>,
    annexb: AnnexbEncoder,
    adts: AdtsEncoder,
}

impl<S: TsSink> TsPipeline<S> {
    pub fn new(config: &SessionConfig, sink: S) -> EngineResult<Self> {
        let streams = vec![
            TsStreamConfig::video(VIDEO_STREAM_INDEX as u16, config.video.codec, config.video.fps),
            TsStreamConfig::audio(AUDIO_STREAM_INDEX as u16, config.audio.sample_rate),
        ];
        let muxer = TsMuxer::new(streams, config.mux.clone(), sink)?;
        debug!(pids = ?muxer.pids(), "TS pipeline ready");
        Ok(Self {
            muxer,
            annexb: AnnexbEncoder::new(config.video.codec),
            adts: AdtsEncoder::new(),
        })
    }

    /// Frame and mux one sample. Returns the bytes the muxer wrote, or
    /// `None` when the adapter consumed the sample without output.
    pub fn push(&mut self, sample: &Sample) -> EngineResult<Option<u64>> {
        let (framed, index) = match sample.kind {
            MediaKind::Video => (self.annexb.push(sample)?, VIDEO_STREAM_INDEX),
            MediaKind::Audio => (self.adts.push(sample)?, AUDIO_STREAM_INDEX),
        };
        let Some(framed) = framed else {
            trace!(kind = ?sample.kind, config = sample.is_config, "Sample consumed by adapter");
            return Ok(None);
        };

        let before = self.muxer.bytes_written();
        self.muxer.push(&framed, index)?;
        Ok(Some(self.muxer.bytes_written() - before))
    }

    /// Write out pending aggregated audio.
    pub fn flush(&mut self) -> EngineResult<()> {
        self.muxer.flush()?;
        Ok(())
    }

    pub fn sink(&self) -> &S {
        self.muxer.sink()
    }

    pub fn sink_mut(&mut self) -> &mut S {
        self.muxer.sink_mut()
    }

    pub fn into_sink(self) -> S {
        self.muxer.into_sink()
    }
}

/// The adapter chain and session chosen for the target URL.
pub enum Pipeline {
    Rtmp(RtmpPipeline),
    Srt(TsPipeline<SrtOutput>),
}

impl Pipeline {
    pub fn rtmp(config: &SessionConfig, listener: Arc<dyn StateListener<RtmpState>>) -> EngineResult<Self> {
        Ok(Self::Rtmp(RtmpPipeline::new(config, listener)?))
    }

    pub fn srt(
        config: &SessionConfig,
        connector: Arc<dyn SrtConnector>,
        listener: Arc<dyn StateListener<SrtState>>,
    ) -> EngineResult<Self> {
        let session = SrtSession::new(config.srt.clone(), connector, listener);
        Ok(Self::Srt(TsPipeline::new(config, SrtOutput::new(session))?))
    }

    pub fn set_bandwidth_listener(&self, listener: Arc<dyn BandwidthListener>) {
        match self {
            Self::Rtmp(p) => p.session.set_bandwidth_listener(listener),
            Self::Srt(p) => p.sink().session.set_bandwidth_listener(listener),
        }
    }

    pub fn start(&mut self, config: &SessionConfig) -> EngineResult<()> {
        match self {
            Self::Rtmp(p) => p.session.start(&config.url, &config.stream_key)?,
            Self::Srt(p) => p.sink_mut().session.start(&config.url)?,
        }
        Ok(())
    }

    pub fn push(&mut self, sample: &Sample) -> EngineResult<Option<u64>> {
        match self {
            Self::Rtmp(p) => p.push(sample),
            Self::Srt(p) => p.push(sample),
        }
    }

    pub fn statistics(&self) -> TransportStatistics {
        match self {
            Self::Rtmp(p) => p.session.statistics(),
            Self::Srt(p) => p.sink().session.statistics(),
        }
    }

    /// Flush what is pending and close the session.
    pub fn stop(&mut self) -> EngineResult<()> {
        match self {
            Self::Rtmp(p) => p.session.stop()?,
            Self::Srt(p) => {
                p.flush()?;
                let session = &mut p.sink_mut().session;
                session.flush();
                session.stop();
            }
        }
        Ok(())
    }
}
