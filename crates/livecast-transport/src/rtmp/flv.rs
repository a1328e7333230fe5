//! FLV tag packetizers: encoded samples to RTMP audio/video message bodies.

use bytes::{BufMut, Bytes, BytesMut};
use livecast_codec::nal::{self, NalUnit};
use livecast_codec::put_be24;
use livecast_ipc::{MediaKind, Sample};
use tracing::{debug, trace, warn};

use crate::{TransportError, TransportResult};

/// RTMP message type for audio.
pub const AUDIO_MESSAGE_TYPE: u8 = 8;

/// RTMP message type for video.
pub const VIDEO_MESSAGE_TYPE: u8 = 9;

const AVC_CODEC_ID: u8 = 0x07;
const AAC_SOUND_FORMAT: u8 = 0xA0;

/// One FLV tag body, ready to become an RTMP message.
#[derive(Debug, Clone)]
pub struct FlvTag {
    pub kind: MediaKind,

    /// Decode timestamp in milliseconds.
    pub timestamp_ms: u32,

    pub data: Bytes,
    pub is_keyframe: bool,

    /// AVC decoder configuration or AudioSpecificConfig.
    pub is_sequence_header: bool,
}

impl FlvTag {
    pub fn type_id(&self) -> u8 {
        match self.kind {
            MediaKind::Video => VIDEO_MESSAGE_TYPE,
            MediaKind::Audio => AUDIO_MESSAGE_TYPE,
        }
    }
}

/// Wraps Annex B H.264 access units into AVC video tags.
///
/// Parameter sets are collected from any sample that carries them; the
/// decoder configuration record goes out once, before the first frame.
/// Frames arriving before both SPS and PPS are known are dropped.
#[derive(Debug, Default)]
pub struct H264Packetizer {
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    sent_config: bool,

    /// Added to every pts, in microseconds.
    cts_offset_us: i64,
}

impl H264Packetizer {
    pub fn new(cts_offset_us: i64) -> Self {
        Self {
            cts_offset_us,
            ..Self::default()
        }
    }

    pub fn has_sent_config(&self) -> bool {
        self.sent_config
    }

    /// Packetize one video sample. Returns zero, one or two tags.
    pub fn push(&mut self, sample: &Sample) -> TransportResult<Vec<FlvTag>> {
        let nals = nal::parse_annex_b(&sample.payload);
        if let Some((sps, pps)) = nal::extract_sps_pps(&nals) {
            self.sps = Some(sps);
            self.pps = Some(pps);
        } else {
            for unit in nals.iter().filter(|n| n.is_parameter_set()) {
                match unit.nal_type {
                    nal::NalUnitType::Sps => self.sps = Some(unit.data.clone()),
                    _ => self.pps = Some(unit.data.clone()),
                }
            }
        }

        let dts = sample.decode_time();
        let pts = sample.pts + self.cts_offset_us;
        let timestamp_ms = (dts.max(0) / 1000) as u32;
        let mut tags = Vec::with_capacity(2);

        if !self.sent_config {
            if let (Some(sps), Some(pps)) = (&self.sps, &self.pps) {
                let record = nal::build_avc_decoder_config(sps, pps)
                    .map_err(|e| TransportError::Protocol(e.to_string()))?;
                debug!(len = record.len(), "Sending AVC sequence header");
                tags.push(FlvTag {
                    kind: MediaKind::Video,
                    timestamp_ms,
                    data: video_tag(&record, true, true, 0),
                    is_keyframe: true,
                    is_sequence_header: true,
                });
                self.sent_config = true;
            }
        }

        let frame: Vec<NalUnit> = nal::filter_parameter_sets(nals);
        if frame.is_empty() || sample.is_config {
            return Ok(tags);
        }
        if !self.sent_config {
            trace!(dts, "Dropping video frame before decoder configuration");
            return Ok(tags);
        }

        let cts_ms = ((pts - dts) / 1000) as i32;
        let body = nal::nals_to_avcc(&frame);
        tags.push(FlvTag {
            kind: MediaKind::Video,
            timestamp_ms,
            data: video_tag(&body, sample.is_keyframe, false, cts_ms),
            is_keyframe: sample.is_keyframe,
            is_sequence_header: false,
        });
        Ok(tags)
    }
}

fn video_tag(body: &[u8], is_keyframe: bool, is_sequence_header: bool, cts_ms: i32) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + body.len());
    let frame_type = if is_keyframe { 0x10 } else { 0x20 };
    buf.put_u8(frame_type | AVC_CODEC_ID);
    buf.put_u8(if is_sequence_header { 0x00 } else { 0x01 });
    // Signed 24-bit composition time.
    put_be24(&mut buf, cts_ms as u32);
    buf.put_slice(body);
    buf.freeze()
}

/// Wraps raw AAC frames into FLV audio tags.
#[derive(Debug)]
pub struct AacPacketizer {
    flags: u8,
    config: Option<Bytes>,
}

impl AacPacketizer {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        let rate = match sample_rate {
            22_050 => 0x08,
            11_025 => 0x04,
            5_512 | 5_500 => 0x00,
            _ => 0x0C,
        };
        let stereo = u8::from(channels > 1);
        Self {
            // AAC, rate, 16-bit samples, mono/stereo
            flags: AAC_SOUND_FORMAT | rate | 0x02 | stereo,
            config: None,
        }
    }

    /// First byte of every audio tag.
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Packetize one audio sample.
    ///
    /// A config sample yields the AudioSpecificConfig sequence header when
    /// it differs from the one already sent.
    pub fn push(&mut self, sample: &Sample) -> Option<FlvTag> {
        let timestamp_ms = sample.timestamp_ms();
        if sample.is_config {
            if self.config.as_ref() == Some(&sample.payload) {
                return None;
            }
            if self.config.is_some() {
                warn!("AudioSpecificConfig changed mid-stream");
            }
            self.config = Some(sample.payload.clone());
            debug!(len = sample.payload.len(), "Sending AAC sequence header");
            return Some(FlvTag {
                kind: MediaKind::Audio,
                timestamp_ms,
                data: self.audio_tag(&sample.payload, true),
                is_keyframe: false,
                is_sequence_header: true,
            });
        }

        if self.config.is_none() {
            trace!("Dropping audio frame before AudioSpecificConfig");
            return None;
        }

        Some(FlvTag {
            kind: MediaKind::Audio,
            timestamp_ms,
            data: self.audio_tag(&sample.payload, false),
            is_keyframe: false,
            is_sequence_header: false,
        })
    }

    fn audio_tag(&self, body: &[u8], is_sequence_header: bool) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + body.len());
        buf.put_u8(self.flags);
        buf.put_u8(if is_sequence_header { 0x00 } else { 0x01 });
        buf.put_slice(body);
        buf.freeze()
    }
}
