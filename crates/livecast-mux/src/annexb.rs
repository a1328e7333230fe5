//! Canonical Annex B access units for MPEG-TS.

use bytes::{BufMut, Bytes, BytesMut};
use livecast_codec::nal::{self, AvcDecoderConfig, ACCESS_UNIT_DELIMITER, START_CODE};
use livecast_ipc::{Sample, VideoCodec};
use tracing::{debug, trace};

use crate::MuxResult;

/// HEVC access unit delimiter: type 35, any slice type.
const HEVC_ACCESS_UNIT_DELIMITER: [u8; 3] = [0x46, 0x01, 0x50];

const NAL_LENGTH_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParameterSet {
    Vps,
    Sps,
    Pps,
}

/// Rewrites video samples into delimiter-led Annex B access units.
///
/// Every output unit starts with an access unit delimiter. Keyframes are
/// preceded by the parameter sets (VPS for HEVC, SPS, PPS), taken from the
/// first of each seen. Input can be Annex B, 4-byte length-prefixed NAL
/// units or, for configs, an `AVCDecoderConfigurationRecord`.
#[derive(Debug)]
pub struct AnnexbEncoder {
    codec: VideoCodec,
    vps: Option<Bytes>,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    conf: Option<Bytes>,
}

impl AnnexbEncoder {
    pub fn new(codec: VideoCodec) -> Self {
        Self {
            codec,
            vps: None,
            sps: None,
            pps: None,
            conf: None,
        }
    }

    /// Parameter sets in Annex B form, once all of them are known.
    pub fn configuration(&self) -> Option<&Bytes> {
        self.conf.as_ref()
    }

    /// Returns the rewritten sample, or `None` when the input only carried
    /// parameter sets.
    pub fn push(&mut self, sample: &Sample) -> MuxResult<Option<Sample>> {
        let units = self.split(&sample.payload, sample.is_config)?;

        let mut has_frame_data = false;
        for unit in &units {
            match self.parameter_set(unit) {
                Some(kind) => self.remember(kind, unit),
                None => has_frame_data |= !self.is_delimiter(unit),
            }
        }
        if self.conf.is_none() {
            self.conf = self.build_configuration();
            if let Some(conf) = &self.conf {
                debug!(codec = ?self.codec, len = conf.len(), "Annex B configuration ready");
            }
        }

        if sample.is_config || !has_frame_data {
            return Ok(None);
        }

        let mut buf = BytesMut::with_capacity(sample.payload.len() + 64);
        buf.put_slice(&START_CODE);
        match self.codec {
            VideoCodec::H264 => buf.put_slice(&ACCESS_UNIT_DELIMITER),
            VideoCodec::Hevc => buf.put_slice(&HEVC_ACCESS_UNIT_DELIMITER),
        }
        if sample.is_keyframe {
            match &self.conf {
                Some(conf) => buf.put_slice(conf),
                None => trace!("Keyframe before parameter sets"),
            }
        }
        for unit in units.iter().filter(|u| !self.is_delimiter(u)) {
            buf.put_slice(&START_CODE);
            buf.put_slice(unit);
        }

        Ok(Some(Sample {
            payload: buf.freeze(),
            ..sample.clone()
        }))
    }

    fn split(&self, payload: &Bytes, is_config: bool) -> MuxResult<Vec<Bytes>> {
        if payload.starts_with(&[0, 0, 1]) || payload.starts_with(&START_CODE) {
            return Ok(nal::parse_annex_b(payload)
                .into_iter()
                .map(|unit| unit.data)
                .collect());
        }
        if is_config && self.codec == VideoCodec::H264 && payload.first() == Some(&1) {
            let record = AvcDecoderConfig::parse(payload)?;
            return Ok(record.sps.into_iter().chain(record.pps).collect());
        }
        Ok(nal::parse_avcc(payload, NAL_LENGTH_SIZE)?
            .into_iter()
            .map(|unit| unit.data)
            .collect())
    }

    fn nal_type(&self, unit: &[u8]) -> Option<u8> {
        let header = *unit.first()?;
        Some(match self.codec {
            VideoCodec::H264 => header & 0x1F,
            VideoCodec::Hevc => (header >> 1) & 0x3F,
        })
    }

    fn parameter_set(&self, unit: &[u8]) -> Option<ParameterSet> {
        match (self.codec, self.nal_type(unit)?) {
            (VideoCodec::H264, 7) => Some(ParameterSet::Sps),
            (VideoCodec::H264, 8) => Some(ParameterSet::Pps),
            (VideoCodec::Hevc, 32) => Some(ParameterSet::Vps),
            (VideoCodec::Hevc, 33) => Some(ParameterSet::Sps),
            (VideoCodec::Hevc, 34) => Some(ParameterSet::Pps),
            _ => None,
        }
    }

    fn is_delimiter(&self, unit: &[u8]) -> bool {
        match (self.codec, self.nal_type(unit)) {
            (VideoCodec::H264, Some(9)) => true,
            (VideoCodec::Hevc, Some(35)) => true,
            _ => false,
        }
    }

    fn remember(&mut self, kind: ParameterSet, unit: &Bytes) {
        let slot = match kind {
            ParameterSet::Vps => &mut self.vps,
            ParameterSet::Sps => &mut self.sps,
            ParameterSet::Pps => &mut self.pps,
        };
        if slot.is_none() {
            *slot = Some(unit.clone());
        }
    }

    fn build_configuration(&self) -> Option<Bytes> {
        let vps = match self.codec {
            VideoCodec::Hevc => Some(self.vps.as_ref()?),
            VideoCodec::H264 => None,
        };
        let sps = self.sps.as_ref()?;
        let pps = self.pps.as_ref()?;

        let mut conf = BytesMut::new();
        for set in vps.into_iter().chain([sps, pps]) {
            conf.put_slice(&START_CODE);
            conf.put_slice(set);
        }
        Some(conf.freeze())
    }
}
