//! ADTS framing for raw AAC frames.

use bytes::{BufMut, Bytes, BytesMut};
use livecast_codec::{BitReader, BitWriter};
use livecast_ipc::Sample;
use tracing::{debug, error, trace};

use crate::{MuxError, MuxResult};

pub const ADTS_HEADER_SIZE: usize = 7;

/// Largest frame the 13-bit length field can describe, header included.
pub const ADTS_MAX_FRAME_BYTES: usize = (1 << 13) - 1;

/// The 2-bit profile field holds object types 1 (Main) through 4 (LTP).
const MAX_ADTS_OBJECT_TYPE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AdtsTemplate {
    object_type: u8,
    sample_rate_index: u8,
    channel_config: u8,
}

/// Prepends an ADTS header to every AAC frame.
///
/// The header fields come from the first AudioSpecificConfig seen; later
/// configs are ignored. Frames before it are dropped.
#[derive(Debug, Default)]
pub struct AdtsEncoder {
    template: Option<AdtsTemplate>,
}

impl AdtsEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_configured(&self) -> bool {
        self.template.is_some()
    }

    /// Returns the framed sample, or `None` for configs and dropped frames.
    pub fn push(&mut self, sample: &Sample) -> MuxResult<Option<Sample>> {
        if sample.is_config {
            if self.template.is_none() {
                let template = parse_audio_specific_config(&sample.payload)?;
                debug!(?template, "ADTS configured");
                self.template = Some(template);
            }
            return Ok(None);
        }

        let Some(template) = self.template else {
            trace!("Dropping AAC frame before AudioSpecificConfig");
            return Ok(None);
        };

        let header = match frame_header(template, sample.payload.len()) {
            Ok(header) => header,
            Err(e) => {
                error!("ADTS frame rejected: {}", e);
                return Err(e);
            }
        };
        let mut buf = BytesMut::with_capacity(ADTS_HEADER_SIZE + sample.payload.len());
        buf.put_slice(&header);
        buf.put_slice(&sample.payload);

        Ok(Some(Sample {
            payload: buf.freeze(),
            ..sample.clone()
        }))
    }
}

fn parse_audio_specific_config(config: &Bytes) -> MuxResult<AdtsTemplate> {
    let mut reader = BitReader::new(config);
    let object_type = reader.get_bits(5)?;
    let sample_rate_index = reader.get_bits(4)?;
    let channel_config = reader.get_bits(4)?;
    if !(1..=MAX_ADTS_OBJECT_TYPE).contains(&object_type) {
        return Err(MuxError::InvalidConfig(format!(
            "AAC object type {object_type} has no ADTS profile"
        )));
    }
    Ok(AdtsTemplate {
        object_type: (object_type - 1) as u8,
        sample_rate_index: sample_rate_index as u8,
        channel_config: channel_config as u8,
    })
}

fn frame_header(template: AdtsTemplate, payload_len: usize) -> MuxResult<Vec<u8>> {
    let full_frame_size = ADTS_HEADER_SIZE + payload_len;
    if full_frame_size > ADTS_MAX_FRAME_BYTES {
        return Err(MuxError::FrameTooLarge {
            size: full_frame_size,
            max: ADTS_MAX_FRAME_BYTES,
        });
    }

    let mut w = BitWriter::new();
    // adts_fixed_header
    w.put_bits(12, 0xFFF)?; // syncword
    w.put_bits(1, 0)?; // ID
    w.put_bits(2, 0)?; // layer
    w.put_bits(1, 1)?; // protection_absent
    w.put_bits(2, u64::from(template.object_type))?;
    w.put_bits(4, u64::from(template.sample_rate_index))?;
    w.put_bits(1, 0)?; // private_bit
    w.put_bits(3, u64::from(template.channel_config))?;
    w.put_bits(1, 0)?; // original_copy
    w.put_bits(1, 0)?; // home
    // adts_variable_header
    w.put_bits(1, 0)?;
    w.put_bits(1, 0)?;
    w.put_bits(13, full_frame_size as u64)?;
    w.put_bits(11, 0x7FF)?; // buffer fullness
    w.put_bits(2, 0)?; // one raw data block
    Ok(w.finish())
}
