//! H.264 NAL unit framing.
//!
//! Encoders hand out access units in one of two layouts:
//! - **Annex B**: NAL units separated by `00 00 01` / `00 00 00 01` start
//!   codes. MPEG-TS carries this layout.
//! - **AVCC**: every NAL unit prefixed by its big-endian length. FLV/RTMP
//!   carries this layout, with the parameter sets moved out into an
//!   `AVCDecoderConfigurationRecord`.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::{ByteReader, CodecError, CodecResult};

/// Annex B start code used when writing.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Access unit delimiter NAL with `primary_pic_type` 7 (any slice type).
pub const ACCESS_UNIT_DELIMITER: [u8; 2] = [0x09, 0xF0];

/// H.264 NAL unit types the core cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NalUnitType {
    NonIdrSlice = 1,
    IdrSlice = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    Aud = 9,
    Other = 0,
}

impl From<u8> for NalUnitType {
    fn from(byte: u8) -> Self {
        match byte & 0x1F {
            1 => NalUnitType::NonIdrSlice,
            5 => NalUnitType::IdrSlice,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            9 => NalUnitType::Aud,
            _ => NalUnitType::Other,
        }
    }
}

/// One NAL unit, header byte included, start code or length excluded.
#[derive(Debug, Clone)]
pub struct NalUnit {
    pub nal_type: NalUnitType,
    pub data: Bytes,
}

impl NalUnit {
    pub fn new(data: Bytes) -> Option<Self> {
        let header = *data.first()?;
        Some(Self {
            nal_type: NalUnitType::from(header),
            data,
        })
    }

    pub fn is_parameter_set(&self) -> bool {
        matches!(self.nal_type, NalUnitType::Sps | NalUnitType::Pps)
    }
}

/// Position and length of the start code at or after `from`.
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, 3));
            }
            if i + 4 <= data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

/// Split an Annex B byte stream into NAL units. Bytes before the first
/// start code are ignored.
pub fn parse_annex_b(data: &[u8]) -> Vec<NalUnit> {
    let mut nals = Vec::new();
    let Some((first, len)) = find_start_code(data, 0) else {
        return nals;
    };

    let mut start = first + len;
    loop {
        let next = find_start_code(data, start);
        let end = next.map_or(data.len(), |(pos, _)| pos);
        if let Some(nal) = NalUnit::new(Bytes::copy_from_slice(&data[start..end])) {
            nals.push(nal);
        }
        match next {
            Some((pos, len)) => start = pos + len,
            None => break,
        }
    }

    nals
}

/// Split an AVCC access unit whose NAL lengths are `length_size` bytes.
pub fn parse_avcc(data: &Bytes, length_size: usize) -> CodecResult<Vec<NalUnit>> {
    let mut nals = Vec::new();
    let mut reader = ByteReader::new(data);

    while reader.remaining() > 0 {
        let length = match length_size {
            1 => usize::from(reader.read_u8()?),
            2 => usize::from(reader.read_be16()?),
            3 => reader.read_be24()? as usize,
            _ => reader.read_be32()? as usize,
        };
        if length > reader.remaining() {
            return Err(CodecError::TruncatedNal {
                length,
                remaining: reader.remaining(),
            });
        }
        let start = reader.position();
        reader.read_bytes(length)?;
        if let Some(nal) = NalUnit::new(data.slice(start..start + length)) {
            nals.push(nal);
        }
    }

    Ok(nals)
}

/// Write NAL units with 4-byte length prefixes.
pub fn nals_to_avcc(nals: &[NalUnit]) -> Bytes {
    let mut buf = BytesMut::with_capacity(nals.iter().map(|n| n.data.len() + 4).sum());
    for nal in nals {
        buf.put_u32(nal.data.len() as u32);
        buf.put_slice(&nal.data);
    }
    buf.freeze()
}

/// Write NAL units with 4-byte start codes.
pub fn nals_to_annex_b(nals: &[NalUnit]) -> Bytes {
    let mut buf = BytesMut::with_capacity(nals.iter().map(|n| n.data.len() + 4).sum());
    for nal in nals {
        buf.put_slice(&START_CODE);
        buf.put_slice(&nal.data);
    }
    buf.freeze()
}

/// First SPS and first PPS among `nals`.
pub fn extract_sps_pps(nals: &[NalUnit]) -> Option<(Bytes, Bytes)> {
    let sps = nals.iter().find(|n| n.nal_type == NalUnitType::Sps)?;
    let pps = nals.iter().find(|n| n.nal_type == NalUnitType::Pps)?;
    Some((sps.data.clone(), pps.data.clone()))
}

/// Drop parameter sets and delimiters; they travel out of band in FLV.
pub fn filter_parameter_sets(nals: Vec<NalUnit>) -> Vec<NalUnit> {
    nals.into_iter()
        .filter(|nal| {
            !matches!(
                nal.nal_type,
                NalUnitType::Sps | NalUnitType::Pps | NalUnitType::Aud
            )
        })
        .collect()
}

/// Build an `AVCDecoderConfigurationRecord` (ISO 14496-15) with 4-byte
/// NAL lengths and a single SPS and PPS.
pub fn build_avc_decoder_config(sps: &[u8], pps: &[u8]) -> CodecResult<Bytes> {
    if sps.len() < 4 {
        return Err(CodecError::InvalidAvcConfig(format!(
            "SPS too short: {} bytes",
            sps.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(11 + sps.len() + pps.len());
    buf.put_u8(0x01);
    // profile_idc, constraint flags, level_idc
    buf.put_slice(&sps[1..4]);
    buf.put_u8(0xFF);
    buf.put_u8(0xE1);
    buf.put_u16(sps.len() as u16);
    buf.put_slice(sps);
    buf.put_u8(0x01);
    buf.put_u16(pps.len() as u16);
    buf.put_slice(pps);

    debug!(
        sps_len = sps.len(),
        pps_len = pps.len(),
        total_len = buf.len(),
        "Built AVC decoder configuration record"
    );
    Ok(buf.freeze())
}

fn read_parameter_sets(
    data: &Bytes,
    reader: &mut ByteReader<'_>,
    count: usize,
) -> CodecResult<Vec<Bytes>> {
    let mut sets = Vec::with_capacity(count);
    for _ in 0..count {
        let len = usize::from(reader.read_be16()?);
        let start = reader.position();
        reader.read_bytes(len)?;
        sets.push(data.slice(start..start + len));
    }
    Ok(sets)
}

/// Contents of an `AVCDecoderConfigurationRecord`.
#[derive(Debug, Clone, Default)]
pub struct AvcDecoderConfig {
    /// Size of the NAL length prefix in access units (1, 2 or 4).
    pub length_size: usize,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl AvcDecoderConfig {
    pub fn parse(data: &Bytes) -> CodecResult<Self> {
        let mut reader = ByteReader::new(data);
        let version = reader.read_u8()?;
        if version != 1 {
            return Err(CodecError::InvalidAvcConfig(format!(
                "unsupported version {}",
                version
            )));
        }
        reader.read_bytes(3)?;
        let length_size = usize::from(reader.read_u8()? & 0x03) + 1;
        if length_size == 3 {
            return Err(CodecError::InvalidAvcConfig(
                "3-byte NAL lengths".to_string(),
            ));
        }

        let sps_count = usize::from(reader.read_u8()? & 0x1F);
        let sps = read_parameter_sets(data, &mut reader, sps_count)?;
        let pps_count = usize::from(reader.read_u8()?);
        let pps = read_parameter_sets(data, &mut reader, pps_count)?;

        Ok(Self {
            length_size,
            sps,
            pps,
        })
    }

    /// Parameter sets in Annex B form, SPS first.
    pub fn to_annex_b(&self) -> Bytes {
        let mut buf = BytesMut::new();
        for set in self.sps.iter().chain(self.pps.iter()) {
            buf.put_slice(&START_CODE);
            buf.put_slice(set);
        }
        buf.freeze()
    }
}
