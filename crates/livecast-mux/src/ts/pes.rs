//! PES headers and payload-bearing transport packets.

use crate::TS_PACKET_SIZE;

pub const VIDEO_STREAM_ID: u8 = 0xE0;
pub const AUDIO_STREAM_ID: u8 = 0xC0;

/// Adaptation field flags.
pub const AF_DISCONTINUITY: u8 = 0x80;
pub const AF_RANDOM_ACCESS: u8 = 0x40;
pub const AF_PCR: u8 = 0x10;

/// Microseconds to 90 kHz ticks.
pub fn us_to_90khz(us: i64) -> i64 {
    (us * 9).div_euclid(100)
}

/// Write a 33-bit timestamp in the 5-byte PES form.
fn put_timestamp(buf: &mut Vec<u8>, prefix: u8, ts: i64) {
    let ts = ts & 0x1_FFFF_FFFF;
    buf.push((prefix << 4) | ((((ts >> 30) & 0x07) << 1) as u8) | 1);
    let mid = (((ts >> 15) & 0x7FFF) << 1) | 1;
    buf.extend_from_slice(&(mid as u16).to_be_bytes());
    let low = ((ts & 0x7FFF) << 1) | 1;
    buf.extend_from_slice(&(low as u16).to_be_bytes());
}

/// PES header for a payload of `payload_len` bytes. Timestamps are 90 kHz;
/// DTS is written only when it differs from PTS.
pub fn pes_header(
    stream_id: u8,
    payload_len: usize,
    pts: i64,
    dts: i64,
    omit_length: bool,
) -> Vec<u8> {
    let with_dts = dts != pts;
    let mut header_len = 5u8;
    let mut flags = 0x80u8;
    if with_dts {
        header_len += 5;
        flags |= 0x40;
    }

    let mut len = payload_len + usize::from(header_len) + 3;
    if len > 0xFFFF || omit_length {
        len = 0;
    }

    let mut buf = Vec::with_capacity(19);
    buf.extend_from_slice(&[0x00, 0x00, 0x01, stream_id]);
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    buf.push(0x80);
    buf.push(flags);
    buf.push(header_len);
    put_timestamp(&mut buf, flags >> 6, pts);
    if with_dts {
        put_timestamp(&mut buf, 1, dts);
    }
    buf
}

/// Build one transport packet.
///
/// `adaptation` is the adaptation field body (flags byte first) if one is
/// needed. As much of `payload` as fits is copied; the rest of the packet
/// is filled with adaptation-field stuffing. Returns the packet and the
/// number of payload bytes it carries.
pub fn payload_packet(
    pid: u16,
    cc: u8,
    unit_start: bool,
    adaptation: Option<Vec<u8>>,
    pes_header: &[u8],
    payload: &[u8],
) -> ([u8; TS_PACKET_SIZE], usize) {
    let mut adaptation = adaptation;
    let af_len = adaptation.as_ref().map_or(0, |body| 1 + body.len());
    let header_len = 4 + af_len + pes_header.len();
    let len = (TS_PACKET_SIZE - header_len).min(payload.len());
    let stuffing = TS_PACKET_SIZE - header_len - len;

    if stuffing > 0 {
        match adaptation.as_mut() {
            Some(body) => body.resize(body.len() + stuffing, 0xFF),
            None => {
                // A lone length byte covers one byte of stuffing.
                let mut body = Vec::with_capacity(stuffing);
                if stuffing > 1 {
                    body.push(0x00);
                    body.resize(stuffing - 1, 0xFF);
                }
                adaptation = Some(body);
            }
        }
    }

    let mut packet = [0xFF; TS_PACKET_SIZE];
    packet[0] = 0x47;
    packet[1] = ((pid >> 8) as u8 & 0x1F) | if unit_start { 0x40 } else { 0 };
    packet[2] = pid as u8;
    packet[3] = 0x10 | (cc & 0x0F);

    let mut pos = 4;
    if let Some(body) = &adaptation {
        packet[3] |= 0x20;
        packet[pos] = body.len() as u8;
        packet[pos + 1..pos + 1 + body.len()].copy_from_slice(body);
        pos += 1 + body.len();
    }
    packet[pos..pos + pes_header.len()].copy_from_slice(pes_header);
    pos += pes_header.len();
    packet[pos..pos + len].copy_from_slice(&payload[..len]);
    debug_assert_eq!(pos + len, TS_PACKET_SIZE);

    (packet, len)
}
