//! PSI/SI tables: PAT, PMT and SDT sections and their packetization.

use bytes::BufMut;
use livecast_codec::crc32_mpeg2;
use tracing::warn;

use crate::{MuxError, MuxResult, TS_PACKET_SIZE};

pub const PAT_PID: u16 = 0x0000;
pub const SDT_PID: u16 = 0x0011;

pub const PAT_TID: u8 = 0x00;
pub const PMT_TID: u8 = 0x02;
pub const SDT_TID: u8 = 0x42;

/// ETSI EN 300 468 service type for digital television.
pub const SERVICE_TYPE_DIGITAL_TV: u8 = 0x01;

/// Largest section including header and CRC.
const MAX_SECTION_SIZE: usize = 1024;

/// Usable section length (12-bit field, top 2 bits zero).
const SECTION_LENGTH: usize = 1020;

/// Stream entries stop once the PMT body gets this close to the limit.
const PMT_ENTRY_HEADROOM: usize = 32;

/// A table carried on one PID, with its own continuity counter.
#[derive(Debug)]
pub struct Section {
    pid: u16,
    cc: u8,
    discontinuity: bool,
}

impl Section {
    /// The counter starts at 15 so the first packet carries 0.
    pub fn new(pid: u16, discontinuity: bool) -> Self {
        Self {
            pid,
            cc: 15,
            discontinuity,
        }
    }

    pub fn pid(&self) -> u16 {
        self.pid
    }

    /// Build a long-form section around `body` and split it into packets.
    pub fn packets(
        &mut self,
        table_id: u8,
        id: u16,
        version: u8,
        body: &[u8],
    ) -> MuxResult<Vec<[u8; TS_PACKET_SIZE]>> {
        let section = build_section(table_id, id, version, 0, 0, body)?;
        Ok(self.packetize(&section))
    }

    fn packetize(&mut self, section: &[u8]) -> Vec<[u8; TS_PACKET_SIZE]> {
        let mut packets = Vec::new();
        let mut offset = 0;

        while offset < section.len() {
            let first = offset == 0;
            let mut packet = Vec::with_capacity(TS_PACKET_SIZE);
            packet.push(0x47);
            let mut b = (self.pid >> 8) as u8;
            if first {
                b |= 0x40;
            }
            packet.push(b);
            packet.push(self.pid as u8);
            self.cc = (self.cc + 1) & 0x0F;
            packet.push(0x10 | self.cc);
            if self.discontinuity {
                packet[3] |= 0x20;
                packet.extend_from_slice(&[0x01, 0x80]);
                self.discontinuity = false;
            }
            if first {
                // pointer_field
                packet.push(0x00);
            }

            let len = (TS_PACKET_SIZE - packet.len()).min(section.len() - offset);
            packet.extend_from_slice(&section[offset..offset + len]);
            packet.resize(TS_PACKET_SIZE, 0xFF);
            offset += len;

            let mut out = [0xFF; TS_PACKET_SIZE];
            out.copy_from_slice(&packet);
            packets.push(out);
        }
        packets
    }
}

/// Wrap `body` in a section header and append the CRC.
pub fn build_section(
    table_id: u8,
    id: u16,
    version: u8,
    section_number: u8,
    last_section_number: u8,
    body: &[u8],
) -> MuxResult<Vec<u8>> {
    let total = 3 + 5 + body.len() + 4;
    if total > MAX_SECTION_SIZE {
        return Err(MuxError::SectionTooLarge(total));
    }

    // reserved_future_use must be 1 in the SDT.
    let flags: u16 = if table_id == SDT_TID { 0xF000 } else { 0xB000 };

    let mut section = Vec::with_capacity(total);
    section.put_u8(table_id);
    section.put_u16(flags | (body.len() + 5 + 4) as u16);
    section.put_u16(id);
    section.put_u8(0xC1 | ((version & 0x1F) << 1));
    section.put_u8(section_number);
    section.put_u8(last_section_number);
    section.put_slice(body);
    section.put_u32(crc32_mpeg2(&section));
    Ok(section)
}

/// PAT body for a single program.
pub fn pat_body(service_id: u16, pmt_pid: u16) -> Vec<u8> {
    let mut body = Vec::with_capacity(4);
    body.put_u16(service_id);
    body.put_u16(0xE000 | pmt_pid);
    body
}

/// PMT body: PCR PID followed by `(stream_type, pid)` entries.
pub fn pmt_body(pcr_pid: u16, streams: &[(u8, u16)]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + streams.len() * 5);
    body.put_u16(0xE000 | pcr_pid);
    // program_info_length = 0
    body.put_u16(0xF000);

    for (index, &(stream_type, pid)) in streams.iter().enumerate() {
        if body.len() > SECTION_LENGTH - PMT_ENTRY_HEADROOM {
            warn!(
                stream = index,
                "PMT section cannot fit this stream and all following streams"
            );
            break;
        }
        body.put_u8(stream_type);
        body.put_u16(0xE000 | pid);
        // ES_info_length = 0
        body.put_u16(0xF000);
    }
    body
}

/// SDT body describing one running service.
pub fn sdt_body(
    original_network_id: u16,
    service_id: u16,
    service_type: u8,
    provider_name: &str,
    service_name: &str,
) -> Vec<u8> {
    let mut body = Vec::with_capacity(32 + provider_name.len() + service_name.len());
    body.put_u16(original_network_id);
    body.put_u8(0xFF);
    body.put_u16(service_id);
    // No EIT information.
    body.put_u8(0xFC);

    let loop_len_at = body.len();
    body.put_u16(0);

    // service_descriptor
    body.put_u8(0x48);
    let desc_len_at = body.len();
    body.put_u8(0);
    body.put_u8(service_type);
    put_str8(&mut body, provider_name);
    put_str8(&mut body, service_name);
    body[desc_len_at] = (body.len() - desc_len_at - 1) as u8;

    let running_status: u16 = 4;
    let free_ca_mode: u16 = 0;
    let loop_len = (body.len() - loop_len_at - 2) as u16;
    let val = (running_status << 13) | (free_ca_mode << 12) | loop_len;
    body[loop_len_at..loop_len_at + 2].copy_from_slice(&val.to_be_bytes());
    body
}

/// Length-prefixed string, cut at 255 bytes.
fn put_str8(buf: &mut Vec<u8>, s: &str) {
    let bytes = &s.as_bytes()[..s.len().min(u8::MAX as usize)];
    buf.put_u8(bytes.len() as u8);
    buf.put_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_crc_checks_out() {
        let section = build_section(PAT_TID, 1, 0, 0, 0, &pat_body(1, 0x1000)).unwrap();
        assert_eq!(
            section[..8],
            [0x00, 0xB0, 0x0D, 0x00, 0x01, 0xC1, 0x00, 0x00]
        );
        assert_eq!(section[8..12], [0x00, 0x01, 0xF0, 0x00]);
        // Running the CRC over data plus its CRC yields zero.
        assert_eq!(crc32_mpeg2(&section), 0);
    }

    #[test]
    fn test_sdt_flags_and_descriptor() {
        let body = sdt_body(0xFF01, 1, SERVICE_TYPE_DIGITAL_TV, "livecast", "Service01");
        let section = build_section(SDT_TID, 1, 0, 0, 0, &body).unwrap();
        assert_eq!(section[1] & 0xF0, 0xF0);

        assert_eq!(&body[..3], &[0xFF, 0x01, 0xFF]);
        // descriptor loop: running, not scrambled
        let loop_len = u16::from_be_bytes([body[6], body[7]]);
        assert_eq!(loop_len >> 13, 4);
        assert_eq!(usize::from(loop_len & 0x0FFF), body.len() - 8);
        assert_eq!(body[8], 0x48);
        assert_eq!(body[11], 8);
        assert_eq!(&body[12..20], b"livecast");
        assert_eq!(body[20], 9);
        assert_eq!(&body[21..30], b"Service01");
    }

    #[test]
    fn test_pmt_lists_streams() {
        let body = pmt_body(0x100, &[(0x1B, 0x100), (0x0F, 0x101)]);
        assert_eq!(
            body,
            vec![0xE1, 0x00, 0xF0, 0x00, 0x1B, 0xE1, 0x00, 0xF0, 0x00, 0x0F, 0xE1, 0x01, 0xF0, 0x00]
        );
    }

    #[test]
    fn test_packetize_counters_and_pointer() {
        let mut section = Section::new(PAT_PID, false);
        let packets = section.packets(PAT_TID, 1, 0, &pat_body(1, 0x1000)).unwrap();
        assert_eq!(packets.len(), 1);
        let p = &packets[0];
        assert_eq!(&p[..5], &[0x47, 0x40, 0x00, 0x10, 0x00]);
        assert!(p[5 + 16..].iter().all(|&b| b == 0xFF));

        let again = section.packets(PAT_TID, 1, 0, &pat_body(1, 0x1000)).unwrap();
        assert_eq!(again[0][3] & 0x0F, 1);
    }

    #[test]
    fn test_long_section_spans_packets() {
        let mut section = Section::new(0x1000, true);
        let packets = section
            .packets(PMT_TID, 1, 0, &vec![0xAB; 400])
            .unwrap();
        assert_eq!(packets.len(), 3);
        // Only the first packet starts the unit and carries a pointer field.
        assert_eq!(packets[0][1] & 0x40, 0x40);
        assert_eq!(packets[1][1] & 0x40, 0);
        // Discontinuity adaptation field on the first packet only.
        assert_eq!(&packets[0][3..7], &[0x30, 0x01, 0x80, 0x00]);
        assert_eq!(packets[1][3], 0x11);
        assert_eq!(packets[2][3], 0x12);
    }

    #[test]
    fn test_oversized_section_rejected() {
        assert!(matches!(
            build_section(PMT_TID, 1, 0, 0, 0, &[0; 1020]),
            Err(MuxError::SectionTooLarge(_))
        ));
    }
}
