//! Program clock reference encoding and clock-only packets.

use crate::TS_PACKET_SIZE;

/// PCR ticks per second.
pub const PCR_TIME_BASE: i64 = 27_000_000;

/// PID of null packets.
pub const NULL_PID: u16 = 0x1FFF;

/// Microseconds to 27 MHz ticks.
pub fn us_to_pcr(us: i64) -> i64 {
    us * (PCR_TIME_BASE / 1_000_000)
}

/// 27 MHz ticks to microseconds.
pub fn pcr_to_us(pcr: i64) -> i64 {
    pcr.div_euclid(PCR_TIME_BASE / 1_000_000)
}

/// 33-bit base, 6 reserved bits, 9-bit extension.
pub fn pcr_bits(pcr: i64) -> [u8; 6] {
    let pcr = pcr.max(0);
    let low = pcr % 300;
    let high = pcr / 300;
    [
        (high >> 25) as u8,
        (high >> 17) as u8,
        (high >> 9) as u8,
        (high >> 1) as u8,
        ((high << 7) | (low >> 8) | 0x7E) as u8,
        low as u8,
    ]
}

/// Decode six PCR bytes back to 27 MHz ticks.
pub fn parse_pcr(bytes: &[u8]) -> Option<i64> {
    let b = bytes.get(..6)?;
    let high = (i64::from(b[0]) << 25)
        | (i64::from(b[1]) << 17)
        | (i64::from(b[2]) << 9)
        | (i64::from(b[3]) << 1)
        | (i64::from(b[4]) >> 7);
    let low = (i64::from(b[4] & 0x01) << 8) | i64::from(b[5]);
    Some(high * 300 + low)
}

/// A stuffing packet on the null PID.
pub fn null_packet() -> [u8; TS_PACKET_SIZE] {
    let mut packet = [0xFF; TS_PACKET_SIZE];
    packet[..4].copy_from_slice(&[0x47, 0x1F, 0xFF, 0x10]);
    packet
}

/// An adaptation-only packet carrying a PCR. The continuity counter is
/// repeated, not incremented, since there is no payload.
pub fn pcr_only_packet(pid: u16, cc: u8, discontinuity: bool, pcr: i64) -> [u8; TS_PACKET_SIZE] {
    let mut packet = [0xFF; TS_PACKET_SIZE];
    packet[0] = 0x47;
    packet[1] = (pid >> 8) as u8 & 0x1F;
    packet[2] = pid as u8;
    packet[3] = 0x20 | (cc & 0x0F);
    packet[4] = (TS_PACKET_SIZE - 5) as u8;
    packet[5] = 0x10;
    if discontinuity {
        packet[5] |= 0x80;
    }
    packet[6..12].copy_from_slice(&pcr_bits(pcr));
    packet
}
