//! MSB-first bit packing.

use crate::{CodecError, CodecResult};

/// Accumulates fields of arbitrary bit width into bytes.
#[derive(Debug, Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    acc: u64,
    filled: u32,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the low `bits` bits of `value`.
    pub fn put_bits(&mut self, bits: u32, value: u64) -> CodecResult<()> {
        debug_assert!(bits <= 32);
        if bits < 64 && value >> bits != 0 {
            return Err(CodecError::ValueOutOfRange { value, bits });
        }
        self.acc = (self.acc << bits) | value;
        self.filled += bits;
        while self.filled >= 8 {
            self.filled -= 8;
            self.bytes.push((self.acc >> self.filled) as u8);
        }
        self.acc &= (1u64 << self.filled) - 1;
        Ok(())
    }

    /// Pad the last partial byte with zeros and return the buffer.
    pub fn finish(mut self) -> Vec<u8> {
        if self.filled > 0 {
            self.bytes.push((self.acc << (8 - self.filled)) as u8);
        }
        self.bytes
    }
}

/// Reads fields of arbitrary bit width from a byte slice.
#[derive(Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, bit_pos: 0 }
    }

    /// Read the next `bits` bits (at most 32).
    pub fn get_bits(&mut self, bits: u32) -> CodecResult<u32> {
        debug_assert!(bits <= 32);
        let end = self.bit_pos + bits as usize;
        if end > self.data.len() * 8 {
            return Err(CodecError::UnexpectedEof {
                needed: end.div_ceil(8),
                remaining: self.data.len(),
            });
        }
        let mut value = 0u32;
        for _ in 0..bits {
            let byte = self.data[self.bit_pos / 8];
            let bit = (byte >> (7 - (self.bit_pos % 8))) & 1;
            value = (value << 1) | u32::from(bit);
            self.bit_pos += 1;
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_packs_msb_first() {
        let mut w = BitWriter::new();
        w.put_bits(12, 0xFFF).unwrap();
        w.put_bits(1, 0).unwrap();
        w.put_bits(2, 0).unwrap();
        w.put_bits(1, 1).unwrap();
        assert_eq!(w.finish(), vec![0xFF, 0xF1]);
    }

    #[test]
    fn test_writer_rejects_wide_value() {
        let mut w = BitWriter::new();
        assert!(w.put_bits(4, 0x10).is_err());
    }

    #[test]
    fn test_writer_pads_partial_byte() {
        let mut w = BitWriter::new();
        w.put_bits(3, 0b101).unwrap();
        assert_eq!(w.finish(), vec![0b1010_0000]);
    }

    #[test]
    fn test_reader_reads_back() {
        // AudioSpecificConfig for AAC-LC, 44.1 kHz, stereo.
        let mut r = BitReader::new(&[0x12, 0x10]);
        assert_eq!(r.get_bits(5).unwrap(), 2);
        assert_eq!(r.get_bits(4).unwrap(), 4);
        assert_eq!(r.get_bits(4).unwrap(), 2);
        assert!(r.get_bits(4).is_err());
    }
}
