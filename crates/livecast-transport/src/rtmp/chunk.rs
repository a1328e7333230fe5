//! RTMP chunk stream framing.
//!
//! Messages are split into chunks of the negotiated size. Each chunk starts
//! with a basic header (format + chunk stream id) followed by a message
//! header whose size depends on the format:
//!
//! | fmt | bytes | fields                                      |
//! |-----|-------|---------------------------------------------|
//! | 0   | 11    | timestamp, length, type id, message stream  |
//! | 1   | 7     | timestamp delta, length, type id            |
//! | 2   | 3     | timestamp delta                             |
//! | 3   | 0     | everything inherited                        |
//!
//! Timestamps at or above `0xFFFFFF` are carried in a 4-byte extended
//! field after the message header.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use livecast_codec::{put_be24, ByteReader, MAX_U24};
use thiserror::Error;

/// Chunk size both sides use until a SetChunkSize message.
pub const DEFAULT_CHUNK_SIZE: u32 = 128;

/// Largest chunk size a peer may announce.
pub const MAX_CHUNK_SIZE: u32 = 0x7FFF_FFFF;

/// Message type id of SetChunkSize.
pub const SET_CHUNK_SIZE_TYPE: u8 = 1;

/// Ids 0 and 1 select the longer basic header forms.
pub const MIN_CHUNK_STREAM_ID: u32 = 2;

/// Largest id a 3-byte basic header can carry.
pub const MAX_CHUNK_STREAM_ID: u32 = 65_599;

/// Chunk-level protocol violations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    /// A header referred to state of a chunk stream never seen before.
    #[error("no previous chunk for chunk stream {csid}")]
    MissingPreviousChunk { csid: u32 },

    /// The peer announced an unusable chunk size.
    #[error("invalid chunk size {0}")]
    InvalidChunkSize(u32),

    /// An outgoing message named a chunk stream id no basic header can encode.
    #[error("chunk stream id {0} outside 2..=65599")]
    InvalidChunkStreamId(u32),
}

/// One complete message on a chunk stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMessage {
    pub csid: u32,
    pub timestamp: u32,
    pub type_id: u8,
    pub message_stream_id: u32,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy)]
struct OutState {
    timestamp: u32,
    message_stream_id: u32,
}

/// Splits outgoing messages into chunks.
#[derive(Debug)]
pub struct ChunkWriter {
    chunk_size: u32,
    streams: HashMap<u32, OutState>,
}

impl Default for ChunkWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkWriter {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
        }
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Frame `message`. A SetChunkSize message is itself framed with the
    /// old size; later messages use the new one.
    pub fn write(&mut self, message: &ChunkMessage) -> Result<Bytes, ChunkError> {
        let csid = message.csid;
        if !(MIN_CHUNK_STREAM_ID..=MAX_CHUNK_STREAM_ID).contains(&csid) {
            return Err(ChunkError::InvalidChunkStreamId(csid));
        }
        let payload = &message.payload;
        let chunk_size = self.chunk_size as usize;
        let chunks = payload.len().div_ceil(chunk_size).max(1);
        let mut out = BytesMut::with_capacity(payload.len() + 18 + chunks * 5);

        let previous = self.streams.get(&csid).copied();
        let (fmt, time_field) = match previous {
            Some(prev)
                if prev.message_stream_id == message.message_stream_id
                    && message.timestamp >= prev.timestamp =>
            {
                (1u8, message.timestamp - prev.timestamp)
            }
            _ => (0u8, message.timestamp),
        };
        let extended = time_field >= MAX_U24;

        put_basic_header(&mut out, fmt, csid);
        put_be24(&mut out, time_field.min(MAX_U24));
        put_be24(&mut out, payload.len() as u32);
        out.put_u8(message.type_id);
        if fmt == 0 {
            out.put_u32_le(message.message_stream_id);
        }
        if extended {
            out.put_u32(time_field);
        }

        let mut offset = 0;
        loop {
            let end = (offset + chunk_size).min(payload.len());
            out.put_slice(&payload[offset..end]);
            offset = end;
            if offset >= payload.len() {
                break;
            }
            put_basic_header(&mut out, 3, csid);
            if extended {
                out.put_u32(time_field);
            }
        }

        self.streams.insert(
            csid,
            OutState {
                timestamp: message.timestamp,
                message_stream_id: message.message_stream_id,
            },
        );

        if message.type_id == SET_CHUNK_SIZE_TYPE && payload.len() >= 4 {
            let size = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
        }

        Ok(out.freeze())
    }
}

fn put_basic_header(out: &mut BytesMut, fmt: u8, csid: u32) {
    debug_assert!((MIN_CHUNK_STREAM_ID..=MAX_CHUNK_STREAM_ID).contains(&csid));
    let fmt = fmt << 6;
    match csid {
        2..=63 => out.put_u8(fmt | csid as u8),
        64..=319 => {
            out.put_u8(fmt);
            out.put_u8((csid - 64) as u8);
        }
        _ => {
            out.put_u8(fmt | 1);
            out.put_u16_le((csid - 64) as u16);
        }
    }
}

#[derive(Debug, Default)]
struct InState {
    timestamp: u32,
    delta: u32,
    length: u32,
    type_id: u8,
    message_stream_id: u32,
    extended: bool,
    partial: BytesMut,
    /// Assembled message must be dropped once complete.
    discard: bool,
}

/// Reassembles incoming chunks into messages.
///
/// Bytes are buffered until a whole chunk is available; a message is
/// returned only once all of its chunks arrived.
#[derive(Debug)]
pub struct ChunkReader {
    chunk_size: u32,
    buffer: BytesMut,
    streams: HashMap<u32, InState>,
}

impl Default for ChunkReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkReader {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer: BytesMut::new(),
            streams: HashMap::new(),
        }
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn set_chunk_size(&mut self, size: u32) -> Result<(), ChunkError> {
        if size == 0 || size > MAX_CHUNK_SIZE {
            return Err(ChunkError::InvalidChunkSize(size));
        }
        self.chunk_size = size;
        Ok(())
    }

    /// Drop the partially received message on `csid`.
    pub fn abort(&mut self, csid: u32) {
        if let Some(state) = self.streams.get_mut(&csid) {
            state.partial.clear();
            state.discard = false;
        }
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete message, if the buffered bytes contain one.
    ///
    /// A chunk referring to an unknown chunk stream yields
    /// [`ChunkError::MissingPreviousChunk`]; the offending message is
    /// dropped and reading can continue.
    pub fn next_message(&mut self) -> Option<Result<ChunkMessage, ChunkError>> {
        loop {
            match self.read_chunk()? {
                Ok(Some(message)) => return Some(Ok(message)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// Consume one chunk. `None` means more bytes are needed.
    fn read_chunk(&mut self) -> Option<Result<Option<ChunkMessage>, ChunkError>> {
        let chunk_size = self.chunk_size as usize;
        let mut r = ByteReader::new(&self.buffer);

        let first = r.read_u8().ok()?;
        let fmt = first >> 6;
        let csid = match first & 0x3F {
            0 => 64 + u32::from(r.read_u8().ok()?),
            1 => {
                let lo = u32::from(r.read_u8().ok()?);
                let hi = u32::from(r.read_u8().ok()?);
                64 + lo + (hi << 8)
            }
            id => u32::from(id),
        };

        let previous = self.streams.get(&csid);
        if fmt >= 2 && previous.is_none() {
            let header_len = r.position() + if fmt == 2 { 3 } else { 0 };
            if self.buffer.len() < header_len {
                return None;
            }
            self.buffer.advance(header_len);
            return Some(Err(ChunkError::MissingPreviousChunk { csid }));
        }

        let (time_field, header) = match fmt {
            0 => {
                let time = r.read_be24().ok()?;
                let length = r.read_be24().ok()?;
                let type_id = r.read_u8().ok()?;
                let msid = r.read_le32().ok()?;
                (Some(time), Some((length, type_id, Some(msid))))
            }
            1 => {
                let time = r.read_be24().ok()?;
                let length = r.read_be24().ok()?;
                let type_id = r.read_u8().ok()?;
                (Some(time), Some((length, type_id, None)))
            }
            2 => (Some(r.read_be24().ok()?), None),
            _ => (None, None),
        };

        let extended = match time_field {
            Some(time) => time == MAX_U24,
            None => previous.is_some_and(|s| s.extended),
        };
        let extended_value = if extended {
            Some(r.read_be32().ok()?)
        } else {
            None
        };
        let header_len = r.position();

        let partial_len = previous.map_or(0, |s| s.partial.len());
        let starting = fmt != 3 || partial_len == 0;
        let length = header
            .map(|(length, _, _)| length)
            .or(previous.map(|s| s.length))
            .unwrap_or(0) as usize;
        let received = if starting { 0 } else { partial_len };
        let take = length.saturating_sub(received).min(chunk_size);
        if self.buffer.len() < header_len + take {
            return None;
        }

        // The whole chunk is buffered: commit the header.
        let unknown = previous.is_none();
        self.buffer.advance(header_len);
        let state = self.streams.entry(csid).or_default();
        if starting {
            state.partial.clear();
            // A fmt 1 header on an unseen chunk stream lacks the message
            // stream id; the message is read and dropped.
            state.discard = fmt == 1 && unknown;
        }
        if let Some((length, type_id, msid)) = header {
            state.length = length;
            state.type_id = type_id;
            if let Some(msid) = msid {
                state.message_stream_id = msid;
            }
        }
        match time_field {
            Some(time) => {
                let value = extended_value.unwrap_or(time);
                state.extended = extended;
                state.delta = value;
                state.timestamp = if fmt == 0 {
                    value
                } else {
                    state.timestamp.wrapping_add(value)
                };
            }
            None if starting => {
                state.timestamp = state.timestamp.wrapping_add(state.delta);
            }
            None => {}
        }

        state.partial.extend_from_slice(&self.buffer[..take]);
        self.buffer.advance(take);

        if state.partial.len() < state.length as usize {
            return Some(Ok(None));
        }

        let payload = std::mem::take(&mut state.partial).freeze();
        if std::mem::take(&mut state.discard) {
            self.streams.remove(&csid);
            return Some(Err(ChunkError::MissingPreviousChunk { csid }));
        }
        Some(Ok(Some(ChunkMessage {
            csid,
            timestamp: state.timestamp,
            type_id: state.type_id,
            message_stream_id: state.message_stream_id,
            payload,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(csid: u32, timestamp: u32, len: usize) -> ChunkMessage {
        ChunkMessage {
            csid,
            timestamp,
            type_id: 9,
            message_stream_id: 1,
            payload: Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>()),
        }
    }

    fn read_all(reader: &mut ChunkReader) -> Vec<Result<ChunkMessage, ChunkError>> {
        std::iter::from_fn(|| reader.next_message()).collect()
    }

    #[test]
    fn test_split_and_reassemble() {
        for (len, chunk_size) in [(0usize, 128u32), (1, 128), (128, 128), (129, 128), (5000, 128), (5000, 4096)] {
            let mut writer = ChunkWriter::new();
            let mut reader = ChunkReader::new();
            if chunk_size != DEFAULT_CHUNK_SIZE {
                let set = ChunkMessage {
                    csid: 2,
                    timestamp: 0,
                    type_id: SET_CHUNK_SIZE_TYPE,
                    message_stream_id: 0,
                    payload: Bytes::copy_from_slice(&chunk_size.to_be_bytes()),
                };
                reader.feed(&writer.write(&set).unwrap());
                let received = reader.next_message().unwrap().unwrap();
                assert_eq!(received.type_id, SET_CHUNK_SIZE_TYPE);
                reader.set_chunk_size(chunk_size).unwrap();
            }

            let msg = message(7, 40, len);
            let wire = writer.write(&msg).unwrap();
            let chunks = len.div_ceil(chunk_size as usize).max(1);
            // 12-byte first header plus one byte per continuation chunk.
            assert_eq!(wire.len(), 12 + len + (chunks - 1));

            reader.feed(&wire);
            let received = reader.next_message().unwrap().unwrap();
            assert_eq!(received, msg);
            assert!(reader.next_message().is_none());
        }
    }

    #[test]
    fn test_second_message_uses_type1_delta() {
        let mut writer = ChunkWriter::new();
        let first = writer.write(&message(8, 100, 10)).unwrap();
        assert_eq!(first[0], 0x08);
        let second = writer.write(&message(8, 123, 10)).unwrap();
        assert_eq!(second[0], 0x40 | 0x08);
        assert_eq!(&second[1..4], &[0, 0, 23]);
        assert_eq!(second.len(), 8 + 10);

        let mut reader = ChunkReader::new();
        reader.feed(&first);
        reader.feed(&second);
        let messages = read_all(&mut reader);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].as_ref().unwrap().timestamp, 123);
        assert_eq!(messages[1].as_ref().unwrap().message_stream_id, 1);
    }

    #[test]
    fn test_type0_when_timestamp_goes_back_or_stream_changes() {
        let mut writer = ChunkWriter::new();
        writer.write(&message(7, 100, 4)).unwrap();
        assert_eq!(writer.write(&message(7, 50, 4)).unwrap()[0] >> 6, 0);

        let mut other_stream = message(7, 60, 4);
        other_stream.message_stream_id = 2;
        assert_eq!(writer.write(&other_stream).unwrap()[0] >> 6, 0);
    }

    #[test]
    fn test_extended_timestamp() {
        let mut writer = ChunkWriter::new();
        let msg = message(6, 0x0123_4567, 300);
        let wire = writer.write(&msg).unwrap();
        assert_eq!(&wire[1..4], &[0xFF, 0xFF, 0xFF]);
        assert_eq!(&wire[12..16], &0x0123_4567u32.to_be_bytes());

        let mut reader = ChunkReader::new();
        reader.feed(&wire);
        assert_eq!(reader.next_message().unwrap().unwrap(), msg);
    }

    #[test]
    fn test_partial_message_not_dispatched() {
        let mut writer = ChunkWriter::new();
        let msg = message(7, 0, 1000);
        let wire = writer.write(&msg).unwrap();

        let mut reader = ChunkReader::new();
        for byte in wire.iter().take(wire.len() - 1) {
            reader.feed(&[*byte]);
            assert!(reader.next_message().is_none());
        }
        reader.feed(&wire[wire.len() - 1..]);
        assert_eq!(reader.next_message().unwrap().unwrap(), msg);
    }

    #[test]
    fn test_missing_previous_chunk_is_per_message() {
        let mut reader = ChunkReader::new();
        // fmt 1 on an unseen chunk stream, 3-byte payload.
        reader.feed(&[0x45, 0, 0, 0, 0, 0, 3, 20, 1, 2, 3]);
        // Followed by a valid fmt 0 message on another stream.
        let mut writer = ChunkWriter::new();
        let msg = message(3, 0, 5);
        reader.feed(&writer.write(&msg).unwrap());

        let results = read_all(&mut reader);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], Err(ChunkError::MissingPreviousChunk { csid: 5 }));
        assert_eq!(results[1], Ok(msg));
    }

    #[test]
    fn test_two_byte_chunk_stream_id() {
        let mut writer = ChunkWriter::new();
        let msg = message(100, 0, 300);
        let wire = writer.write(&msg).unwrap();
        assert_eq!(&wire[..2], &[0x00, 36]);

        let mut reader = ChunkReader::new();
        reader.feed(&wire);
        assert_eq!(reader.next_message().unwrap().unwrap(), msg);
    }

    #[test]
    fn test_abort_discards_partial() {
        let mut writer = ChunkWriter::new();
        let wire = writer.write(&message(7, 0, 200)).unwrap();
        let mut reader = ChunkReader::new();
        reader.feed(&wire[..12 + 128]);
        assert!(reader.next_message().is_none());
        reader.abort(7);

        let next = message(7, 10, 4);
        reader.feed(&writer.write(&next).unwrap());
        let received = reader.next_message().unwrap().unwrap();
        assert_eq!(received.payload, next.payload);
    }

    #[test]
    fn test_invalid_chunk_size_rejected() {
        let mut reader = ChunkReader::new();
        assert_eq!(reader.set_chunk_size(0), Err(ChunkError::InvalidChunkSize(0)));
        assert!(reader.set_chunk_size(4096).is_ok());
        assert_eq!(reader.chunk_size(), 4096);
    }

    #[test]
    fn test_reserved_chunk_stream_id_rejected() {
        let mut writer = ChunkWriter::new();
        for csid in [0, 1, MAX_CHUNK_STREAM_ID + 1] {
            assert_eq!(
                writer.write(&message(csid, 0, 4)),
                Err(ChunkError::InvalidChunkStreamId(csid))
            );
        }
        // A rejected message leaves no per-stream state behind.
        assert!(writer.streams.is_empty());
    }

    #[test]
    fn test_basic_header_forms_round_trip() {
        for csid in [2, 63, 64, 319, 320, MAX_CHUNK_STREAM_ID] {
            let mut writer = ChunkWriter::new();
            let mut reader = ChunkReader::new();
            reader.feed(&writer.write(&message(csid, 0, 10)).unwrap());
            let received = reader.next_message().unwrap().unwrap();
            assert_eq!(received.csid, csid);
        }
    }
}
