//! Outbound message queue between the session and the socket writer.
//!
//! Messages are framed into chunks only when the writer dequeues them, so
//! anything dropped here never reaches the chunk writer's header state.

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::chunk::ChunkMessage;
use super::flv::{AUDIO_MESSAGE_TYPE, VIDEO_MESSAGE_TYPE};

/// What the writer puts on the wire.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Pre-framed bytes (handshake).
    Raw(Bytes),

    /// An RTMP message, chunked at write time.
    Message {
        message: ChunkMessage,
        is_keyframe: bool,

        /// AVC or AAC decoder configuration; survives buffer clearing.
        is_sequence_header: bool,
    },
}

impl Outbound {
    pub fn len(&self) -> usize {
        match self {
            Self::Raw(bytes) => bytes.len(),
            Self::Message { message, .. } => message.payload.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_media(&self) -> bool {
        matches!(
            self,
            Self::Message { message, .. }
                if message.type_id == AUDIO_MESSAGE_TYPE || message.type_id == VIDEO_MESSAGE_TYPE
        )
    }

    fn is_keyframe(&self) -> bool {
        matches!(self, Self::Message { is_keyframe: true, .. })
    }

    /// Media that may be discarded to catch up.
    fn is_droppable(&self) -> bool {
        self.is_media() && !matches!(self, Self::Message { is_sequence_header: true, .. })
    }
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    item: Outbound,
}

#[derive(Debug, Default)]
struct Inner {
    entries: VecDeque<Entry>,
    buffered: usize,
    next_seq: u64,

    /// Media queued before this sequence number is dropped on dequeue.
    clearing_from: Option<u64>,

    dropped_messages: u64,
    dropped_bytes: u64,
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub buffered_bytes: usize,
    pub queued_messages: usize,
    pub dropped_messages: u64,
    pub dropped_bytes: u64,
}

/// FIFO of outbound items with a soft byte cap.
///
/// When a keyframe is pushed while more than `cap` bytes are waiting, every
/// audio/video message queued before it is discarded as the writer reaches
/// it. Commands, control messages and sequence headers are never discarded.
#[derive(Debug)]
pub struct SendQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    cap: usize,
}

impl SendQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            cap,
        }
    }

    /// Append an item and wake the writer. Returns the buffered byte count.
    pub fn push(&self, item: Outbound) -> usize {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        if item.is_droppable() && item.is_keyframe() && inner.buffered > self.cap {
            warn!(
                buffered = inner.buffered,
                cap = self.cap,
                "Send buffer over capacity, clearing up to keyframe"
            );
            inner.clearing_from = Some(seq);
        }

        inner.buffered += item.len();
        inner.entries.push_back(Entry { seq, item });
        let buffered = inner.buffered;
        drop(inner);

        self.notify.notify_one();
        buffered
    }

    /// Next item to write, skipping media that is being cleared.
    pub fn pop(&self) -> Option<Outbound> {
        let mut inner = self.inner.lock();
        while let Some(entry) = inner.entries.pop_front() {
            inner.buffered -= entry.item.len();

            if let Some(from) = inner.clearing_from {
                if entry.seq >= from {
                    debug!(
                        dropped = inner.dropped_messages,
                        "Send buffer cleared up to keyframe"
                    );
                    inner.clearing_from = None;
                } else if entry.item.is_droppable() {
                    inner.dropped_messages += 1;
                    inner.dropped_bytes += entry.item.len() as u64;
                    continue;
                }
            }
            return Some(entry.item);
        }
        None
    }

    /// Wait for the next item.
    pub async fn next(&self) -> Outbound {
        loop {
            if let Some(item) = self.pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    /// Drop everything queued. Dropped items are not counted as losses.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.buffered = 0;
        inner.clearing_from = None;
    }

    pub fn buffered_bytes(&self) -> usize {
        self.inner.lock().buffered
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            buffered_bytes: inner.buffered,
            queued_messages: inner.entries.len(),
            dropped_messages: inner.dropped_messages,
            dropped_bytes: inner.dropped_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(type_id: u8, len: usize, is_keyframe: bool) -> Outbound {
        Outbound::Message {
            message: ChunkMessage {
                csid: 7,
                timestamp: 0,
                type_id,
                message_stream_id: 1,
                payload: Bytes::from(vec![0u8; len]),
            },
            is_keyframe,
            is_sequence_header: false,
        }
    }

    fn sequence_header(type_id: u8, len: usize) -> Outbound {
        Outbound::Message {
            message: ChunkMessage {
                csid: if type_id == 8 { 6 } else { 7 },
                timestamp: 0,
                type_id,
                message_stream_id: 1,
                payload: Bytes::from(vec![0u8; len]),
            },
            is_keyframe: type_id == 9,
            is_sequence_header: true,
        }
    }

    fn command(len: usize) -> Outbound {
        Outbound::Message {
            message: ChunkMessage {
                csid: 3,
                timestamp: 0,
                type_id: 20,
                message_stream_id: 0,
                payload: Bytes::from(vec![0u8; len]),
            },
            is_keyframe: false,
            is_sequence_header: false,
        }
    }

    #[test]
    fn test_fifo_and_byte_count() {
        let queue = SendQueue::new(1000);
        assert_eq!(queue.push(media(9, 10, true)), 10);
        assert_eq!(queue.push(Outbound::Raw(Bytes::from_static(&[1, 2, 3]))), 13);

        assert!(matches!(queue.pop(), Some(Outbound::Message { .. })));
        assert_eq!(queue.buffered_bytes(), 3);
        assert!(matches!(queue.pop(), Some(Outbound::Raw(_))));
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_keyframe_over_cap_clears_older_media() {
        let queue = SendQueue::new(100);
        queue.push(media(9, 80, true));
        queue.push(command(5));
        queue.push(media(8, 40, false));
        // 125 bytes buffered, over the cap.
        queue.push(media(9, 50, true));
        queue.push(media(8, 10, false));

        let first = queue.pop().unwrap();
        assert!(matches!(first, Outbound::Message { ref message, .. } if message.type_id == 20));

        let keyframe = queue.pop().unwrap();
        assert!(keyframe.is_keyframe());
        assert_eq!(keyframe.len(), 50);

        assert_eq!(queue.pop().unwrap().len(), 10);
        let stats = queue.stats();
        assert_eq!(stats.dropped_messages, 2);
        assert_eq!(stats.dropped_bytes, 120);
        assert_eq!(stats.buffered_bytes, 0);
    }

    #[test]
    fn test_clearing_keeps_sequence_headers() {
        let queue = SendQueue::new(100);
        queue.push(sequence_header(8, 120));
        queue.push(media(9, 30, true));

        let first = queue.pop().unwrap();
        assert!(matches!(first, Outbound::Message { ref message, .. } if message.type_id == 8));
        assert_eq!(first.len(), 120);
        assert!(queue.pop().unwrap().is_keyframe());
        assert_eq!(queue.stats().dropped_messages, 0);
    }

    #[test]
    fn test_clearing_keeps_avc_header_drops_frames() {
        let queue = SendQueue::new(100);
        queue.push(sequence_header(9, 40));
        queue.push(media(9, 60, false));
        queue.push(media(8, 20, false));
        queue.push(media(9, 30, true));

        let lens: Vec<usize> = std::iter::from_fn(|| queue.pop()).map(|o| o.len()).collect();
        assert_eq!(lens, vec![40, 30]);
        let stats = queue.stats();
        assert_eq!(stats.dropped_messages, 2);
        assert_eq!(stats.dropped_bytes, 80);
    }

    #[test]
    fn test_non_keyframe_over_cap_does_not_clear() {
        let queue = SendQueue::new(10);
        queue.push(media(9, 20, false));
        queue.push(media(9, 20, false));
        assert_eq!(queue.pop().unwrap().len(), 20);
        assert_eq!(queue.pop().unwrap().len(), 20);
        assert_eq!(queue.stats().dropped_messages, 0);
    }

    #[test]
    fn test_clear() {
        let queue = SendQueue::new(10);
        queue.push(command(4));
        queue.clear();
        assert!(queue.pop().is_none());
        assert_eq!(queue.buffered_bytes(), 0);
    }
}
