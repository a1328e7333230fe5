//! Client side of the simple RTMP handshake.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use livecast_ipc::RtmpState;
use rand::Rng;
use tracing::{debug, trace};

use crate::{TransportError, TransportResult};

/// Protocol version carried in C0/S0.
pub const RTMP_VERSION: u8 = 0x03;

/// Size of C1, C2, S1 and S2.
pub const HANDSHAKE_SIZE: usize = 1536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    WaitingS0,
    WaitingS1,
    WaitingS2,
    Done,
}

/// Result of feeding server bytes into the handshake.
#[derive(Debug, Default)]
pub struct HandshakeOutput {
    /// Bytes to send to the server (C2).
    pub response: Bytes,

    /// States entered while processing, in order.
    pub transitions: Vec<RtmpState>,

    /// Bytes following S2, set once the handshake completed.
    pub remaining: Option<Bytes>,
}

/// Sans-IO handshake: C0+C1 out, S0+S1 in, C2 out, S2 in.
#[derive(Debug)]
pub struct Handshake {
    stage: Stage,
    uptime_ms: u32,
    buffer: BytesMut,
}

impl Handshake {
    /// `uptime_ms` goes into the time field of C1.
    pub fn new(uptime_ms: u32) -> Self {
        Self {
            stage: Stage::Idle,
            uptime_ms,
            buffer: BytesMut::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.stage == Stage::Done
    }

    /// Build C0 and C1.
    pub fn start(&mut self) -> (Bytes, Bytes) {
        let mut c1 = BytesMut::with_capacity(HANDSHAKE_SIZE);
        c1.put_u32(self.uptime_ms);
        c1.put_u32(0);
        let mut random = vec![0u8; HANDSHAKE_SIZE - 8];
        rand::thread_rng().fill(&mut random[..]);
        c1.put_slice(&random);

        self.stage = Stage::WaitingS0;
        debug!(uptime_ms = self.uptime_ms, "Sending C0+C1");
        (Bytes::from_static(&[RTMP_VERSION]), c1.freeze())
    }

    /// Consume server bytes.
    pub fn process(&mut self, data: &[u8]) -> TransportResult<HandshakeOutput> {
        self.buffer.extend_from_slice(data);
        let mut output = HandshakeOutput::default();
        let mut response = BytesMut::new();

        loop {
            match self.stage {
                Stage::Idle => {
                    return Err(TransportError::Handshake(
                        "server data before C0".to_string(),
                    ))
                }
                Stage::WaitingS0 => {
                    if self.buffer.is_empty() {
                        break;
                    }
                    let version = self.buffer.get_u8();
                    if version != RTMP_VERSION {
                        return Err(TransportError::Handshake(format!(
                            "unexpected S0 version 0x{:02X}",
                            version
                        )));
                    }
                    self.stage = Stage::WaitingS1;
                    output.transitions.push(RtmpState::Handshake1S0);
                }
                Stage::WaitingS1 => {
                    if self.buffer.len() < HANDSHAKE_SIZE {
                        break;
                    }
                    let mut c2 = self.buffer.split_to(HANDSHAKE_SIZE);
                    c2[4..8].fill(0);
                    response.put_slice(&c2);
                    trace!("Received S1, sending C2");
                    self.stage = Stage::WaitingS2;
                    output.transitions.push(RtmpState::Handshake1S1);
                }
                Stage::WaitingS2 => {
                    if self.buffer.len() < HANDSHAKE_SIZE {
                        break;
                    }
                    output.transitions.push(RtmpState::Handshake2);
                    self.buffer.advance(HANDSHAKE_SIZE);
                    self.stage = Stage::Done;
                    output.transitions.push(RtmpState::HandshakeComplete);
                    output.remaining = Some(self.buffer.split().freeze());
                    debug!("Handshake complete");
                    break;
                }
                Stage::Done => {
                    output.remaining = Some(self.buffer.split().freeze());
                    break;
                }
            }
        }

        output.response = response.freeze();
        Ok(output)
    }
}
