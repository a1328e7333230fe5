//! RTMP publishing.

mod chunk;
mod flv;
mod handshake;
mod protocol;
mod send_queue;
mod session;

pub use chunk::{
    ChunkError, ChunkMessage, ChunkReader, ChunkWriter, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE,
};
pub use flv::{AacPacketizer, FlvTag, H264Packetizer, AUDIO_MESSAGE_TYPE, VIDEO_MESSAGE_TYPE};
pub use handshake::{Handshake, HandshakeOutput, HANDSHAKE_SIZE, RTMP_VERSION};
pub use protocol::{
    PendingCommands, ProtocolOutput, RtmpEndpoint, RtmpProtocol, RtmpSessionParameters,
    DEFAULT_RTMP_PORT,
};
pub use send_queue::{Outbound, QueueStats, SendQueue};
pub use session::RtmpSession;
