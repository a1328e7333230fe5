//! Sans-IO RTMP publishing client.
//!
//! [`RtmpProtocol`] turns socket bytes into outbound messages and state
//! changes. It never touches the network, so the whole publish flow can be
//! driven from tests.

use std::collections::HashMap;

use bytes::Bytes;
use livecast_codec::amf0::{self, Amf0Value, ObjectBuilder};
use livecast_ipc::{AudioParams, MediaKind, RtmpState, VideoParams};
use rml_rtmp::messages::{MessagePayload, RtmpMessage, UserControlEventType};
use rml_rtmp::time::RtmpTimestamp;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};
use url::Url;

use super::chunk::{ChunkMessage, ChunkReader};
use super::flv::FlvTag;
use super::handshake::Handshake;
use super::send_queue::Outbound;
use crate::{TransportError, TransportResult};

/// Default RTMP port.
pub const DEFAULT_RTMP_PORT: u16 = 1935;

/// Default RTMPS port.
pub const DEFAULT_RTMPS_PORT: u16 = 443;

pub const CONTROL_CSID: u32 = 2;
const CONNECT_CSID: u32 = 3;
const STREAM_CSID: u32 = 4;
const PUBLISH_CSID: u32 = 5;
const METADATA_CSID: u32 = 6;
pub const VIDEO_CSID: u32 = 7;
pub const AUDIO_CSID: u32 = 8;

/// Stream id used when a createStream reply carries none.
const FALLBACK_STREAM_ID: u32 = 1;

/// AAC bitrate announced in the metadata object.
const METADATA_AUDIO_BITRATE: f64 = 131_152.0;

/// Server address and publish names derived from an RTMP URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpEndpoint {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    pub app: String,

    /// Stream name, including any query string.
    pub play_path: String,

    pub tc_url: String,
}

impl RtmpEndpoint {
    /// Parse `rtmp[s]://host[:port]/app/playpath[?query]`.
    pub fn parse(url: &str) -> TransportResult<Self> {
        let parsed = Url::parse(url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

        let secure = match parsed.scheme() {
            "rtmp" => false,
            "rtmps" => true,
            other => {
                return Err(TransportError::InvalidUrl(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        };

        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TransportError::InvalidUrl("Missing host".to_string()))?
            .to_string();
        let default_port = if secure {
            DEFAULT_RTMPS_PORT
        } else {
            DEFAULT_RTMP_PORT
        };
        let port = parsed.port().unwrap_or(default_port);

        let path = parsed.path().trim_start_matches('/');
        let (app, mut play_path) = match path.split_once('/') {
            Some((app, rest)) => (app.to_string(), rest.trim_end_matches('/').to_string()),
            None => (path.to_string(), String::new()),
        };
        if app.is_empty() {
            return Err(TransportError::InvalidUrl(
                "Missing application name in URL path".to_string(),
            ));
        }
        if play_path.is_empty() {
            return Err(TransportError::InvalidUrl(
                "Missing stream name in URL path".to_string(),
            ));
        }
        if let Some(query) = parsed.query() {
            play_path = format!("{}?{}", play_path, query);
        }

        let port_part = parsed.port().map(|p| format!(":{}", p)).unwrap_or_default();
        let tc_url = format!("{}://{}{}/{}", parsed.scheme(), host, port_part, app);

        Ok(Self {
            secure,
            host,
            port,
            app,
            play_path,
            tc_url,
        })
    }

    /// `host:port` for the TCP connect.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Stream properties announced in the `onMetaData` object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtmpSessionParameters {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub video_bitrate_bps: u32,
    pub audio_sample_rate: u32,
    pub stereo: bool,
}

impl Default for RtmpSessionParameters {
    fn default() -> Self {
        Self::from_params(&VideoParams::default(), &AudioParams::default())
    }
}

impl RtmpSessionParameters {
    pub fn from_params(video: &VideoParams, audio: &AudioParams) -> Self {
        Self {
            width: video.width,
            height: video.height,
            frame_rate: video.fps,
            video_bitrate_bps: video.bitrate_bps,
            audio_sample_rate: audio.sample_rate,
            stereo: audio.channels > 1,
        }
    }
}

/// Transaction id to command name, for matching `_result` replies.
#[derive(Debug)]
pub struct PendingCommands {
    next_id: u32,
    pending: HashMap<u32, String>,
}

impl Default for PendingCommands {
    fn default() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }
}

impl PendingCommands {
    /// Allocate a transaction id for `name`.
    pub fn track(&mut self, name: &str) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(id, name.to_string());
        id
    }

    /// Remove and return the command a reply belongs to.
    pub fn resolve(&mut self, id: u32) -> Option<String> {
        self.pending.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Something the session must act on.
#[derive(Debug, Clone)]
pub enum ProtocolOutput {
    Send(Outbound),
    StateChanged {
        previous: RtmpState,
        current: RtmpState,
    },
}

/// Client-side RTMP publish state machine.
#[derive(Debug)]
pub struct RtmpProtocol {
    endpoint: RtmpEndpoint,
    params: RtmpSessionParameters,
    out_chunk_size: u32,
    state: RtmpState,
    handshake: Handshake,
    reader: ChunkReader,
    pending: PendingCommands,
    stream_id: u32,
    video_header: Option<FlvTag>,
    audio_header: Option<FlvTag>,
}

impl RtmpProtocol {
    pub fn new(endpoint: RtmpEndpoint, params: RtmpSessionParameters, out_chunk_size: u32) -> Self {
        Self {
            endpoint,
            params,
            out_chunk_size,
            state: RtmpState::Disconnected,
            handshake: Handshake::new(0),
            reader: ChunkReader::new(),
            pending: PendingCommands::default(),
            stream_id: FALLBACK_STREAM_ID,
            video_header: None,
            audio_header: None,
        }
    }

    pub fn state(&self) -> RtmpState {
        self.state
    }

    pub fn endpoint(&self) -> &RtmpEndpoint {
        &self.endpoint
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn pending_commands(&self) -> usize {
        self.pending.len()
    }

    pub fn set_parameters(&mut self, params: RtmpSessionParameters) {
        self.params = params;
    }

    /// Move to `next`, recording the change if it is one.
    pub fn transition(&mut self, next: RtmpState, out: &mut Vec<ProtocolOutput>) {
        if self.state == next {
            return;
        }
        let previous = self.state;
        self.state = next;
        debug!(from = previous.name(), to = next.name(), "RTMP state changed");
        out.push(ProtocolOutput::StateChanged {
            previous,
            current: next,
        });
    }

    /// Forget everything tied to the current connection. Cached sequence
    /// headers survive so they can be resent after a reconnect.
    pub fn reset(&mut self) {
        self.handshake = Handshake::new(0);
        self.reader = ChunkReader::new();
        self.pending = PendingCommands::default();
        self.stream_id = FALLBACK_STREAM_ID;
    }

    /// TCP is up: start the handshake.
    pub fn on_tcp_connected(&mut self, uptime_ms: u32) -> Vec<ProtocolOutput> {
        let mut out = Vec::new();
        self.reset();
        self.handshake = Handshake::new(uptime_ms);
        self.transition(RtmpState::TcpConnected, &mut out);

        let (c0, c1) = self.handshake.start();
        out.push(ProtocolOutput::Send(Outbound::Raw(c0)));
        out.push(ProtocolOutput::Send(Outbound::Raw(c1)));
        self.transition(RtmpState::Handshake0, &mut out);
        out
    }

    /// Feed bytes read from the socket.
    pub fn on_data(&mut self, data: &[u8]) -> TransportResult<Vec<ProtocolOutput>> {
        let mut out = Vec::new();

        if !self.handshake.is_complete() {
            let result = self.handshake.process(data)?;
            if !result.response.is_empty() {
                out.push(ProtocolOutput::Send(Outbound::Raw(result.response)));
            }
            for state in result.transitions {
                self.transition(state, &mut out);
            }
            match result.remaining {
                Some(rest) => {
                    self.send_connect(&mut out)?;
                    self.reader.feed(&rest);
                }
                None => return Ok(out),
            }
        } else {
            self.reader.feed(data);
        }

        while let Some(next) = self.reader.next_message() {
            match next {
                Ok(message) => self.dispatch(message, &mut out)?,
                Err(e) => warn!(error = %e, "Discarding RTMP message"),
            }
        }

        Ok(out)
    }

    /// Wrap a media tag for sending. Sequence headers are cached and
    /// replayed when publishing (re)starts; nothing is sent before that.
    pub fn media(&mut self, tag: FlvTag) -> Option<Outbound> {
        if tag.is_sequence_header {
            match tag.kind {
                MediaKind::Video => self.video_header = Some(tag.clone()),
                MediaKind::Audio => self.audio_header = Some(tag.clone()),
            }
        }
        if !self.state.is_started() {
            return None;
        }
        Some(self.media_message(&tag))
    }

    /// `deleteStream` for a stream that was created.
    pub fn delete_stream(&mut self) -> TransportResult<Option<Outbound>> {
        if self.state < RtmpState::Ready || self.state.is_terminal() {
            return Ok(None);
        }
        let message = RtmpMessage::Amf0Command {
            command_name: "deleteStream".to_string(),
            transaction_id: 0.0,
            command_object: Amf0Value::Null,
            additional_arguments: vec![Amf0Value::Number(f64::from(self.stream_id))],
        };
        Ok(Some(self.outbound(STREAM_CSID, 0, 0, message, false)?))
    }

    fn media_message(&self, tag: &FlvTag) -> Outbound {
        let csid = match tag.kind {
            MediaKind::Video => VIDEO_CSID,
            MediaKind::Audio => AUDIO_CSID,
        };
        Outbound::Message {
            message: ChunkMessage {
                csid,
                timestamp: tag.timestamp_ms,
                type_id: tag.type_id(),
                message_stream_id: self.stream_id,
                payload: tag.data.clone(),
            },
            is_keyframe: tag.kind == MediaKind::Video && tag.is_keyframe,
            is_sequence_header: tag.is_sequence_header,
        }
    }

    fn outbound(
        &self,
        csid: u32,
        message_stream_id: u32,
        timestamp: u32,
        message: RtmpMessage,
        is_keyframe: bool,
    ) -> TransportResult<Outbound> {
        let payload = message
            .into_message_payload(RtmpTimestamp::new(timestamp), message_stream_id)
            .map_err(|e| TransportError::Protocol(format!("serialize failed: {:?}", e)))?;
        Ok(Outbound::Message {
            message: ChunkMessage {
                csid,
                timestamp,
                type_id: payload.type_id,
                message_stream_id,
                payload: payload.data,
            },
            is_keyframe,
            is_sequence_header: false,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn send_command(
        &mut self,
        csid: u32,
        message_stream_id: u32,
        name: &str,
        tracked: bool,
        command_object: Amf0Value,
        arguments: Vec<Amf0Value>,
        out: &mut Vec<ProtocolOutput>,
    ) -> TransportResult<()> {
        let transaction_id = if tracked { self.pending.track(name) } else { 0 };
        trace!(command = name, transaction_id, "Sending command");
        let message = RtmpMessage::Amf0Command {
            command_name: name.to_string(),
            transaction_id: f64::from(transaction_id),
            command_object,
            additional_arguments: arguments,
        };
        let outbound = self.outbound(csid, message_stream_id, 0, message, false)?;
        out.push(ProtocolOutput::Send(outbound));
        Ok(())
    }

    fn send_connect(&mut self, out: &mut Vec<ProtocolOutput>) -> TransportResult<()> {
        info!(app = %self.endpoint.app, tc_url = %self.endpoint.tc_url, "Sending connect");
        let object = ObjectBuilder::new()
            .string("app", self.endpoint.app.clone())
            .string("type", "nonprivate")
            .string("flashVer", "FMLE/3.0 (compatible; FMSc/1.0)")
            .string("tcUrl", self.endpoint.tc_url.clone())
            .boolean("fpad", false)
            .number("capabilities", 15.0)
            .number("audioCodecs", 10.0)
            .number("videoCodecs", 7.0)
            .number("videoFunction", 1.0)
            .build();
        self.send_command(CONNECT_CSID, 0, "connect", true, object, Vec::new(), out)
    }

    fn dispatch(&mut self, message: ChunkMessage, out: &mut Vec<ProtocolOutput>) -> TransportResult<()> {
        let payload = MessagePayload {
            timestamp: RtmpTimestamp::new(message.timestamp),
            type_id: message.type_id,
            message_stream_id: message.message_stream_id,
            data: message.payload,
        };
        let decoded = match payload.to_rtmp_message() {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(type_id = message.type_id, error = ?e, "Undecodable RTMP message");
                return Ok(());
            }
        };

        match decoded {
            RtmpMessage::SetChunkSize { size } => match self.reader.set_chunk_size(size) {
                Ok(()) => debug!(size, "Peer chunk size changed"),
                Err(e) => warn!(error = %e, "Ignoring SetChunkSize"),
            },
            RtmpMessage::Abort { stream_id } => {
                debug!(csid = stream_id, "Peer aborted message");
                self.reader.abort(stream_id);
            }
            RtmpMessage::Acknowledgement { sequence_number } => {
                trace!(sequence_number, "Acknowledgement");
            }
            RtmpMessage::WindowAcknowledgement { size } => {
                debug!(size, "Window acknowledgement size");
            }
            RtmpMessage::SetPeerBandwidth { size, .. } => {
                debug!(size, "Peer bandwidth");
            }
            RtmpMessage::UserControl {
                event_type: UserControlEventType::PingRequest,
                timestamp,
                ..
            } => {
                let timestamp = timestamp.unwrap_or_else(|| RtmpTimestamp::new(0));
                trace!(timestamp = timestamp.value, "Ping request");
                let pong = RtmpMessage::UserControl {
                    event_type: UserControlEventType::PingResponse,
                    stream_id: None,
                    buffer_length: None,
                    timestamp: Some(timestamp),
                };
                let outbound = self.outbound(CONTROL_CSID, 0, 0, pong, false)?;
                out.push(ProtocolOutput::Send(outbound));
            }
            RtmpMessage::UserControl { event_type, .. } => {
                trace!(event = ?event_type, "User control event");
            }
            RtmpMessage::Amf0Command {
                command_name,
                transaction_id,
                additional_arguments,
                ..
            } => self.handle_command(&command_name, transaction_id, &additional_arguments, out)?,
            other => trace!(message = ?other, "Ignoring RTMP message"),
        }
        Ok(())
    }

    fn handle_command(
        &mut self,
        name: &str,
        transaction_id: f64,
        arguments: &[Amf0Value],
        out: &mut Vec<ProtocolOutput>,
    ) -> TransportResult<()> {
        match name {
            "_result" => match self.pending.resolve(transaction_id as u32).as_deref() {
                Some("connect") => {
                    info!("Connect accepted");
                    let play_path = Amf0Value::Utf8String(self.endpoint.play_path.clone());
                    self.send_command(
                        STREAM_CSID,
                        0,
                        "releaseStream",
                        true,
                        Amf0Value::Null,
                        vec![play_path.clone()],
                        out,
                    )?;
                    self.send_command(
                        STREAM_CSID,
                        0,
                        "FCPublish",
                        true,
                        Amf0Value::Null,
                        vec![play_path],
                        out,
                    )?;
                    self.send_command(
                        STREAM_CSID,
                        0,
                        "createStream",
                        true,
                        Amf0Value::Null,
                        Vec::new(),
                        out,
                    )?;
                    self.transition(RtmpState::FcPublishSent, out);
                }
                Some("createStream") => {
                    self.stream_id = arguments
                        .iter()
                        .find_map(amf0::as_number)
                        .map(|id| id as u32)
                        .unwrap_or(FALLBACK_STREAM_ID);
                    info!(stream_id = self.stream_id, play_path = %self.endpoint.play_path, "Publishing");
                    self.send_command(
                        PUBLISH_CSID,
                        self.stream_id,
                        "publish",
                        false,
                        Amf0Value::Null,
                        vec![
                            Amf0Value::Utf8String(self.endpoint.play_path.clone()),
                            Amf0Value::Utf8String("live".to_string()),
                        ],
                        out,
                    )?;
                    self.transition(RtmpState::Ready, out);
                }
                Some(command) => trace!(command, "Command acknowledged"),
                None => warn!(transaction_id, "Reply for unknown transaction"),
            },
            "_error" => {
                let command = self.pending.resolve(transaction_id as u32);
                let description = arguments
                    .iter()
                    .find_map(|v| amf0::property(v, "description").and_then(amf0::as_str))
                    .unwrap_or("no description");
                warn!(command = ?command, description, "Command rejected");
                self.transition(RtmpState::Error, out);
            }
            "onStatus" => {
                let code = arguments
                    .iter()
                    .find_map(|v| amf0::property(v, "code").and_then(amf0::as_str))
                    .unwrap_or_default();
                match code {
                    "NetStream.Publish.Start" => {
                        if self.state < RtmpState::SessionStarted {
                            self.start_session(out)?;
                        }
                    }
                    "NetStream.Publish.BadName" | "NetStream.Publish.Failed" => {
                        warn!(code, "Publish rejected");
                        self.transition(RtmpState::Error, out);
                    }
                    _ => debug!(code, "onStatus"),
                }
            }
            _ => trace!(command = name, "Ignoring command"),
        }
        Ok(())
    }

    fn start_session(&mut self, out: &mut Vec<ProtocolOutput>) -> TransportResult<()> {
        let metadata = self.metadata_message()?;
        out.push(ProtocolOutput::Send(metadata));

        let set_chunk_size = RtmpMessage::SetChunkSize {
            size: self.out_chunk_size,
        };
        out.push(ProtocolOutput::Send(self.outbound(
            CONTROL_CSID,
            0,
            0,
            set_chunk_size,
            false,
        )?));

        self.transition(RtmpState::SessionStarted, out);

        let headers: Vec<FlvTag> = self
            .video_header
            .iter()
            .chain(self.audio_header.iter())
            .cloned()
            .collect();
        for tag in headers {
            out.push(ProtocolOutput::Send(self.media_message(&tag)));
        }
        info!(chunk_size = self.out_chunk_size, "Publish started");
        Ok(())
    }

    fn metadata_message(&self) -> TransportResult<Outbound> {
        let p = &self.params;
        let object = ObjectBuilder::new()
            .number("width", f64::from(p.width))
            .number("height", f64::from(p.height))
            .number("displaywidth", f64::from(p.width))
            .number("displayheight", f64::from(p.height))
            .number("framewidth", f64::from(p.width))
            .number("frameheight", f64::from(p.height))
            .number("videodatarate", f64::from(p.video_bitrate_bps) / 1024.0)
            .number("videoframerate", p.frame_rate)
            .string("videocodecid", "avc1")
            .number("audiodatarate", METADATA_AUDIO_BITRATE / 1024.0)
            .number("audiosamplerate", f64::from(p.audio_sample_rate))
            .number("audiosamplesize", 16.0)
            .number("audiochannels", if p.stereo { 2.0 } else { 1.0 })
            .string("audiocodecid", "mp4a")
            .boolean("stereo", p.stereo)
            .build();
        let message = RtmpMessage::Amf0Data {
            values: vec![
                Amf0Value::Utf8String("@setDataFrame".to_string()),
                Amf0Value::Utf8String("onMetaData".to_string()),
                object,
            ],
        };
        self.outbound(METADATA_CSID, self.stream_id, 0, message, false)
    }
}

/// Raw payload of an outbound message, for tests and logging.
pub fn outbound_payload(outbound: &Outbound) -> Bytes {
    match outbound {
        Outbound::Raw(bytes) => bytes.clone(),
        Outbound::Message { message, .. } => message.payload.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtmp::chunk::ChunkWriter;
    use crate::rtmp::flv::VIDEO_MESSAGE_TYPE;
    use crate::rtmp::handshake::{HANDSHAKE_SIZE, RTMP_VERSION};

    /// Scripted server side: frames replies and decodes what the client sent.
    struct MockServer {
        writer: ChunkWriter,
        reader: ChunkReader,
        client_writer: ChunkWriter,
    }

    impl MockServer {
        fn new() -> Self {
            Self {
                writer: ChunkWriter::new(),
                reader: ChunkReader::new(),
                client_writer: ChunkWriter::new(),
            }
        }

        fn handshake_reply() -> Vec<u8> {
            let mut reply = vec![RTMP_VERSION];
            reply.extend(std::iter::repeat(0x11).take(HANDSHAKE_SIZE));
            reply.extend(std::iter::repeat(0x22).take(HANDSHAKE_SIZE));
            reply
        }

        fn frame(&mut self, csid: u32, message_stream_id: u32, message: RtmpMessage) -> Vec<u8> {
            let payload = message
                .into_message_payload(RtmpTimestamp::new(0), message_stream_id)
                .unwrap();
            self.writer
                .write(&ChunkMessage {
                    csid,
                    timestamp: 0,
                    type_id: payload.type_id,
                    message_stream_id,
                    payload: payload.data,
                })
                .unwrap()
                .to_vec()
        }

        fn result(&mut self, transaction_id: f64, arguments: Vec<Amf0Value>) -> Vec<u8> {
            self.frame(
                3,
                0,
                RtmpMessage::Amf0Command {
                    command_name: "_result".to_string(),
                    transaction_id,
                    command_object: Amf0Value::Null,
                    additional_arguments: arguments,
                },
            )
        }

        fn on_status(&mut self, code: &str) -> Vec<u8> {
            let info = ObjectBuilder::new()
                .string("level", "status")
                .string("code", code)
                .build();
            self.frame(
                5,
                1,
                RtmpMessage::Amf0Command {
                    command_name: "onStatus".to_string(),
                    transaction_id: 0.0,
                    command_object: Amf0Value::Null,
                    additional_arguments: vec![info],
                },
            )
        }

        /// Decode every message the client emitted.
        fn received(&mut self, outputs: &[ProtocolOutput]) -> Vec<(u32, RtmpMessage)> {
            let mut messages = Vec::new();
            for output in outputs {
                let ProtocolOutput::Send(Outbound::Message { message, .. }) = output else {
                    continue;
                };
                let bytes = self.client_writer.write(message).unwrap();
                self.reader.feed(&bytes);
                while let Some(next) = self.reader.next_message() {
                    let chunk = next.unwrap();
                    let csid = chunk.csid;
                    let decoded = MessagePayload {
                        timestamp: RtmpTimestamp::new(chunk.timestamp),
                        type_id: chunk.type_id,
                        message_stream_id: chunk.message_stream_id,
                        data: chunk.payload,
                    }
                    .to_rtmp_message()
                    .unwrap();
                    if let RtmpMessage::SetChunkSize { size } = decoded {
                        self.reader.set_chunk_size(size).unwrap();
                    }
                    messages.push((csid, decoded));
                }
            }
            messages
        }
    }

    fn command_names(messages: &[(u32, RtmpMessage)]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|(_, m)| match m {
                RtmpMessage::Amf0Command { command_name, .. } => Some(command_name.clone()),
                _ => None,
            })
            .collect()
    }

    fn states(outputs: &[ProtocolOutput]) -> Vec<RtmpState> {
        outputs
            .iter()
            .filter_map(|o| match o {
                ProtocolOutput::StateChanged { current, .. } => Some(*current),
                _ => None,
            })
            .collect()
    }

    fn protocol() -> RtmpProtocol {
        let endpoint = RtmpEndpoint::parse("rtmp://localhost/live/stream-key").unwrap();
        RtmpProtocol::new(endpoint, RtmpSessionParameters::default(), 4096)
    }

    #[test]
    fn test_endpoint_parse() {
        let endpoint = RtmpEndpoint::parse("rtmp://a.rtmp.example.com:1936/live2/abc?token=1").unwrap();
        assert_eq!(endpoint.host, "a.rtmp.example.com");
        assert_eq!(endpoint.port, 1936);
        assert_eq!(endpoint.app, "live2");
        assert_eq!(endpoint.play_path, "abc?token=1");
        assert_eq!(endpoint.tc_url, "rtmp://a.rtmp.example.com:1936/live2");
        assert_eq!(endpoint.address(), "a.rtmp.example.com:1936");

        let endpoint = RtmpEndpoint::parse("rtmp://host/app/nested/key").unwrap();
        assert_eq!(endpoint.port, DEFAULT_RTMP_PORT);
        assert_eq!(endpoint.play_path, "nested/key");
        assert_eq!(endpoint.tc_url, "rtmp://host/app");

        assert!(RtmpEndpoint::parse("rtmps://host/app/key").unwrap().secure);
    }

    #[test]
    fn test_endpoint_rejects_bad_urls() {
        for url in ["http://host/app/key", "rtmp://host/app", "rtmp://host/", "not a url"] {
            assert!(
                matches!(RtmpEndpoint::parse(url), Err(TransportError::InvalidUrl(_))),
                "{url}"
            );
        }
    }

    #[test]
    fn test_pending_commands() {
        let mut pending = PendingCommands::default();
        let connect = pending.track("connect");
        let create = pending.track("createStream");
        assert_eq!((connect, create), (1, 2));
        assert_eq!(pending.resolve(create).as_deref(), Some("createStream"));
        assert_eq!(pending.resolve(create), None);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_publish_flow_against_mock_server() {
        let mut client = protocol();
        let mut server = MockServer::new();
        let mut all_states = Vec::new();
        let mut all_messages = Vec::new();

        let out = client.on_tcp_connected(100);
        all_states.extend(states(&out));
        let raw: Vec<usize> = out
            .iter()
            .filter_map(|o| match o {
                ProtocolOutput::Send(Outbound::Raw(b)) => Some(b.len()),
                _ => None,
            })
            .collect();
        assert_eq!(raw, vec![1, HANDSHAKE_SIZE]);

        // S0+S1+S2 and a window ack size in one read.
        let mut data = MockServer::handshake_reply();
        data.extend(server.frame(2, 0, RtmpMessage::WindowAcknowledgement { size: 2_500_000 }));
        let out = client.on_data(&data).unwrap();
        all_states.extend(states(&out));
        all_messages.extend(server.received(&out));
        assert_eq!(client.state(), RtmpState::HandshakeComplete);

        let reply = server.result(1.0, vec![ObjectBuilder::new().string("code", "NetConnection.Connect.Success").build()]);
        let out = client.on_data(&reply).unwrap();
        all_states.extend(states(&out));
        let messages = server.received(&out);
        assert_eq!(
            command_names(&messages),
            vec!["releaseStream", "FCPublish", "createStream"]
        );
        all_messages.extend(messages);
        assert_eq!(client.state(), RtmpState::FcPublishSent);

        // createStream was the fourth tracked command.
        let reply = server.result(4.0, vec![Amf0Value::Number(7.0)]);
        let out = client.on_data(&reply).unwrap();
        all_states.extend(states(&out));
        all_messages.extend(server.received(&out));
        assert_eq!(client.state(), RtmpState::Ready);
        assert_eq!(client.stream_id(), 7);

        let status = server.on_status("NetStream.Publish.Start");
        let out = client.on_data(&status).unwrap();
        all_states.extend(states(&out));
        all_messages.extend(server.received(&out));

        // A repeated status must not restart the session.
        let out = client.on_data(&server.on_status("NetStream.Publish.Start")).unwrap();
        assert!(out.is_empty());

        assert_eq!(client.state(), RtmpState::SessionStarted);
        assert_eq!(
            all_states,
            vec![
                RtmpState::TcpConnected,
                RtmpState::Handshake0,
                RtmpState::Handshake1S0,
                RtmpState::Handshake1S1,
                RtmpState::Handshake2,
                RtmpState::HandshakeComplete,
                RtmpState::FcPublishSent,
                RtmpState::Ready,
                RtmpState::SessionStarted,
            ]
        );

        let names = command_names(&all_messages);
        assert_eq!(names.iter().filter(|n| *n == "connect").count(), 1);
        assert_eq!(names.last().map(String::as_str), Some("publish"));

        let metadata: Vec<_> = all_messages
            .iter()
            .filter(|(_, m)| matches!(m, RtmpMessage::Amf0Data { .. }))
            .collect();
        assert_eq!(metadata.len(), 1);
        if let (_, RtmpMessage::Amf0Data { values }) = metadata[0] {
            assert_eq!(amf0::as_str(&values[0]), Some("@setDataFrame"));
            assert_eq!(amf0::as_str(&values[1]), Some("onMetaData"));
            assert_eq!(
                amf0::property(&values[2], "width").and_then(amf0::as_number),
                Some(1280.0)
            );
        }

        let chunk_sizes: Vec<u32> = all_messages
            .iter()
            .filter_map(|(_, m)| match m {
                RtmpMessage::SetChunkSize { size } => Some(*size),
                _ => None,
            })
            .collect();
        assert_eq!(chunk_sizes, vec![4096]);

        // releaseStream and FCPublish are never answered by this server.
        assert_eq!(client.pending_commands(), 2);
    }

    /// Message stream ids of every command the client framed, by name.
    fn command_streams(outputs: &[ProtocolOutput]) -> Vec<(String, u32)> {
        outputs
            .iter()
            .filter_map(|o| match o {
                ProtocolOutput::Send(Outbound::Message { message, .. }) => Some(message),
                _ => None,
            })
            .filter_map(|message| {
                let decoded = MessagePayload {
                    timestamp: RtmpTimestamp::new(0),
                    type_id: message.type_id,
                    message_stream_id: message.message_stream_id,
                    data: message.payload.clone(),
                }
                .to_rtmp_message()
                .ok()?;
                match decoded {
                    RtmpMessage::Amf0Command { command_name, .. } => {
                        Some((command_name, message.message_stream_id))
                    }
                    _ => None,
                }
            })
            .collect()
    }

    #[test]
    fn test_publish_flow_with_first_stream_id() {
        let mut client = protocol();
        let mut server = MockServer::new();
        client.on_tcp_connected(0);
        client.on_data(&MockServer::handshake_reply()).unwrap();

        let reply = server.result(1.0, vec![ObjectBuilder::new().string("code", "NetConnection.Connect.Success").build()]);
        let out = client.on_data(&reply).unwrap();
        assert_eq!(
            command_streams(&out),
            vec![
                ("releaseStream".to_string(), 0),
                ("FCPublish".to_string(), 0),
                ("createStream".to_string(), 0),
            ]
        );

        let out = client
            .on_data(&server.result(4.0, vec![Amf0Value::Null, Amf0Value::Number(1.0)]))
            .unwrap();
        assert_eq!(client.stream_id(), 1);
        assert_eq!(client.state(), RtmpState::Ready);
        assert_eq!(command_streams(&out), vec![("publish".to_string(), 1)]);

        // onStatus arrives on the created stream.
        let out = client
            .on_data(&server.on_status("NetStream.Publish.Start"))
            .unwrap();
        assert_eq!(states(&out), vec![RtmpState::SessionStarted]);
        let metadata = out.iter().find_map(|o| match o {
            ProtocolOutput::Send(Outbound::Message { message, .. })
                if message.csid == METADATA_CSID =>
            {
                Some(message.message_stream_id)
            }
            _ => None,
        });
        assert_eq!(metadata, Some(1));

        let frame = FlvTag {
            kind: MediaKind::Video,
            timestamp_ms: 33,
            data: Bytes::from_static(&[0x27, 0x01, 0, 0, 0, 0xAA]),
            is_keyframe: false,
            is_sequence_header: false,
        };
        let Some(Outbound::Message { message, .. }) = client.media(frame) else {
            panic!("expected video message");
        };
        assert_eq!(message.message_stream_id, 1);

        let Some(Outbound::Message { message, .. }) = client.delete_stream().unwrap() else {
            panic!("expected deleteStream");
        };
        let decoded = MessagePayload {
            timestamp: RtmpTimestamp::new(0),
            type_id: message.type_id,
            message_stream_id: 0,
            data: message.payload,
        }
        .to_rtmp_message()
        .unwrap();
        let RtmpMessage::Amf0Command { additional_arguments, .. } = decoded else {
            panic!("expected command");
        };
        assert_eq!(additional_arguments, vec![Amf0Value::Number(1.0)]);
    }

    #[test]
    fn test_connect_object() {
        let mut client = protocol();
        let mut server = MockServer::new();
        client.on_tcp_connected(0);
        let out = client.on_data(&MockServer::handshake_reply()).unwrap();
        let messages = server.received(&out);
        assert_eq!(messages.len(), 1);
        let (csid, RtmpMessage::Amf0Command { command_name, transaction_id, command_object, .. }) =
            &messages[0]
        else {
            panic!("expected connect command");
        };
        assert_eq!(*csid, CONNECT_CSID);
        assert_eq!(command_name, "connect");
        assert_eq!(*transaction_id, 1.0);
        let get = |key| amf0::property(command_object, key);
        assert_eq!(get("app").and_then(amf0::as_str), Some("live"));
        assert_eq!(get("tcUrl").and_then(amf0::as_str), Some("rtmp://localhost/live"));
        assert_eq!(get("type").and_then(amf0::as_str), Some("nonprivate"));
        assert_eq!(get("capabilities").and_then(amf0::as_number), Some(15.0));
        assert_eq!(get("audioCodecs").and_then(amf0::as_number), Some(10.0));
        assert_eq!(get("videoCodecs").and_then(amf0::as_number), Some(7.0));
        assert_eq!(get("videoFunction").and_then(amf0::as_number), Some(1.0));
        assert_eq!(get("fpad"), Some(&Amf0Value::Boolean(false)));
    }

    #[test]
    fn test_ping_request_answered() {
        let mut client = protocol();
        let mut server = MockServer::new();
        client.on_tcp_connected(0);
        client.on_data(&MockServer::handshake_reply()).unwrap();

        let ping = server.frame(
            2,
            0,
            RtmpMessage::UserControl {
                event_type: UserControlEventType::PingRequest,
                stream_id: None,
                buffer_length: None,
                timestamp: Some(RtmpTimestamp::new(1234)),
            },
        );
        let out = client.on_data(&ping).unwrap();
        assert_eq!(out.len(), 1);
        let ProtocolOutput::Send(Outbound::Message { message, .. }) = &out[0] else {
            panic!("expected ping response");
        };
        assert_eq!(message.csid, CONTROL_CSID);
        let decoded = MessagePayload {
            timestamp: RtmpTimestamp::new(0),
            type_id: message.type_id,
            message_stream_id: 0,
            data: message.payload.clone(),
        }
        .to_rtmp_message()
        .unwrap();
        match decoded {
            RtmpMessage::UserControl {
                event_type: UserControlEventType::PingResponse,
                timestamp: Some(ts),
                ..
            } => assert_eq!(ts.value, 1234),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bad_name_is_error() {
        let mut client = protocol();
        let mut server = MockServer::new();
        client.on_tcp_connected(0);
        client.on_data(&MockServer::handshake_reply()).unwrap();
        let out = client
            .on_data(&server.on_status("NetStream.Publish.BadName"))
            .unwrap();
        assert_eq!(states(&out), vec![RtmpState::Error]);
    }

    #[test]
    fn test_media_gated_and_headers_replayed() {
        let mut client = protocol();
        let header = FlvTag {
            kind: MediaKind::Video,
            timestamp_ms: 0,
            data: Bytes::from_static(&[0x17, 0x00, 0, 0, 0, 0x01]),
            is_keyframe: true,
            is_sequence_header: true,
        };
        assert!(client.media(header).is_none());

        let mut out = Vec::new();
        client.transition(RtmpState::Ready, &mut out);
        client.start_session(&mut out).unwrap();
        let video: Vec<_> = out
            .iter()
            .filter_map(|o| match o {
                ProtocolOutput::Send(Outbound::Message {
                    message,
                    is_keyframe,
                    is_sequence_header,
                }) if message.type_id == VIDEO_MESSAGE_TYPE => {
                    Some((message.csid, *is_keyframe, *is_sequence_header))
                }
                _ => None,
            })
            .collect();
        assert_eq!(video, vec![(VIDEO_CSID, true, true)]);

        let frame = FlvTag {
            kind: MediaKind::Audio,
            timestamp_ms: 23,
            data: Bytes::from_static(&[0xAF, 0x01, 0x21]),
            is_keyframe: false,
            is_sequence_header: false,
        };
        let Some(Outbound::Message { message, .. }) = client.media(frame) else {
            panic!("expected audio message");
        };
        assert_eq!(message.csid, AUDIO_CSID);
        assert_eq!(message.timestamp, 23);
        let outbound = Outbound::Message {
            message,
            is_keyframe: false,
            is_sequence_header: false,
        };
        assert_eq!(outbound_payload(&outbound).len(), 3);
    }
}
