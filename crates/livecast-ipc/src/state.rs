//! Session and engine state machines.

use serde::{Deserialize, Serialize};

/// RTMP session state.
///
/// Variants are declared in handshake order; a session never moves
/// backwards except through [`RtmpState::Reconnecting`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RtmpState {
    #[default]
    Disconnected,
    TcpConnected,
    /// C0+C1 sent, waiting for S0.
    Handshake0,
    /// S0 received, waiting for S1.
    Handshake1S0,
    /// S1 received and C2 sent, waiting for S2.
    Handshake1S1,
    /// S2 being consumed.
    Handshake2,
    HandshakeComplete,
    FcPublishSent,
    Ready,
    SessionStarted,
    Reconnecting,
    /// Peer closed the connection.
    Ended,
    Error,
}

impl RtmpState {
    /// Publishing is live.
    pub fn is_started(self) -> bool {
        matches!(self, Self::SessionStarted)
    }

    /// No further transitions will happen without a new `start`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Error)
    }

    /// Somewhere between TCP connect and publish acknowledgement.
    pub fn is_connecting(self) -> bool {
        self >= Self::TcpConnected && self < Self::SessionStarted
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::TcpConnected => "TcpConnected",
            Self::Handshake0 => "Handshake0",
            Self::Handshake1S0 => "Handshake1S0",
            Self::Handshake1S1 => "Handshake1S1",
            Self::Handshake2 => "Handshake2",
            Self::HandshakeComplete => "HandshakeComplete",
            Self::FcPublishSent => "FcPublishSent",
            Self::Ready => "Ready",
            Self::SessionStarted => "SessionStarted",
            Self::Reconnecting => "Reconnecting",
            Self::Ended => "Ended",
            Self::Error => "Error",
        }
    }
}

/// SRT session state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SrtState {
    #[default]
    None,
    Connecting,
    Connected,
    Error,
    /// The connected peer went away.
    NotConnected,
    Reconnecting,
}

impl SrtState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Error => "Error",
            Self::NotConnected => "NotConnected",
            Self::Reconnecting => "Reconnecting",
        }
    }
}

/// Transport protocol chosen from the target URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Rtmp,
    Srt,
}

impl Protocol {
    /// Protocol for a URL scheme, if supported.
    pub fn from_url(url: &str) -> Option<Self> {
        let scheme = url.split("://").next()?.to_ascii_lowercase();
        match scheme.as_str() {
            "rtmp" | "rtmps" => Some(Self::Rtmp),
            "srt" => Some(Self::Srt),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Rtmp => "RTMP",
            Self::Srt => "SRT",
        }
    }
}

/// Unified engine state, independent of the transport in use.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum EngineState {
    /// Not streaming.
    #[default]
    Idle,

    /// Transport is connecting or negotiating.
    Starting { protocol: Protocol },

    /// Media is flowing.
    Live { protocol: Protocol },

    /// The connection dropped and is being re-established.
    Reconnecting { protocol: Protocol },

    /// Stop requested, draining.
    Stopping { reason: StopReason },

    /// The peer ended the session.
    Ended,

    /// Fatal failure.
    Error { message: String, recoverable: bool },
}

impl EngineState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live { .. })
    }

    pub fn is_starting(&self) -> bool {
        matches!(self, Self::Starting { .. })
    }

    pub fn is_reconnecting(&self) -> bool {
        matches!(self, Self::Reconnecting { .. })
    }

    pub fn is_stopping(&self) -> bool {
        matches!(self, Self::Stopping { .. })
    }

    /// A session exists (starting, live or reconnecting).
    pub fn is_active(&self) -> bool {
        self.is_starting() || self.is_live() || self.is_reconnecting()
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Starting { .. } => "Starting",
            Self::Live { .. } => "Live",
            Self::Reconnecting { .. } => "Reconnecting",
            Self::Stopping { .. } => "Stopping",
            Self::Ended => "Ended",
            Self::Error { .. } => "Error",
        }
    }
}

/// Why a stream stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StopReason {
    UserRequested,
    NetworkLost,
    FatalError { message: String },
}

impl StopReason {
    pub fn message(&self) -> String {
        match self {
            Self::UserRequested => "Stream stopped by user".to_string(),
            Self::NetworkLost => "Network connection lost".to_string(),
            Self::FatalError { message } => format!("Fatal error: {message}"),
        }
    }
}
