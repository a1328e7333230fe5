//! `srt://` URI parsing and connection mode resolution.

use std::collections::BTreeMap;
use std::fmt;

use livecast_ipc::{DEFAULT_SRT_CHUNK_SIZE, SRT_LIVE_MAX_PAYLOAD};
use url::Url;

use crate::{TransportError, TransportResult};

/// Lowest port accepted in a URI.
pub const MIN_SRT_PORT: u16 = 1025;

/// Values of boolean socket options that mean "off".
const FALSE_NAMES: [&str; 4] = ["0", "no", "off", "false"];

/// How the socket reaches its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtMode {
    /// Connect out to `host:port`.
    Caller,
    /// Bind `adapter:port` and accept one peer.
    Listener,
    /// Bind and connect simultaneously.
    Rendezvous,
}

impl SrtMode {
    fn from_name(name: &str) -> TransportResult<Self> {
        match name {
            "caller" | "client" => Ok(Self::Caller),
            "listener" | "server" => Ok(Self::Listener),
            "rendezvous" => Ok(Self::Rendezvous),
            other => Err(TransportError::InvalidConfig(format!(
                "invalid SRT mode '{}', use caller, listener or rendezvous",
                other
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Caller => "caller",
            Self::Listener => "listener",
            Self::Rendezvous => "rendezvous",
        }
    }
}

impl fmt::Display for SrtMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A parsed SRT endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtTarget {
    /// Remote host; empty for a listener bound to all interfaces.
    pub host: String,
    pub port: u16,
    pub mode: SrtMode,

    /// Local interface for listener and rendezvous modes.
    pub adapter: String,

    /// Local port to bind in caller/rendezvous mode.
    pub outgoing_port: Option<u16>,

    /// Connect timeout in milliseconds.
    pub timeout_ms: Option<u64>,

    /// Timestamp-based packet delivery; on unless `tsbpd` says otherwise.
    pub tsbpd: bool,

    /// Remaining query parameters, passed through as socket options.
    pub options: BTreeMap<String, String>,
}

impl SrtTarget {
    /// Parse `uri` for a session writing `chunk_size`-byte payloads.
    pub fn parse(uri: &str, chunk_size: usize) -> TransportResult<Self> {
        let rest = uri
            .strip_prefix("srt://")
            .ok_or_else(|| TransportError::InvalidUrl(format!("not an srt:// URI: {}", uri)))?;

        // `srt://:port` names a listener on every interface; the URL parser
        // rejects an empty host, so parse with a placeholder.
        let empty_host = rest.starts_with(':');
        let parsed = if empty_host {
            Url::parse(&format!("srt://0.0.0.0{}", rest))
        } else {
            Url::parse(uri)
        }
        .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

        let host = if empty_host {
            String::new()
        } else {
            parsed.host_str().unwrap_or_default().to_string()
        };
        let port = parsed
            .port()
            .ok_or_else(|| TransportError::InvalidUrl("SRT URI needs a port".to_string()))?;
        if port < MIN_SRT_PORT {
            return Err(TransportError::InvalidConfig(format!(
                "SRT port must be above 1024, got {}",
                port
            )));
        }

        let mut params: BTreeMap<String, String> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let adapter_param = params.remove("adapter");
        let mode = match params.remove("mode") {
            Some(name) if name != "default" => SrtMode::from_name(&name)?,
            _ if host.is_empty() => SrtMode::Listener,
            _ if adapter_param.is_some() => SrtMode::Rendezvous,
            _ => SrtMode::Caller,
        };
        let adapter = match adapter_param {
            Some(adapter) => adapter,
            None if mode == SrtMode::Listener => host.clone(),
            None => String::new(),
        };

        let timeout_ms = params
            .remove("timeout")
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|_| TransportError::InvalidConfig(format!("timeout={}", v)))
            })
            .transpose()?;
        let outgoing_port = params
            .remove("port")
            .map(|v| {
                v.parse::<u16>()
                    .map_err(|_| TransportError::InvalidConfig(format!("port={}", v)))
            })
            .transpose()?;

        let tsbpd = params
            .get("tsbpd")
            .map_or(true, |v| !FALSE_NAMES.contains(&v.as_str()));

        let file_mode = params.get("transtype").map(String::as_str) == Some("file");
        if !file_mode && chunk_size != DEFAULT_SRT_CHUNK_SIZE {
            if chunk_size > SRT_LIVE_MAX_PAYLOAD {
                return Err(TransportError::InvalidConfig(format!(
                    "chunk size {} exceeds the {} byte live payload limit",
                    chunk_size, SRT_LIVE_MAX_PAYLOAD
                )));
            }
            params.insert("payloadsize".to_string(), chunk_size.to_string());
        }

        Ok(Self {
            host,
            port,
            mode,
            adapter,
            outgoing_port,
            timeout_ms,
            tsbpd,
            options: params,
        })
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.options.get("streamid").map(String::as_str)
    }

    /// Latency in milliseconds, if given.
    pub fn latency_ms(&self) -> Option<u32> {
        self.options.get("latency").and_then(|v| v.parse().ok())
    }
}

impl fmt::Display for SrtTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "srt://{}:{} ({})", self.host, self.port, self.mode)
    }
}
