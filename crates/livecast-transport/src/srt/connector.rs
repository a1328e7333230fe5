//! [`SrtConnector`] over `srt-tokio`.
//!
//! Each opened socket spawns one task on the connector's runtime. The task
//! establishes the connection for the target's mode, then forwards queued
//! messages to the peer until either side goes away. The session thread
//! only touches the shared [`Link`] and a bounded queue, so nothing here
//! blocks on the network.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use srt_tokio::{SrtListener, SrtSocket as SrtStream};
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::socket::{SocketStatus, SrtConnector, SrtSocket, WriteSignal};
use super::stats::SrtStats;
use super::uri::{SrtMode, SrtTarget};
use crate::{TransportError, TransportResult};

/// Messages queued between a socket handle and its connection task.
const SEND_QUEUE_MESSAGES: usize = 64;

/// Receiver latency when the URI does not set `latency`.
const DEFAULT_LATENCY: Duration = Duration::from_millis(120);

#[derive(Debug, Default, Clone, Copy)]
struct LinkCounters {
    bytes_sent: u64,
    packets_sent: u64,
    bytes_dropped: u64,
    packets_dropped: u64,
    bytes_buffered: u64,
}

/// State shared between socket handles and the connection task.
struct Link {
    status: Mutex<SocketStatus>,
    events: Sender<()>,
    counters: Mutex<LinkCounters>,
    writable: Arc<WriteSignal>,
    closing: Notify,
}

impl Link {
    fn status(&self) -> SocketStatus {
        *self.status.lock()
    }

    fn set_status(&self, status: SocketStatus) {
        let previous = std::mem::replace(&mut *self.status.lock(), status);
        if previous == status {
            return;
        }
        debug!(?previous, ?status, "SRT socket status");
        let _ = self.events.send(());
        if status.is_failed() {
            self.writable.notify_all();
        }
    }

    fn queued(&self, len: u64) {
        self.counters.lock().bytes_buffered += len;
    }

    fn written(&self, len: u64, delivered: bool) {
        {
            let mut counters = self.counters.lock();
            counters.bytes_buffered = counters.bytes_buffered.saturating_sub(len);
            if delivered {
                counters.bytes_sent += len;
                counters.packets_sent += 1;
            } else {
                counters.bytes_dropped += len;
                counters.packets_dropped += 1;
            }
        }
        self.writable.notify();
    }
}

/// Opens sockets with `srt-tokio` on a private runtime.
pub struct TokioSrtConnector {
    runtime: Runtime,
}

impl TokioSrtConnector {
    pub fn new() -> TransportResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("livecast-srt-io")
            .enable_all()
            .build()
            .map_err(TransportError::Io)?;
        Ok(Self { runtime })
    }
}

impl SrtConnector for TokioSrtConnector {
    fn open(&self, target: &SrtTarget) -> TransportResult<Box<dyn SrtSocket>> {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let link = Arc::new(Link {
            status: Mutex::new(SocketStatus::Opened),
            events: events_tx,
            counters: Mutex::new(LinkCounters::default()),
            writable: Arc::new(WriteSignal::default()),
            closing: Notify::new(),
        });
        let (outgoing_tx, outgoing_rx) = mpsc::channel(SEND_QUEUE_MESSAGES);

        debug!(%target, "Opening SRT socket");
        let task = self.runtime.spawn(run_connection(
            target.clone(),
            Arc::clone(&link),
            outgoing_rx,
        ));

        Ok(Box::new(TokioSrtSocket {
            link,
            events: events_rx,
            outgoing: outgoing_tx,
            task: Arc::new(Mutex::new(Some(task))),
            listening: target.mode == SrtMode::Listener,
            handed_off: false,
            stats_since: Instant::now(),
        }))
    }
}

/// Handle to one connection task.
///
/// In listener mode the handle opened by the connector reports `Listening`
/// and hands the established connection out through `accept`.
struct TokioSrtSocket {
    link: Arc<Link>,
    events: Receiver<()>,
    outgoing: mpsc::Sender<Bytes>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
    listening: bool,
    handed_off: bool,
    stats_since: Instant,
}

impl SrtSocket for TokioSrtSocket {
    fn status(&self) -> SocketStatus {
        let status = self.link.status();
        if self.listening && !status.is_failed() {
            SocketStatus::Listening
        } else {
            status
        }
    }

    fn wait_event(&mut self, timeout: Duration) -> TransportResult<bool> {
        let fired = if timeout.is_zero() {
            self.events.try_recv().is_ok()
        } else {
            self.events.recv_timeout(timeout).is_ok()
        };
        // Status is level-triggered; one wake-up covers queued events.
        while self.events.try_recv().is_ok() {}
        Ok(fired)
    }

    fn accept(&mut self) -> TransportResult<Box<dyn SrtSocket>> {
        if !self.listening || self.handed_off {
            return Err(TransportError::Srt("socket is not listening".to_string()));
        }
        if self.link.status() != SocketStatus::Connected {
            return Err(TransportError::WouldBlock);
        }
        self.handed_off = true;
        let _ = self.link.events.send(());
        Ok(Box::new(TokioSrtSocket {
            link: Arc::clone(&self.link),
            events: self.events.clone(),
            outgoing: self.outgoing.clone(),
            task: Arc::clone(&self.task),
            listening: false,
            handed_off: false,
            stats_since: Instant::now(),
        }))
    }

    fn send(&mut self, data: &[u8]) -> TransportResult<usize> {
        if self.listening || self.link.status() != SocketStatus::Connected {
            return Err(TransportError::NotConnected);
        }
        match self.outgoing.try_send(Bytes::copy_from_slice(data)) {
            Ok(()) => {
                self.link.queued(data.len() as u64);
                Ok(data.len())
            }
            Err(TrySendError::Full(_)) => Err(TransportError::WouldBlock),
            Err(TrySendError::Closed(_)) => Err(TransportError::NotConnected),
        }
    }

    fn stats(&mut self, clear: bool) -> TransportResult<SrtStats> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.stats_since).as_secs_f64();
        let snapshot = {
            let mut counters = self.link.counters.lock();
            let snapshot = *counters;
            if clear {
                *counters = LinkCounters {
                    bytes_buffered: snapshot.bytes_buffered,
                    ..LinkCounters::default()
                };
            }
            snapshot
        };
        if clear {
            self.stats_since = now;
        }

        let mbps_send_rate = if elapsed > 0.0 {
            snapshot.bytes_sent as f64 * 8.0 / elapsed / 1_000_000.0
        } else {
            0.0
        };
        Ok(SrtStats {
            mbps_send_rate,
            bytes_sent: snapshot.bytes_sent,
            packets_sent: snapshot.packets_sent,
            packets_dropped: snapshot.packets_dropped,
            bytes_dropped: snapshot.bytes_dropped,
            bytes_buffered: snapshot.bytes_buffered,
            ..SrtStats::default()
        })
    }

    fn close(&mut self) {
        if self.handed_off {
            return;
        }
        let Some(task) = self.task.lock().take() else {
            return;
        };
        if self.link.status() == SocketStatus::Connected {
            // The task shuts the connection down after queued messages.
            self.link.closing.notify_one();
        } else {
            task.abort();
        }
        self.link.set_status(SocketStatus::Closed);
    }

    fn write_signal(&self) -> Option<Arc<WriteSignal>> {
        Some(Arc::clone(&self.link.writable))
    }
}

impl Drop for TokioSrtSocket {
    fn drop(&mut self) {
        self.close();
    }
}

fn latency(target: &SrtTarget) -> Duration {
    target
        .options
        .get("latency")
        .and_then(|ms| ms.parse().ok())
        .map_or(DEFAULT_LATENCY, Duration::from_millis)
}

async fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", host)))
}

fn bind_address(target: &SrtTarget) -> io::Result<SocketAddr> {
    let adapter = if target.adapter.is_empty() {
        "0.0.0.0"
    } else {
        target.adapter.as_str()
    };
    format!("{}:{}", adapter, target.port)
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{}: {}", adapter, e)))
}

/// Bound the handshake by the URI's `timeout`, when it has one.
async fn handshake<F>(target: &SrtTarget, connect: F) -> io::Result<SrtStream>
where
    F: std::future::Future<Output = io::Result<SrtStream>>,
{
    match target.timeout_ms {
        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), connect)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "SRT handshake timed out"))?,
        None => connect.await,
    }
}

/// Reach the peer. The listener is returned alongside the accepted
/// connection so its endpoint lives as long as the connection.
async fn establish(
    target: &SrtTarget,
    link: &Link,
) -> io::Result<(Option<SrtListener>, SrtStream)> {
    let latency = latency(target);
    match target.mode {
        SrtMode::Caller => {
            link.set_status(SocketStatus::Connecting);
            let remote = resolve(&target.host, target.port).await?;
            let mut builder = SrtStream::builder().latency(latency);
            if let Some(port) = target.outgoing_port {
                builder = builder.local_port(port);
            }
            let stream_id = target.options.get("streamid").map(String::as_str);
            let socket = handshake(target, builder.call(remote, stream_id)).await?;
            Ok((None, socket))
        }
        SrtMode::Rendezvous => {
            link.set_status(SocketStatus::Connecting);
            let remote = resolve(&target.host, target.port).await?;
            let local_port = target.outgoing_port.unwrap_or(target.port);
            let builder = SrtStream::builder().latency(latency).local_port(local_port);
            let socket = handshake(target, builder.rendezvous(remote)).await?;
            Ok((None, socket))
        }
        SrtMode::Listener => {
            let local = bind_address(target)?;
            let (listener, mut incoming) = SrtListener::builder().bind(local).await?;
            info!(%local, "SRT listener waiting for a caller");
            link.set_status(SocketStatus::Listening);

            let request = incoming.incoming().next().await.ok_or_else(|| {
                io::Error::new(io::ErrorKind::ConnectionAborted, "listener closed")
            })?;
            let stream_id = request.stream_id().map(|s| s.to_string());
            debug!(?stream_id, "Incoming SRT connection");
            let socket = request.accept(None).await?;
            Ok((Some(listener), socket))
        }
    }
}

async fn run_connection(target: SrtTarget, link: Arc<Link>, mut outgoing: mpsc::Receiver<Bytes>) {
    let (_listener, socket) = match establish(&target, &link).await {
        Ok(established) => established,
        Err(e) => {
            warn!(mode = target.mode.name(), error = %e, "SRT connection failed");
            link.set_status(SocketStatus::Broken);
            return;
        }
    };
    info!(mode = target.mode.name(), "SRT connection established");
    link.set_status(SocketStatus::Connected);

    let (mut sink, mut incoming) = socket.split::<(Instant, Bytes)>();
    let status = loop {
        tokio::select! {
            message = outgoing.recv() => {
                let Some(message) = message else {
                    break SocketStatus::Closed;
                };
                let len = message.len() as u64;
                let result = sink.send((Instant::now(), message)).await;
                link.written(len, result.is_ok());
                if let Err(e) = result {
                    warn!(error = %e, "SRT send failed");
                    break SocketStatus::Broken;
                }
            }
            _ = link.closing.notified() => break SocketStatus::Closed,
            received = incoming.next() => match received {
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "SRT connection lost");
                    break SocketStatus::Broken;
                }
                None => {
                    debug!("SRT peer closed the connection");
                    break SocketStatus::Broken;
                }
            },
        }
    };

    if status == SocketStatus::Closed {
        if let Err(e) = sink.close().await {
            debug!("SRT close failed: {}", e);
        }
    }
    link.set_status(status);
}
