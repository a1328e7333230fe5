//! RTMP publishing session: socket I/O around [`RtmpProtocol`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use livecast_abr::TcpThroughputSampler;
use livecast_ipc::{BandwidthListener, RtmpConfig, RtmpState, StateListener};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, trace, warn};

use super::chunk::ChunkWriter;
use super::flv::FlvTag;
use super::protocol::{ProtocolOutput, RtmpEndpoint, RtmpProtocol, RtmpSessionParameters};
use super::send_queue::{Outbound, SendQueue};
use crate::connection::ReconnectPolicy;
use crate::task_queue::TaskQueue;
use crate::{TransportError, TransportResult, TransportStatistics};

/// How long a blocked read waits before re-checking the exit flag.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on waiting for `deleteStream` to leave the queue on stop.
const STOP_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

const READ_BUFFER_SIZE: usize = 4096;

struct Shared {
    protocol: Mutex<Option<RtmpProtocol>>,
    /// Runs every protocol mutation in order; present while started.
    tasks: Mutex<Option<TaskQueue>>,
    state: RwLock<RtmpState>,
    queue: SendQueue,
    exiting: AtomicBool,
    reached_started: AtomicBool,
    sampler: Mutex<TcpThroughputSampler>,
    state_listener: Arc<dyn StateListener<RtmpState>>,
    bandwidth_listener: RwLock<Option<Arc<dyn BandwidthListener>>>,
    created: Instant,
    bytes_sent: AtomicU64,
    messages_sent: AtomicU64,
}

impl Shared {
    fn state(&self) -> RtmpState {
        *self.state.read()
    }

    fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    fn uptime_ms(&self) -> u32 {
        self.created.elapsed().as_millis() as u32
    }

    /// Queue `job` on the session's task queue. Dropped when the session is
    /// not started.
    fn enqueue<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.tasks.lock().as_ref() {
            Some(queue) => queue.enqueue(job),
            None => trace!("Session not started, dropping job"),
        }
    }

    /// Queue `f` against the protocol. The receiver yields its result once
    /// the outputs have been applied, or closes if the job was skipped.
    fn submit<F>(self: &Arc<Self>, f: F) -> oneshot::Receiver<TransportResult<()>>
    where
        F: FnOnce(&mut RtmpProtocol) -> TransportResult<Vec<ProtocolOutput>> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let shared = Arc::clone(self);
        self.enqueue(move || {
            let _ = done_tx.send(shared.run_step(f));
        });
        done_rx
    }

    /// Run `f` against the protocol on the task queue and wait for it.
    async fn step<F>(self: &Arc<Self>, f: F) -> TransportResult<()>
    where
        F: FnOnce(&mut RtmpProtocol) -> TransportResult<Vec<ProtocolOutput>> + Send + 'static,
    {
        self.submit(f).await.unwrap_or(Err(TransportError::NotConnected))
    }

    fn run_step<F>(&self, f: F) -> TransportResult<()>
    where
        F: FnOnce(&mut RtmpProtocol) -> TransportResult<Vec<ProtocolOutput>>,
    {
        let outputs = {
            let mut guard = self.protocol.lock();
            let protocol = guard.as_mut().ok_or(TransportError::NotConnected)?;
            f(protocol)?
        };
        self.apply(outputs);
        Ok(())
    }

    async fn transition(self: &Arc<Self>, next: RtmpState) {
        let result = self
            .step(move |p| {
                let mut out = Vec::new();
                p.transition(next, &mut out);
                Ok(out)
            })
            .await;
        if let Err(e) = result {
            warn!(state = next.name(), error = %e, "State transition not applied");
        }
    }

    fn apply(&self, outputs: Vec<ProtocolOutput>) {
        for output in outputs {
            match output {
                ProtocolOutput::Send(item) => {
                    self.queue.push(item);
                }
                ProtocolOutput::StateChanged { previous, current } => {
                    *self.state.write() = current;
                    if current == RtmpState::SessionStarted {
                        self.reached_started.store(true, Ordering::SeqCst);
                        self.start_sampler();
                    }
                    self.state_listener.on_state_changed(previous, current);
                }
            }
        }
    }

    fn start_sampler(&self) {
        let listener = self.bandwidth_listener.read().clone();
        if let Some(listener) = listener {
            self.sampler.lock().start(listener);
        }
    }

    fn stop_sampler(&self) {
        let mut sampler = self.sampler.lock();
        sampler.stop();
        sampler.reset();
    }

    fn enqueue_media(&self, tag: FlvTag) {
        let outbound = self.protocol.lock().as_mut().and_then(|p| p.media(tag));
        if let Some(item) = outbound {
            let buffered = self.queue.push(item);
            self.sampler.lock().add_buffer_size(buffered);
        }
    }
}

/// Publishes FLV tags to an RTMP server.
///
/// Network I/O runs on a private tokio runtime; callers stay synchronous.
pub struct RtmpSession {
    config: RtmpConfig,
    params: RtmpSessionParameters,
    shared: Arc<Shared>,
    runtime: Option<Runtime>,
    done: Option<Receiver<()>>,
}

impl RtmpSession {
    pub fn new(config: RtmpConfig, listener: Arc<dyn StateListener<RtmpState>>) -> Self {
        let sampler = TcpThroughputSampler::new(Duration::from_millis(config.sample_interval_ms));
        let shared = Arc::new(Shared {
            protocol: Mutex::new(None),
            tasks: Mutex::new(None),
            state: RwLock::new(RtmpState::Disconnected),
            queue: SendQueue::new(config.send_buffer_cap_bytes),
            exiting: AtomicBool::new(false),
            reached_started: AtomicBool::new(false),
            sampler: Mutex::new(sampler),
            state_listener: listener,
            bandwidth_listener: RwLock::new(None),
            created: Instant::now(),
            bytes_sent: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
        });

        Self {
            config,
            params: RtmpSessionParameters::default(),
            shared,
            runtime: None,
            done: None,
        }
    }

    /// Stream properties for the metadata sent when publishing starts.
    pub fn set_session_parameters(&mut self, params: RtmpSessionParameters) {
        if self.runtime.is_some() {
            let update = params.clone();
            drop(self.shared.submit(move |p| {
                p.set_parameters(update);
                Ok(Vec::new())
            }));
        }
        self.params = params;
    }

    /// Receive throughput reports once publishing has started.
    pub fn set_bandwidth_listener(&self, listener: Arc<dyn BandwidthListener>) {
        *self.shared.bandwidth_listener.write() = Some(listener);
        if self.shared.state().is_started() {
            self.shared.start_sampler();
        }
    }

    pub fn state(&self) -> RtmpState {
        self.shared.state()
    }

    pub fn statistics(&self) -> TransportStatistics {
        let queue = self.shared.queue.stats();
        TransportStatistics {
            bytes_sent: self.shared.bytes_sent.load(Ordering::Relaxed),
            packets_sent: self.shared.messages_sent.load(Ordering::Relaxed),
            packets_dropped: queue.dropped_messages,
            bytes_lost: queue.dropped_bytes,
            buffered_bytes: queue.buffered_bytes as u64,
        }
    }

    /// Connect to `url` and publish under `stream_key`.
    ///
    /// A non-empty key is appended to the URL path.
    #[instrument(name = "rtmp_start", skip(self, stream_key))]
    pub fn start(&mut self, url: &str, stream_key: &str) -> TransportResult<()> {
        if self.runtime.is_some() {
            return Err(TransportError::AlreadyStarted);
        }

        let full_url = if stream_key.is_empty() {
            url.to_string()
        } else {
            format!("{}/{}", url.trim_end_matches('/'), stream_key)
        };
        let endpoint = RtmpEndpoint::parse(&full_url)?;
        if endpoint.secure {
            return Err(TransportError::Unsupported(
                "rtmps requires a TLS transport".to_string(),
            ));
        }

        info!(host = %endpoint.host, port = endpoint.port, app = %endpoint.app, "Starting RTMP session");

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("livecast-rtmp")
            .enable_all()
            .build()
            .map_err(TransportError::Io)?;

        *self.shared.protocol.lock() = Some(RtmpProtocol::new(
            endpoint.clone(),
            self.params.clone(),
            self.config.out_chunk_size,
        ));
        *self.shared.state.write() = RtmpState::Disconnected;
        self.shared.exiting.store(false, Ordering::SeqCst);
        self.shared.reached_started.store(false, Ordering::SeqCst);
        self.shared.queue.clear();
        *self.shared.tasks.lock() = Some(TaskQueue::new("livecast-rtmp-tasks"));

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        runtime.spawn(async move {
            run_session(shared, endpoint, config).await;
            let _ = done_tx.send(());
        });

        self.runtime = Some(runtime);
        self.done = Some(done_rx);
        Ok(())
    }

    /// Queue a tag. Media is discarded until publishing has started; sequence
    /// headers are kept and sent first once it has.
    pub fn push(&self, tag: FlvTag) {
        let shared = Arc::clone(&self.shared);
        self.shared.enqueue(move || shared.enqueue_media(tag));
    }

    /// Send `deleteStream` if publishing, close the connection and wait for
    /// the I/O task.
    #[instrument(name = "rtmp_stop", skip(self))]
    pub fn stop(&mut self) -> TransportResult<()> {
        let Some(runtime) = self.runtime.take() else {
            return Ok(());
        };
        info!("Stopping RTMP session");

        let deleted = self
            .shared
            .submit(|p| Ok(p.delete_stream()?.into_iter().map(ProtocolOutput::Send).collect()))
            .blocking_recv();
        match deleted {
            Ok(Ok(())) => {
                let deadline = Instant::now() + STOP_FLUSH_TIMEOUT;
                while !self.shared.queue.is_empty() && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
            Ok(Err(e)) => debug!("deleteStream not sent: {}", e),
            Err(_) => debug!("deleteStream skipped"),
        }

        self.shared.exiting.store(true, Ordering::SeqCst);
        let tasks = self.shared.tasks.lock().take();
        if let Some(mut queue) = tasks {
            queue.shutdown();
        }
        if let Some(done) = self.done.take() {
            if done.recv_timeout(Duration::from_secs(2)).is_err() {
                warn!("RTMP task did not finish in time");
            }
        }
        runtime.shutdown_timeout(Duration::from_secs(1));

        self.shared.stop_sampler();
        self.shared.queue.clear();
        *self.shared.protocol.lock() = None;
        *self.shared.state.write() = RtmpState::Disconnected;

        info!("RTMP session stopped");
        Ok(())
    }
}

impl Drop for RtmpSession {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

async fn run_session(shared: Arc<Shared>, endpoint: RtmpEndpoint, config: RtmpConfig) {
    let policy = ReconnectPolicy::from(&config);
    let mut attempt = 0u32;

    loop {
        let result = run_connection(&shared, &endpoint, &config).await;
        if shared.is_exiting() {
            break;
        }

        shared.stop_sampler();
        if shared.state().is_started() {
            attempt = 0;
        }

        let rejected = shared.state() == RtmpState::Error;
        let terminal = match &result {
            Ok(()) => {
                info!("RTMP connection closed by peer");
                RtmpState::Ended
            }
            Err(e) => {
                warn!(error = %e, "RTMP connection failed");
                RtmpState::Error
            }
        };

        let may_retry = config.auto_reconnect
            && !rejected
            && shared.reached_started.load(Ordering::SeqCst)
            && policy.should_retry(attempt);
        if !may_retry {
            if attempt > 0 && !policy.should_retry(attempt) {
                error!(attempts = attempt, "{}", TransportError::ReconnectExhausted(attempt));
            }
            shared.transition(terminal).await;
            break;
        }

        attempt += 1;
        shared.transition(RtmpState::Reconnecting).await;
        shared.queue.clear();
        let delay = policy.delay_for_attempt(attempt);
        info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");

        let deadline = tokio::time::Instant::now() + delay;
        while tokio::time::Instant::now() < deadline {
            if shared.is_exiting() {
                return;
            }
            tokio::time::sleep(READ_POLL_INTERVAL).await;
        }
    }
}

async fn run_connection(
    shared: &Arc<Shared>,
    endpoint: &RtmpEndpoint,
    config: &RtmpConfig,
) -> TransportResult<()> {
    let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
    let address = endpoint.address();
    debug!(address = %address, "Opening TCP connection");

    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&address))
        .await
        .map_err(|_| TransportError::ConnectionFailed("TCP connect timed out".to_string()))?
        .map_err(|e| TransportError::ConnectionFailed(format!("TCP connect failed: {}", e)))?;
    stream.set_nodelay(true)?;

    let (reader, writer) = stream.into_split();
    let uptime = shared.uptime_ms();
    shared.step(move |p| Ok(p.on_tcp_connected(uptime))).await?;

    let write_timeout = Duration::from_millis(config.write_timeout_ms);
    tokio::select! {
        result = read_loop(shared, reader, connect_timeout) => result,
        result = write_loop(shared, writer, write_timeout) => result,
    }
}

async fn read_loop(
    shared: &Arc<Shared>,
    mut reader: OwnedReadHalf,
    connect_timeout: Duration,
) -> TransportResult<()> {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let opened = Instant::now();

    loop {
        if shared.is_exiting() {
            return Ok(());
        }

        match tokio::time::timeout(READ_POLL_INTERVAL, reader.read(&mut buf)).await {
            Err(_) => {
                if shared.state() < RtmpState::HandshakeComplete && opened.elapsed() > connect_timeout
                {
                    return Err(TransportError::Handshake("timed out".to_string()));
                }
            }
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(n)) => {
                trace!(bytes = n, "Received");
                let data = buf[..n].to_vec();
                shared.step(move |p| p.on_data(&data)).await?;
                if shared.state() == RtmpState::Error {
                    return Err(TransportError::Protocol("publish rejected".to_string()));
                }
            }
            Ok(Err(e)) => return Err(TransportError::ConnectionLost(e.to_string())),
        }
    }
}

async fn write_loop(
    shared: &Arc<Shared>,
    mut writer: OwnedWriteHalf,
    write_timeout: Duration,
) -> TransportResult<()> {
    let mut chunker = ChunkWriter::new();

    loop {
        let item = tokio::select! {
            item = shared.queue.next() => item,
            _ = tokio::time::sleep(READ_POLL_INTERVAL) => {
                if shared.is_exiting() {
                    return Ok(());
                }
                continue;
            }
        };

        let bytes = match &item {
            Outbound::Raw(bytes) => bytes.clone(),
            Outbound::Message { message, .. } => match chunker.write(message) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(csid = message.csid, error = %e, "Dropping unframeable message");
                    continue;
                }
            },
        };

        let mut offset = 0;
        while offset < bytes.len() {
            match tokio::time::timeout(write_timeout, writer.write(&bytes[offset..])).await {
                Ok(Ok(0)) => {
                    return Err(TransportError::ConnectionLost("socket closed".to_string()))
                }
                Ok(Ok(n)) => offset += n,
                Ok(Err(e)) => return Err(TransportError::SendFailed(e.to_string())),
                Err(_) => {
                    if shared.is_exiting() {
                        return Ok(());
                    }
                    trace!(pending = bytes.len() - offset, "Write blocked, retrying");
                }
            }
        }

        shared.sampler.lock().add_sent_bytes(bytes.len());
        shared
            .bytes_sent
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        if matches!(item, Outbound::Message { .. }) {
            shared.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
    }
}
