//! SRT publishing session: connection lifecycle and chunked sending.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use livecast_ipc::{BandwidthListener, SrtConfig, SrtState, StateListener};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, trace, warn};

use super::socket::{SocketHandle, SocketStatus, SrtConnector};
use super::stats::{ListenerSlot, SrtStats, SrtStatsSampler};
use super::uri::SrtTarget;
use crate::task_queue::TaskQueue;
use crate::{TransportError, TransportResult, TransportStatistics};

/// Collects pushed bytes into fixed-size chunks.
#[derive(Debug)]
struct ChunkAccumulator {
    chunk_size: usize,
    partial: BytesMut,
    ready: Vec<Bytes>,
}

impl ChunkAccumulator {
    fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            partial: BytesMut::with_capacity(chunk_size),
            ready: Vec::new(),
        }
    }

    /// Append `data`. Data that does not fit the current chunk closes it
    /// and starts a new one; data larger than a chunk is split.
    fn push(&mut self, data: &[u8]) {
        if self.partial.len() + data.len() <= self.chunk_size {
            self.partial.extend_from_slice(data);
            if self.partial.len() == self.chunk_size {
                self.close_partial();
            }
            return;
        }

        self.close_partial();
        for piece in data.chunks(self.chunk_size) {
            if piece.len() == self.chunk_size {
                self.ready.push(Bytes::copy_from_slice(piece));
            } else {
                self.partial.extend_from_slice(piece);
            }
        }
    }

    fn close_partial(&mut self) {
        if !self.partial.is_empty() {
            let chunk = self.partial.split().freeze();
            self.ready.push(chunk);
        }
    }

    fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Take every ready chunk, closing the partial one first if `flush`.
    fn take(&mut self, flush: bool) -> Vec<Bytes> {
        if flush {
            self.close_partial();
        }
        std::mem::take(&mut self.ready)
    }

    fn buffered_bytes(&self) -> usize {
        self.partial.len() + self.ready.iter().map(Bytes::len).sum::<usize>()
    }

    fn clear(&mut self) {
        self.partial.clear();
        self.ready.clear();
    }
}

#[derive(Debug, Default)]
struct SendCounters {
    wrote_bytes: u64,
    lost_bytes: u64,
    chunks_sent: u64,
    chunks_lost: u64,
    last_reported_lost: u64,
    last_report: Option<Instant>,
}

struct Shared {
    socket: SocketHandle,
    state: RwLock<SrtState>,
    ending: AtomicBool,
    state_listener: Arc<dyn StateListener<SrtState>>,
    bandwidth_listener: ListenerSlot,
    sampler: Mutex<SrtStatsSampler>,
    counters: Mutex<SendCounters>,
    loss_report_interval: Duration,
    write_timeout: Duration,
    retry_delay: Duration,
}

impl Shared {
    fn state(&self) -> SrtState {
        *self.state.read()
    }

    fn is_ending(&self) -> bool {
        self.ending.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: SrtState) {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        debug!(from = previous.name(), to = next.name(), "SRT state");
        self.state_listener.on_state_changed(previous, next);
    }

    fn start_sampler(&self) {
        self.sampler
            .lock()
            .start(Arc::clone(&self.socket), Arc::clone(&self.bandwidth_listener));
    }

    fn stop_sampler(&self) {
        self.sampler.lock().stop();
    }

    /// Close and forget the current socket.
    fn drop_socket(&self) {
        if let Some(mut socket) = self.socket.lock().take() {
            if let Some(signal) = socket.write_signal() {
                signal.notify_all();
            }
            socket.close();
        }
    }

    /// Wake writers waiting on the current socket.
    fn wake_writers(&self) {
        let signal = self.socket.lock().as_ref().and_then(|s| s.write_signal());
        if let Some(signal) = signal {
            signal.notify_all();
        }
    }

    /// Write one chunk, waiting while the send buffer is full.
    ///
    /// The socket lock is held only for each non-blocking attempt. Returns
    /// the number of bytes accepted before the socket went away, a send
    /// failed or the session began ending.
    fn write_chunk(&self, chunk: &[u8]) -> usize {
        let mut offset = 0;
        while offset < chunk.len() && !self.is_ending() {
            let (result, signal) = {
                let mut guard = self.socket.lock();
                match guard.as_mut() {
                    Some(socket) if socket.status() == SocketStatus::Connected => {
                        (socket.send(&chunk[offset..]), socket.write_signal())
                    }
                    _ => {
                        trace!("Chunk not written: socket not connected");
                        break;
                    }
                }
            };

            match result {
                Ok(0) | Err(TransportError::WouldBlock) => {
                    let woken = match signal {
                        Some(signal) => signal.wait(self.write_timeout),
                        None => {
                            std::thread::sleep(self.write_timeout.min(self.retry_delay));
                            false
                        }
                    };
                    if !woken {
                        trace!(pending = chunk.len() - offset, "SRT write still blocked");
                    }
                }
                Ok(n) => offset += n,
                Err(e) => {
                    trace!("Chunk not written: {}", e);
                    break;
                }
            }
        }
        offset
    }

    /// Write `chunks` in order. Bytes that cannot be written count as lost.
    fn write_burst(&self, chunks: Vec<Bytes>) {
        if self.is_ending() {
            return;
        }

        let mut wrote = 0u64;
        let mut lost = 0u64;
        let mut sent_chunks = 0u64;
        let mut lost_chunks = 0u64;
        for chunk in &chunks {
            let written = self.write_chunk(chunk);
            wrote += written as u64;
            if written == chunk.len() {
                sent_chunks += 1;
            } else {
                lost += (chunk.len() - written) as u64;
                lost_chunks += 1;
            }
        }

        let mut counters = self.counters.lock();
        counters.wrote_bytes += wrote;
        counters.lost_bytes += lost;
        counters.chunks_sent += sent_chunks;
        counters.chunks_lost += lost_chunks;

        if counters.lost_bytes != counters.last_reported_lost {
            let now = Instant::now();
            let due = counters
                .last_report
                .map_or(true, |at| now.duration_since(at) >= self.loss_report_interval);
            if due {
                debug!(
                    lost_bytes = counters.lost_bytes,
                    sent_bytes = counters.wrote_bytes,
                    "SRT bytes lost"
                );
                counters.last_report = Some(now);
                counters.last_reported_lost = counters.lost_bytes;
            }
        }
    }
}

/// Publishes a byte stream (normally MPEG-TS) over SRT.
///
/// A dedicated thread owns the connection lifecycle; writes happen in
/// bursts on a task queue.
pub struct SrtSession {
    config: SrtConfig,
    connector: Arc<dyn SrtConnector>,
    shared: Arc<Shared>,
    accumulator: Mutex<ChunkAccumulator>,
    send_queue: Option<TaskQueue>,
    stop_tx: Option<Sender<()>>,
    event_loop: Option<JoinHandle<()>>,
}

impl SrtSession {
    pub fn new(
        config: SrtConfig,
        connector: Arc<dyn SrtConnector>,
        listener: Arc<dyn StateListener<SrtState>>,
    ) -> Self {
        let sampler = SrtStatsSampler::new(
            Duration::from_millis(config.stats_interval_ms),
            config.stats_window,
        );
        let shared = Arc::new(Shared {
            socket: Arc::new(Mutex::new(None)),
            state: RwLock::new(SrtState::None),
            ending: AtomicBool::new(false),
            state_listener: listener,
            bandwidth_listener: Arc::new(RwLock::new(None)),
            sampler: Mutex::new(sampler),
            counters: Mutex::new(SendCounters::default()),
            loss_report_interval: Duration::from_millis(config.loss_report_interval_ms),
            write_timeout: Duration::from_millis(config.write_timeout_ms),
            retry_delay: Duration::from_millis(config.poll_interval_ms),
        });

        Self {
            accumulator: Mutex::new(ChunkAccumulator::new(config.chunk_size)),
            config,
            connector,
            shared,
            send_queue: None,
            stop_tx: None,
            event_loop: None,
        }
    }

    /// Receive a report whenever the link statistics call for a rate change.
    pub fn set_bandwidth_listener(&self, listener: Arc<dyn BandwidthListener>) {
        *self.shared.bandwidth_listener.write() = Some(listener);
    }

    pub fn state(&self) -> SrtState {
        self.shared.state()
    }

    /// Latest link statistics, if the session has been connected.
    pub fn link_stats(&self) -> Option<SrtStats> {
        self.shared.sampler.lock().latest()
    }

    pub fn statistics(&self) -> TransportStatistics {
        let counters = self.shared.counters.lock();
        TransportStatistics {
            bytes_sent: counters.wrote_bytes,
            packets_sent: counters.chunks_sent,
            packets_dropped: counters.chunks_lost,
            bytes_lost: counters.lost_bytes,
            buffered_bytes: self.accumulator.lock().buffered_bytes() as u64,
        }
    }

    /// Parse `uri` and start connecting in the background.
    ///
    /// Configuration errors are returned here; connection failures are
    /// reported through the state listener.
    #[instrument(name = "srt_start", skip(self))]
    pub fn start(&mut self, uri: &str) -> TransportResult<()> {
        if self.event_loop.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        let target = SrtTarget::parse(uri, self.config.chunk_size)?;
        info!(%target, "Starting SRT session");

        self.shared.ending.store(false, Ordering::SeqCst);
        *self.shared.state.write() = SrtState::None;
        *self.shared.counters.lock() = SendCounters::default();
        self.accumulator.lock().clear();

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let shared = Arc::clone(&self.shared);
        let connector = Arc::clone(&self.connector);
        let config = self.config.clone();
        let handle = std::thread::Builder::new()
            .name("livecast-srt".to_string())
            .spawn(move || run_event_loop(shared, connector, target, config, stop_rx))?;

        self.send_queue = Some(TaskQueue::new("livecast-srt-send"));
        self.stop_tx = Some(stop_tx);
        self.event_loop = Some(handle);
        Ok(())
    }

    /// Append bytes to the outgoing stream. Empty `data` flushes.
    pub fn push(&self, data: &[u8]) {
        if data.is_empty() {
            self.flush();
            return;
        }
        if self.shared.is_ending() {
            return;
        }
        let burst = {
            let mut acc = self.accumulator.lock();
            acc.push(data);
            if acc.ready_count() >= self.config.burst_chunks {
                acc.take(false)
            } else {
                Vec::new()
            }
        };
        self.send(burst);
    }

    /// Send everything buffered, including a partial chunk.
    pub fn flush(&self) {
        let chunks = self.accumulator.lock().take(true);
        self.send(chunks);
    }

    fn send(&self, chunks: Vec<Bytes>) {
        if chunks.is_empty() {
            return;
        }
        let Some(queue) = &self.send_queue else {
            trace!(chunks = chunks.len(), "Dropping chunks, session not started");
            return;
        };
        let shared = Arc::clone(&self.shared);
        queue.enqueue(move || shared.write_burst(chunks));
    }

    /// Stop the event loop, discard unsent data and close the socket.
    #[instrument(name = "srt_stop", skip(self))]
    pub fn stop(&mut self) {
        let Some(handle) = self.event_loop.take() else {
            return;
        };
        info!("Stopping SRT session");

        self.shared.ending.store(true, Ordering::SeqCst);
        self.shared.wake_writers();
        if let Some(mut queue) = self.send_queue.take() {
            queue.shutdown();
        }
        self.stop_tx = None;
        if handle.join().is_err() {
            warn!("SRT event loop panicked");
        }

        self.shared.stop_sampler();
        self.shared.drop_socket();
        self.accumulator.lock().clear();

        let counters = self.shared.counters.lock();
        info!(
            sent_bytes = counters.wrote_bytes,
            lost_bytes = counters.lost_bytes,
            "SRT session stopped"
        );
    }
}

impl Drop for SrtSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_event_loop(
    shared: Arc<Shared>,
    connector: Arc<dyn SrtConnector>,
    target: SrtTarget,
    config: SrtConfig,
    stop_rx: Receiver<()>,
) {
    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    let reconnect_period = Duration::from_millis(config.reconnect_period_ms);
    let mut connected = false;
    let mut ever_connected = false;
    let mut reopen_at: Option<Instant> = None;

    loop {
        match stop_rx.recv_timeout(poll_interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        if shared.is_ending() {
            break;
        }

        if shared.socket.lock().is_none() {
            if reopen_at.is_some_and(|at| Instant::now() < at) {
                continue;
            }
            reopen_at = None;
            match connector.open(&target) {
                Ok(socket) => *shared.socket.lock() = Some(socket),
                Err(e) => {
                    error!(error = %e, "Failed to open SRT socket");
                    shared.set_state(SrtState::Error);
                    return;
                }
            }
            *shared.counters.lock() = SendCounters::default();
            if shared.state() != SrtState::Reconnecting {
                shared.set_state(SrtState::Connecting);
            }
        }

        let status = {
            let mut guard = shared.socket.lock();
            let Some(socket) = guard.as_mut() else {
                continue;
            };
            match socket.wait_event(Duration::ZERO) {
                Ok(true) => socket.status(),
                Ok(false) => continue,
                Err(e) => {
                    debug!("SRT poll failed: {}", e);
                    continue;
                }
            }
        };

        match status {
            SocketStatus::Listening => {
                let accepted = shared.socket.lock().as_mut().map(|s| s.accept());
                match accepted {
                    Some(Ok(peer)) => {
                        if let Some(mut listener) = shared.socket.lock().replace(peer) {
                            listener.close();
                        }
                        debug!("Accepted SRT connection");
                        connected = true;
                        ever_connected = true;
                        shared.set_state(SrtState::Connected);
                        shared.start_sampler();
                    }
                    Some(Err(TransportError::WouldBlock)) | None => {}
                    Some(Err(e)) => {
                        error!(error = %e, "Failed to accept SRT connection");
                        shared.set_state(SrtState::Error);
                        break;
                    }
                }
            }
            SocketStatus::Connected if !connected => {
                debug!("SRT target connected");
                connected = true;
                ever_connected = true;
                shared.set_state(SrtState::Connected);
                shared.start_sampler();
            }
            status if status.is_failed() => {
                if connected {
                    debug!(?status, "SRT target disconnected");
                    connected = false;
                    shared.set_state(SrtState::NotConnected);
                }
                shared.stop_sampler();
                shared.drop_socket();

                if !ever_connected || !config.auto_reconnect {
                    warn!(?status, ever_connected, "SRT connection failed");
                    shared.set_state(SrtState::Error);
                    break;
                }
                shared.set_state(SrtState::Reconnecting);
                reopen_at = Some(Instant::now() + reconnect_period);
            }
            _ => {}
        }
    }

    shared.stop_sampler();
    shared.drop_socket();
    trace!("SRT event loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::srt::socket::mock::MockConnector;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<SrtState>>);

    impl StateListener<SrtState> for Recorder {
        fn on_state_changed(&self, _previous: SrtState, current: SrtState) {
            self.0.lock().push(current);
        }
    }

    impl Recorder {
        fn states(&self) -> Vec<SrtState> {
            self.0.lock().clone()
        }

        fn wait_for(&self, state: SrtState) -> bool {
            let deadline = Instant::now() + Duration::from_secs(2);
            while Instant::now() < deadline {
                if self.states().contains(&state) {
                    return true;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            false
        }
    }

    fn fast_config() -> SrtConfig {
        SrtConfig {
            poll_interval_ms: 5,
            reconnect_period_ms: 100,
            stats_interval_ms: 10,
            ..SrtConfig::default()
        }
    }

    fn session(connector: &MockConnector, config: SrtConfig) -> (SrtSession, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let session = SrtSession::new(config, Arc::new(connector.clone()), recorder.clone());
        (session, recorder)
    }

    #[test]
    fn test_accumulator_fills_exact_chunks() {
        let mut acc = ChunkAccumulator::new(8);
        acc.push(&[1; 4]);
        acc.push(&[2; 4]);
        assert_eq!(acc.ready_count(), 1);
        acc.push(&[3; 6]);
        acc.push(&[4; 4]);
        // 6 + 4 does not fit: the first chunk closes short.
        assert_eq!(acc.ready_count(), 2);
        assert_eq!(acc.buffered_bytes(), 8 + 6 + 4);

        let chunks = acc.take(true);
        let lens: Vec<usize> = chunks.iter().map(Bytes::len).collect();
        assert_eq!(lens, vec![8, 6, 4]);
        assert_eq!(acc.buffered_bytes(), 0);
    }

    #[test]
    fn test_accumulator_splits_large_writes() {
        let mut acc = ChunkAccumulator::new(188);
        acc.push(&[0; 100]);
        acc.push(&[1; 188 * 2 + 50]);
        let lens: Vec<usize> = acc.take(true).iter().map(Bytes::len).collect();
        assert_eq!(lens, vec![100, 188, 188, 50]);
    }

    #[test]
    fn test_start_rejects_bad_uri() {
        let connector = MockConnector::new(SocketStatus::Connected);
        let (mut session, recorder) = session(&connector, fast_config());
        assert!(matches!(
            session.start("srt://host:80"),
            Err(TransportError::InvalidConfig(_))
        ));
        assert!(recorder.states().is_empty());
    }

    #[test]
    fn test_caller_connects_and_sends_bursts() {
        let connector = MockConnector::new(SocketStatus::Connected);
        let (mut session, recorder) = session(&connector, fast_config());
        session.start("srt://127.0.0.1:9000").unwrap();
        assert!(matches!(
            session.start("srt://127.0.0.1:9000"),
            Err(TransportError::AlreadyStarted)
        ));
        assert!(recorder.wait_for(SrtState::Connected));
        assert_eq!(
            recorder.states(),
            vec![SrtState::Connecting, SrtState::Connected]
        );

        // Nine full chunks stay buffered, the tenth triggers the burst.
        for _ in 0..9 {
            session.push(&[0x47; 1316]);
        }
        session.send_queue.as_ref().unwrap().drain();
        assert!(connector.written().is_empty());
        session.push(&[0x47; 1316]);
        session.send_queue.as_ref().unwrap().drain();
        assert_eq!(connector.written().len(), 10);

        session.push(&[0x47; 188]);
        session.push(&[]);
        session.send_queue.as_ref().unwrap().drain();
        let written = connector.written();
        assert_eq!(written.len(), 11);
        assert_eq!(written[10].len(), 188);

        let stats = session.statistics();
        assert_eq!(stats.bytes_sent, 1316 * 10 + 188);
        assert_eq!(stats.bytes_lost, 0);
        session.stop();
        assert!(connector.state.lock().closed >= 1);
    }

    #[test]
    fn test_writes_before_connect_are_lost() {
        let connector = MockConnector::new(SocketStatus::Connecting);
        let (mut session, recorder) = session(&connector, fast_config());
        session.start("srt://127.0.0.1:9000").unwrap();
        assert!(recorder.wait_for(SrtState::Connecting));

        session.push(&[0x47; 500]);
        session.flush();
        session.send_queue.as_ref().unwrap().drain();
        let stats = session.statistics();
        assert_eq!(stats.bytes_lost, 500);
        assert_eq!(stats.packets_dropped, 1);
        assert!(connector.written().is_empty());
    }

    #[test]
    fn test_listener_accepts_peer() {
        let connector = MockConnector::new(SocketStatus::Listening);
        let (mut session, recorder) = session(&connector, fast_config());
        session.start("srt://:9000").unwrap();
        assert!(recorder.wait_for(SrtState::Connected));
        let state = connector.state.lock();
        assert_eq!(state.accepted, 1);
        // The listening socket is closed once the peer is accepted.
        assert_eq!(state.closed, 1);
        assert_eq!(
            state.last_target.as_ref().map(|t| t.mode),
            Some(crate::srt::SrtMode::Listener)
        );
    }

    #[test]
    fn test_never_connected_is_error() {
        let connector = MockConnector::new(SocketStatus::Broken);
        let (mut session, recorder) = session(&connector, fast_config());
        session.start("srt://127.0.0.1:9000").unwrap();
        assert!(recorder.wait_for(SrtState::Error));
        assert_eq!(recorder.states(), vec![SrtState::Connecting, SrtState::Error]);
        assert_eq!(connector.state.lock().opened, 1);
    }

    #[test]
    fn test_reconnects_after_drop() {
        let connector = MockConnector::new(SocketStatus::Connected);
        let (mut session, recorder) = session(&connector, fast_config());
        session.start("srt://127.0.0.1:9000").unwrap();
        assert!(recorder.wait_for(SrtState::Connected));

        connector.set_status(SocketStatus::Broken);
        assert!(recorder.wait_for(SrtState::Reconnecting));
        connector.set_status(SocketStatus::Connected);

        let deadline = Instant::now() + Duration::from_secs(2);
        while recorder.states().len() < 5 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            recorder.states(),
            vec![
                SrtState::Connecting,
                SrtState::Connected,
                SrtState::NotConnected,
                SrtState::Reconnecting,
                SrtState::Connected,
            ]
        );
        assert_eq!(connector.state.lock().opened, 2);
        session.stop();
    }

    #[test]
    fn test_drop_without_reconnect_is_error() {
        let connector = MockConnector::new(SocketStatus::Connected);
        let config = SrtConfig {
            auto_reconnect: false,
            ..fast_config()
        };
        let (mut session, recorder) = session(&connector, config);
        session.start("srt://127.0.0.1:9000").unwrap();
        assert!(recorder.wait_for(SrtState::Connected));
        connector.set_status(SocketStatus::Closed);
        assert!(recorder.wait_for(SrtState::Error));
        assert_eq!(
            recorder.states(),
            vec![
                SrtState::Connecting,
                SrtState::Connected,
                SrtState::NotConnected,
                SrtState::Error,
            ]
        );
    }

    #[test]
    fn test_open_failure_is_error() {
        let connector = MockConnector::new(SocketStatus::Connected);
        connector.state.lock().fail_open = true;
        let (mut session, recorder) = session(&connector, fast_config());
        session.start("srt://127.0.0.1:9000").unwrap();
        assert!(recorder.wait_for(SrtState::Error));
        assert_eq!(recorder.states(), vec![SrtState::Error]);
    }

    fn wait_for_attempt(connector: &MockConnector) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while connector.state.lock().send_attempts == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_blocked_write_waits_outside_socket_lock() {
        let connector = MockConnector::new(SocketStatus::Connected);
        connector.state.lock().blocked_sends = usize::MAX;
        let config = SrtConfig {
            write_timeout_ms: 5_000,
            ..fast_config()
        };
        let (mut session, recorder) = session(&connector, config);
        session.start("srt://127.0.0.1:9000").unwrap();
        assert!(recorder.wait_for(SrtState::Connected));

        session.push(&[0x47; 1316]);
        session.flush();
        wait_for_attempt(&connector);

        // The event loop and sampler can still reach the socket.
        assert!(session
            .shared
            .socket
            .try_lock_for(Duration::from_millis(500))
            .is_some());
        assert!(connector.written().is_empty());

        connector.unblock();
        session.send_queue.as_ref().unwrap().drain();
        assert_eq!(connector.written().len(), 1);
        let stats = session.statistics();
        assert_eq!(stats.bytes_sent, 1316);
        assert_eq!(stats.bytes_lost, 0);
        session.stop();
    }

    #[test]
    fn test_blocked_write_retries_after_timeout() {
        let connector = MockConnector::new(SocketStatus::Connected);
        connector.state.lock().blocked_sends = 2;
        let config = SrtConfig {
            write_timeout_ms: 10,
            ..fast_config()
        };
        let (mut session, recorder) = session(&connector, config);
        session.start("srt://127.0.0.1:9000").unwrap();
        assert!(recorder.wait_for(SrtState::Connected));

        session.push(&[0x47; 188]);
        session.flush();
        session.send_queue.as_ref().unwrap().drain();
        assert_eq!(connector.state.lock().send_attempts, 3);
        assert_eq!(connector.written().len(), 1);
        assert_eq!(session.statistics().bytes_lost, 0);
        session.stop();
    }

    #[test]
    fn test_stop_releases_blocked_writer() {
        let connector = MockConnector::new(SocketStatus::Connected);
        connector.state.lock().blocked_sends = usize::MAX;
        let config = SrtConfig {
            write_timeout_ms: 5_000,
            ..fast_config()
        };
        let (mut session, recorder) = session(&connector, config);
        session.start("srt://127.0.0.1:9000").unwrap();
        assert!(recorder.wait_for(SrtState::Connected));

        session.push(&[0x47; 1316]);
        session.flush();
        wait_for_attempt(&connector);

        let started = Instant::now();
        session.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
        let stats = session.statistics();
        assert_eq!(stats.bytes_lost, 1316);
        assert_eq!(stats.packets_dropped, 1);
    }

    #[test]
    fn test_partial_write_sends_remainder() {
        let connector = MockConnector::new(SocketStatus::Connected);
        connector.state.lock().max_send = Some(500);
        let (mut session, recorder) = session(&connector, fast_config());
        session.start("srt://127.0.0.1:9000").unwrap();
        assert!(recorder.wait_for(SrtState::Connected));

        session.push(&[0x47; 1316]);
        session.flush();
        session.send_queue.as_ref().unwrap().drain();
        let lens: Vec<usize> = connector.written().iter().map(Vec::len).collect();
        assert_eq!(lens, vec![500, 500, 316]);
        let stats = session.statistics();
        assert_eq!(stats.bytes_sent, 1316);
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.bytes_lost, 0);
        session.stop();
    }
}
