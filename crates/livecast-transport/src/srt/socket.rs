//! The socket primitive the SRT session drives.
//!
//! The session never talks to an SRT library directly. The default
//! [`SrtConnector`] is [`TokioSrtConnector`](super::TokioSrtConnector); an
//! embedding application may supply its own binding, and tests plug in an
//! in-memory implementation.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::stats::SrtStats;
use super::uri::SrtTarget;
use crate::TransportResult;

/// Socket status as reported by the SRT library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    Init,
    Opened,
    /// Bound and waiting for a peer (listener mode).
    Listening,
    Connecting,
    Connected,
    Broken,
    Closing,
    Closed,
    NonExistent,
}

impl SocketStatus {
    /// The connection is gone and will not come back on this socket.
    pub fn is_failed(self) -> bool {
        matches!(self, Self::Broken | Self::Closed | Self::NonExistent)
    }
}

/// One SRT socket.
pub trait SrtSocket: Send {
    fn status(&self) -> SocketStatus;

    /// Wait up to `timeout` for a socket event. Returns whether one fired.
    /// A zero timeout only polls.
    fn wait_event(&mut self, timeout: Duration) -> TransportResult<bool>;

    /// Accept a pending peer on a listening socket.
    fn accept(&mut self) -> TransportResult<Box<dyn SrtSocket>>;

    /// Write one message without blocking. Returns the number of bytes
    /// accepted, or [`TransportError::WouldBlock`](crate::TransportError::WouldBlock)
    /// when the send buffer is full.
    fn send(&mut self, data: &[u8]) -> TransportResult<usize>;

    /// Counters since the last call with `clear` set.
    fn stats(&mut self, clear: bool) -> TransportResult<SrtStats>;

    fn close(&mut self);

    /// Notified whenever buffer space frees up. Writers on sockets without
    /// one retry after a short sleep.
    fn write_signal(&self) -> Option<Arc<WriteSignal>> {
        None
    }
}

/// Counting wake-up for writers blocked on a full send buffer.
#[derive(Debug, Default)]
pub struct WriteSignal {
    permits: Mutex<u64>,
    ready: Condvar,
}

impl WriteSignal {
    /// Record that a write may now succeed and wake one waiter.
    pub fn notify(&self) {
        *self.permits.lock() += 1;
        self.ready.notify_one();
    }

    /// Wake every waiter, as on teardown.
    pub fn notify_all(&self) {
        *self.permits.lock() += 1;
        self.ready.notify_all();
    }

    /// Wait up to `timeout` for a notification. Returns whether one was
    /// consumed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            self.ready.wait_for(&mut permits, timeout);
        }
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }
}

/// Creates sockets for a target.
pub trait SrtConnector: Send + Sync {
    /// Create a socket, apply `target`'s options and begin connecting
    /// (caller, rendezvous) or listening (listener). Must not block on the
    /// peer.
    fn open(&self, target: &SrtTarget) -> TransportResult<Box<dyn SrtSocket>>;
}

/// The session's current socket, shared by the event loop, the send jobs
/// and the statistics sampler.
pub(crate) type SocketHandle = Arc<Mutex<Option<Box<dyn SrtSocket>>>>;

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory socket whose status the test script drives.

    use std::collections::VecDeque;

    use super::*;
    use crate::TransportError;

    /// Everything a test can observe or steer.
    #[derive(Default)]
    pub struct MockState {
        /// Status returned until changed.
        pub status: Option<SocketStatus>,
        /// Statuses returned by successive `status` calls, before `status`.
        pub script: VecDeque<SocketStatus>,
        pub written: Vec<Vec<u8>>,
        pub stats: VecDeque<SrtStats>,
        pub opened: usize,
        pub accepted: usize,
        pub closed: usize,
        pub fail_open: bool,
        pub fail_send: bool,
        /// Sends rejected as would-block before writes go through again.
        pub blocked_sends: usize,
        /// Largest number of bytes one send accepts.
        pub max_send: Option<usize>,
        pub send_attempts: usize,
        pub last_target: Option<SrtTarget>,
    }

    #[derive(Clone, Default)]
    pub struct MockConnector {
        pub state: Arc<Mutex<MockState>>,
        pub signal: Arc<WriteSignal>,
    }

    impl MockConnector {
        pub fn new(initial: SocketStatus) -> Self {
            let connector = Self::default();
            connector.state.lock().status = Some(initial);
            connector
        }

        pub fn set_status(&self, status: SocketStatus) {
            self.state.lock().status = Some(status);
        }

        pub fn written(&self) -> Vec<Vec<u8>> {
            self.state.lock().written.clone()
        }

        /// Let blocked writes through and wake the writer.
        pub fn unblock(&self) {
            self.state.lock().blocked_sends = 0;
            self.signal.notify();
        }
    }

    impl SrtConnector for MockConnector {
        fn open(&self, target: &SrtTarget) -> TransportResult<Box<dyn SrtSocket>> {
            let mut state = self.state.lock();
            if state.fail_open {
                return Err(TransportError::Srt("open refused".to_string()));
            }
            state.opened += 1;
            state.last_target = Some(target.clone());
            Ok(Box::new(MockSocket {
                state: Arc::clone(&self.state),
                signal: Arc::clone(&self.signal),
                accepted: false,
            }))
        }
    }

    pub struct MockSocket {
        state: Arc<Mutex<MockState>>,
        signal: Arc<WriteSignal>,
        accepted: bool,
    }

    impl SrtSocket for MockSocket {
        fn status(&self) -> SocketStatus {
            let mut state = self.state.lock();
            if let Some(next) = state.script.pop_front() {
                return next;
            }
            let status = state.status.unwrap_or(SocketStatus::Init);
            if self.accepted && status == SocketStatus::Listening {
                SocketStatus::Connected
            } else {
                status
            }
        }

        fn wait_event(&mut self, timeout: Duration) -> TransportResult<bool> {
            if !timeout.is_zero() {
                std::thread::sleep(timeout);
            }
            Ok(true)
        }

        fn accept(&mut self) -> TransportResult<Box<dyn SrtSocket>> {
            self.state.lock().accepted += 1;
            Ok(Box::new(MockSocket {
                state: Arc::clone(&self.state),
                signal: Arc::clone(&self.signal),
                accepted: true,
            }))
        }

        fn send(&mut self, data: &[u8]) -> TransportResult<usize> {
            let mut state = self.state.lock();
            state.send_attempts += 1;
            if state.fail_send {
                return Err(TransportError::Srt("send failed".to_string()));
            }
            if state.blocked_sends > 0 {
                state.blocked_sends -= 1;
                return Err(TransportError::WouldBlock);
            }
            let len = state.max_send.map_or(data.len(), |max| max.min(data.len()));
            state.written.push(data[..len].to_vec());
            Ok(len)
        }

        fn stats(&mut self, _clear: bool) -> TransportResult<SrtStats> {
            Ok(self.state.lock().stats.pop_front().unwrap_or_default())
        }

        fn close(&mut self) {
            self.state.lock().closed += 1;
        }

        fn write_signal(&self) -> Option<Arc<WriteSignal>> {
            Some(Arc::clone(&self.signal))
        }
    }
}
