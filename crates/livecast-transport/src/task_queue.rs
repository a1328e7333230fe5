//! Ordered job execution on a dedicated thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, trace, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Barrier(Sender<()>),
}

/// A FIFO of jobs run one at a time on a named worker thread.
///
/// After [`mark_exiting`](TaskQueue::mark_exiting) queued and future jobs
/// are skipped. Dropping the queue shuts it down.
pub struct TaskQueue {
    name: String,
    sender: Option<Sender<Message>>,
    exiting: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    worker_id: Option<ThreadId>,
}

impl TaskQueue {
    pub fn new(name: &str) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let exiting = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&exiting);
        let thread_name = name.to_string();

        let worker = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || run_worker(&thread_name, receiver, flag));

        let (worker, worker_id) = match worker {
            Ok(handle) => {
                let id = handle.thread().id();
                (Some(handle), Some(id))
            }
            Err(e) => {
                warn!(queue = name, "Failed to spawn task queue worker: {}", e);
                (None, None)
            }
        };

        Self {
            name: name.to_string(),
            sender: Some(sender),
            exiting,
            worker,
            worker_id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `job` behind everything already enqueued.
    pub fn enqueue<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_exiting() {
            return;
        }
        if let Some(sender) = &self.sender {
            let _ = sender.send(Message::Run(Box::new(job)));
        }
    }

    /// Run `job` on the worker and wait for its result.
    ///
    /// Runs inline when called from the worker itself. Returns `None` when
    /// the job was skipped because the queue is exiting.
    pub fn enqueue_sync<F, R>(&self, job: F) -> Option<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_worker_thread() {
            return Some(job());
        }
        if self.is_exiting() {
            return None;
        }

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        self.enqueue(move || {
            let _ = done_tx.send(job());
        });
        // A skipped job drops `done_tx`, which ends the wait.
        done_rx.recv().ok()
    }

    /// Skip every pending and future job.
    pub fn mark_exiting(&self) {
        self.exiting.store(true, Ordering::SeqCst);
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    /// Block until everything enqueued so far has run or been skipped.
    pub fn drain(&self) {
        if self.is_worker_thread() {
            return;
        }
        let Some(sender) = &self.sender else {
            return;
        };
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        if sender.send(Message::Barrier(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }

    /// Mark exiting, drain and join the worker.
    pub fn shutdown(&mut self) {
        self.mark_exiting();
        self.drain();
        self.sender = None;
        if let Some(worker) = self.worker.take() {
            if self.is_worker_thread() {
                return;
            }
            if worker.join().is_err() {
                warn!(queue = %self.name, "Task queue worker panicked");
            }
            debug!(queue = %self.name, "Task queue stopped");
        }
    }

    fn is_worker_thread(&self) -> bool {
        self.worker_id == Some(std::thread::current().id())
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(name: &str, receiver: Receiver<Message>, exiting: Arc<AtomicBool>) {
    trace!(queue = name, "Task queue started");
    for message in receiver.iter() {
        match message {
            Message::Run(job) => {
                if exiting.load(Ordering::SeqCst) {
                    trace!(queue = name, "Skipping job");
                    continue;
                }
                job();
            }
            Message::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_in_order() {
        let queue = TaskQueue::new("test-order");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let seen = Arc::clone(&seen);
            queue.enqueue(move || seen.lock().push(i));
        }
        queue.drain();
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_enqueue_sync_returns_value() {
        let queue = TaskQueue::new("test-sync");
        assert_eq!(queue.enqueue_sync(|| 21 * 2), Some(42));
    }

    #[test]
    fn test_enqueue_sync_inline_on_worker() {
        let queue = Arc::new(TaskQueue::new("test-inline"));
        let inner = Arc::clone(&queue);
        // Would deadlock if the nested call waited for the worker.
        let result = queue.enqueue_sync(move || inner.enqueue_sync(|| 7));
        assert_eq!(result, Some(Some(7)));
    }

    #[test]
    fn test_exiting_skips_pending_jobs() {
        let queue = TaskQueue::new("test-exit");
        let ran = Arc::new(AtomicBool::new(false));

        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        queue.enqueue(move || {
            let _ = gate_rx.recv_timeout(Duration::from_secs(1));
        });
        let flag = Arc::clone(&ran);
        queue.enqueue(move || flag.store(true, Ordering::SeqCst));

        queue.mark_exiting();
        let _ = gate_tx.send(());
        queue.drain();

        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(queue.enqueue_sync(|| 1), None);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut queue = TaskQueue::new("test-shutdown");
        queue.enqueue(|| {});
        queue.shutdown();
        queue.shutdown();
        assert!(queue.is_exiting());
    }
}
