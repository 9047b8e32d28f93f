//! Dedicated consumer-owning worker thread.
//!
//! The Kafka client is not thread-safe: every client call must run on the
//! one thread that owns it. [`ConsumerThread`] is that thread — a named
//! worker (`kafka-{group_id}-{n}`) draining a FIFO task queue. Other
//! threads interact with the consumer only by submitting tasks here, by
//! flipping atomic flags, or through the records hand-off.
//!
//! A panicking task is contained and logged; the worker keeps serving the
//! queue. The worker exits once every task sender is gone and the queue
//! has drained.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::{self, ThreadId};

use tracing::{error, trace};

type Task = Box<dyn FnOnce() + Send + 'static>;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(0);

/// Handle to the consumer-owning worker thread.
pub(crate) struct ConsumerThread {
    tx: mpsc::Sender<Task>,
    worker_id: ThreadId,
    name: String,
}

impl ConsumerThread {
    /// Spawns the worker thread for the given consumer group.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be spawned.
    pub(crate) fn spawn(group_id: &str) -> std::io::Result<Self> {
        let n = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
        let name = format!("kafka-{group_id}-{n}");
        let (tx, rx) = mpsc::channel::<Task>();

        let thread_name = name.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            trace!(thread = %thread_name, "consumer thread started");
            while let Ok(task) = rx.recv() {
                if catch_unwind(AssertUnwindSafe(task)).is_err() {
                    error!(thread = %thread_name, "consumer task panicked");
                }
            }
            trace!(thread = %thread_name, "consumer thread stopped");
        })?;

        Ok(Self {
            tx,
            worker_id: handle.thread().id(),
            name,
        })
    }

    /// Submits a task to run on the worker.
    ///
    /// Returns `false` if the worker has already stopped.
    pub(crate) fn execute(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Box::new(task)).is_ok()
    }

    /// Returns `true` when called from the worker thread itself.
    ///
    /// Consumer-thread-only functions assert this in debug builds.
    pub(crate) fn is_current(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    /// The worker's thread name (`kafka-{group_id}-{n}`).
    #[allow(dead_code)]
    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for ConsumerThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerThread")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_tasks_run_in_submission_order() {
        let thread = ConsumerThread::spawn("order").unwrap();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..10 {
            let log = Arc::clone(&log);
            assert!(thread.execute(move || log.lock().push(i)));
        }

        let (tx, rx) = mpsc::channel();
        thread.execute(move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_is_current_only_on_worker() {
        let thread = ConsumerThread::spawn("affinity").unwrap();
        assert!(!thread.is_current());

        let (tx, rx) = mpsc::channel();
        let probe = Arc::new(thread);
        let probe2 = Arc::clone(&probe);
        probe.execute(move || {
            let _ = tx.send(probe2.is_current());
        });
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
    }

    #[test]
    fn test_thread_name_prefix() {
        let thread = ConsumerThread::spawn("payments").unwrap();
        assert!(thread.name().starts_with("kafka-payments-"));
    }

    #[test]
    fn test_panic_does_not_kill_worker() {
        let thread = ConsumerThread::spawn("panics").unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        thread.execute(|| panic!("scripted failure"));
        let ran2 = Arc::clone(&ran);
        let (tx, rx) = mpsc::channel();
        thread.execute(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        });

        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
