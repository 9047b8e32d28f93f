//! The consumer event loop.
//!
//! Bridges the blocking, thread-affine consumer client to the async
//! record stream: a state machine interleaving polls, pause/resume for
//! backpressure, rebalance handling, batched offset tracking, and
//! scheduled commits with retry — all pinned to the consumer thread.
//!
//! Cross-thread interaction is restricted to atomic flag flips, task
//! submission to the consumer thread, and `wakeup()`. The records
//! hand-off is a rendezvous: when downstream is not ready the loop stops
//! polling, pauses every assigned partition, and hands the blocked send to
//! a runtime task so the consumer thread stays responsive to wakeups and
//! commits.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

use crate::at_most_once::AtMostOnceOffsets;
use crate::batch::{CommitArgs, CommittableBatch};
use crate::client::{CommitCallback, ConsumerClient, RebalanceListener};
use crate::config::{AckMode, ReceiverSettings};
use crate::error::ReceiverError;
use crate::handoff::{HandoffSender, TrySendError};
use crate::metrics::ReceiverMetrics;
use crate::thread::ConsumerThread;
use crate::types::{OffsetMap, Record, TopicPartition};

/// Poll/pause/commit state machine for one subscription.
pub(crate) struct EventLoop<C: ConsumerClient> {
    consumer: Arc<C>,
    settings: ReceiverSettings,
    thread: ConsumerThread,
    batch: CommittableBatch,
    at_most_once: AtMostOnceOffsets,
    records: HandoffSender<Vec<Record>>,
    metrics: Arc<ReceiverMetrics>,
    runtime: tokio::runtime::Handle,

    /// The loop may schedule further polls.
    is_polling: AtomicBool,
    /// Partitions are currently paused by the loop.
    is_paused: AtomicBool,
    /// Debounce: at most one poll task queued at a time.
    scheduled: AtomicBool,
    /// A commit should run on the next consumer-thread tick.
    commit_pending: AtomicBool,
    /// In-flight async commits.
    async_commits_in_progress: AtomicUsize,
    /// Reset to 0 by any successful non-empty commit.
    consecutive_commit_failures: AtomicU32,
    /// Between a failed retriable commit and its next attempt.
    is_retrying_commit: AtomicBool,
    /// Externally set; while true the loop pauses consumption.
    awaiting_transaction: AtomicBool,
    /// Partitions the user explicitly paused; survives rebalances.
    paused_by_user: Mutex<HashSet<TopicPartition>>,
}

impl<C: ConsumerClient> EventLoop<C> {
    pub(crate) fn new(
        consumer: Arc<C>,
        settings: ReceiverSettings,
        thread: ConsumerThread,
        records: HandoffSender<Vec<Record>>,
        metrics: Arc<ReceiverMetrics>,
        runtime: tokio::runtime::Handle,
    ) -> Arc<Self> {
        let batch = CommittableBatch::new(settings.max_deferred_commits > 0);
        Arc::new(Self {
            consumer,
            settings,
            thread,
            batch,
            at_most_once: AtMostOnceOffsets::new(),
            records,
            metrics,
            runtime,
            is_polling: AtomicBool::new(true),
            is_paused: AtomicBool::new(false),
            scheduled: AtomicBool::new(false),
            commit_pending: AtomicBool::new(false),
            async_commits_in_progress: AtomicUsize::new(0),
            consecutive_commit_failures: AtomicU32::new(0),
            is_retrying_commit: AtomicBool::new(false),
            awaiting_transaction: AtomicBool::new(false),
            paused_by_user: Mutex::new(HashSet::new()),
        })
    }

    pub(crate) fn batch(&self) -> &CommittableBatch {
        &self.batch
    }

    pub(crate) fn metrics(&self) -> &Arc<ReceiverMetrics> {
        &self.metrics
    }

    #[cfg(test)]
    pub(crate) fn consecutive_failures(&self) -> u32 {
        self.consecutive_commit_failures.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn is_retrying(&self) -> bool {
        self.is_retrying_commit.load(Ordering::Acquire)
    }

    /// Subscribes on the consumer thread and schedules the first poll.
    pub(crate) fn start(self: &Arc<Self>, topics: Vec<String>) {
        let listener: Arc<dyn RebalanceListener> = Arc::new(LoopRebalanceListener {
            inner: Arc::downgrade(self),
        });
        let this = Arc::clone(self);
        let submitted = self.thread.execute(move || {
            match this.consumer.subscribe(&topics, listener) {
                Ok(()) => debug!(?topics, "subscribed"),
                Err(e) => {
                    error!(error = %e, "subscription failed");
                    this.fatal_close(e);
                }
            }
        });
        if submitted {
            self.schedule_poll();
        } else {
            self.fatal_close(ReceiverError::ThreadUnavailable);
        }
    }

    /// Queues a poll task unless one is already queued.
    pub(crate) fn schedule_poll(self: &Arc<Self>) {
        if self
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let this = Arc::clone(self);
        self.thread.execute(move || {
            this.scheduled.store(false, Ordering::Release);
            if !this.records.is_closed() {
                this.poll();
            }
        });
    }

    /// Requests a commit on the next consumer-thread tick, unless one is
    /// already pending or a retry is in flight.
    pub(crate) fn schedule_commit_if_required(self: &Arc<Self>) {
        if self.is_retrying_commit.load(Ordering::Acquire) {
            return;
        }
        if self
            .commit_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let this = Arc::clone(self);
        if !self.thread.execute(move || this.commit()) {
            trace!("consumer thread gone; dropping commit request");
        }
    }

    /// Interrupts a blocking poll. Callable from any thread.
    pub(crate) fn wakeup(&self) {
        self.consumer.wakeup();
    }

    /// Pauses partitions on the user's behalf; remembered across
    /// rebalances and excluded from backpressure resume.
    pub(crate) fn pause_partitions(self: &Arc<Self>, partitions: Vec<TopicPartition>) {
        let this = Arc::clone(self);
        self.thread.execute(move || {
            this.paused_by_user.lock().extend(partitions.iter().cloned());
            if let Err(e) = this.consumer.pause(&partitions) {
                warn!(error = %e, "user pause failed");
            }
            debug!(partitions = partitions.len(), "user paused partitions");
        });
    }

    /// Resumes user-paused partitions.
    pub(crate) fn resume_partitions(self: &Arc<Self>, partitions: Vec<TopicPartition>) {
        let this = Arc::clone(self);
        self.thread.execute(move || {
            {
                let mut registry = this.paused_by_user.lock();
                for tp in &partitions {
                    registry.remove(tp);
                }
            }
            if let Err(e) = this.consumer.resume(&partitions) {
                warn!(error = %e, "user resume failed");
            }
            debug!(partitions = partitions.len(), "user resumed partitions");
        });
    }

    /// Gates consumption on an external transaction: while set, the next
    /// poll cycles pause every assigned partition.
    pub(crate) fn set_awaiting_transaction(&self, awaiting: bool) {
        self.awaiting_transaction.store(awaiting, Ordering::Release);
    }

    /// One turn of the poll state machine. Consumer thread only.
    fn poll(self: &Arc<Self>) {
        debug_assert!(self.thread.is_current());

        self.run_commit_if_required(false);

        let deferred_gate = self.settings.max_deferred_commits > 0
            && self.batch.deferred_count() >= self.settings.max_deferred_commits;
        let should_poll = self.is_polling.load(Ordering::Acquire)
            && !deferred_gate
            && !self.is_retrying_commit.load(Ordering::Acquire);

        if should_poll && !self.awaiting_transaction.load(Ordering::Acquire) {
            if self
                .is_paused
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let assignment = self.consumer.assignment();
                let resume: Vec<TopicPartition> = {
                    let registry = self.paused_by_user.lock();
                    assignment
                        .into_iter()
                        .filter(|tp| !registry.contains(tp))
                        .collect()
                };
                if let Err(e) = self.consumer.resume(&resume) {
                    warn!(error = %e, "resume failed");
                }
                trace!(partitions = resume.len(), "resumed consumption");
            }
        } else {
            self.pause_all_assigned();
        }

        let records = match self.consumer.poll(self.settings.poll_timeout) {
            Ok(records) => records,
            Err(ReceiverError::Wakeup) => {
                self.metrics.record_wakeup();
                Vec::new()
            }
            Err(e) => {
                error!(error = %e, "poll failed");
                self.fatal_close(e);
                return;
            }
        };

        if records.is_empty() {
            self.metrics.record_empty_poll();
            self.schedule_poll();
            return;
        }

        self.metrics.record_poll(records.len() as u64);
        if self.settings.max_deferred_commits > 0 {
            self.batch.add_uncommitted(&records);
        }

        match self.records.try_send(records) {
            Ok(()) => {
                self.metrics.record_batch_delivered();
                self.schedule_poll();
            }
            Err(TrySendError::Closed(_)) => {
                debug!("records channel closed; dropping polled batch");
            }
            Err(TrySendError::Full(records)) => {
                // Downstream is busy: stop polling and hand the blocking
                // send to the runtime so this thread stays available.
                self.is_polling.store(false, Ordering::Release);
                trace!("downstream busy; entering backpressure");
                let this = Arc::clone(self);
                self.runtime.spawn(async move {
                    match this.records.send(records).await {
                        Ok(()) => {
                            this.metrics.record_batch_delivered();
                            if this.is_paused.load(Ordering::Acquire) {
                                this.consumer.wakeup();
                            }
                            this.is_polling.store(true, Ordering::Release);
                            this.schedule_poll();
                        }
                        Err(()) => {
                            debug!("records channel closed during blocking hand-off");
                        }
                    }
                });
            }
        }
    }

    /// Transitions into the paused state and, on a fresh transition,
    /// remembers the user-paused set and pauses the full assignment.
    fn pause_all_assigned(&self) {
        if !self.pause_and_wakeup_if_needed() {
            return;
        }
        let user_paused = self.consumer.paused();
        self.paused_by_user.lock().extend(user_paused);
        let assignment: Vec<TopicPartition> = self.consumer.assignment().into_iter().collect();
        if let Err(e) = self.consumer.pause(&assignment) {
            warn!(error = %e, "pause failed");
        }
        trace!(partitions = assignment.len(), "paused consumption");
    }

    /// Sets `is_paused`; returns whether the transition was fresh. A fresh
    /// pause while polling wakes the consumer so a blocking poll returns
    /// early and re-enters the state machine.
    fn pause_and_wakeup_if_needed(&self) -> bool {
        if self
            .is_paused
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if self.is_polling.load(Ordering::Acquire) && !self.is_retrying_commit.load(Ordering::Acquire)
        {
            self.consumer.wakeup();
        }
        true
    }

    /// Runs a commit if one is pending (or forced) and no retry is in
    /// flight. Consumer thread only.
    fn run_commit_if_required(self: &Arc<Self>, force: bool) {
        if force {
            self.commit_pending.store(true, Ordering::Release);
        }
        if !self.is_retrying_commit.load(Ordering::Acquire)
            && self.commit_pending.load(Ordering::Acquire)
        {
            self.commit();
        }
    }

    /// Drains the batch and dispatches the commit per ack mode.
    fn commit(self: &Arc<Self>) {
        debug_assert!(self.thread.is_current());
        if self
            .commit_pending
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let args = self.batch.get_and_clear_offsets();
        if args.is_empty() {
            // Nothing to flush; resolve any waiters right away.
            self.commit_success(args, &OffsetMap::new());
            return;
        }
        match self.settings.ack_mode {
            AckMode::ManualAck | AckMode::AutoAck => self.commit_async_op(args),
            AckMode::AtMostOnce => self.commit_sync_op(args),
            AckMode::ExactlyOnce => {
                // Commits belong to the producer's transaction.
                for waiter in args.waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
        }
    }

    fn commit_async_op(self: &Arc<Self>, args: CommitArgs) {
        self.async_commits_in_progress.fetch_add(1, Ordering::AcqRel);
        let offsets = args.offsets.clone();
        let shared = Arc::new(Mutex::new(Some(args)));

        let callback: CommitCallback = {
            let this = Arc::clone(self);
            let shared = Arc::clone(&shared);
            let offsets = offsets.clone();
            Box::new(move |result| {
                let Some(args) = shared.lock().take() else {
                    return;
                };
                this.async_commits_in_progress.fetch_sub(1, Ordering::AcqRel);
                match result {
                    Ok(()) => this.commit_success(args, &offsets),
                    Err(e) => this.commit_failure(args, &e),
                }
            })
        };

        trace!(partitions = offsets.len(), "dispatching async commit");
        match self.consumer.commit_async(offsets, callback) {
            Ok(()) => {
                self.metrics.record_async_commit();
                // The client needs a poll to drive callback delivery.
                self.poll();
            }
            Err(e) => {
                if let Some(args) = shared.lock().take() {
                    self.async_commits_in_progress.fetch_sub(1, Ordering::AcqRel);
                    self.commit_failure(args, &e);
                }
            }
        }
    }

    fn commit_sync_op(self: &Arc<Self>, args: CommitArgs) {
        trace!(partitions = args.offsets.len(), "dispatching sync commit");
        match self.consumer.commit_sync(&args.offsets) {
            Ok(()) => {
                self.metrics.record_sync_commit();
                let offsets = args.offsets.clone();
                self.commit_success(args, &offsets);
                self.at_most_once.on_commit(&offsets);
            }
            Err(e) => self.commit_failure(args, &e),
        }
    }

    fn commit_success(self: &Arc<Self>, args: CommitArgs, offsets: &OffsetMap) {
        if !offsets.is_empty() {
            self.consecutive_commit_failures.store(0, Ordering::Release);
            debug!(partitions = offsets.len(), "commit succeeded");
        }
        if self
            .is_retrying_commit
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.poll();
        }
        for waiter in args.waiters {
            let _ = waiter.send(Ok(()));
        }
    }

    fn commit_failure(self: &Arc<Self>, mut args: CommitArgs, error: &ReceiverError) {
        self.metrics.record_commit_failure();
        let failures = self.consecutive_commit_failures.fetch_add(1, Ordering::AcqRel) + 1;

        if error.is_retriable() && failures < self.settings.max_commit_attempts {
            warn!(attempt = failures, error = %error, "commit failed; scheduling retry");
            self.batch.restore(args, true);
            self.commit_pending.store(true, Ordering::Release);
            self.is_retrying_commit.store(true, Ordering::Release);
            self.poll();

            let this = Arc::clone(self);
            let delay = self.settings.commit_retry_interval;
            self.runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                let again = Arc::clone(&this);
                if !this.thread.execute(move || again.commit()) {
                    debug!("consumer thread gone before commit retry");
                }
            });
            return;
        }

        let waiters = std::mem::take(&mut args.waiters);
        if waiters.is_empty() {
            error!(error = %error, "commit failed with no waiters; closing stream");
            self.fatal_close(error.clone());
        } else {
            warn!(error = %error, waiters = waiters.len(), "commit failed; notifying waiters");
            self.batch.restore(args, false);
            self.commit_pending.store(false, Ordering::Release);
            for waiter in waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
    }

    /// Acknowledges and synchronously flushes one offset ahead of
    /// delivery (at-most-once mode).
    pub(crate) async fn commit_ahead(
        self: &Arc<Self>,
        tp: TopicPartition,
        offset: i64,
    ) -> Result<(), ReceiverError> {
        self.batch.acknowledge(&tp, offset);
        let (tx, rx) = oneshot::channel();
        self.batch.add_waiter(tx);
        let this = Arc::clone(self);
        if !self.thread.execute(move || this.run_commit_if_required(true)) {
            return Err(ReceiverError::ThreadUnavailable);
        }
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ReceiverError::Closed),
        }
    }

    /// Closes the records channel with a fatal error. First close wins;
    /// a racing error is reported out of band.
    fn fatal_close(&self, error: ReceiverError) {
        if !self.records.close(Some(error.clone())) {
            error!(error = %error, "stream already closed; dropping error");
        }
    }

    /// Runs the shutdown sequence on the consumer thread, reporting the
    /// outcome through `done`.
    pub(crate) fn shutdown(self: &Arc<Self>, done: oneshot::Sender<Result<(), ReceiverError>>) {
        let this = Arc::clone(self);
        // If the thread is gone `done` is dropped and the caller observes
        // a cancelled wait.
        self.thread.execute(move || {
            let result = this.close_loop();
            let _ = done.send(result);
        });
    }

    fn close_loop(self: &Arc<Self>) -> Result<(), ReceiverError> {
        debug_assert!(self.thread.is_current());
        let deadline = Instant::now() + self.settings.close_timeout;
        let mut attempts = 3u32;
        loop {
            match self.close_once(deadline) {
                Err(ReceiverError::Wakeup) if attempts > 1 => {
                    attempts -= 1;
                    debug!(attempts_left = attempts, "wakeup during close; retrying");
                }
                result => return result,
            }
        }
    }

    fn close_once(self: &Arc<Self>, deadline: Instant) -> Result<(), ReceiverError> {
        if self.settings.ack_mode != AckMode::ExactlyOnce {
            let force = match self.settings.ack_mode {
                AckMode::AtMostOnce => self.at_most_once.undo_commit_ahead(&self.batch),
                _ => true,
            };
            self.run_commit_if_required(force);
            while self.async_commits_in_progress.load(Ordering::Acquire) > 0
                && Instant::now() < deadline
            {
                match self.consumer.poll(Duration::from_millis(1)) {
                    Ok(_) => {}
                    Err(e @ ReceiverError::Wakeup) => return Err(e),
                    Err(e) => {
                        warn!(error = %e, "poll failed while draining commits");
                        break;
                    }
                }
            }
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.consumer.close(remaining)
    }
}

impl<C: ConsumerClient> std::fmt::Debug for EventLoop<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("group_id", &self.settings.group_id)
            .field("ack_mode", &self.settings.ack_mode)
            .field("is_polling", &self.is_polling.load(Ordering::Relaxed))
            .field("is_paused", &self.is_paused.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Forwards client rebalance callbacks into the loop.
///
/// Holds a weak reference: the client (which owns the listener) must not
/// keep the loop alive.
struct LoopRebalanceListener<C: ConsumerClient> {
    inner: Weak<EventLoop<C>>,
}

impl<C: ConsumerClient> RebalanceListener for LoopRebalanceListener<C> {
    fn on_partitions_assigned(&self, partitions: &[TopicPartition]) {
        let Some(event_loop) = self.inner.upgrade() else {
            return;
        };
        event_loop.metrics.record_rebalance();
        debug!(partitions = partitions.len(), "partitions assigned");

        if event_loop.is_paused.load(Ordering::Acquire) {
            // Keep backpressure across the rebalance.
            if !partitions.is_empty() {
                if let Err(e) = event_loop.consumer.pause(partitions) {
                    warn!(error = %e, "re-pause after rebalance failed");
                }
            }
            return;
        }

        let assigned = event_loop.consumer.assignment();
        let repause: Vec<TopicPartition> = {
            let mut registry = event_loop.paused_by_user.lock();
            if registry.is_empty() {
                return;
            }
            // Iterate a snapshot; a user-paused partition that was not
            // reassigned is forgotten.
            let repause = partitions
                .iter()
                .filter(|tp| registry.contains(*tp))
                .cloned()
                .collect();
            registry.retain(|tp| assigned.contains(tp));
            repause
        };
        if !repause.is_empty() {
            if let Err(e) = event_loop.consumer.pause(&repause) {
                warn!(error = %e, "re-pause of user-paused partitions failed");
            }
            debug!(partitions = repause.len(), "re-paused user-paused partitions");
        }
    }

    fn on_partitions_revoked(&self, partitions: &[TopicPartition]) {
        let Some(event_loop) = self.inner.upgrade() else {
            return;
        };
        debug!(partitions = partitions.len(), "partitions revoked");

        if event_loop.settings.ack_mode != AckMode::AtMostOnce && !partitions.is_empty() {
            event_loop.run_commit_if_required(true);
        }
        let orphaned = event_loop.batch.on_partitions_revoked(partitions);
        for waiter in orphaned {
            let _ = waiter.send(Err(ReceiverError::Revoked));
        }
    }
}
