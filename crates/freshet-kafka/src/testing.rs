//! Testing utilities for the receiver runtime.
//!
//! [`MockConsumer`] implements [`ConsumerClient`] entirely in memory:
//! scripted record batches, programmable commit and close outcomes,
//! poll-driven delivery of async-commit callbacks and rebalance events,
//! and observable pause/commit state. Helper constructors build records
//! for tests.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::client::{CommitCallback, ConsumerClient, RebalanceListener};
use crate::error::ReceiverError;
use crate::types::{OffsetMap, Record, TopicPartition};

/// Builds `count` records for one partition starting at `first_offset`.
#[must_use]
pub fn mock_records(topic: &str, partition: i32, first_offset: i64, count: usize) -> Vec<Record> {
    (0..count as i64)
        .map(|i| {
            Record::new(topic, partition, first_offset + i)
                .with_payload(format!("payload_{}", first_offset + i))
        })
        .collect()
}

struct RebalanceEvent {
    revoked: Vec<TopicPartition>,
    assigned: Vec<TopicPartition>,
}

#[derive(Default)]
struct MockState {
    subscribed_topics: Option<Vec<String>>,
    listener: Option<Arc<dyn RebalanceListener>>,
    assignment: HashSet<TopicPartition>,
    paused: HashSet<TopicPartition>,
    script: VecDeque<Vec<Record>>,
    rebalance_events: VecDeque<RebalanceEvent>,
    pending_callbacks: Vec<(CommitCallback, Result<(), ReceiverError>)>,
    commit_outcomes: VecDeque<ReceiverError>,
    commit_call_errors: VecDeque<ReceiverError>,
    close_errors: VecDeque<ReceiverError>,
    committed: OffsetMap,
    wakeup: bool,
    wakeup_count: u64,
    commit_async_count: u64,
    commit_sync_count: u64,
    close_calls: u64,
}

/// In-memory [`ConsumerClient`] for tests.
///
/// Cloning shares the underlying state, so tests keep a handle for
/// scripting and assertions while the receiver owns another.
#[derive(Clone)]
pub struct MockConsumer {
    inner: Arc<MockInner>,
}

struct MockInner {
    state: Mutex<MockState>,
    available: Condvar,
}

impl Default for MockConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConsumer {
    /// Creates an empty mock with no assignment and no scripted batches.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockInner {
                state: Mutex::new(MockState::default()),
                available: Condvar::new(),
            }),
        }
    }

    /// Sets the current assignment directly (as if a rebalance completed
    /// before the first poll).
    pub fn assign(&self, partitions: Vec<TopicPartition>) {
        let mut st = self.inner.state.lock();
        st.assignment = partitions.into_iter().collect();
    }

    /// Queues a batch for a later poll.
    ///
    /// A batch is only delivered while every partition it touches is
    /// assigned and unpaused; otherwise it stays queued.
    pub fn enqueue_records(&self, records: Vec<Record>) {
        let mut st = self.inner.state.lock();
        st.script.push_back(records);
        self.inner.available.notify_all();
    }

    /// Queues a rebalance, delivered through the listener on the next
    /// poll: first the revoke callback, then the assignment switches to
    /// `assigned` (pause state of rebalanced partitions is dropped, as a
    /// real client does), then the assigned callback.
    pub fn trigger_rebalance(
        &self,
        revoked: Vec<TopicPartition>,
        assigned: Vec<TopicPartition>,
    ) {
        let mut st = self.inner.state.lock();
        st.rebalance_events
            .push_back(RebalanceEvent { revoked, assigned });
        self.inner.available.notify_all();
    }

    /// Scripts the outcome of the next commit (async or sync).
    pub fn fail_next_commit(&self, error: ReceiverError) {
        self.inner.state.lock().commit_outcomes.push_back(error);
    }

    /// Scripts the next `commit_async` call itself to fail (the callback
    /// is never invoked).
    pub fn fail_next_commit_call(&self, error: ReceiverError) {
        self.inner.state.lock().commit_call_errors.push_back(error);
    }

    /// Scripts the next `close` call to fail.
    pub fn fail_next_close(&self, error: ReceiverError) {
        self.inner.state.lock().close_errors.push_back(error);
    }

    /// The committed offset (next offset to read) for a partition.
    #[must_use]
    pub fn committed(&self, tp: &TopicPartition) -> Option<i64> {
        self.inner.state.lock().committed.get(tp).copied()
    }

    /// Topics passed to `subscribe`, if it was called.
    #[must_use]
    pub fn subscribed_topics(&self) -> Option<Vec<String>> {
        self.inner.state.lock().subscribed_topics.clone()
    }

    /// Number of `close` invocations.
    #[must_use]
    pub fn close_calls(&self) -> u64 {
        self.inner.state.lock().close_calls
    }

    /// Number of `wakeup` invocations.
    #[must_use]
    pub fn wakeup_count(&self) -> u64 {
        self.inner.state.lock().wakeup_count
    }

    /// Number of `commit_async` dispatches.
    #[must_use]
    pub fn commit_async_count(&self) -> u64 {
        self.inner.state.lock().commit_async_count
    }

    /// Number of `commit_sync` calls.
    #[must_use]
    pub fn commit_sync_count(&self) -> u64 {
        self.inner.state.lock().commit_sync_count
    }

    /// Remaining queued batches not yet delivered.
    #[must_use]
    pub fn queued_batches(&self) -> usize {
        self.inner.state.lock().script.len()
    }

    fn front_batch_deliverable(st: &MockState) -> bool {
        match st.script.front() {
            Some(batch) => batch.iter().all(|r| {
                let tp = r.topic_partition();
                st.assignment.contains(&tp) && !st.paused.contains(&tp)
            }),
            None => false,
        }
    }

    fn apply_commit(st: &mut MockState, offsets: &OffsetMap) {
        for (tp, next) in offsets {
            let entry = st.committed.entry(tp.clone()).or_insert(*next);
            if *next > *entry {
                *entry = *next;
            }
        }
    }
}

impl ConsumerClient for MockConsumer {
    fn subscribe(
        &self,
        topics: &[String],
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<(), ReceiverError> {
        let mut st = self.inner.state.lock();
        st.subscribed_topics = Some(topics.to_vec());
        st.listener = Some(listener);
        Ok(())
    }

    fn poll(&self, timeout: Duration) -> Result<Vec<Record>, ReceiverError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Rebalance events, delivered without holding the lock.
            let pending_event = {
                let mut st = self.inner.state.lock();
                st.rebalance_events
                    .pop_front()
                    .map(|ev| (st.listener.clone(), ev))
            };
            if let Some((listener, event)) = pending_event {
                if let Some(listener) = &listener {
                    listener.on_partitions_revoked(&event.revoked);
                }
                {
                    let mut st = self.inner.state.lock();
                    st.assignment = event.assigned.iter().cloned().collect();
                    // An eager rebalance resets pause state; the listener
                    // re-pauses what it needs to.
                    st.paused.clear();
                }
                if let Some(listener) = &listener {
                    listener.on_partitions_assigned(&event.assigned);
                }
                continue;
            }

            // Async commit callbacks, also lock-free during delivery.
            let callbacks = {
                let mut st = self.inner.state.lock();
                std::mem::take(&mut st.pending_callbacks)
            };
            if !callbacks.is_empty() {
                for (callback, outcome) in callbacks {
                    callback(outcome);
                }
                continue;
            }

            {
                let mut st = self.inner.state.lock();
                if st.wakeup {
                    st.wakeup = false;
                    return Err(ReceiverError::Wakeup);
                }
                if Self::front_batch_deliverable(&st) {
                    let batch = st.script.pop_front().unwrap_or_default();
                    return Ok(batch);
                }
                if Instant::now() >= deadline {
                    return Ok(Vec::new());
                }
                let _ = self.inner.available.wait_until(&mut st, deadline);
            }
        }
    }

    fn pause(&self, partitions: &[TopicPartition]) -> Result<(), ReceiverError> {
        let mut st = self.inner.state.lock();
        st.paused.extend(partitions.iter().cloned());
        Ok(())
    }

    fn resume(&self, partitions: &[TopicPartition]) -> Result<(), ReceiverError> {
        let mut st = self.inner.state.lock();
        for tp in partitions {
            st.paused.remove(tp);
        }
        self.inner.available.notify_all();
        Ok(())
    }

    fn assignment(&self) -> HashSet<TopicPartition> {
        self.inner.state.lock().assignment.clone()
    }

    fn paused(&self) -> HashSet<TopicPartition> {
        self.inner.state.lock().paused.clone()
    }

    fn commit_async(
        &self,
        offsets: OffsetMap,
        callback: CommitCallback,
    ) -> Result<(), ReceiverError> {
        let mut st = self.inner.state.lock();
        if let Some(err) = st.commit_call_errors.pop_front() {
            return Err(err);
        }
        st.commit_async_count += 1;
        let outcome = match st.commit_outcomes.pop_front() {
            Some(err) => Err(err),
            None => {
                Self::apply_commit(&mut st, &offsets);
                Ok(())
            }
        };
        st.pending_callbacks.push((callback, outcome));
        self.inner.available.notify_all();
        Ok(())
    }

    fn commit_sync(&self, offsets: &OffsetMap) -> Result<(), ReceiverError> {
        let mut st = self.inner.state.lock();
        st.commit_sync_count += 1;
        match st.commit_outcomes.pop_front() {
            Some(err) => Err(err),
            None => {
                Self::apply_commit(&mut st, offsets);
                Ok(())
            }
        }
    }

    fn wakeup(&self) {
        let mut st = self.inner.state.lock();
        st.wakeup = true;
        st.wakeup_count += 1;
        self.inner.available.notify_all();
    }

    fn close(&self, _timeout: Duration) -> Result<(), ReceiverError> {
        let mut st = self.inner.state.lock();
        st.close_calls += 1;
        match st.close_errors.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for MockConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("MockConsumer")
            .field("assignment", &st.assignment.len())
            .field("paused", &st.paused.len())
            .field("queued_batches", &st.script.len())
            .finish_non_exhaustive()
    }
}
