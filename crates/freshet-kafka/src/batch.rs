//! Commit batch accumulation.
//!
//! [`CommittableBatch`] gathers, per partition, the highest acknowledged
//! offset since the last flush, the number of acknowledgements that
//! contributed, and the callers waiting for the next successful commit.
//! When deferred-commit gating is enabled it also tracks every polled but
//! not yet acknowledged offset.
//!
//! All operations are internally synchronized and callable from any
//! thread. Committed offsets follow the Kafka next-offset-to-read
//! convention: the stored offset + 1 is what goes to the broker.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::ReceiverError;
use crate::types::{OffsetMap, Record, TopicPartition};

/// One-shot completion for a caller awaiting the next commit.
pub(crate) type CommitWaiter = oneshot::Sender<Result<(), ReceiverError>>;

/// Snapshot drained from the batch for a single commit attempt.
#[derive(Debug, Default)]
pub(crate) struct CommitArgs {
    /// Offsets to commit (next-offset-to-read per partition).
    pub offsets: OffsetMap,
    /// Acknowledgement counts that contributed, for restore on failure.
    pub counts: HashMap<TopicPartition, usize>,
    /// Waiters to resume on the terminal outcome.
    pub waiters: Vec<CommitWaiter>,
}

impl CommitArgs {
    /// Returns `true` when there is nothing to commit.
    ///
    /// Waiters may still be present: an empty flush resolves them
    /// immediately.
    pub(crate) fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// Thread-safe accumulator of offsets eligible to commit.
#[derive(Clone)]
pub(crate) struct CommittableBatch {
    inner: Arc<Mutex<BatchInner>>,
}

struct BatchInner {
    /// Highest acknowledged offset per partition since the last drain.
    latest_offsets: HashMap<TopicPartition, i64>,
    /// Acknowledgements per partition since the last drain.
    pending_counts: HashMap<TopicPartition, usize>,
    /// Running sum of `pending_counts`.
    pending_total: usize,
    /// Polled but unacknowledged offsets; maintained only when deferred
    /// gating is enabled.
    uncommitted: HashMap<TopicPartition, BTreeSet<i64>>,
    /// FIFO of callers awaiting the next successful flush.
    waiters: VecDeque<CommitWaiter>,
    track_uncommitted: bool,
}

impl CommittableBatch {
    /// Creates an empty batch. `track_uncommitted` enables the
    /// deferred-commit bookkeeping.
    pub(crate) fn new(track_uncommitted: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BatchInner {
                latest_offsets: HashMap::new(),
                pending_counts: HashMap::new(),
                pending_total: 0,
                uncommitted: HashMap::new(),
                waiters: VecDeque::new(),
                track_uncommitted,
            })),
        }
    }

    /// Raises the partition's offset and counts one acknowledgement.
    ///
    /// Returns the total pending acknowledgements across all partitions.
    pub(crate) fn update_offset(&self, tp: &TopicPartition, offset: i64) -> usize {
        let mut inner = self.inner.lock();
        inner.raise(tp, offset);
        inner.pending_total
    }

    /// Acknowledges one record: raises the offset and, when deferred
    /// gating is enabled, clears the exact offset from the unacknowledged
    /// set. Returns the total pending acknowledgements.
    pub(crate) fn acknowledge(&self, tp: &TopicPartition, offset: i64) -> usize {
        let mut inner = self.inner.lock();
        if inner.track_uncommitted {
            if let Some(set) = inner.uncommitted.get_mut(tp) {
                set.remove(&offset);
                if set.is_empty() {
                    inner.uncommitted.remove(tp);
                }
            }
        }
        inner.raise(tp, offset);
        inner.pending_total
    }

    /// Total acknowledgements awaiting flush.
    pub(crate) fn batch_size(&self) -> usize {
        self.inner.lock().pending_total
    }

    /// Total polled but unacknowledged records.
    pub(crate) fn deferred_count(&self) -> usize {
        self.inner.lock().uncommitted.values().map(BTreeSet::len).sum()
    }

    /// Registers polled records as unacknowledged.
    ///
    /// No-op unless deferred gating is enabled.
    pub(crate) fn add_uncommitted(&self, records: &[Record]) {
        let mut inner = self.inner.lock();
        if !inner.track_uncommitted {
            return;
        }
        for record in records {
            inner
                .uncommitted
                .entry(record.topic_partition())
                .or_default()
                .insert(record.offset);
        }
    }

    /// Appends a waiter resumed by the next commit outcome.
    pub(crate) fn add_waiter(&self, waiter: CommitWaiter) {
        self.inner.lock().waiters.push_back(waiter);
    }

    /// Atomically snapshots and resets the pending offsets, counts, and
    /// waiters. Committed offsets are stored offset + 1.
    pub(crate) fn get_and_clear_offsets(&self) -> CommitArgs {
        let mut inner = self.inner.lock();
        let offsets = inner
            .latest_offsets
            .drain()
            .map(|(tp, offset)| (tp, offset + 1))
            .collect();
        let counts = inner.pending_counts.drain().collect();
        inner.pending_total = 0;
        let waiters = inner.waiters.drain(..).collect();
        CommitArgs {
            offsets,
            counts,
            waiters,
        }
    }

    /// Merges a failed commit's snapshot back into the batch.
    ///
    /// Offsets are re-raised (the commit encoding is undone), counts are
    /// added back, and — when `restore_waiters` is set — the waiters are
    /// re-queued at the head in their original order.
    pub(crate) fn restore(&self, args: CommitArgs, restore_waiters: bool) {
        let mut inner = self.inner.lock();
        for (tp, committed) in args.offsets {
            inner.raise_only(&tp, committed - 1);
        }
        for (tp, count) in args.counts {
            *inner.pending_counts.entry(tp).or_insert(0) += count;
            inner.pending_total += count;
        }
        if restore_waiters {
            for waiter in args.waiters.into_iter().rev() {
                inner.waiters.push_front(waiter);
            }
        }
    }

    /// Drops all state for revoked partitions.
    ///
    /// If nothing remains to commit afterwards, pending waiters can never
    /// be satisfied by a later flush; they are handed back for the caller
    /// to fail with a revocation error.
    pub(crate) fn on_partitions_revoked(&self, partitions: &[TopicPartition]) -> Vec<CommitWaiter> {
        let mut inner = self.inner.lock();
        for tp in partitions {
            inner.latest_offsets.remove(tp);
            if let Some(count) = inner.pending_counts.remove(tp) {
                inner.pending_total -= count;
            }
            inner.uncommitted.remove(tp);
        }
        if inner.latest_offsets.is_empty() && !inner.waiters.is_empty() {
            inner.waiters.drain(..).collect()
        } else {
            Vec::new()
        }
    }

    /// Removes partitions whose accumulated offset is already covered by a
    /// commit performed ahead of delivery. Returns whether anything was
    /// corrected.
    pub(crate) fn discard_committed_ahead(&self, committed: &OffsetMap) -> bool {
        let mut inner = self.inner.lock();
        let mut corrected = false;
        for (tp, committed_next) in committed {
            let superseded = match inner.latest_offsets.get(tp) {
                Some(latest) => *committed_next > *latest,
                None => false,
            };
            if superseded {
                inner.latest_offsets.remove(tp);
                if let Some(count) = inner.pending_counts.remove(tp) {
                    inner.pending_total -= count;
                }
                corrected = true;
            }
        }
        corrected
    }
}

impl BatchInner {
    fn raise(&mut self, tp: &TopicPartition, offset: i64) {
        self.raise_only(tp, offset);
        *self.pending_counts.entry(tp.clone()).or_insert(0) += 1;
        self.pending_total += 1;
    }

    fn raise_only(&mut self, tp: &TopicPartition, offset: i64) {
        match self.latest_offsets.get_mut(tp) {
            Some(existing) => {
                if offset > *existing {
                    *existing = offset;
                }
            }
            None => {
                self.latest_offsets.insert(tp.clone(), offset);
            }
        }
    }
}

impl std::fmt::Debug for CommittableBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CommittableBatch")
            .field("partitions", &inner.latest_offsets.len())
            .field("pending", &inner.pending_total)
            .field("waiters", &inner.waiters.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp(partition: i32) -> TopicPartition {
        TopicPartition::new("events", partition)
    }

    #[test]
    fn test_update_offset_keeps_max() {
        let batch = CommittableBatch::new(false);
        assert_eq!(batch.update_offset(&tp(0), 5), 1);
        assert_eq!(batch.update_offset(&tp(0), 3), 2);
        assert_eq!(batch.update_offset(&tp(1), 9), 3);

        let args = batch.get_and_clear_offsets();
        assert_eq!(args.offsets[&tp(0)], 6);
        assert_eq!(args.offsets[&tp(1)], 10);
        assert_eq!(args.counts[&tp(0)], 2);
        assert_eq!(args.counts[&tp(1)], 1);
    }

    #[test]
    fn test_drain_resets_state() {
        let batch = CommittableBatch::new(false);
        batch.update_offset(&tp(0), 5);
        let first = batch.get_and_clear_offsets();
        assert!(!first.is_empty());

        assert_eq!(batch.batch_size(), 0);
        let second = batch.get_and_clear_offsets();
        assert!(second.is_empty());
    }

    #[test]
    fn test_empty_drain_still_carries_waiters() {
        let batch = CommittableBatch::new(false);
        let (tx, _rx) = oneshot::channel();
        batch.add_waiter(tx);

        let args = batch.get_and_clear_offsets();
        assert!(args.is_empty());
        assert_eq!(args.waiters.len(), 1);
    }

    #[test]
    fn test_restore_re_raises_offsets_and_counts() {
        let batch = CommittableBatch::new(false);
        batch.update_offset(&tp(0), 5);
        let args = batch.get_and_clear_offsets();

        // Progress happened while the failed commit was in flight.
        batch.update_offset(&tp(0), 8);
        batch.restore(args, true);

        let drained = batch.get_and_clear_offsets();
        assert_eq!(drained.offsets[&tp(0)], 9, "newer offset wins");
        assert_eq!(drained.counts[&tp(0)], 2);
    }

    #[test]
    fn test_restore_waiters_keep_fifo_order() {
        let batch = CommittableBatch::new(false);
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        batch.add_waiter(tx1);
        batch.add_waiter(tx2);
        batch.update_offset(&tp(0), 1);

        let args = batch.get_and_clear_offsets();
        batch.restore(args, true);

        let (tx3, mut rx3) = oneshot::channel();
        batch.add_waiter(tx3);

        let drained = batch.get_and_clear_offsets();
        assert_eq!(drained.waiters.len(), 3);
        for waiter in drained.waiters {
            let _ = waiter.send(Ok(()));
        }
        // All three complete; order of delivery is list order.
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_ok());
    }

    #[test]
    fn test_deferred_tracking_roundtrip() {
        let batch = CommittableBatch::new(true);
        let records = vec![
            Record::new("events", 0, 0),
            Record::new("events", 0, 1),
            Record::new("events", 1, 0),
        ];
        batch.add_uncommitted(&records);
        assert_eq!(batch.deferred_count(), 3);

        batch.acknowledge(&tp(0), 1);
        assert_eq!(batch.deferred_count(), 2);
        batch.acknowledge(&tp(0), 0);
        batch.acknowledge(&tp(1), 0);
        assert_eq!(batch.deferred_count(), 0);
    }

    #[test]
    fn test_deferred_tracking_disabled_is_noop() {
        let batch = CommittableBatch::new(false);
        batch.add_uncommitted(&[Record::new("events", 0, 0)]);
        assert_eq!(batch.deferred_count(), 0);
    }

    #[test]
    fn test_revoke_drops_partition_state() {
        let batch = CommittableBatch::new(true);
        batch.add_uncommitted(&[Record::new("events", 0, 0), Record::new("events", 1, 0)]);
        batch.acknowledge(&tp(0), 0);
        batch.acknowledge(&tp(1), 0);

        let waiters = batch.on_partitions_revoked(&[tp(0)]);
        assert!(waiters.is_empty(), "offsets remain for partition 1");

        let args = batch.get_and_clear_offsets();
        assert!(!args.offsets.contains_key(&tp(0)));
        assert_eq!(args.offsets[&tp(1)], 1);
    }

    #[test]
    fn test_revoke_of_everything_hands_back_waiters() {
        let batch = CommittableBatch::new(false);
        batch.update_offset(&tp(0), 3);
        let (tx, mut rx) = oneshot::channel();
        batch.add_waiter(tx);

        let waiters = batch.on_partitions_revoked(&[tp(0)]);
        assert_eq!(waiters.len(), 1);
        for waiter in waiters {
            let _ = waiter.send(Err(ReceiverError::Revoked));
        }
        assert!(matches!(rx.try_recv(), Ok(Err(ReceiverError::Revoked))));
        assert_eq!(batch.batch_size(), 0);
    }

    #[test]
    fn test_discard_committed_ahead() {
        let batch = CommittableBatch::new(false);
        batch.update_offset(&tp(0), 4);
        batch.update_offset(&tp(1), 9);

        let mut committed = OffsetMap::new();
        committed.insert(tp(0), 5); // covers offset 4
        committed.insert(tp(1), 8); // does not cover offset 9

        assert!(batch.discard_committed_ahead(&committed));
        let args = batch.get_and_clear_offsets();
        assert!(!args.offsets.contains_key(&tp(0)));
        assert_eq!(args.offsets[&tp(1)], 10);
    }

    #[test]
    fn test_discard_committed_ahead_nothing_to_correct() {
        let batch = CommittableBatch::new(false);
        batch.update_offset(&tp(0), 9);

        let mut committed = OffsetMap::new();
        committed.insert(tp(0), 5);
        assert!(!batch.discard_committed_ahead(&committed));
    }
}
