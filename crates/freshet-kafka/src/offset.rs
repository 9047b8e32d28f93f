//! Per-record acknowledgement and commit handles.
//!
//! Every delivered record carries a [`ReceiverOffset`]. Downstream code
//! calls [`acknowledge`](ReceiverOffset::acknowledge) to mark the offset
//! eligible for the next commit, or [`commit`](ReceiverOffset::commit) to
//! additionally await that commit's outcome. Neither performs a commit by
//! itself; flushing is driven by the scheduler and the event loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::batch::CommittableBatch;
use crate::error::ReceiverError;
use crate::types::TopicPartition;

/// Shared per-subscription context behind every offset handle.
pub(crate) struct CommitContext {
    batch: CommittableBatch,
    commit_signal: mpsc::Sender<()>,
    commit_batch_size: usize,
    closed: AtomicBool,
    /// Nudges the event loop to flush (`schedule_commit_if_required`).
    trigger: Box<dyn Fn() + Send + Sync>,
}

impl CommitContext {
    pub(crate) fn new(
        batch: CommittableBatch,
        commit_signal: mpsc::Sender<()>,
        commit_batch_size: usize,
        trigger: Box<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            batch,
            commit_signal,
            commit_batch_size,
            closed: AtomicBool::new(false),
            trigger,
        }
    }

    /// Marks the subscription terminated: later `commit()` calls fail
    /// with [`ReceiverError::Closed`], `acknowledge()` becomes a no-op.
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Acknowledgement handle for one consumed record.
///
/// Cloneable and callable from any task. Both operations take effect at
/// most once; repeat calls are no-ops.
#[derive(Clone)]
pub struct ReceiverOffset {
    inner: Arc<OffsetInner>,
}

struct OffsetInner {
    topic_partition: TopicPartition,
    offset: i64,
    acknowledged: AtomicBool,
    ctx: Arc<CommitContext>,
}

impl ReceiverOffset {
    pub(crate) fn new(topic_partition: TopicPartition, offset: i64, ctx: Arc<CommitContext>) -> Self {
        Self {
            inner: Arc::new(OffsetInner {
                topic_partition,
                offset,
                acknowledged: AtomicBool::new(false),
                ctx,
            }),
        }
    }

    /// The partition this record was read from.
    #[must_use]
    pub fn topic_partition(&self) -> &TopicPartition {
        &self.inner.topic_partition
    }

    /// The record's offset within its partition.
    #[must_use]
    pub fn offset(&self) -> i64 {
        self.inner.offset
    }

    /// Marks the offset eligible to be committed.
    ///
    /// The first call records the offset in the commit batch; if a
    /// size-based commit strategy is configured and the pending count has
    /// reached its threshold, the commit scheduler is signalled. Repeat
    /// calls, and calls after the stream has terminated, do nothing.
    pub fn acknowledge(&self) {
        let ctx = &self.inner.ctx;
        if ctx.closed.load(Ordering::Acquire) {
            return;
        }
        if self
            .inner
            .acknowledged
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let pending = ctx
            .batch
            .acknowledge(&self.inner.topic_partition, self.inner.offset);
        if ctx.commit_batch_size >= 1 && pending >= ctx.commit_batch_size {
            // Rendezvous signal; a signal already in flight is enough.
            let _ = ctx.commit_signal.try_send(());
        }
    }

    /// Acknowledges the offset and waits for the next commit that covers
    /// it.
    ///
    /// Resolves when that commit completes. Repeat calls return
    /// immediately without registering a waiter.
    ///
    /// # Errors
    ///
    /// Returns the commit error on a terminal (non-retried) failure,
    /// [`ReceiverError::Revoked`] if the partition was revoked first, or
    /// [`ReceiverError::Closed`] if the stream has terminated.
    pub async fn commit(&self) -> Result<(), ReceiverError> {
        let ctx = &self.inner.ctx;
        if ctx.closed.load(Ordering::Acquire) {
            return Err(ReceiverError::Closed);
        }
        if self
            .inner
            .acknowledged
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        ctx.batch
            .acknowledge(&self.inner.topic_partition, self.inner.offset);
        let (tx, rx) = oneshot::channel();
        ctx.batch.add_waiter(tx);
        (ctx.trigger)();
        match rx.await {
            Ok(outcome) => outcome,
            // Waiter dropped without a verdict: the loop went away.
            Err(_) => Err(ReceiverError::Closed),
        }
    }
}

impl std::fmt::Debug for ReceiverOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverOffset")
            .field("topic_partition", &self.inner.topic_partition)
            .field("offset", &self.inner.offset)
            .field(
                "acknowledged",
                &self.inner.acknowledged.load(Ordering::Relaxed),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn context(batch: CommittableBatch, batch_size: usize) -> (Arc<CommitContext>, Arc<AtomicUsize>, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        let triggers = Arc::new(AtomicUsize::new(0));
        let triggers2 = Arc::clone(&triggers);
        let ctx = Arc::new(CommitContext::new(
            batch,
            tx,
            batch_size,
            Box::new(move || {
                triggers2.fetch_add(1, Ordering::SeqCst);
            }),
        ));
        (ctx, triggers, rx)
    }

    fn tp() -> TopicPartition {
        TopicPartition::new("events", 0)
    }

    #[tokio::test]
    async fn test_acknowledge_is_one_shot() {
        let batch = CommittableBatch::new(false);
        let (ctx, _triggers, _rx) = context(batch.clone(), 0);
        let offset = ReceiverOffset::new(tp(), 7, ctx);

        offset.acknowledge();
        offset.acknowledge();
        assert_eq!(batch.batch_size(), 1);
    }

    #[tokio::test]
    async fn test_acknowledge_signals_at_threshold() {
        let batch = CommittableBatch::new(false);
        let (ctx, _triggers, mut rx) = context(batch.clone(), 2);

        ReceiverOffset::new(tp(), 0, Arc::clone(&ctx)).acknowledge();
        assert!(rx.try_recv().is_err(), "below threshold");

        ReceiverOffset::new(tp(), 1, Arc::clone(&ctx)).acknowledge();
        assert!(rx.try_recv().is_ok(), "threshold reached");
    }

    #[tokio::test]
    async fn test_commit_registers_waiter_and_triggers() {
        let batch = CommittableBatch::new(false);
        let (ctx, triggers, _rx) = context(batch.clone(), 0);
        let offset = ReceiverOffset::new(tp(), 3, ctx);

        let pending = tokio::spawn({
            let offset = offset.clone();
            async move { offset.commit().await }
        });
        // Let the commit register its waiter.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(triggers.load(Ordering::SeqCst), 1);

        let args = batch.get_and_clear_offsets();
        assert_eq!(args.offsets[&tp()], 4);
        assert_eq!(args.waiters.len(), 1);
        for waiter in args.waiters {
            let _ = waiter.send(Ok(()));
        }
        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_commit_repeat_returns_immediately() {
        let batch = CommittableBatch::new(false);
        let (ctx, triggers, _rx) = context(batch.clone(), 0);
        let offset = ReceiverOffset::new(tp(), 3, ctx);

        offset.acknowledge();
        offset.commit().await.unwrap();
        assert_eq!(triggers.load(Ordering::SeqCst), 0, "no waiter registered");
    }

    #[tokio::test]
    async fn test_operations_after_close() {
        let batch = CommittableBatch::new(false);
        let (ctx, _triggers, _rx) = context(batch.clone(), 0);
        ctx.mark_closed();

        let offset = ReceiverOffset::new(tp(), 3, ctx);
        offset.acknowledge();
        assert_eq!(batch.batch_size(), 0);
        assert!(matches!(offset.commit().await, Err(ReceiverError::Closed)));
    }
}
