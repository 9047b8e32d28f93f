//! Receiver metrics.
//!
//! [`ReceiverMetrics`] collects atomic counters on the poll and commit
//! paths. Counters are cheap to update from the consumer thread and can be
//! snapshotted from any thread.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for receiver activity.
#[derive(Debug, Default)]
pub struct ReceiverMetrics {
    records_polled: AtomicU64,
    empty_polls: AtomicU64,
    batches_delivered: AtomicU64,
    async_commits: AtomicU64,
    sync_commits: AtomicU64,
    commit_failures: AtomicU64,
    rebalances: AtomicU64,
    wakeups: AtomicU64,
}

impl ReceiverMetrics {
    /// Creates a zeroed metrics set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a poll that returned `records` records.
    pub fn record_poll(&self, records: u64) {
        self.records_polled.fetch_add(records, Ordering::Relaxed);
    }

    /// Records a poll that returned nothing.
    pub fn record_empty_poll(&self) {
        self.empty_polls.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a batch handed off downstream.
    pub fn record_batch_delivered(&self) {
        self.batches_delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a dispatched asynchronous commit.
    pub fn record_async_commit(&self) {
        self.async_commits.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a completed synchronous commit.
    pub fn record_sync_commit(&self) {
        self.sync_commits.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed commit attempt.
    pub fn record_commit_failure(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a rebalance callback.
    pub fn record_rebalance(&self) {
        self.rebalances.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a poll interrupted by wakeup.
    pub fn record_wakeup(&self) {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> ReceiverMetricsSnapshot {
        ReceiverMetricsSnapshot {
            records_polled: self.records_polled.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            async_commits: self.async_commits.load(Ordering::Relaxed),
            sync_commits: self.sync_commits.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            rebalances: self.rebalances.load(Ordering::Relaxed),
            wakeups: self.wakeups.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`ReceiverMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceiverMetricsSnapshot {
    /// Total records returned by polls.
    pub records_polled: u64,
    /// Polls that returned no records (including wakeups).
    pub empty_polls: u64,
    /// Batches handed off downstream.
    pub batches_delivered: u64,
    /// Asynchronous commits dispatched.
    pub async_commits: u64,
    /// Synchronous commits completed.
    pub sync_commits: u64,
    /// Failed commit attempts.
    pub commit_failures: u64,
    /// Rebalance callbacks observed.
    pub rebalances: u64,
    /// Polls interrupted by wakeup.
    pub wakeups: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_snapshot_is_zero() {
        let metrics = ReceiverMetrics::new();
        assert_eq!(metrics.snapshot(), ReceiverMetricsSnapshot::default());
    }

    #[test]
    fn test_counters_accumulate() {
        let metrics = ReceiverMetrics::new();
        metrics.record_poll(10);
        metrics.record_poll(5);
        metrics.record_empty_poll();
        metrics.record_batch_delivered();
        metrics.record_async_commit();
        metrics.record_sync_commit();
        metrics.record_commit_failure();
        metrics.record_rebalance();
        metrics.record_wakeup();

        let snap = metrics.snapshot();
        assert_eq!(snap.records_polled, 15);
        assert_eq!(snap.empty_polls, 1);
        assert_eq!(snap.batches_delivered, 1);
        assert_eq!(snap.async_commits, 1);
        assert_eq!(snap.sync_commits, 1);
        assert_eq!(snap.commit_failures, 1);
        assert_eq!(snap.rebalances, 1);
        assert_eq!(snap.wakeups, 1);
    }
}
