//! Committed-ahead offset tracking for at-most-once delivery.
//!
//! Under [`AckMode::AtMostOnce`](crate::config::AckMode::AtMostOnce) the
//! loop commits offsets synchronously before records are delivered.
//! [`AtMostOnceOffsets`] remembers those commits so the shutdown sequence
//! can skip re-committing offsets the broker already has.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::batch::CommittableBatch;
use crate::types::{OffsetMap, TopicPartition};

/// Per-partition record of offsets committed ahead of delivery.
#[derive(Clone, Default)]
pub(crate) struct AtMostOnceOffsets {
    inner: Arc<Mutex<OffsetMap>>,
}

impl AtMostOnceOffsets {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records a completed sync commit.
    pub(crate) fn on_commit(&self, offsets: &OffsetMap) {
        let mut inner = self.inner.lock();
        for (tp, next) in offsets {
            let entry = inner.entry(tp.clone()).or_insert(*next);
            if *next > *entry {
                *entry = *next;
            }
        }
    }

    /// Consulted at shutdown: drops batch entries whose offsets were
    /// already committed ahead of delivery. Returns whether any entry was
    /// corrected.
    pub(crate) fn undo_commit_ahead(&self, batch: &CommittableBatch) -> bool {
        let committed = self.inner.lock().clone();
        if committed.is_empty() {
            return false;
        }
        batch.discard_committed_ahead(&committed)
    }

    /// The committed-ahead offset for a partition, if any.
    #[cfg(test)]
    pub(crate) fn committed(&self, tp: &TopicPartition) -> Option<i64> {
        self.inner.lock().get(tp).copied()
    }
}

impl std::fmt::Debug for AtMostOnceOffsets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtMostOnceOffsets")
            .field("partitions", &self.inner.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp(partition: i32) -> TopicPartition {
        TopicPartition::new("events", partition)
    }

    #[test]
    fn test_on_commit_keeps_max() {
        let offsets = AtMostOnceOffsets::new();
        let mut map = OffsetMap::new();
        map.insert(tp(0), 5);
        offsets.on_commit(&map);

        map.insert(tp(0), 3);
        offsets.on_commit(&map);
        assert_eq!(offsets.committed(&tp(0)), Some(5));

        map.insert(tp(0), 8);
        offsets.on_commit(&map);
        assert_eq!(offsets.committed(&tp(0)), Some(8));
    }

    #[test]
    fn test_undo_commit_ahead_supersedes_batch() {
        let offsets = AtMostOnceOffsets::new();
        let batch = CommittableBatch::new(false);
        batch.update_offset(&tp(0), 4);

        let mut map = OffsetMap::new();
        map.insert(tp(0), 5);
        offsets.on_commit(&map);

        assert!(offsets.undo_commit_ahead(&batch));
        assert!(batch.get_and_clear_offsets().is_empty());
    }

    #[test]
    fn test_undo_commit_ahead_empty_tracker() {
        let offsets = AtMostOnceOffsets::new();
        let batch = CommittableBatch::new(false);
        batch.update_offset(&tp(0), 4);
        assert!(!offsets.undo_commit_ahead(&batch));
        assert!(!batch.get_and_clear_offsets().is_empty());
    }
}
