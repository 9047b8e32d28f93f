//! Consumer client contract.
//!
//! [`ConsumerClient`] is the seam between the event loop and the
//! underlying Kafka client library. Implementations are expected to match
//! the classic consumer API: blocking calls, not thread-safe, with
//! `wakeup()` as the single sanctioned cross-thread signal that interrupts
//! a blocking `poll`.
//!
//! The event loop confines every call except `wakeup()` to the consumer
//! thread; implementations may rely on that. The crate ships
//! [`MockConsumer`](crate::testing::MockConsumer) for tests and, behind
//! the `rdkafka` feature, an adapter over `rdkafka`'s `BaseConsumer`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ReceiverError;
use crate::types::{OffsetMap, Record, TopicPartition};

/// Callback invoked with the outcome of an asynchronous commit.
///
/// Delivered on the consumer thread during a later `poll`.
pub type CommitCallback = Box<dyn FnOnce(Result<(), ReceiverError>) + Send>;

/// Receives partition assignment changes during group rebalances.
///
/// Invoked by the client on the consumer thread, from within `poll`.
pub trait RebalanceListener: Send + Sync {
    /// Partitions newly assigned to this consumer.
    fn on_partitions_assigned(&self, partitions: &[TopicPartition]);

    /// Partitions about to be revoked from this consumer.
    fn on_partitions_revoked(&self, partitions: &[TopicPartition]);
}

/// Blocking, thread-affine Kafka consumer client.
pub trait ConsumerClient: Send + Sync + 'static {
    /// Subscribes to the given topics, registering the rebalance listener.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Subscription`] if the subscription cannot
    /// be established.
    fn subscribe(
        &self,
        topics: &[String],
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<(), ReceiverError>;

    /// Blocks up to `timeout` waiting for records.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Wakeup`] when interrupted by [`wakeup`],
    /// which callers treat as an empty batch; any other error is fatal.
    ///
    /// [`wakeup`]: ConsumerClient::wakeup
    fn poll(&self, timeout: Duration) -> Result<Vec<Record>, ReceiverError>;

    /// Pauses record delivery for the given partitions.
    ///
    /// # Errors
    ///
    /// Returns an error if the client rejects the call.
    fn pause(&self, partitions: &[TopicPartition]) -> Result<(), ReceiverError>;

    /// Resumes record delivery for the given partitions.
    ///
    /// # Errors
    ///
    /// Returns an error if the client rejects the call.
    fn resume(&self, partitions: &[TopicPartition]) -> Result<(), ReceiverError>;

    /// The partitions currently assigned to this consumer.
    fn assignment(&self) -> HashSet<TopicPartition>;

    /// The partitions currently paused on this consumer.
    fn paused(&self) -> HashSet<TopicPartition>;

    /// Starts an asynchronous commit; `callback` fires on the consumer
    /// thread during a later `poll`.
    ///
    /// # Errors
    ///
    /// If the call itself fails the callback is never invoked and the
    /// error is returned directly.
    fn commit_async(
        &self,
        offsets: OffsetMap,
        callback: CommitCallback,
    ) -> Result<(), ReceiverError>;

    /// Commits synchronously, blocking until the broker responds.
    ///
    /// # Errors
    ///
    /// Returns a commit error; `is_retriable()` steers the retry loop.
    fn commit_sync(&self, offsets: &OffsetMap) -> Result<(), ReceiverError>;

    /// Interrupts an in-progress or upcoming `poll`, making it return
    /// [`ReceiverError::Wakeup`]. Callable from any thread.
    fn wakeup(&self);

    /// Closes the consumer, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Wakeup`] if a pending wakeup interrupted
    /// the close (the shutdown sequence retries), or any other close
    /// failure.
    fn close(&self, timeout: Duration) -> Result<(), ReceiverError>;
}
