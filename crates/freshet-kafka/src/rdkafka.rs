//! `ConsumerClient` adapter over rdkafka's `BaseConsumer`.
//!
//! Bridges the librdkafka consumer into the receiver's client contract:
//! a custom [`ConsumerContext`] forwards rebalance callbacks and async
//! commit outcomes (librdkafka delivers both from within `poll`, which
//! matches the contract's consumer-thread requirement).
//!
//! Two librdkafka gaps are papered over locally:
//!
//! - There is no `wakeup()`. The adapter slices each poll into short
//!   sub-polls and checks an internal wake flag, so a wakeup makes the
//!   current poll return [`ReceiverError::Wakeup`] promptly.
//! - The broker-side paused set is not queryable. The adapter mirrors
//!   `pause`/`resume` calls into a local set to serve `paused()`.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use ::rdkafka::config::ClientConfig;
use ::rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance};
use ::rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use ::rdkafka::message::Message;
use ::rdkafka::{ClientContext, Offset, TopicPartitionList};

use crate::client::{CommitCallback, ConsumerClient, RebalanceListener};
use crate::config::ReceiverSettings;
use crate::error::ReceiverError;
use crate::types::{OffsetMap, Record, TopicPartition};

/// How often a blocking poll re-checks the wake flag.
const WAKE_CHECK_SLICE: Duration = Duration::from_millis(10);

/// Broker connection configuration for [`RdKafkaConsumer`].
#[derive(Debug, Clone)]
pub struct KafkaClientConfig {
    /// Comma-separated `host:port` broker list.
    pub bootstrap_servers: String,
    /// Upper bound on records returned by one poll.
    pub max_poll_records: usize,
    /// Pass-through librdkafka properties (`security.protocol`, …).
    pub properties: Vec<(String, String)>,
}

impl KafkaClientConfig {
    /// Creates a config for the given broker list.
    #[must_use]
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            max_poll_records: 500,
            properties: Vec::new(),
        }
    }

    /// Adds a pass-through librdkafka property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    /// Builds the librdkafka configuration for a receiver in `group_id`.
    ///
    /// The receiver owns the commit lifecycle, so auto-commit is always
    /// disabled.
    #[must_use]
    pub fn to_rdkafka_config(&self, settings: &ReceiverSettings) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("group.id", &settings.group_id)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false");
        for (key, value) in &self.properties {
            config.set(key, value);
        }
        config
    }
}

/// Client context forwarding rebalance and commit callbacks.
struct ReceiverContext {
    listener: Mutex<Option<Arc<dyn RebalanceListener>>>,
    commit_callbacks: Mutex<VecDeque<CommitCallback>>,
    paused: Mutex<HashSet<TopicPartition>>,
    wake: AtomicBool,
}

impl ClientContext for ReceiverContext {}

impl ConsumerContext for ReceiverContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Revoke(partitions) = rebalance {
            let revoked = from_tpl(partitions);
            debug!(partitions = revoked.len(), "rebalance: revoking");
            let listener = self.listener.lock().clone();
            if let Some(listener) = listener {
                listener.on_partitions_revoked(&revoked);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                let assigned = from_tpl(partitions);
                debug!(partitions = assigned.len(), "rebalance: assigned");
                // Newly assigned partitions start unpaused.
                self.paused.lock().retain(|tp| !assigned.contains(tp));
                let listener = self.listener.lock().clone();
                if let Some(listener) = listener {
                    listener.on_partitions_assigned(&assigned);
                }
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => warn!(error = %e, "rebalance error"),
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        let Some(callback) = self.commit_callbacks.lock().pop_front() else {
            warn!(
                partitions = offsets.count(),
                "commit callback with no registered waiter"
            );
            return;
        };
        callback(result.map_err(map_commit_error));
    }
}

/// [`ConsumerClient`] backed by an rdkafka [`BaseConsumer`].
pub struct RdKafkaConsumer {
    consumer: BaseConsumer<ReceiverContext>,
    max_poll_records: usize,
}

impl RdKafkaConsumer {
    /// Creates the consumer. It connects lazily; the first poll after
    /// `subscribe` joins the group.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Subscription`] if librdkafka rejects the
    /// configuration.
    pub fn new(
        config: &KafkaClientConfig,
        settings: &ReceiverSettings,
    ) -> Result<Self, ReceiverError> {
        let context = ReceiverContext {
            listener: Mutex::new(None),
            commit_callbacks: Mutex::new(VecDeque::new()),
            paused: Mutex::new(HashSet::new()),
            wake: AtomicBool::new(false),
        };
        let consumer: BaseConsumer<ReceiverContext> = config
            .to_rdkafka_config(settings)
            .create_with_context(context)
            .map_err(|e| ReceiverError::Subscription(format!("failed to create consumer: {e}")))?;
        Ok(Self {
            consumer,
            max_poll_records: config.max_poll_records,
        })
    }
}

impl ConsumerClient for RdKafkaConsumer {
    fn subscribe(
        &self,
        topics: &[String],
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<(), ReceiverError> {
        *self.consumer.context().listener.lock() = Some(listener);
        let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&refs)
            .map_err(|e| ReceiverError::Subscription(format!("failed to subscribe: {e}")))
    }

    fn poll(&self, timeout: Duration) -> Result<Vec<Record>, ReceiverError> {
        let context = self.consumer.context();
        let deadline = Instant::now() + timeout;
        let mut records = Vec::new();

        loop {
            if context.wake.swap(false, Ordering::AcqRel) {
                if records.is_empty() {
                    return Err(ReceiverError::Wakeup);
                }
                return Ok(records);
            }
            let now = Instant::now();
            if now >= deadline || records.len() >= self.max_poll_records {
                return Ok(records);
            }
            let slice = deadline.saturating_duration_since(now).min(WAKE_CHECK_SLICE);
            match self.consumer.poll(slice) {
                Some(Ok(message)) => {
                    records.push(Record {
                        topic: message.topic().to_string(),
                        partition: message.partition(),
                        offset: message.offset(),
                        key: message.key().map(<[u8]>::to_vec),
                        payload: message.payload().map(<[u8]>::to_vec),
                        timestamp: message.timestamp().to_millis(),
                    });
                }
                Some(Err(e)) => {
                    if records.is_empty() {
                        return Err(ReceiverError::Poll(e.to_string()));
                    }
                    warn!(error = %e, "poll error after partial batch");
                    return Ok(records);
                }
                None => {
                    // Nothing buffered; hand back what we have rather than
                    // idling out the full timeout.
                    if !records.is_empty() {
                        return Ok(records);
                    }
                }
            }
        }
    }

    fn pause(&self, partitions: &[TopicPartition]) -> Result<(), ReceiverError> {
        self.consumer
            .pause(&to_tpl(partitions))
            .map_err(|e| ReceiverError::Poll(format!("pause failed: {e}")))?;
        self.consumer
            .context()
            .paused
            .lock()
            .extend(partitions.iter().cloned());
        Ok(())
    }

    fn resume(&self, partitions: &[TopicPartition]) -> Result<(), ReceiverError> {
        self.consumer
            .resume(&to_tpl(partitions))
            .map_err(|e| ReceiverError::Poll(format!("resume failed: {e}")))?;
        let mut paused = self.consumer.context().paused.lock();
        for tp in partitions {
            paused.remove(tp);
        }
        Ok(())
    }

    fn assignment(&self) -> HashSet<TopicPartition> {
        match self.consumer.assignment() {
            Ok(tpl) => from_tpl(&tpl).into_iter().collect(),
            Err(e) => {
                warn!(error = %e, "assignment query failed");
                HashSet::new()
            }
        }
    }

    fn paused(&self) -> HashSet<TopicPartition> {
        self.consumer.context().paused.lock().clone()
    }

    fn commit_async(
        &self,
        offsets: OffsetMap,
        callback: CommitCallback,
    ) -> Result<(), ReceiverError> {
        let tpl = to_commit_tpl(&offsets);
        let context = self.consumer.context();
        context.commit_callbacks.lock().push_back(callback);
        match self
            .consumer
            .commit(&tpl, ::rdkafka::consumer::CommitMode::Async)
        {
            Ok(()) => Ok(()),
            Err(e) => {
                // The dispatch failed before the broker saw it; the
                // callback we just queued will never fire.
                context.commit_callbacks.lock().pop_back();
                Err(map_commit_error(e))
            }
        }
    }

    fn commit_sync(&self, offsets: &OffsetMap) -> Result<(), ReceiverError> {
        self.consumer
            .commit(&to_commit_tpl(offsets), ::rdkafka::consumer::CommitMode::Sync)
            .map_err(map_commit_error)
    }

    fn wakeup(&self) {
        self.consumer.context().wake.store(true, Ordering::Release);
    }

    fn close(&self, _timeout: Duration) -> Result<(), ReceiverError> {
        self.consumer.unsubscribe();
        Ok(())
    }
}

impl std::fmt::Debug for RdKafkaConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdKafkaConsumer")
            .field("max_poll_records", &self.max_poll_records)
            .finish_non_exhaustive()
    }
}

fn to_tpl(partitions: &[TopicPartition]) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for tp in partitions {
        tpl.add_partition(&tp.topic, tp.partition);
    }
    tpl
}

fn to_commit_tpl(offsets: &OffsetMap) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for (tp, next) in offsets {
        tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(*next))
            .ok();
    }
    tpl
}

fn from_tpl(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
        .collect()
}

fn map_commit_error(error: KafkaError) -> ReceiverError {
    let retriable = matches!(
        error.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::OperationTimedOut
                | RDKafkaErrorCode::NotCoordinator
                | RDKafkaErrorCode::CoordinatorNotAvailable
                | RDKafkaErrorCode::CoordinatorLoadInProgress
                | RDKafkaErrorCode::NetworkException
                | RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::RebalanceInProgress
        )
    );
    ReceiverError::Commit {
        message: error.to_string(),
        retriable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rdkafka_config_keys() {
        let settings = ReceiverSettings::builder().group_id("adapter").build().unwrap();
        let config = KafkaClientConfig::new("broker-1:9092,broker-2:9092")
            .with_property("security.protocol", "plaintext");
        let rd = config.to_rdkafka_config(&settings);

        assert_eq!(rd.get("bootstrap.servers"), Some("broker-1:9092,broker-2:9092"));
        assert_eq!(rd.get("group.id"), Some("adapter"));
        assert_eq!(rd.get("enable.auto.commit"), Some("false"));
        assert_eq!(rd.get("security.protocol"), Some("plaintext"));
    }

    #[test]
    fn test_commit_tpl_encoding() {
        let mut offsets = OffsetMap::new();
        offsets.insert(TopicPartition::new("events", 0), 100);
        let tpl = to_commit_tpl(&offsets);

        let elements = tpl.elements();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].topic(), "events");
        assert_eq!(elements[0].offset(), Offset::Offset(100));
    }

    #[test]
    fn test_commit_error_classification() {
        let retriable = map_commit_error(KafkaError::ConsumerCommit(
            RDKafkaErrorCode::RequestTimedOut,
        ));
        assert!(retriable.is_retriable());

        let fatal = map_commit_error(KafkaError::ConsumerCommit(
            RDKafkaErrorCode::UnknownMemberId,
        ));
        assert!(!fatal.is_retriable());
    }
}
