//! Core value types shared across the receiver runtime.
//!
//! [`TopicPartition`] identifies a single partition of a topic and is used
//! as the key for all offset bookkeeping. [`Record`] is one consumed Kafka
//! record; deserialization of keys and payloads is left to the caller.

use std::collections::HashMap;

/// A (topic, partition) pair.
///
/// Equality and hashing cover both fields. Displayed as
/// `"{topic}-{partition}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    /// Topic name.
    pub topic: String,
    /// Partition index within the topic.
    pub partition: i32,
}

impl TopicPartition {
    /// Creates a new topic-partition pair.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Map from topic-partition to a committed offset.
///
/// Per Kafka convention the stored offset is the next offset to read
/// (last consumed offset + 1).
pub type OffsetMap = HashMap<TopicPartition, i64>;

/// A single record consumed from Kafka.
///
/// Key and payload are raw bytes; format decoding is out of scope for the
/// receiver runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Topic the record was read from.
    pub topic: String,
    /// Partition the record was read from.
    pub partition: i32,
    /// Offset of the record within its partition.
    pub offset: i64,
    /// Message key, if present.
    pub key: Option<Vec<u8>>,
    /// Message payload, if present.
    pub payload: Option<Vec<u8>>,
    /// Broker or producer timestamp in milliseconds, if present.
    pub timestamp: Option<i64>,
}

impl Record {
    /// Creates a record with no key, payload, or timestamp.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            payload: None,
            timestamp: None,
        }
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Sets the key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Returns the topic-partition this record belongs to.
    #[must_use]
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_partition_equality() {
        let a = TopicPartition::new("events", 0);
        let b = TopicPartition::new("events", 0);
        let c = TopicPartition::new("events", 1);
        let d = TopicPartition::new("orders", 0);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_topic_partition_display() {
        let tp = TopicPartition::new("events", 3);
        assert_eq!(tp.to_string(), "events-3");
    }

    #[test]
    fn test_topic_partition_as_map_key() {
        let mut map: OffsetMap = HashMap::new();
        map.insert(TopicPartition::new("events", 0), 10);
        map.insert(TopicPartition::new("events", 0), 20);
        assert_eq!(map.len(), 1);
        assert_eq!(map[&TopicPartition::new("events", 0)], 20);
    }

    #[test]
    fn test_record_builders() {
        let rec = Record::new("events", 1, 42)
            .with_key("k1")
            .with_payload("hello");
        assert_eq!(rec.topic_partition(), TopicPartition::new("events", 1));
        assert_eq!(rec.offset, 42);
        assert_eq!(rec.key.as_deref(), Some(b"k1".as_slice()));
        assert_eq!(rec.payload.as_deref(), Some(b"hello".as_slice()));
    }
}
