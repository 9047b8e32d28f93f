//! # Freshet Kafka
//!
//! Reactive, back-pressured Kafka receiver runtime.
//!
//! The crate bridges a blocking, thread-affine Kafka consumer to an
//! asynchronous, pull-driven stream of record batches, managing the
//! offset commit lifecycle under several delivery-guarantee modes.
//!
//! ## Architecture
//!
//! ```text
//! consumer thread (kafka-{group}-{n})        async runtime
//!   poll -> pause/resume -> commit    --->   rendezvous hand-off
//!   rebalance callbacks               <---   acknowledge / commit
//!   shutdown sequence                 <---   commit scheduler
//! ```
//!
//! Every Kafka client call is pinned to one dedicated thread; downstream
//! tasks interact only through atomic flags, submitted tasks, and the
//! rendezvous records channel. When downstream falls behind, the loop
//! stops polling and pauses the assignment on the broker until the
//! hand-off completes.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use freshet_kafka::{KafkaReceiver, ReceiverSettings, CommitStrategy};
//!
//! let settings = ReceiverSettings::builder()
//!     .group_id("analytics")
//!     .commit_strategy(CommitStrategy::BySizeOrTime(100, Duration::from_secs(5)))
//!     .build()?;
//! let receiver = KafkaReceiver::new(consumer, settings, vec!["events"])?;
//! let mut stream = receiver.receive()?;
//! while let Some(batch) = stream.recv().await {
//!     for record in batch? {
//!         process(record.record());
//!         record.offset().acknowledge();
//!     }
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Common test patterns that are acceptable
#![cfg_attr(
    test,
    allow(
        clippy::field_reassign_with_default,
        clippy::manual_let_else,
        clippy::needless_return,
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss,
        unused_mut
    )
)]

/// Receiver error types.
pub mod error;

/// Receiver configuration (settings, ack modes, commit strategies).
pub mod config;

/// Core value types (topic-partitions, records, offset maps).
pub mod types;

/// The consumer client contract.
pub mod client;

/// Receiver metrics counters.
pub mod metrics;

/// Per-record acknowledgement and commit handles.
pub mod offset;

/// The public receiver API and its streams.
pub mod receiver;

/// Testing utilities (mock consumer, record helpers).
pub mod testing;

/// rdkafka-backed consumer client.
#[cfg(feature = "rdkafka")]
pub mod rdkafka;

mod at_most_once;
mod batch;
mod event_loop;
mod handoff;
mod scheduler;
mod thread;

pub use client::{CommitCallback, ConsumerClient, RebalanceListener};
pub use config::{AckMode, CommitStrategy, ReceiverSettings, ReceiverSettingsBuilder};
pub use error::ReceiverError;
pub use metrics::{ReceiverMetrics, ReceiverMetricsSnapshot};
pub use offset::ReceiverOffset;
pub use receiver::{AtMostOnceRecords, KafkaReceiver, ReceiverRecord, ReceiverRecords};
pub use types::{OffsetMap, Record, TopicPartition};

#[cfg(feature = "rdkafka")]
pub use crate::rdkafka::{KafkaClientConfig, RdKafkaConsumer};
