//! Receiver error types.
//!
//! [`ReceiverError`] is the unified error for all receiver operations.
//! Commit errors carry a retriable flag; [`ReceiverError::is_retriable`]
//! is the predicate consulted by the commit retry loop.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while receiving from Kafka.
#[derive(Debug, Clone, Error)]
pub enum ReceiverError {
    /// Subscribing to the topics failed.
    #[error("subscription failed: {0}")]
    Subscription(String),

    /// The consumer poll failed with a non-wakeup error.
    #[error("poll failed: {0}")]
    Poll(String),

    /// An offset commit failed.
    #[error("commit failed: {message}")]
    Commit {
        /// Description of the failure.
        message: String,
        /// Whether the failure is transient and the commit may be retried.
        retriable: bool,
    },

    /// A blocking consumer call was interrupted by `wakeup()`.
    ///
    /// Benign: the event loop treats a woken poll as an empty batch.
    #[error("consumer woken up")]
    Wakeup,

    /// Partitions were revoked before a pending commit could complete.
    #[error("partitions revoked before commit completed")]
    Revoked,

    /// Invalid receiver configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The receiver stream has terminated.
    #[error("receiver closed")]
    Closed,

    /// The shutdown sequence did not complete within the close timeout.
    #[error("close timed out after {0:?}")]
    CloseTimeout(Duration),

    /// The consumer thread is no longer accepting work.
    #[error("consumer thread unavailable")]
    ThreadUnavailable,
}

impl ReceiverError {
    /// Creates a retriable commit error.
    #[must_use]
    pub fn commit_retriable(message: impl Into<String>) -> Self {
        ReceiverError::Commit {
            message: message.into(),
            retriable: true,
        }
    }

    /// Creates a non-retriable commit error.
    #[must_use]
    pub fn commit_fatal(message: impl Into<String>) -> Self {
        ReceiverError::Commit {
            message: message.into(),
            retriable: false,
        }
    }

    /// Returns `true` if a failed commit may be retried.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, ReceiverError::Commit { retriable: true, .. })
    }
}
