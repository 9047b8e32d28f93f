//! Receiver configuration.
//!
//! [`ReceiverSettings`] configures poll cadence, delivery guarantees, and
//! the commit lifecycle. Construct via [`ReceiverSettings::builder`] or
//! start from [`ReceiverSettings::default`] and adjust fields; call
//! [`ReceiverSettings::validate`] before use (the receiver does so on
//! construction).

use std::time::Duration;

use crate::error::ReceiverError;

/// Delivery guarantee / acknowledgement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Records are committed only after the caller acknowledges them.
    #[default]
    ManualAck,
    /// Records are acknowledged transparently after downstream consumes
    /// a batch, then committed like [`AckMode::ManualAck`].
    AutoAck,
    /// Offsets are committed synchronously before each record is
    /// delivered downstream.
    AtMostOnce,
    /// Commits are delegated to a transactional producer; the receiver
    /// itself never commits.
    ExactlyOnce,
}

impl AckMode {
    /// Returns the canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::ManualAck => "manual_ack",
            AckMode::AutoAck => "auto_ack",
            AckMode::AtMostOnce => "at_most_once",
            AckMode::ExactlyOnce => "exactly_once",
        }
    }
}

impl std::str::FromStr for AckMode {
    type Err = ReceiverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "manual_ack" | "manual" => Ok(AckMode::ManualAck),
            "auto_ack" | "auto" => Ok(AckMode::AutoAck),
            "at_most_once" | "atmost_once" => Ok(AckMode::AtMostOnce),
            "exactly_once" => Ok(AckMode::ExactlyOnce),
            other => Err(ReceiverError::Configuration(format!(
                "invalid ack mode: '{other}' (expected manual_ack/auto_ack/at_most_once/exactly_once)"
            ))),
        }
    }
}

impl std::fmt::Display for AckMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// When the scheduler triggers offset commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStrategy {
    /// Commit once at least `n` acknowledgements have accumulated.
    BySize(usize),
    /// Commit on a fixed interval.
    ByTime(Duration),
    /// Commit when either the size threshold or the interval fires,
    /// whichever occurs first.
    BySizeOrTime(usize, Duration),
}

impl CommitStrategy {
    /// The acknowledgement count that triggers a size-based commit,
    /// or 0 when size is not a trigger.
    #[must_use]
    pub fn commit_batch_size(&self) -> usize {
        match self {
            CommitStrategy::BySize(n) | CommitStrategy::BySizeOrTime(n, _) => *n,
            CommitStrategy::ByTime(_) => 0,
        }
    }

    /// The interval for time-based commits, if time is a trigger.
    #[must_use]
    pub fn commit_interval(&self) -> Option<Duration> {
        match self {
            CommitStrategy::ByTime(d) | CommitStrategy::BySizeOrTime(_, d) => Some(*d),
            CommitStrategy::BySize(_) => None,
        }
    }
}

impl Default for CommitStrategy {
    fn default() -> Self {
        CommitStrategy::ByTime(Duration::from_secs(5))
    }
}

/// Configuration for a [`KafkaReceiver`](crate::receiver::KafkaReceiver).
#[derive(Debug, Clone)]
pub struct ReceiverSettings {
    /// Consumer group id. Also names the consumer thread
    /// (`kafka-{group_id}-{n}`).
    pub group_id: String,
    /// Maximum time a single poll blocks waiting for records.
    pub poll_timeout: Duration,
    /// When the scheduler triggers commits.
    pub commit_strategy: CommitStrategy,
    /// Delay before retrying a failed commit.
    pub commit_retry_interval: Duration,
    /// Consecutive commit failures tolerated before the error surfaces.
    pub max_commit_attempts: u32,
    /// If > 0, stop polling and pause once this many polled records are
    /// still unacknowledged.
    pub max_deferred_commits: usize,
    /// Upper bound for the shutdown sequence.
    pub close_timeout: Duration,
    /// Delivery guarantee mode used by `receive()`.
    pub ack_mode: AckMode,
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self {
            group_id: "freshet".to_string(),
            poll_timeout: Duration::from_millis(100),
            commit_strategy: CommitStrategy::default(),
            commit_retry_interval: Duration::from_millis(500),
            max_commit_attempts: 100,
            max_deferred_commits: 0,
            close_timeout: Duration::from_secs(30),
            ack_mode: AckMode::default(),
        }
    }
}

impl ReceiverSettings {
    /// Creates a new settings builder.
    #[must_use]
    pub fn builder() -> ReceiverSettingsBuilder {
        ReceiverSettingsBuilder::default()
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Configuration`] if any field is out of
    /// range: empty group id, zero poll timeout, zero commit retry
    /// interval, zero commit attempts, or a zero size/interval in the
    /// commit strategy.
    pub fn validate(&self) -> Result<(), ReceiverError> {
        if self.group_id.is_empty() {
            return Err(ReceiverError::Configuration(
                "group_id must not be empty".to_string(),
            ));
        }
        if self.poll_timeout.is_zero() {
            return Err(ReceiverError::Configuration(
                "poll_timeout must be > 0".to_string(),
            ));
        }
        if self.commit_retry_interval.is_zero() {
            return Err(ReceiverError::Configuration(
                "commit_retry_interval must be > 0".to_string(),
            ));
        }
        if self.max_commit_attempts == 0 {
            return Err(ReceiverError::Configuration(
                "max_commit_attempts must be >= 1".to_string(),
            ));
        }
        match self.commit_strategy {
            CommitStrategy::BySize(0) | CommitStrategy::BySizeOrTime(0, _) => {
                return Err(ReceiverError::Configuration(
                    "commit batch size must be >= 1".to_string(),
                ));
            }
            CommitStrategy::ByTime(d) | CommitStrategy::BySizeOrTime(_, d) if d.is_zero() => {
                return Err(ReceiverError::Configuration(
                    "commit interval must be > 0".to_string(),
                ));
            }
            _ => {}
        }
        Ok(())
    }
}

/// Builder for [`ReceiverSettings`].
#[derive(Debug, Default)]
pub struct ReceiverSettingsBuilder {
    group_id: Option<String>,
    poll_timeout: Option<Duration>,
    commit_strategy: Option<CommitStrategy>,
    commit_retry_interval: Option<Duration>,
    max_commit_attempts: Option<u32>,
    max_deferred_commits: Option<usize>,
    close_timeout: Option<Duration>,
    ack_mode: Option<AckMode>,
}

impl ReceiverSettingsBuilder {
    /// Sets the consumer group id.
    #[must_use]
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Sets the poll timeout.
    #[must_use]
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    /// Sets the commit strategy.
    #[must_use]
    pub fn commit_strategy(mut self, strategy: CommitStrategy) -> Self {
        self.commit_strategy = Some(strategy);
        self
    }

    /// Sets the delay before a failed commit is retried.
    #[must_use]
    pub fn commit_retry_interval(mut self, interval: Duration) -> Self {
        self.commit_retry_interval = Some(interval);
        self
    }

    /// Sets the consecutive-failure budget for commits.
    #[must_use]
    pub fn max_commit_attempts(mut self, attempts: u32) -> Self {
        self.max_commit_attempts = Some(attempts);
        self
    }

    /// Sets the unacknowledged-record ceiling (0 disables the gate).
    #[must_use]
    pub fn max_deferred_commits(mut self, max: usize) -> Self {
        self.max_deferred_commits = Some(max);
        self
    }

    /// Sets the shutdown deadline.
    #[must_use]
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = Some(timeout);
        self
    }

    /// Sets the delivery guarantee mode.
    #[must_use]
    pub fn ack_mode(mut self, mode: AckMode) -> Self {
        self.ack_mode = Some(mode);
        self
    }

    /// Builds and validates the settings.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Configuration`] if the resulting settings
    /// fail [`ReceiverSettings::validate`].
    pub fn build(self) -> Result<ReceiverSettings, ReceiverError> {
        let defaults = ReceiverSettings::default();
        let settings = ReceiverSettings {
            group_id: self.group_id.unwrap_or(defaults.group_id),
            poll_timeout: self.poll_timeout.unwrap_or(defaults.poll_timeout),
            commit_strategy: self.commit_strategy.unwrap_or(defaults.commit_strategy),
            commit_retry_interval: self
                .commit_retry_interval
                .unwrap_or(defaults.commit_retry_interval),
            max_commit_attempts: self
                .max_commit_attempts
                .unwrap_or(defaults.max_commit_attempts),
            max_deferred_commits: self
                .max_deferred_commits
                .unwrap_or(defaults.max_deferred_commits),
            close_timeout: self.close_timeout.unwrap_or(defaults.close_timeout),
            ack_mode: self.ack_mode.unwrap_or(defaults.ack_mode),
        };
        settings.validate()?;
        Ok(settings)
    }
}
