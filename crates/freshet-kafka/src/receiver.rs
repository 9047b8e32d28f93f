//! The public receiver API.
//!
//! [`KafkaReceiver`] binds a consumer client, settings, and a topic list.
//! Calling one of the `receive*` methods produces a lazy stream: nothing
//! touches the broker until the first pull, which spawns the consumer
//! thread, subscribes, schedules the first poll, and starts the commit
//! scheduler. Dropping a stream (or awaiting
//! [`ReceiverRecords::close`]) runs the shutdown sequence: the records
//! channel closes, the scheduler stops, the consumer is woken, pending
//! acknowledgements are flushed, and the client is closed.
//!
//! Streams must be created and polled inside a Tokio runtime.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tokio_stream::Stream;
use tracing::debug;

use crate::client::ConsumerClient;
use crate::config::{AckMode, ReceiverSettings};
use crate::error::ReceiverError;
use crate::event_loop::EventLoop;
use crate::handoff::{handoff, HandoffReceiver};
use crate::metrics::{ReceiverMetrics, ReceiverMetricsSnapshot};
use crate::offset::{CommitContext, ReceiverOffset};
use crate::scheduler::CommitScheduler;
use crate::thread::ConsumerThread;
use crate::types::{Record, TopicPartition};

/// A consumed record paired with its acknowledgement handle.
#[derive(Debug, Clone)]
pub struct ReceiverRecord {
    record: Record,
    offset: ReceiverOffset,
}

impl ReceiverRecord {
    /// The consumed record.
    #[must_use]
    pub fn record(&self) -> &Record {
        &self.record
    }

    /// The acknowledgement handle for this record.
    #[must_use]
    pub fn offset(&self) -> &ReceiverOffset {
        &self.offset
    }

    /// Splits into record and handle.
    #[must_use]
    pub fn into_parts(self) -> (Record, ReceiverOffset) {
        (self.record, self.offset)
    }
}

/// Reactive Kafka receiver for one subscription.
pub struct KafkaReceiver<C: ConsumerClient> {
    consumer: Arc<C>,
    settings: ReceiverSettings,
    topics: Vec<String>,
}

impl<C: ConsumerClient> KafkaReceiver<C> {
    /// Creates a receiver for the given topics.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Configuration`] if the settings fail
    /// validation or no topic is given.
    pub fn new(
        consumer: C,
        settings: ReceiverSettings,
        topics: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, ReceiverError> {
        settings.validate()?;
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        if topics.is_empty() {
            return Err(ReceiverError::Configuration(
                "at least one topic is required".to_string(),
            ));
        }
        Ok(Self {
            consumer: Arc::new(consumer),
            settings,
            topics,
        })
    }

    /// Returns a batch stream honouring the configured
    /// [`ReceiverSettings::ack_mode`].
    ///
    /// # Errors
    ///
    /// Returns [`ReceiverError::Configuration`] for
    /// [`AckMode::AtMostOnce`], which yields records rather than
    /// acknowledgeable batches — use
    /// [`receive_at_most_once`](Self::receive_at_most_once).
    pub fn receive(self) -> Result<ReceiverRecords<C>, ReceiverError> {
        if self.settings.ack_mode == AckMode::AtMostOnce {
            return Err(ReceiverError::Configuration(
                "at-most-once delivery uses receive_at_most_once()".to_string(),
            ));
        }
        let auto_ack = self.settings.ack_mode == AckMode::AutoAck;
        Ok(ReceiverRecords::new(self.into_core(), auto_ack))
    }

    /// Returns a batch stream that acknowledges each batch once the next
    /// one is requested (or the stream ends).
    #[must_use]
    pub fn receive_auto_ack(mut self) -> ReceiverRecords<C> {
        self.settings.ack_mode = AckMode::AutoAck;
        ReceiverRecords::new(self.into_core(), true)
    }

    /// Returns a per-record stream that commits each offset synchronously
    /// before handing the record out.
    #[must_use]
    pub fn receive_at_most_once(mut self) -> AtMostOnceRecords<C> {
        self.settings.ack_mode = AckMode::AtMostOnce;
        AtMostOnceRecords::new(self.into_core())
    }

    /// Returns a batch stream that never commits; offsets are expected to
    /// be committed through a transactional producer.
    #[must_use]
    pub fn receive_exactly_once(mut self) -> ReceiverRecords<C> {
        self.settings.ack_mode = AckMode::ExactlyOnce;
        ReceiverRecords::new(self.into_core(), false)
    }

    fn into_core(self) -> StreamCore<C> {
        StreamCore {
            state: CoreState::Idle {
                consumer: self.consumer,
                settings: self.settings,
                topics: self.topics,
                prepaused: Vec::new(),
                awaiting_txn: false,
            },
        }
    }
}

impl<C: ConsumerClient> std::fmt::Debug for KafkaReceiver<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaReceiver")
            .field("group_id", &self.settings.group_id)
            .field("topics", &self.topics)
            .field("ack_mode", &self.settings.ack_mode)
            .finish_non_exhaustive()
    }
}

enum CoreState<C: ConsumerClient> {
    Idle {
        consumer: Arc<C>,
        settings: ReceiverSettings,
        topics: Vec<String>,
        prepaused: Vec<TopicPartition>,
        awaiting_txn: bool,
    },
    Running(Running<C>),
    Terminated,
}

struct Running<C: ConsumerClient> {
    event_loop: Arc<EventLoop<C>>,
    records: HandoffReceiver<Vec<Record>>,
    scheduler: Option<CommitScheduler>,
    ctx: Arc<CommitContext>,
    metrics: Arc<ReceiverMetrics>,
}

/// Shared machinery behind both stream flavours.
struct StreamCore<C: ConsumerClient> {
    state: CoreState<C>,
}

impl<C: ConsumerClient> StreamCore<C> {
    fn ensure_started(&mut self) -> Result<&mut Running<C>, ReceiverError> {
        if matches!(self.state, CoreState::Idle { .. }) {
            let prev = std::mem::replace(&mut self.state, CoreState::Terminated);
            let CoreState::Idle {
                consumer,
                settings,
                topics,
                prepaused,
                awaiting_txn,
            } = prev
            else {
                return Err(ReceiverError::Closed);
            };
            let running = start_core(consumer, settings, topics, prepaused, awaiting_txn)?;
            self.state = CoreState::Running(running);
        }
        match &mut self.state {
            CoreState::Running(running) => Ok(running),
            _ => Err(ReceiverError::Closed),
        }
    }

    /// Polls the records hand-off, starting the loop on first use.
    #[allow(clippy::type_complexity)]
    fn poll_recv(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<(Vec<Record>, Arc<CommitContext>), ReceiverError>>> {
        let running = match self.ensure_started() {
            Ok(running) => running,
            Err(ReceiverError::Closed) => return Poll::Ready(None),
            Err(e) => return Poll::Ready(Some(Err(e))),
        };
        match running.records.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(Some(Ok(records))) => {
                Poll::Ready(Some(Ok((records, Arc::clone(&running.ctx)))))
            }
        }
    }

    fn running(&mut self) -> Result<&mut Running<C>, ReceiverError> {
        match &mut self.state {
            CoreState::Running(running) => Ok(running),
            _ => Err(ReceiverError::Closed),
        }
    }

    /// Initiates shutdown; returns a completion receiver if a loop was
    /// running.
    fn begin_shutdown(&mut self) -> Option<oneshot::Receiver<Result<(), ReceiverError>>> {
        match std::mem::replace(&mut self.state, CoreState::Terminated) {
            CoreState::Running(mut running) => {
                debug!("receiver stream terminating");
                running.ctx.mark_closed();
                running.records.close();
                if let Some(mut scheduler) = running.scheduler.take() {
                    scheduler.stop();
                }
                running.event_loop.wakeup();
                let (tx, rx) = oneshot::channel();
                running.event_loop.shutdown(tx);
                Some(rx)
            }
            _ => None,
        }
    }

    fn pause(&mut self, partitions: Vec<TopicPartition>) {
        match &mut self.state {
            CoreState::Idle { prepaused, .. } => prepaused.extend(partitions),
            CoreState::Running(running) => running.event_loop.pause_partitions(partitions),
            CoreState::Terminated => {}
        }
    }

    fn resume(&mut self, partitions: Vec<TopicPartition>) {
        match &mut self.state {
            CoreState::Idle { prepaused, .. } => {
                prepaused.retain(|tp| !partitions.contains(tp));
            }
            CoreState::Running(running) => running.event_loop.resume_partitions(partitions),
            CoreState::Terminated => {}
        }
    }

    fn set_awaiting_transaction(&mut self, awaiting: bool) {
        match &mut self.state {
            CoreState::Idle { awaiting_txn, .. } => *awaiting_txn = awaiting,
            CoreState::Running(running) => running.event_loop.set_awaiting_transaction(awaiting),
            CoreState::Terminated => {}
        }
    }

    fn metrics(&self) -> ReceiverMetricsSnapshot {
        match &self.state {
            CoreState::Running(running) => running.metrics.snapshot(),
            _ => ReceiverMetricsSnapshot::default(),
        }
    }
}

impl<C: ConsumerClient> Drop for StreamCore<C> {
    fn drop(&mut self) {
        let _ = self.begin_shutdown();
    }
}

fn start_core<C: ConsumerClient>(
    consumer: Arc<C>,
    settings: ReceiverSettings,
    topics: Vec<String>,
    prepaused: Vec<TopicPartition>,
    awaiting_txn: bool,
) -> Result<Running<C>, ReceiverError> {
    let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
        ReceiverError::Configuration("receiver streams require a Tokio runtime".to_string())
    })?;
    let thread = ConsumerThread::spawn(&settings.group_id).map_err(|e| {
        ReceiverError::Subscription(format!("failed to spawn consumer thread: {e}"))
    })?;

    let ack_mode = settings.ack_mode;
    let strategy = settings.commit_strategy;
    let (records_tx, records_rx) = handoff();
    let metrics = Arc::new(ReceiverMetrics::new());
    let event_loop = EventLoop::new(
        consumer,
        settings,
        thread,
        records_tx,
        Arc::clone(&metrics),
        runtime.clone(),
    );

    let (signal_tx, signal_rx) = mpsc::channel(1);
    let ctx = Arc::new(CommitContext::new(
        event_loop.batch().clone(),
        signal_tx,
        strategy.commit_batch_size(),
        commit_trigger(&event_loop),
    ));

    // The scheduler only serves the acknowledgement-driven modes.
    let scheduler = matches!(ack_mode, AckMode::ManualAck | AckMode::AutoAck).then(|| {
        CommitScheduler::start(strategy, signal_rx, commit_trigger(&event_loop), &runtime)
    });

    if !prepaused.is_empty() {
        event_loop.pause_partitions(prepaused);
    }
    if awaiting_txn {
        event_loop.set_awaiting_transaction(true);
    }
    event_loop.start(topics);

    Ok(Running {
        event_loop,
        records: records_rx,
        scheduler,
        ctx,
        metrics,
    })
}

fn commit_trigger<C: ConsumerClient>(event_loop: &Arc<EventLoop<C>>) -> Box<dyn Fn() + Send + Sync> {
    let weak = Arc::downgrade(event_loop);
    Box::new(move || {
        if let Some(event_loop) = weak.upgrade() {
            event_loop.schedule_commit_if_required();
        }
    })
}

/// Batch stream of acknowledgeable records.
///
/// Yields `Vec<ReceiverRecord>` per poll. In auto-ack mode the previous
/// batch is acknowledged when the next one is requested or the stream
/// terminates.
pub struct ReceiverRecords<C: ConsumerClient> {
    core: StreamCore<C>,
    auto_ack: bool,
    pending_acks: Vec<ReceiverOffset>,
    done: bool,
}

impl<C: ConsumerClient> ReceiverRecords<C> {
    fn new(core: StreamCore<C>, auto_ack: bool) -> Self {
        Self {
            core,
            auto_ack,
            pending_acks: Vec::new(),
            done: false,
        }
    }

    /// Awaits the next batch.
    pub async fn recv(&mut self) -> Option<Result<Vec<ReceiverRecord>, ReceiverError>> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    /// Pauses delivery for the given partitions until
    /// [`resume`](Self::resume). Survives rebalances.
    pub fn pause(&mut self, partitions: Vec<TopicPartition>) {
        self.core.pause(partitions);
    }

    /// Resumes delivery for partitions paused via [`pause`](Self::pause).
    pub fn resume(&mut self, partitions: Vec<TopicPartition>) {
        self.core.resume(partitions);
    }

    /// While set, the loop pauses all consumption (used to fence an
    /// external producer transaction).
    pub fn set_awaiting_transaction(&mut self, awaiting: bool) {
        self.core.set_awaiting_transaction(awaiting);
    }

    /// Snapshot of the receiver's counters.
    #[must_use]
    pub fn metrics(&self) -> ReceiverMetricsSnapshot {
        self.core.metrics()
    }

    /// Terminates the stream and awaits the shutdown sequence.
    ///
    /// # Errors
    ///
    /// Returns the shutdown failure, e.g. a close timeout.
    pub async fn close(mut self) -> Result<(), ReceiverError> {
        self.flush_pending_acks();
        self.done = true;
        match self.core.begin_shutdown() {
            Some(done) => match done.await {
                Ok(result) => result,
                Err(_) => Err(ReceiverError::ThreadUnavailable),
            },
            None => Ok(()),
        }
    }

    fn flush_pending_acks(&mut self) {
        for offset in self.pending_acks.drain(..) {
            offset.acknowledge();
        }
    }

    fn finish(&mut self) {
        self.flush_pending_acks();
        self.done = true;
        let _ = self.core.begin_shutdown();
    }
}

impl<C: ConsumerClient> Stream for ReceiverRecords<C> {
    type Item = Result<Vec<ReceiverRecord>, ReceiverError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.core.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(Some(Ok((records, ctx)))) => {
                if this.auto_ack {
                    this.flush_pending_acks();
                }
                let batch: Vec<ReceiverRecord> = records
                    .into_iter()
                    .map(|record| {
                        let offset = ReceiverOffset::new(
                            record.topic_partition(),
                            record.offset,
                            Arc::clone(&ctx),
                        );
                        ReceiverRecord { record, offset }
                    })
                    .collect();
                if this.auto_ack {
                    this.pending_acks = batch.iter().map(|r| r.offset.clone()).collect();
                }
                Poll::Ready(Some(Ok(batch)))
            }
        }
    }
}

impl<C: ConsumerClient> std::fmt::Debug for ReceiverRecords<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverRecords")
            .field("auto_ack", &self.auto_ack)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

/// Per-record stream with at-most-once delivery.
///
/// Each record's offset is committed synchronously before the record is
/// handed out, so a crash after receipt never causes redelivery.
pub struct AtMostOnceRecords<C: ConsumerClient> {
    core: StreamCore<C>,
    buffer: VecDeque<Record>,
    done: bool,
}

impl<C: ConsumerClient> AtMostOnceRecords<C> {
    fn new(core: StreamCore<C>) -> Self {
        Self {
            core,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    /// Awaits the next record, committing its offset first.
    pub async fn recv(&mut self) -> Option<Result<Record, ReceiverError>> {
        if self.done {
            return None;
        }
        loop {
            if let Some(record) = self.buffer.pop_front() {
                let event_loop = match self.core.running() {
                    Ok(running) => Arc::clone(&running.event_loop),
                    Err(_) => return None,
                };
                let outcome = event_loop
                    .commit_ahead(record.topic_partition(), record.offset)
                    .await;
                return match outcome {
                    Ok(()) => Some(Ok(record)),
                    Err(e) => Some(Err(e)),
                };
            }
            let next = std::future::poll_fn(|cx| self.core.poll_recv(cx)).await;
            match next {
                Some(Ok((records, _ctx))) => self.buffer.extend(records),
                Some(Err(e)) => return Some(Err(e)),
                None => {
                    self.done = true;
                    let _ = self.core.begin_shutdown();
                    return None;
                }
            }
        }
    }

    /// Snapshot of the receiver's counters.
    #[must_use]
    pub fn metrics(&self) -> ReceiverMetricsSnapshot {
        self.core.metrics()
    }

    /// Terminates the stream and awaits the shutdown sequence.
    ///
    /// # Errors
    ///
    /// Returns the shutdown failure, e.g. a close timeout.
    pub async fn close(mut self) -> Result<(), ReceiverError> {
        self.done = true;
        match self.core.begin_shutdown() {
            Some(done) => match done.await {
                Ok(result) => result,
                Err(_) => Err(ReceiverError::ThreadUnavailable),
            },
            None => Ok(()),
        }
    }
}

impl<C: ConsumerClient> std::fmt::Debug for AtMostOnceRecords<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtMostOnceRecords")
            .field("buffered", &self.buffer.len())
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
