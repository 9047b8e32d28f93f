//! End-to-end receiver scenarios against the mock consumer.

use std::time::Duration;

use tokio_stream::StreamExt;

use freshet_kafka::testing::{mock_records, MockConsumer};
use freshet_kafka::{
    AckMode, CommitStrategy, ConsumerClient, KafkaReceiver, ReceiverError, ReceiverSettings,
    TopicPartition,
};

fn tp(partition: i32) -> TopicPartition {
    TopicPartition::new("events", partition)
}

fn settings() -> ReceiverSettings {
    ReceiverSettings::builder()
        .group_id("scenarios")
        .poll_timeout(Duration::from_millis(10))
        .commit_strategy(CommitStrategy::ByTime(Duration::from_millis(100)))
        .commit_retry_interval(Duration::from_millis(20))
        .build()
        .unwrap()
}

/// Settings whose timed scheduler never fires within a test run, so only
/// explicit `commit()` calls flush the batch.
fn manual_flush_settings() -> ReceiverSettings {
    let mut config = settings();
    config.commit_strategy = CommitStrategy::ByTime(Duration::from_secs(3600));
    config
}

/// Happy path: ten records, each acknowledged; the timed scheduler flushes
/// the offsets and the stream closes cleanly.
#[tokio::test(flavor = "multi_thread")]
async fn happy_path_by_time_commit() {
    let consumer = MockConsumer::new();
    consumer.assign(vec![tp(0)]);
    consumer.enqueue_records(mock_records("events", 0, 0, 10));

    let receiver =
        KafkaReceiver::new(consumer.clone(), settings(), vec!["events"]).unwrap();
    let mut stream = receiver.receive().unwrap();

    let mut received = Vec::new();
    while received.len() < 10 {
        let batch = stream.recv().await.unwrap().unwrap();
        for record in batch {
            received.push(record.record().offset);
            record.offset().acknowledge();
        }
    }
    assert_eq!(received, (0..10).collect::<Vec<_>>());

    // Wait out the commit interval.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(consumer.committed(&tp(0)), Some(10));

    stream.close().await.unwrap();
    assert_eq!(consumer.close_calls(), 1);
}

/// Backpressure: a slow downstream forces the loop to pause the
/// assignment while a hand-off is blocked, resume afterwards, and deliver
/// every record exactly once in order.
#[tokio::test(flavor = "multi_thread")]
async fn backpressure_pauses_and_resumes() {
    let consumer = MockConsumer::new();
    consumer.assign(vec![tp(0)]);
    for batch in 0..20 {
        consumer.enqueue_records(mock_records("events", 0, batch * 10, 10));
    }

    let config = ReceiverSettings::builder()
        .group_id("backpressure")
        .poll_timeout(Duration::from_millis(10))
        .commit_strategy(CommitStrategy::ByTime(Duration::from_millis(20)))
        .build()
        .unwrap();
    let receiver = KafkaReceiver::new(consumer.clone(), config, vec!["events"]).unwrap();
    let mut stream = receiver.receive().unwrap();

    let mut seen = Vec::new();
    let mut paused_observed = false;
    while seen.len() < 200 {
        let batch = stream.recv().await.unwrap().unwrap();
        for record in batch {
            seen.push(record.record().offset);
            record.offset().acknowledge();
        }
        // Downstream is deliberately slow; commit-driven poll cycles pause
        // the assignment while the next hand-off is blocked.
        tokio::time::sleep(Duration::from_millis(50)).await;
        if !consumer.paused().is_empty() {
            paused_observed = true;
        }
    }

    assert_eq!(seen, (0..200).collect::<Vec<_>>(), "no loss, no reorder");
    assert!(paused_observed, "backpressure never paused the assignment");

    // Downstream has caught up: the loop resumes the assignment.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(consumer.paused().is_empty());

    stream.close().await.unwrap();
    assert_eq!(consumer.committed(&tp(0)), Some(200));
}

/// A commit that fails retriably three times succeeds on the fourth
/// attempt; the waiting `commit()` caller is resolved, never rejected.
#[tokio::test(flavor = "multi_thread")]
async fn retryable_commit_failures_recover() {
    let consumer = MockConsumer::new();
    consumer.assign(vec![tp(0)]);
    consumer.enqueue_records(mock_records("events", 0, 0, 10));
    for _ in 0..3 {
        consumer.fail_next_commit(ReceiverError::commit_retriable("coordinator moved"));
    }

    let receiver =
        KafkaReceiver::new(consumer.clone(), manual_flush_settings(), vec!["events"]).unwrap();
    let mut stream = receiver.receive().unwrap();

    let batch = stream.recv().await.unwrap().unwrap();
    for record in &batch[..9] {
        record.offset().acknowledge();
    }
    // The last record's commit() rides through the retries.
    batch[9].offset().commit().await.unwrap();

    assert_eq!(consumer.committed(&tp(0)), Some(10));
    assert!(stream.metrics().commit_failures >= 3);

    stream.close().await.unwrap();
}

/// A non-retryable failure with a registered waiter rejects that waiter
/// but leaves the stream open for further work.
#[tokio::test(flavor = "multi_thread")]
async fn non_retryable_commit_rejects_waiter_stream_survives() {
    let consumer = MockConsumer::new();
    consumer.assign(vec![tp(0)]);
    consumer.enqueue_records(mock_records("events", 0, 0, 1));
    consumer.fail_next_commit(ReceiverError::commit_fatal("unknown member id"));

    let receiver =
        KafkaReceiver::new(consumer.clone(), manual_flush_settings(), vec!["events"]).unwrap();
    let mut stream = receiver.receive().unwrap();

    let batch = stream.recv().await.unwrap().unwrap();
    let outcome = batch[0].offset().commit().await;
    assert!(matches!(outcome, Err(ReceiverError::Commit { .. })));

    // The stream keeps flowing and later commits succeed.
    consumer.enqueue_records(mock_records("events", 0, 1, 1));
    let batch = stream.recv().await.unwrap().unwrap();
    batch[0].offset().commit().await.unwrap();
    assert_eq!(consumer.committed(&tp(0)), Some(2));

    stream.close().await.unwrap();
}

/// A user-paused partition survives revoke + reassign; a partition paused
/// only by backpressure is resumed once the gate lifts.
#[tokio::test(flavor = "multi_thread")]
async fn rebalance_preserves_user_pause() {
    let consumer = MockConsumer::new();
    consumer.assign(vec![tp(0), tp(1)]);

    let receiver =
        KafkaReceiver::new(consumer.clone(), settings(), vec!["events"]).unwrap();
    let mut stream = receiver.receive().unwrap();
    // Kick the loop into motion with an empty pull attempt.
    tokio::select! {
        _ = stream.recv() => {}
        () = tokio::time::sleep(Duration::from_millis(50)) => {}
    }

    stream.pause(vec![tp(0)]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(consumer.paused(), [tp(0)].into_iter().collect());

    // Global pause (transaction gate), then a rebalance that revokes
    // {0, 1} and assigns {0, 2}.
    stream.set_awaiting_transaction(true);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(consumer.paused().len(), 2);

    consumer.trigger_rebalance(vec![tp(0), tp(1)], vec![tp(0), tp(2)]);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(
        consumer.paused(),
        [tp(0), tp(2)].into_iter().collect(),
        "all reassigned partitions re-paused while the loop is paused"
    );

    // Gate lifts: everything except the user-paused partition resumes.
    stream.set_awaiting_transaction(false);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(
        consumer.paused(),
        [tp(0)].into_iter().collect(),
        "user-paused partition stays paused after the rebalance"
    );

    stream.close().await.unwrap();
}

/// At-most-once: the offset is committed before the record is handed out,
/// and a downstream crash after receipt does not rewind the commit.
#[tokio::test(flavor = "multi_thread")]
async fn at_most_once_commits_ahead_of_delivery() {
    let consumer = MockConsumer::new();
    consumer.assign(vec![tp(0)]);
    consumer.enqueue_records(mock_records("events", 0, 0, 3));

    let mut config = settings();
    config.ack_mode = AckMode::AtMostOnce;
    let receiver = KafkaReceiver::new(consumer.clone(), config, vec!["events"]).unwrap();
    let mut stream = receiver.receive_at_most_once();

    let record = stream.recv().await.unwrap().unwrap();
    assert_eq!(record.offset, 0);
    assert_eq!(
        consumer.committed(&tp(0)),
        Some(1),
        "commit lands before delivery"
    );

    // Crash the downstream: drop the stream without processing further.
    let commits_before = consumer.commit_sync_count();
    drop(stream);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(consumer.committed(&tp(0)), Some(1), "no rewind on crash");
    assert_eq!(
        consumer.commit_sync_count(),
        commits_before,
        "no redundant commit at close"
    );
}

/// The batch stream implements `Stream`; batches arrive in poll order.
#[tokio::test(flavor = "multi_thread")]
async fn stream_adapter_preserves_batch_order() {
    let consumer = MockConsumer::new();
    consumer.assign(vec![tp(0)]);
    consumer.enqueue_records(mock_records("events", 0, 0, 2));
    consumer.enqueue_records(mock_records("events", 0, 2, 2));

    let receiver =
        KafkaReceiver::new(consumer.clone(), settings(), vec!["events"]).unwrap();
    let mut stream = receiver.receive_auto_ack();

    let first = stream.next().await.unwrap().unwrap();
    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(first[0].record().offset, 0);
    assert_eq!(second[0].record().offset, 2);

    stream.close().await.unwrap();
    assert_eq!(consumer.committed(&tp(0)), Some(4));
}
