//! Commit scheduler.
//!
//! A long-lived task that nudges the event loop to flush the commit batch,
//! driven by a size-threshold signal channel, a timer, or both, per the
//! configured [`CommitStrategy`]. Started lazily when the stream starts
//! and only for the acknowledgement-driven modes.

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::trace;

use crate::config::CommitStrategy;

/// Handle to the running scheduler task.
pub(crate) struct CommitScheduler {
    shutdown: Option<oneshot::Sender<()>>,
}

impl CommitScheduler {
    /// Spawns the scheduler on the given runtime.
    pub(crate) fn start(
        strategy: CommitStrategy,
        signal: mpsc::Receiver<()>,
        trigger: Box<dyn Fn() + Send + Sync>,
        runtime: &tokio::runtime::Handle,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        runtime.spawn(run(strategy, signal, shutdown_rx, trigger));
        Self {
            shutdown: Some(shutdown_tx),
        }
    }

    /// Stops the scheduler task. Idempotent.
    pub(crate) fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for CommitScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    strategy: CommitStrategy,
    mut signal: mpsc::Receiver<()>,
    mut shutdown: oneshot::Receiver<()>,
    trigger: Box<dyn Fn() + Send + Sync>,
) {
    trace!(?strategy, "commit scheduler started");
    match strategy {
        CommitStrategy::BySize(_) => loop {
            tokio::select! {
                _ = &mut shutdown => break,
                sig = signal.recv() => match sig {
                    Some(()) => trigger(),
                    None => break,
                },
            }
        },
        CommitStrategy::ByTime(period) => {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = ticks.tick() => trigger(),
                }
            }
        }
        CommitStrategy::BySizeOrTime(_, period) => {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = ticks.tick() => trigger(),
                    sig = signal.recv() => match sig {
                        Some(()) => trigger(),
                        None => break,
                    },
                }
            }
        }
    }
    trace!("commit scheduler stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn counter_trigger() -> (Box<dyn Fn() + Send + Sync>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        (
            Box::new(move || {
                count2.fetch_add(1, Ordering::SeqCst);
            }),
            count,
        )
    }

    #[tokio::test]
    async fn test_by_time_fires_periodically() {
        let (trigger, count) = counter_trigger();
        let (_tx, rx) = mpsc::channel(1);
        let mut scheduler = CommitScheduler::start(
            CommitStrategy::ByTime(Duration::from_millis(20)),
            rx,
            trigger,
            &tokio::runtime::Handle::current(),
        );

        tokio::time::sleep(Duration::from_millis(110)).await;
        scheduler.stop();
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 3, "expected several ticks, got {fired}");
    }

    #[tokio::test]
    async fn test_by_size_fires_on_signal_only() {
        let (trigger, count) = counter_trigger();
        let (tx, rx) = mpsc::channel(1);
        let mut scheduler = CommitScheduler::start(
            CommitStrategy::BySize(10),
            rx,
            trigger,
            &tokio::runtime::Handle::current(),
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tx.send(()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_by_size_or_time_takes_earliest() {
        let (trigger, count) = counter_trigger();
        let (tx, rx) = mpsc::channel(1);
        let mut scheduler = CommitScheduler::start(
            CommitStrategy::BySizeOrTime(10, Duration::from_secs(60)),
            rx,
            trigger,
            &tokio::runtime::Handle::current(),
        );

        // The timer is far away; the signal should fire first.
        tx.send(()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_signal_channel_close_stops_scheduler() {
        let (trigger, count) = counter_trigger();
        let (tx, rx) = mpsc::channel(1);
        let _scheduler = CommitScheduler::start(
            CommitStrategy::BySize(10),
            rx,
            trigger,
            &tokio::runtime::Handle::current(),
        );

        drop(tx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
