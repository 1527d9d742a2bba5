//! Tracking and committing the resumable offset of a partition.

use crate::error::Error;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use conduit_consumer::{Consumer, OffsetCommit};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Offsets {
    /// Highest offset the lambda has returned from without error.
    completed: Option<u64>,

    /// Highest offset marked safe to resume from. Never above `completed`.
    latest: Option<u64>,

    /// Highest offset the consumer acknowledged.
    committed: Option<u64>,
}

/// Tracks the latest offset of a partition that is safe to resume from, and
/// commits it through the partition's consumer.
///
/// Commits are serialized. A commit requested while another is in flight waits
/// for it and then commits whatever is newest at that point, so bursts of
/// checkpoints collapse into a single trailing commit.
///
/// Closing the manager discards offsets that were recorded but not yet
/// committed.
#[derive(Clone, Debug)]
pub struct CheckpointManager<C>
where
    C: Consumer,
{
    id: i32,
    consumer: C,
    offsets: Arc<Mutex<Offsets>>,
    commit_lock: Arc<tokio::sync::Mutex<()>>,
    closed: Arc<AtomicBool>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl<C> CheckpointManager<C>
where
    C: Consumer,
{
    /// Creates a checkpoint manager for partition `id`.
    pub fn new(id: i32, consumer: C) -> Self {
        Self {
            id,
            consumer,
            offsets: Arc::new(Mutex::new(Offsets::default())),
            commit_lock: Arc::new(tokio::sync::Mutex::new(())),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        }
    }

    /// The partition this manager commits for.
    #[must_use]
    pub const fn id(&self) -> i32 {
        self.id
    }

    /// Records that the lambda returned without error for `offset`.
    pub fn complete(&self, offset: u64) {
        if self.is_closed() {
            return;
        }

        let mut offsets = self.offsets.lock();
        if offsets.completed.is_none_or(|completed| offset > completed) {
            offsets.completed = Some(offset);
        }
    }

    /// Marks `offset` as safe to resume from without committing it.
    ///
    /// Offsets below the current mark are ignored, and offsets beyond the
    /// highest completed offset are clamped to it.
    pub fn update(&self, offset: u64) {
        if self.is_closed() {
            return;
        }

        let mut offsets = self.offsets.lock();
        let Some(completed) = offsets.completed else {
            debug!(
                "ignoring checkpoint {} on partition {}: nothing completed",
                offset, self.id
            );
            return;
        };

        let offset = if offset > completed {
            debug!(
                "clamping checkpoint {} on partition {} to {}",
                offset, self.id, completed
            );
            completed
        } else {
            offset
        };

        if offsets.latest.is_none_or(|latest| offset > latest) {
            offsets.latest = Some(offset);
        }
    }

    /// Marks `offset` as safe to resume from and commits it.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails or the manager has been closed.
    pub async fn checkpoint(&self, offset: u64) -> Result<(), Error> {
        self.update(offset);
        self.flush().await
    }

    /// Commits the most recently marked offset, if it has not been committed
    /// yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Commit`] if the consumer fails to commit, and
    /// [`Error::Closed`] if the manager has been closed.
    pub async fn flush(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let _guard = self.commit_lock.lock().await;

        if self.is_closed() {
            return Err(Error::Closed);
        }

        let target = {
            let offsets = self.offsets.lock();
            match (offsets.latest, offsets.committed) {
                (None, _) => return Ok(()),
                (Some(latest), Some(committed)) if latest <= committed => return Ok(()),
                (Some(latest), _) => latest,
            }
        };

        debug!("committing offset {} for partition {}", target, self.id);

        self.consumer
            .commit_offset(OffsetCommit {
                partition: self.id,
                offset: target,
            })
            .await
            .map_err(|e| {
                warn!(
                    "failed to commit offset {} for partition {}: {}",
                    target, self.id, e
                );
                Error::commit(e)
            })?;

        let mut offsets = self.offsets.lock();
        if offsets.committed.is_none_or(|committed| target > committed) {
            offsets.committed = Some(target);
        }

        Ok(())
    }

    /// Flushes every `interval` until the manager is closed or a commit fails.
    ///
    /// Commit failures are handed to `on_error` and stop the timer.
    pub fn start_periodic_flush<E>(&self, interval: Duration, on_error: E)
    where
        E: Fn(Error) + Send + Sync + 'static,
    {
        let manager = self.clone();
        let shutdown_token = self.shutdown_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    () = shutdown_token.cancelled() => break,
                    _ = ticker.tick() => {
                        match manager.flush().await {
                            Ok(()) => {}
                            Err(Error::Closed) => break,
                            Err(e) => {
                                on_error(e);
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    /// Stops periodic flushing and discards any uncommitted offset.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown_token.cancel();
        self.task_tracker.close();

        let offsets = self.offsets.lock();
        if offsets.latest > offsets.committed {
            debug!(
                "discarding uncommitted offset {:?} for partition {}",
                offsets.latest, self.id
            );
        }
    }

    /// Whether the manager has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The highest offset acknowledged by the consumer.
    #[must_use]
    pub fn committed(&self) -> Option<u64> {
        self.offsets.lock().committed
    }

    /// The highest offset marked safe to resume from.
    #[must_use]
    pub fn latest(&self) -> Option<u64> {
        self.offsets.lock().latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use conduit_consumer_memory::MemoryConsumer;

    fn manager() -> (CheckpointManager<MemoryConsumer>, MemoryConsumer) {
        let consumer = MemoryConsumer::new("test");
        (CheckpointManager::new(0, consumer.clone()), consumer)
    }

    #[tokio::test]
    async fn test_flush_commits_latest() {
        let (manager, consumer) = manager();

        manager.complete(3);
        manager.update(3);
        manager.flush().await.unwrap();

        assert_eq!(consumer.committed(0).await, Some(3));
        assert_eq!(manager.committed(), Some(3));
    }

    #[tokio::test]
    async fn test_flush_without_offset_is_noop() {
        let (manager, consumer) = manager();

        manager.flush().await.unwrap();

        assert!(consumer.commits().await.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_flush_commits_once() {
        let (manager, consumer) = manager();

        manager.complete(5);
        manager.update(5);
        manager.flush().await.unwrap();
        manager.flush().await.unwrap();

        assert_eq!(consumer.commits().await.len(), 1);
    }

    #[tokio::test]
    async fn test_offsets_never_decrease() {
        let (manager, consumer) = manager();

        manager.complete(10);
        manager.update(8);
        manager.update(4);
        assert_eq!(manager.latest(), Some(8));

        manager.flush().await.unwrap();
        manager.checkpoint(6).await.unwrap();

        assert_eq!(consumer.committed(0).await, Some(8));
        assert_eq!(consumer.commits().await.len(), 1);
    }

    #[tokio::test]
    async fn test_update_is_clamped_to_completed() {
        let (manager, _) = manager();

        manager.update(2);
        assert_eq!(manager.latest(), None);

        manager.complete(4);
        manager.update(9);
        assert_eq!(manager.latest(), Some(4));
    }

    #[tokio::test]
    async fn test_concurrent_checkpoints_coalesce() {
        let (manager, consumer) = manager();
        consumer
            .set_commit_delay(Some(Duration::from_millis(50)))
            .await;

        manager.complete(1);
        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.checkpoint(1).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut waiting = Vec::new();
        for offset in 2..=5 {
            manager.complete(offset);
            let manager = manager.clone();
            let handle = tokio::spawn(async move { manager.checkpoint(offset).await });
            waiting.push(handle);
        }

        first.await.unwrap().unwrap();
        for handle in waiting {
            handle.await.unwrap().unwrap();
        }

        let commits: Vec<u64> = consumer
            .commits()
            .await
            .iter()
            .map(|commit| commit.offset)
            .collect();
        assert_eq!(commits, vec![1, 5]);
    }

    #[tokio::test]
    async fn test_commit_failure_propagates() {
        let (manager, consumer) = manager();
        consumer.set_fail_commits(true).await;

        manager.complete(1);
        let result = manager.checkpoint(1).await;

        assert_matches!(result, Err(Error::Commit(_)));
        assert_eq!(manager.committed(), None);

        consumer.set_fail_commits(false).await;
        manager.flush().await.unwrap();
        assert_eq!(consumer.committed(0).await, Some(1));
    }

    #[tokio::test]
    async fn test_close_discards_unflushed_offset() {
        let (manager, consumer) = manager();

        manager.complete(7);
        manager.update(7);
        manager.close();

        assert_matches!(manager.flush().await, Err(Error::Closed));
        assert!(consumer.commits().await.is_empty());

        manager.complete(8);
        manager.update(8);
        assert_eq!(manager.latest(), Some(7));
    }

    #[tokio::test]
    async fn test_periodic_flush() {
        let (manager, consumer) = manager();
        manager.start_periodic_flush(Duration::from_millis(20), |_| {});

        manager.complete(2);
        manager.update(2);

        tokio::time::timeout(Duration::from_secs(1), async {
            while consumer.committed(0).await.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        manager.close();
        assert_eq!(consumer.committed(0).await, Some(2));
    }

    #[tokio::test]
    async fn test_periodic_flush_reports_failure() {
        let (manager, consumer) = manager();
        consumer.set_fail_commits(true).await;

        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        manager.start_periodic_flush(Duration::from_millis(10), move |e| {
            let _ = sender.send(e);
        });

        manager.complete(1);
        manager.update(1);

        let error = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_matches!(error, Error::Commit(_));

        manager.close();
    }
}
