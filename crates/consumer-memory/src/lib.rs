//! In-memory implementation of a log consumer for local development and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_consumer::{Consumer, OffsetCommit};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Default)]
struct State {
    commits: Vec<OffsetCommit>,
    committed: HashMap<i32, u64>,
    commit_delay: Option<Duration>,
    fail_commits: bool,
}

/// In-memory consumer which records every offset commit.
#[derive(Clone, Debug)]
pub struct MemoryConsumer {
    name: String,
    state: Arc<Mutex<State>>,
}

impl MemoryConsumer {
    /// Creates a new `MemoryConsumer`.
    #[must_use]
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Every commit accepted so far, in commit order.
    pub async fn commits(&self) -> Vec<OffsetCommit> {
        self.state.lock().await.commits.clone()
    }

    /// The last committed offset for a partition.
    pub async fn committed(&self, partition: i32) -> Option<u64> {
        self.state.lock().await.committed.get(&partition).copied()
    }

    /// Delays every subsequent commit by `delay`.
    pub async fn set_commit_delay(&self, delay: Option<Duration>) {
        self.state.lock().await.commit_delay = delay;
    }

    /// Makes every subsequent commit fail (or succeed again).
    pub async fn set_fail_commits(&self, fail: bool) {
        self.state.lock().await.fail_commits = fail;
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    type Error = Error;

    fn name(&self) -> &str {
        &self.name
    }

    async fn commit_offset(&self, commit: OffsetCommit) -> Result<(), Self::Error> {
        let delay = self.state.lock().await.commit_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if state.fail_commits {
            return Err(Error::CommitRejected {
                partition: commit.partition,
                offset: commit.offset,
            });
        }

        debug!(
            "{} committed {}@{}",
            self.name, commit.partition, commit.offset
        );
        state.commits.push(commit);
        state.committed.insert(commit.partition, commit.offset);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_commit_records_offsets() {
        let consumer = MemoryConsumer::new("group");

        consumer
            .commit_offset(OffsetCommit {
                partition: 0,
                offset: 4,
            })
            .await
            .unwrap();
        consumer
            .commit_offset(OffsetCommit {
                partition: 1,
                offset: 7,
            })
            .await
            .unwrap();

        assert_eq!(consumer.committed(0).await, Some(4));
        assert_eq!(consumer.committed(1).await, Some(7));
        assert_eq!(consumer.committed(2).await, None);
        assert_eq!(consumer.commits().await.len(), 2);
        assert_eq!(consumer.name(), "group");
    }

    #[tokio::test]
    async fn test_failing_commits() {
        let consumer = MemoryConsumer::new("group");
        consumer.set_fail_commits(true).await;

        let result = consumer
            .commit_offset(OffsetCommit {
                partition: 0,
                offset: 1,
            })
            .await;

        assert_matches!(
            result,
            Err(Error::CommitRejected {
                partition: 0,
                offset: 1
            })
        );
        assert_eq!(consumer.committed(0).await, None);

        consumer.set_fail_commits(false).await;
        consumer
            .commit_offset(OffsetCommit {
                partition: 0,
                offset: 1,
            })
            .await
            .unwrap();
        assert_eq!(consumer.committed(0).await, Some(1));
    }
}
