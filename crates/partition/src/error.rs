use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while processing a partition.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The partition (or its checkpoint manager) has been closed.
    #[error("partition is closed")]
    Closed,

    /// The consumer failed to commit an offset.
    #[error("offset commit failed: {0}")]
    Commit(Arc<dyn StdError + Send + Sync>),

    /// The partition stopped making progress after a fatal error.
    #[error("partition {0} can no longer make progress")]
    Failed(i32),

    /// A handler call did not complete in time.
    #[error("handler for offset {offset} did not complete within {timeout:?}")]
    HandlerTimeout {
        /// Offset of the message being handled.
        offset: u64,

        /// The configured handler timeout.
        timeout: Duration,
    },

    /// A message did not follow the previously accepted one.
    #[error("offset {offset} does not follow previously accepted offset {last}")]
    OffsetRegression {
        /// The last accepted offset.
        last: u64,

        /// The rejected offset.
        offset: u64,
    },

    /// A message was delivered to the wrong partition.
    #[error("message for partition {actual} delivered to partition {expected}")]
    PartitionMismatch {
        /// The id of the receiving partition.
        expected: i32,

        /// The partition named by the message.
        actual: i32,
    },
}

impl Error {
    pub(crate) fn commit<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Commit(Arc::new(error))
    }
}
