use conduit_consumer::ConsumerError;
use thiserror::Error;

/// Errors that can occur in the in-memory consumer.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Commits were configured to fail.
    #[error("commit of offset {offset} for partition {partition} rejected")]
    CommitRejected {
        /// The partition of the rejected commit.
        partition: i32,

        /// The offset of the rejected commit.
        offset: u64,
    },
}

impl ConsumerError for Error {}
