//! Abstract interface for partitioned log consumers.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::{self, Debug, Display};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Marker trait for consumer errors
pub trait ConsumerError: Debug + Error + Send + Sync + 'static {}

/// A single entry of a partitioned log, as delivered by the consumer client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The topic the message was read from.
    pub topic: String,

    /// The partition the message belongs to.
    pub partition: i32,

    /// Position of the message within its partition.
    pub offset: u64,

    /// Opaque message body.
    pub payload: Bytes,
}

impl Message {
    /// Creates a new message.
    pub fn new<T, P>(topic: T, partition: i32, offset: u64, payload: P) -> Self
    where
        T: Into<String>,
        P: Into<Bytes>,
    {
        Self {
            topic: topic.into(),
            partition,
            offset,
            payload: payload.into(),
        }
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.topic, self.partition, self.offset)
    }
}

/// An offset to durably record for a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OffsetCommit {
    /// The partition being committed.
    pub partition: i32,

    /// The offset consumption should resume after.
    pub offset: u64,
}

/// A trait representing the broker-facing side of a log consumer.
///
/// Message delivery is driven by the owning service; the processing core only
/// needs the consumer to persist offsets.
#[async_trait]
pub trait Consumer
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the consumer.
    type Error: ConsumerError;

    /// Returns the name of the consumer (usually its group id).
    fn name(&self) -> &str;

    /// Durably commits the given offset.
    async fn commit_offset(&self, commit: OffsetCommit) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_display() {
        let message = Message::new("deltas", 3, 42, "payload");

        assert_eq!(message.to_string(), "deltas:3@42");
        assert_eq!(message.payload, Bytes::from("payload"));
    }
}
