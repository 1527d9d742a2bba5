//! Abstract interface for the units of business logic fed by a partition.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use conduit_consumer::Message;

/// Type-erased error reported by lambdas through their context.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Marker trait for lambda errors
pub trait LambdaError: Debug + Error + Send + Sync + 'static {}

/// Marker trait for lambda factory errors
pub trait LambdaFactoryError: Debug + Error + Send + Sync + 'static {}

/// The channel through which a lambda reports progress and failures back to
/// the partition that feeds it.
pub trait Context
where
    Self: Debug + Send + Sync + 'static,
{
    /// Reports that every message up to and including `offset` has been fully
    /// processed and may be checkpointed.
    ///
    /// Offsets beyond what the partition has seen the lambda complete are
    /// clamped. Commit failures surface as restart signals.
    fn checkpoint(&self, offset: u64);

    /// Reports an error. `restart` requests that the whole consumption unit be
    /// torn down and rebuilt from the last checkpoint.
    fn error(&self, error: BoxError, restart: bool);
}

/// A trait representing a handler for the messages of a single partition.
///
/// Messages are handed over one at a time, in offset order. The next message
/// is not handed over until the previous `handle` call has returned.
#[async_trait]
pub trait Lambda
where
    Self: Send + Sync + 'static,
{
    /// The error type for the lambda.
    type Error: LambdaError;

    /// Handles the given message. Any error is fatal for the partition.
    async fn handle(&self, message: &Message) -> Result<(), Self::Error>;

    /// Releases resources held by the lambda. Called at most once.
    async fn close(&self);
}

/// A trait representing an asynchronous constructor of lambdas.
#[async_trait]
pub trait LambdaFactory
where
    Self: Send + Sync + 'static,
{
    /// Configuration handed to every created lambda.
    type Config: Clone + Debug + Send + Sync + 'static;

    /// The error type for the factory.
    type Error: LambdaFactoryError;

    /// The lambda type produced by the factory.
    type Lambda: Lambda;

    /// Creates a lambda bound to the given context.
    async fn create(
        &self,
        config: Self::Config,
        context: Arc<dyn Context>,
    ) -> Result<Self::Lambda, Self::Error>;
}
