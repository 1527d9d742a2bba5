//! Ordered processing of a single log partition through a pluggable lambda,
//! with checkpointing of the resumable offset.
//!
//! A [`Partition`] buffers messages until its lambda has been created, hands
//! them to the lambda one at a time in offset order, and records each offset
//! the lambda completes with its [`CheckpointManager`]. Fatal conditions from
//! any layer surface as [`ErrorSignal`]s on the partition's [`ErrorReceiver`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod checkpoint;
mod config;
mod context;
mod error;
mod partition;
mod signal;

pub use checkpoint::CheckpointManager;
pub use config::PartitionOptions;
pub use context::PartitionContext;
pub use error::Error;
pub use partition::{Partition, PartitionState};
pub use signal::{ErrorReceiver, ErrorSignal, ErrorSource};
