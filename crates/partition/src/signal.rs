use std::error::Error as StdError;
use std::fmt::{self, Display};
use std::sync::Arc;

use tokio::sync::mpsc;

/// The layer an error signal originated from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorSource {
    /// The lambda factory failed to produce a lambda.
    Factory,

    /// The lambda failed to handle a message.
    Handler,

    /// An offset commit failed outside of a drain.
    Checkpoint,

    /// The lambda reported an error through its context.
    Lambda,
}

impl Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Factory => write!(f, "factory"),
            Self::Handler => write!(f, "handler"),
            Self::Checkpoint => write!(f, "checkpoint"),
            Self::Lambda => write!(f, "lambda"),
        }
    }
}

/// An error raised by a partition or anything it owns.
#[derive(Clone, Debug)]
pub struct ErrorSignal {
    /// Where the error came from.
    pub source: ErrorSource,

    /// The underlying error.
    pub error: Arc<dyn StdError + Send + Sync>,

    /// Whether the whole consumption unit must be torn down and recreated.
    pub restart: bool,
}

impl ErrorSignal {
    pub(crate) fn new<E>(source: ErrorSource, error: E, restart: bool) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            source,
            error: Arc::new(error),
            restart,
        }
    }
}

impl Display for ErrorSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} error (restart: {}): {}",
            self.source, self.restart, self.error
        )
    }
}

/// Receiving side of a partition's error signals.
///
/// Yields `None` once the partition has been closed or drained and every
/// emitted signal has been received.
#[derive(Debug)]
pub struct ErrorReceiver {
    receiver: mpsc::UnboundedReceiver<ErrorSignal>,
}

impl ErrorReceiver {
    pub(crate) const fn new(receiver: mpsc::UnboundedReceiver<ErrorSignal>) -> Self {
        Self { receiver }
    }

    /// Waits for the next error signal.
    pub async fn recv(&mut self) -> Option<ErrorSignal> {
        self.receiver.recv().await
    }

    /// Returns the next error signal if one is already available.
    pub fn try_recv(&mut self) -> Option<ErrorSignal> {
        self.receiver.try_recv().ok()
    }
}
