//! The channel between a partition's lambda and the partition itself.

use crate::checkpoint::CheckpointManager;
use crate::error::Error;
use crate::signal::{ErrorReceiver, ErrorSignal, ErrorSource};

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use conduit_consumer::Consumer;
use conduit_lambda::{BoxError, Context};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Context handed to the lambda of a partition.
///
/// Forwards checkpoints to the partition's [`CheckpointManager`] and funnels
/// every error signal raised by the partition, its checkpointing, or its
/// lambda into a single [`ErrorReceiver`]. Of the signals requesting a restart
/// only the first is forwarded.
pub struct PartitionContext<C>
where
    C: Consumer,
{
    checkpoint_manager: CheckpointManager<C>,
    sender: Mutex<Option<mpsc::UnboundedSender<ErrorSignal>>>,
    restart_requested: AtomicBool,
    task_tracker: TaskTracker,
    this: Weak<Self>,
}

impl<C> PartitionContext<C>
where
    C: Consumer,
{
    /// Creates a context bound to `checkpoint_manager`, along with the
    /// receiver its error signals are delivered to.
    pub fn new(checkpoint_manager: CheckpointManager<C>) -> (Arc<Self>, ErrorReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();

        let context = Arc::new_cyclic(|this| Self {
            checkpoint_manager,
            sender: Mutex::new(Some(sender)),
            restart_requested: AtomicBool::new(false),
            task_tracker: TaskTracker::new(),
            this: this.clone(),
        });

        (context, ErrorReceiver::new(receiver))
    }

    /// Emits an error signal, unless a restart has already been requested or
    /// the context is closed.
    pub fn emit(&self, signal: ErrorSignal) {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            debug!("context closed, dropping {}", signal);
            return;
        };

        if signal.restart && self.restart_requested.swap(true, Ordering::SeqCst) {
            debug!("restart already requested, suppressing {}", signal);
            return;
        }

        warn!(
            "partition {} raised {}",
            self.checkpoint_manager.id(),
            signal
        );
        let _ = sender.send(signal);
    }

    /// Whether a restart signal has been emitted.
    pub fn restart_requested(&self) -> bool {
        self.restart_requested.load(Ordering::SeqCst)
    }

    /// Stops forwarding signals. The checkpoint manager is left open.
    pub fn close(&self) {
        self.sender.lock().take();
        self.task_tracker.close();
    }

    /// Whether the context has been closed.
    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Reports a failed background commit as a restart signal.
    pub fn emit_checkpoint_failure(&self, error: Error) {
        if matches!(error, Error::Closed) {
            return;
        }

        self.emit(ErrorSignal::new(ErrorSource::Checkpoint, error, true));
    }
}

impl<C> Context for PartitionContext<C>
where
    C: Consumer,
{
    fn checkpoint(&self, offset: u64) {
        if self.is_closed() {
            return;
        }

        self.checkpoint_manager.update(offset);

        let checkpoint_manager = self.checkpoint_manager.clone();
        let this = self.this.clone();
        self.task_tracker.spawn(async move {
            if let Err(e) = checkpoint_manager.flush().await {
                if let Some(context) = this.upgrade() {
                    context.emit_checkpoint_failure(e);
                }
            }
        });
    }

    fn error(&self, error: BoxError, restart: bool) {
        self.emit(ErrorSignal {
            source: ErrorSource::Lambda,
            error: Arc::from(error),
            restart,
        });
    }
}

impl<C> Debug for PartitionContext<C>
where
    C: Consumer,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionContext")
            .field("partition", &self.checkpoint_manager.id())
            .field("restart_requested", &self.restart_requested())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
