//! Ordered, single-concurrency routing of partition messages into a lambda.

use crate::checkpoint::CheckpointManager;
use crate::config::PartitionOptions;
use crate::context::PartitionContext;
use crate::error::Error;
use crate::signal::{ErrorReceiver, ErrorSignal, ErrorSource};

use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;

use conduit_consumer::{Consumer, Message};
use conduit_lambda::{Context, Lambda, LambdaFactory};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

/// Lifecycle states of a [`Partition`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PartitionState {
    /// Waiting for the lambda factory. Messages are buffered.
    Initializing,

    /// The lambda is resolved and messages are being processed.
    Active,

    /// The lambda factory failed. Messages are buffered but never processed.
    FactoryFailed,

    /// A handler failed. Nothing after the failing message is processed.
    Failed,

    /// Closed abruptly. Queued messages were discarded.
    Closed,

    /// Drained: every queued message was processed and the checkpoint flushed.
    Drained,
}

impl PartitionState {
    /// Whether the partition has been shut down.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Drained)
    }

    /// Whether the partition can still process queued messages.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Initializing | Self::Active)
    }
}

impl Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Active => write!(f, "active"),
            Self::FactoryFailed => write!(f, "factory failed"),
            Self::Failed => write!(f, "failed"),
            Self::Closed => write!(f, "closed"),
            Self::Drained => write!(f, "drained"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Status {
    state: PartitionState,

    /// Messages accepted by `process` that have not finished processing.
    pending: usize,
}

#[derive(Debug)]
struct Queue {
    sender: mpsc::UnboundedSender<Message>,
    last_offset: Option<u64>,
}

type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// A handler failure that stops the partition.
#[derive(Debug)]
struct HandlerFailure {
    offset: u64,
    error: SharedError,
}

/// One partition of a message stream.
///
/// Routes messages, one at a time and in the order they were given to
/// [`process`](Self::process), into the lambda produced by the factory, and
/// maintains the partition's checkpoint. Messages received before the lambda
/// resolves are buffered.
///
/// Dropping a partition closes it.
#[derive(Debug)]
pub struct Partition<C>
where
    C: Consumer,
{
    id: i32,
    checkpoint_manager: CheckpointManager<C>,
    context: Arc<PartitionContext<C>>,
    queue: Mutex<Queue>,
    status: Arc<watch::Sender<Status>>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl<C> Partition<C>
where
    C: Consumer,
{
    /// Creates partition `id` and starts resolving its lambda.
    ///
    /// Returns the partition along with the receiver of its error signals. A
    /// signal with `restart` set means the partition must be discarded and
    /// the whole consumption unit recreated.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<F>(
        id: i32,
        factory: F,
        consumer: C,
        config: F::Config,
        options: PartitionOptions,
    ) -> (Self, ErrorReceiver)
    where
        F: LambdaFactory,
    {
        let checkpoint_manager = CheckpointManager::new(id, consumer);
        let (context, errors) = PartitionContext::new(checkpoint_manager.clone());

        if let Some(interval) = options.checkpoint_interval {
            let context = Arc::downgrade(&context);
            checkpoint_manager.start_periodic_flush(interval, move |e| {
                if let Some(context) = context.upgrade() {
                    context.emit_checkpoint_failure(e);
                }
            });
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(Status {
            state: PartitionState::Initializing,
            pending: 0,
        });
        let status = Arc::new(status);
        let shutdown_token = CancellationToken::new();
        let task_tracker = TaskTracker::new();

        task_tracker.spawn(Self::run(
            id,
            factory,
            config,
            Worker {
                checkpoint_manager: checkpoint_manager.clone(),
                context: context.clone(),
                receiver,
                status: status.clone(),
                shutdown_token: shutdown_token.clone(),
                options,
            },
        ));
        task_tracker.close();

        let partition = Self {
            id,
            checkpoint_manager,
            context,
            queue: Mutex::new(Queue {
                sender,
                last_offset: None,
            }),
            status,
            shutdown_token,
            task_tracker,
        };

        (partition, errors)
    }

    /// The id of the partition.
    #[must_use]
    pub const fn id(&self) -> i32 {
        self.id
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PartitionState {
        self.status.borrow().state
    }

    /// The number of accepted messages that have not finished processing.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.status.borrow().pending
    }

    /// The checkpoint manager of the partition.
    #[must_use]
    pub const fn checkpoint_manager(&self) -> &CheckpointManager<C> {
        &self.checkpoint_manager
    }

    /// Queues `message` for processing. Never waits.
    ///
    /// # Errors
    ///
    /// Returns an error if the partition is shut down, if the message belongs
    /// to another partition, or if its offset does not follow the previously
    /// queued message.
    pub fn process(&self, message: Message) -> Result<(), Error> {
        if message.partition != self.id {
            return Err(Error::PartitionMismatch {
                expected: self.id,
                actual: message.partition,
            });
        }

        let mut queue = self.queue.lock();

        if self.state().is_terminal() {
            return Err(Error::Closed);
        }

        if let Some(last) = queue.last_offset {
            if message.offset <= last {
                return Err(Error::OffsetRegression {
                    last,
                    offset: message.offset,
                });
            }
        }

        let offset = message.offset;
        self.status.send_modify(|status| status.pending += 1);

        if queue.sender.send(message).is_err() {
            // The worker only exits once shut down.
            self.status
                .send_modify(|status| status.pending = status.pending.saturating_sub(1));
            return Err(Error::Closed);
        }

        queue.last_offset = Some(offset);

        Ok(())
    }

    /// Stops the partition immediately.
    ///
    /// Queued messages that have not started are discarded. A handler call in
    /// flight is left to finish in the background, and its outcome ignored.
    /// The lambda is closed once that call returns, or straight away if idle.
    /// A lambda still being created is abandoned. Calling `close` again has no
    /// effect.
    pub fn close(&self) {
        if !self.transition(PartitionState::Closed) {
            return;
        }

        info!(
            "closing partition {} with {} pending messages",
            self.id,
            self.pending()
        );

        self.shutdown();
    }

    /// Processes every queued message, then commits the latest checkpoint and
    /// shuts the partition down.
    ///
    /// If nothing is queued the checkpoint is flushed straight away.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the partition is or gets closed,
    /// [`Error::Failed`] if it cannot process its queue, and
    /// [`Error::Commit`] if the final commit fails. A failed commit leaves
    /// the partition running.
    pub async fn drain(&self) -> Result<(), Error> {
        let mut status = self.status.subscribe();

        if status.borrow().pending == 0 {
            info!("no pending work on partition {}, exiting early", self.id);
        } else {
            info!("waiting for partition {} to drain", self.id);
        }

        let state = status
            .wait_for(|status| !status.state.is_live() || status.pending == 0)
            .await
            .map_err(|_| Error::Closed)?
            .state;

        match state {
            PartitionState::Closed => return Err(Error::Closed),
            PartitionState::Drained => return Ok(()),
            PartitionState::FactoryFailed | PartitionState::Failed => {
                return Err(Error::Failed(self.id));
            }
            PartitionState::Initializing | PartitionState::Active => {}
        }

        info!("partition {} drained", self.id);

        match self.checkpoint_manager.flush().await {
            Ok(()) => {}
            // A concurrent drain finished first and closed the checkpoint.
            Err(Error::Closed) => return self.drained_by_other().await,
            Err(e) => return Err(e),
        }

        if !self.transition(PartitionState::Drained) {
            return self.drained_by_other().await;
        }

        self.shutdown();
        self.task_tracker.wait().await;

        Ok(())
    }

    /// Waits for the background task of the partition to exit.
    ///
    /// The task exits once the partition is shut down and its lambda closed.
    pub async fn wait(&self) {
        self.task_tracker.wait().await;
    }

    /// Outcome of a drain that lost the race to move into a terminal state.
    async fn drained_by_other(&self) -> Result<(), Error> {
        match self.state() {
            PartitionState::Drained => {
                self.task_tracker.wait().await;
                Ok(())
            }
            PartitionState::FactoryFailed | PartitionState::Failed => Err(Error::Failed(self.id)),
            _ => Err(Error::Closed),
        }
    }

    /// Moves into the terminal `state`, unless already terminal.
    fn transition(&self, state: PartitionState) -> bool {
        self.status.send_if_modified(|status| {
            if status.state.is_terminal() {
                false
            } else {
                status.state = state;
                true
            }
        })
    }

    fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.checkpoint_manager.close();
        self.context.close();
    }

    async fn run<F>(id: i32, factory: F, config: F::Config, mut worker: Worker<C>)
    where
        F: LambdaFactory,
    {
        let context: Arc<dyn Context> = worker.context.clone();

        let lambda = tokio::select! {
            biased;
            () = worker.shutdown_token.cancelled() => {
                debug!("partition {} shut down before its lambda resolved", id);
                return;
            }
            result = factory.create(config, context) => match result {
                Ok(lambda) => lambda,
                Err(e) => {
                    error!("failed to create lambda for partition {}: {}", id, e);
                    worker.set_state(PartitionState::FactoryFailed);
                    worker
                        .context
                        .emit(ErrorSignal::new(ErrorSource::Factory, e, true));

                    // Keep accepting messages until shut down; they are never processed.
                    worker.shutdown_token.cancelled().await;
                    return;
                }
            }
        };

        if worker.set_state(PartitionState::Active) {
            debug!("lambda for partition {} resolved", id);

            if let Err(failure) = worker.process_messages(&lambda).await {
                error!(
                    "handler failed on partition {} at offset {}: {}",
                    id, failure.offset, failure.error
                );
                worker.set_state(PartitionState::Failed);
                worker.context.emit(ErrorSignal {
                    source: ErrorSource::Handler,
                    error: failure.error,
                    restart: true,
                });

                worker.shutdown_token.cancelled().await;
            }
        }

        lambda.close().await;
        debug!("closed lambda for partition {}", id);
    }
}

impl<C> Drop for Partition<C>
where
    C: Consumer,
{
    fn drop(&mut self) {
        self.close();
    }
}

/// State owned by the background task of a partition.
struct Worker<C>
where
    C: Consumer,
{
    checkpoint_manager: CheckpointManager<C>,
    context: Arc<PartitionContext<C>>,
    receiver: mpsc::UnboundedReceiver<Message>,
    status: Arc<watch::Sender<Status>>,
    shutdown_token: CancellationToken,
    options: PartitionOptions,
}

impl<C> Worker<C>
where
    C: Consumer,
{
    async fn process_messages<L>(&mut self, lambda: &L) -> Result<(), HandlerFailure>
    where
        L: Lambda,
    {
        loop {
            let message = tokio::select! {
                biased;
                () = self.shutdown_token.cancelled() => return Ok(()),
                message = self.receiver.recv() => match message {
                    Some(message) => message,
                    None => return Ok(()),
                }
            };

            let result = self.process_core(lambda, &message).await;

            if self.shutdown_token.is_cancelled() {
                debug!("discarding outcome of {} after shutdown", message);
                return Ok(());
            }

            result?;

            self.checkpoint_manager.complete(message.offset);
            if self.options.auto_checkpoint {
                self.checkpoint_manager.update(message.offset);
            }

            self.status
                .send_modify(|status| status.pending = status.pending.saturating_sub(1));
        }
    }

    async fn process_core<L>(&self, lambda: &L, message: &Message) -> Result<(), HandlerFailure>
    where
        L: Lambda,
    {
        trace!("{}", message);

        let result = match self.options.handler_timeout {
            Some(timeout) => Self::handle_with_timeout(lambda, message, timeout).await,
            None => lambda
                .handle(message)
                .await
                .map_err(|e| -> SharedError { Arc::new(e) }),
        };

        result.map_err(|error| HandlerFailure {
            offset: message.offset,
            error,
        })
    }

    async fn handle_with_timeout<L>(
        lambda: &L,
        message: &Message,
        timeout: Duration,
    ) -> Result<(), SharedError>
    where
        L: Lambda,
    {
        match tokio::time::timeout(timeout, lambda.handle(message)).await {
            Ok(result) => result.map_err(|e| -> SharedError { Arc::new(e) }),
            Err(_) => {
                warn!("handler for {} timed out after {:?}", message, timeout);
                Err(Arc::new(Error::HandlerTimeout {
                    offset: message.offset,
                    timeout,
                }))
            }
        }
    }

    /// Moves to `state` if the partition is still live.
    fn set_state(&self, state: PartitionState) -> bool {
        self.status.send_if_modified(|status| {
            if status.state.is_live() {
                status.state = state;
                true
            } else {
                false
            }
        })
    }
}
