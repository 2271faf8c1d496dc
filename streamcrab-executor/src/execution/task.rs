//! One execution attempt and the thread that runs it.
//!
//! ```text
//! CREATED --deploy--> DEPLOYING --start--> RUNNING --invoke ok--> FINISHED
//!    |                   |                    |
//!    |                cancel               cancel --> CANCELING --thread exit--> CANCELED
//!    +---- cancel before start ------------------------------------------------> CANCELED
//!    any non-terminal state --failure--> FAILED
//! ```
//!
//! Cancellation is cooperative: the stop flag and the watch channel wake code
//! that polls, and closing the task's [`CloseableRegistry`] unblocks code that
//! is stuck inside a resource and ignores every other signal.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, Sender, unbounded};
use tokio::sync::watch;

use super::{
    CloseOnDrop, CloseableRegistry, ExecutionState, ExecutionStateMachine, ExecutionStateUpdate,
    Invokable, TaskContext, TaskEnvironment, TaskInfo, TaskMail,
};
use crate::error::TaskError;
use crate::partition::{
    InputChannelDescriptor, InputChannelId, PartitionError, PartitionInfo, PartitionLocation,
    PartitionResolver, ResolvedChannel,
};
use crate::types::{CheckpointId, CheckpointMetaData, CheckpointOptions, ExecutionAttemptId};

pub struct Task {
    info: TaskInfo,
    env: TaskEnvironment,
    state: ExecutionStateMachine,
    closeables: Arc<CloseableRegistry>,
    stop_requested: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    mailbox_tx: Sender<TaskMail>,
    mailbox_rx: Mutex<Option<Receiver<TaskMail>>>,
    invokable: Mutex<Option<Box<dyn Invokable>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    input_channels: Mutex<BTreeMap<InputChannelId, InputChannelDescriptor>>,
}

impl Task {
    pub fn new(
        info: TaskInfo,
        env: TaskEnvironment,
        input_channels: Vec<InputChannelDescriptor>,
        invokable: Box<dyn Invokable>,
    ) -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(false);
        let (mailbox_tx, mailbox_rx) = unbounded();
        let state = ExecutionStateMachine::new(info.attempt_id, info.name_with_subtask());
        Arc::new(Self {
            info,
            env,
            state,
            closeables: Arc::new(CloseableRegistry::new()),
            stop_requested: AtomicBool::new(false),
            cancel_tx,
            mailbox_tx,
            mailbox_rx: Mutex::new(Some(mailbox_rx)),
            invokable: Mutex::new(Some(invokable)),
            thread: Mutex::new(None),
            started: AtomicBool::new(false),
            input_channels: Mutex::new(
                input_channels
                    .into_iter()
                    .map(|channel| (channel.channel, channel))
                    .collect(),
            ),
        })
    }

    pub fn info(&self) -> &TaskInfo {
        &self.info
    }

    pub fn attempt_id(&self) -> ExecutionAttemptId {
        self.info.attempt_id
    }

    pub fn environment(&self) -> &TaskEnvironment {
        &self.env
    }

    pub fn closeables(&self) -> &Arc<CloseableRegistry> {
        &self.closeables
    }

    pub fn execution_state(&self) -> ExecutionState {
        self.state.current()
    }

    pub fn failure_cause(&self) -> Option<Arc<anyhow::Error>> {
        self.state.failure_cause()
    }

    pub fn subscribe(&self) -> Receiver<ExecutionStateUpdate> {
        self.state.subscribe()
    }

    pub fn add_state_listener(&self, listener: Sender<ExecutionStateUpdate>) {
        self.state.add_listener(listener);
    }

    /// True once cancellation or an external failure has been requested.
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Receiver that flips to `true` when the attempt must stop.
    pub fn cancellation(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Run `f` under the state lock if the attempt is RUNNING and not stopping.
    pub(crate) fn report_if_running<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        if self.is_stop_requested() {
            return None;
        }
        self.state.with_state(ExecutionState::Running, f)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn deploy(&self) -> Result<(), TaskError> {
        if self
            .state
            .transition(ExecutionState::Created, ExecutionState::Deploying)
        {
            Ok(())
        } else {
            Err(TaskError::IllegalStateTransition {
                from: self.state.current(),
                to: ExecutionState::Deploying,
            })
        }
    }

    /// Spawn the task thread. Only valid from DEPLOYING.
    pub fn start(self: &Arc<Self>) -> Result<(), TaskError> {
        let mut thread = self.thread.lock().expect("task thread slot poisoned");
        let current = self.state.current();
        if current != ExecutionState::Deploying || self.started.load(Ordering::SeqCst) {
            return Err(TaskError::IllegalStateTransition {
                from: current,
                to: ExecutionState::Running,
            });
        }

        let invokable = self.invokable.lock().expect("task invokable poisoned").take();
        let mailbox = self.mailbox_rx.lock().expect("task mailbox poisoned").take();
        let (Some(invokable), Some(mailbox)) = (invokable, mailbox) else {
            return Err(TaskError::IllegalStateTransition {
                from: current,
                to: ExecutionState::Running,
            });
        };

        let task = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("task-{}", self.info.name_with_subtask()))
            .spawn(move || task.run(invokable, mailbox));
        match spawned {
            Ok(handle) => {
                self.started.store(true, Ordering::SeqCst);
                *thread = Some(handle);
                Ok(())
            }
            Err(err) => {
                let err = anyhow!(err).context("failed to spawn task thread");
                self.state.fail(err);
                Err(TaskError::IllegalStateTransition {
                    from: current,
                    to: ExecutionState::Running,
                })
            }
        }
    }

    /// Wait for the task thread to exit. No-op if it never started.
    pub fn join(&self) -> Result<()> {
        let handle = self.thread.lock().expect("task thread slot poisoned").take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| anyhow!("task thread of {} panicked", self.info.attempt_id))?;
        }
        Ok(())
    }

    /// Request cancellation. Repeated calls and calls after a terminal state are no-ops.
    pub fn cancel(&self) {
        self.stop(None);
    }

    /// Fail the attempt from outside the task thread, then release its resources.
    pub fn fail_externally(&self, cause: anyhow::Error) {
        self.stop(Some(cause));
    }

    fn stop(&self, cause: Option<anyhow::Error>) {
        {
            // Holding the thread slot keeps `start` from racing with us.
            let _thread = self.thread.lock().expect("task thread slot poisoned");

            if !self.started.load(Ordering::SeqCst) {
                // Never started: nothing to signal, settle directly.
                let current = self.state.current();
                if current.is_terminal() {
                    return;
                }
                let settled = match cause {
                    Some(cause) => self.state.fail(cause),
                    None => self.state.transition(current, ExecutionState::Canceled),
                };
                if settled {
                    self.stop_requested.store(true, Ordering::SeqCst);
                    self.invokable.lock().expect("task invokable poisoned").take();
                }
                return;
            }

            // Raised before the state moves, so an invokable failing after it
            // sees CANCELING is already counted as stopping.
            self.stop_requested.store(true, Ordering::SeqCst);
            match cause {
                Some(cause) => {
                    if !self.state.fail(cause) {
                        return;
                    }
                }
                None => loop {
                    // The task thread may move DEPLOYING -> RUNNING under us; retry.
                    let current = self.state.current();
                    if current.is_terminal() || current == ExecutionState::Canceling {
                        return;
                    }
                    if self.state.transition(current, ExecutionState::Canceling) {
                        break;
                    }
                },
            }
        }

        self.cancel_tx.send_replace(true);
        let _ = self.mailbox_tx.send(TaskMail::Wake);
        if let Err(err) = self.closeables.close_all() {
            tracing::warn!(
                "error while closing resources of {} ({}): {err:#}",
                self.info.name_with_subtask(),
                self.info.attempt_id
            );
        }
    }

    fn run(self: Arc<Self>, mut invokable: Box<dyn Invokable>, mailbox: Receiver<TaskMail>) {
        let _release = CloseOnDrop(Arc::clone(&self.closeables));

        if !self
            .state
            .transition(ExecutionState::Deploying, ExecutionState::Running)
        {
            self.settle(Ok(()));
            return;
        }

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let inputs = self.resolve_inputs()?;
            let mut ctx = TaskContext::new(Arc::clone(&self), mailbox, inputs);
            invokable.invoke(&mut ctx)
        }))
        .unwrap_or_else(|_| Err(anyhow!("task code panicked")));
        drop(invokable);
        if let Err(err) = self.closeables.close_all() {
            tracing::warn!("error while releasing task resources: {err:#}");
        }
        self.settle(outcome);
    }

    /// Final transition after the invokable returned.
    fn settle(&self, outcome: Result<()>) {
        match outcome {
            Ok(()) => {
                if self
                    .state
                    .transition(ExecutionState::Running, ExecutionState::Finished)
                {
                    return;
                }
            }
            Err(err) if !self.is_stop_requested() => {
                if self.state.fail(classify_failure(err)) {
                    return;
                }
            }
            Err(err) => {
                tracing::debug!(
                    "{} ({}) exited with an error during cancellation: {err:#}",
                    self.info.name_with_subtask(),
                    self.info.attempt_id
                );
            }
        }
        if self.is_stop_requested() {
            // The stop request may not have moved RUNNING to CANCELING yet.
            self.state
                .transition(ExecutionState::Running, ExecutionState::Canceling);
        }
        self.state
            .transition(ExecutionState::Canceling, ExecutionState::Canceled);
    }

    fn resolve_inputs(&self) -> Result<Vec<ResolvedChannel>> {
        let channels: Vec<InputChannelDescriptor> = self
            .input_channels
            .lock()
            .map_err(|_| anyhow!("input channel lock poisoned"))?
            .values()
            .cloned()
            .collect();
        if channels.is_empty() {
            return Ok(Vec::new());
        }

        let resolver = PartitionResolver::new(
            Arc::clone(&self.env.partition_provider),
            self.env.partition_backoff.clone(),
        );
        let resolved = self
            .env
            .async_executor
            .handle()
            .block_on(resolver.resolve_all(channels, self.cancellation()))?;

        let mut channels = self
            .input_channels
            .lock()
            .map_err(|_| anyhow!("input channel lock poisoned"))?;
        for channel in &resolved {
            if let Some(descriptor) = channels.get_mut(&channel.channel_id) {
                descriptor.known_location = Some(channel.location.clone());
            }
        }
        Ok(resolved)
    }

    // ========================================================================
    // Control messages
    // ========================================================================

    /// Queue a checkpoint on the task thread. Returns false (and does nothing)
    /// unless the attempt is RUNNING.
    pub fn trigger_checkpoint(&self, metadata: CheckpointMetaData, options: CheckpointOptions) -> bool {
        if self.execution_state() != ExecutionState::Running || self.is_stop_requested() {
            tracing::debug!(
                "ignoring trigger of checkpoint {} for {} in state {}",
                metadata.checkpoint_id,
                self.info.attempt_id,
                self.execution_state()
            );
            return false;
        }
        self.mailbox_tx
            .send(TaskMail::TriggerCheckpoint { metadata, options })
            .is_ok()
    }

    pub fn notify_checkpoint_complete(&self, checkpoint_id: CheckpointId) -> bool {
        if self.execution_state() != ExecutionState::Running {
            return false;
        }
        self.mailbox_tx
            .send(TaskMail::NotifyCheckpointComplete(checkpoint_id))
            .is_ok()
    }

    /// Point the input channel that consumes `info`'s partition at a new location.
    pub fn update_partition_info(&self, info: PartitionInfo) -> Result<()> {
        let mut channels = self
            .input_channels
            .lock()
            .map_err(|_| anyhow!("input channel lock poisoned"))?;
        let descriptor = channels
            .values_mut()
            .find(|channel| channel.partition_id.partition_id == info.partition_id.partition_id)
            .ok_or(PartitionError::UnknownPartition {
                partition_id: info.partition_id,
            })?;
        descriptor.partition_id = info.partition_id;
        descriptor.known_location = Some(info.location.clone());
        drop(channels);

        if self.execution_state() == ExecutionState::Running {
            let _ = self.mailbox_tx.send(TaskMail::PartitionUpdated(info));
        }
        Ok(())
    }

    pub fn input_location(&self, channel: InputChannelId) -> Option<PartitionLocation> {
        self.input_channels
            .lock()
            .expect("input channel lock poisoned")
            .get(&channel)
            .and_then(|descriptor| descriptor.known_location.clone())
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.info.name_with_subtask())
            .field("attempt_id", &self.info.attempt_id)
            .field("state", &self.state.current())
            .finish()
    }
}

/// Keep typed failures visible to callers; wrap everything else as an execution failure.
fn classify_failure(err: anyhow::Error) -> anyhow::Error {
    if err.is::<TaskError>() || err.is::<PartitionError>() {
        err
    } else {
        TaskError::ExecutionFailure { source: err }.into()
    }
}
