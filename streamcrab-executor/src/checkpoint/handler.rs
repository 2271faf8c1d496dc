use super::*;
use crate::execution::{ExecutionState, RegistrationKey};
use crate::state::SnapshotError;
use std::panic::AssertUnwindSafe;

/// What the synchronous phase of a participant gets to work with.
pub struct SyncSnapshotContext<'a> {
    pub checkpoint_id: CheckpointId,
    pub timestamp: EventTime,
    pub options: &'a CheckpointOptions,
    pub stream_factory: &'a Arc<dyn CheckpointStreamFactory>,
    /// Scoped to this checkpoint. Streams opened during the synchronous phase
    /// must be registered here so cancellation can close them.
    pub registry: &'a Arc<CloseableRegistry>,
}

/// Anything on the task thread that owns state: usually one operator of the chain.
pub trait SnapshotParticipant {
    fn operator_id(&self) -> OperatorId;

    /// Capture a consistent view of the state and return the writes still to do.
    fn snapshot_sync(&mut self, ctx: &SyncSnapshotContext<'_>) -> Result<OperatorSnapshotFutures>;

    fn notify_checkpoint_complete(&mut self, _checkpoint_id: CheckpointId) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Nothing was reported: the task is not running or the id is already in flight.
    Skipped,
    /// The synchronous phase failed and the checkpoint was declined.
    Declined,
    /// The asynchronous phase was handed to the snapshot executor.
    Triggered,
}

type InFlight = Arc<Mutex<HashMap<CheckpointId, Arc<CloseableRegistry>>>>;

/// Drives checkpoints of one task: the synchronous phase on the caller's
/// thread, the asynchronous phase on the shared snapshot executor.
///
/// Each checkpoint id owns its metrics and its own [`CloseableRegistry`], which
/// is itself registered with the task's registry. Cancelling the task therefore
/// closes the streams of every checkpoint still writing.
pub struct CheckpointBarrierHandler {
    task: Arc<Task>,
    in_flight: InFlight,
}

impl CheckpointBarrierHandler {
    pub fn new(task: Arc<Task>) -> Self {
        Self {
            task,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn is_in_flight(&self, checkpoint_id: CheckpointId) -> bool {
        self.in_flight
            .lock()
            .expect("in-flight checkpoints poisoned")
            .contains_key(&checkpoint_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight
            .lock()
            .expect("in-flight checkpoints poisoned")
            .len()
    }

    /// Run the synchronous phase of `metadata`'s checkpoint over `participants`.
    ///
    /// Must be called on the task thread. Returns an error only when the
    /// failure policy says the task has to fail.
    pub fn trigger_checkpoint<P: SnapshotParticipant>(
        &mut self,
        metadata: CheckpointMetaData,
        options: &CheckpointOptions,
        participants: &mut [P],
    ) -> Result<TriggerOutcome> {
        self.trigger_checkpoint_after_alignment(metadata, options, Duration::ZERO, participants)
    }

    /// Like [`trigger_checkpoint`](Self::trigger_checkpoint) for a checkpoint
    /// started by a barrier; `alignment_duration` is reported with the acknowledgement.
    pub fn trigger_checkpoint_after_alignment<P: SnapshotParticipant>(
        &mut self,
        metadata: CheckpointMetaData,
        options: &CheckpointOptions,
        alignment_duration: Duration,
        participants: &mut [P],
    ) -> Result<TriggerOutcome> {
        let checkpoint_id = metadata.checkpoint_id;
        if self.task.is_stop_requested()
            || self.task.execution_state() != ExecutionState::Running
        {
            tracing::debug!(
                "skipping checkpoint {checkpoint_id} of {}: task is {}",
                self.task.attempt_id(),
                self.task.execution_state()
            );
            return Ok(TriggerOutcome::Skipped);
        }

        let registry = Arc::new(CloseableRegistry::new());
        {
            let mut in_flight = self
                .in_flight
                .lock()
                .map_err(|_| anyhow!("in-flight checkpoints lock poisoned"))?;
            if in_flight.contains_key(&checkpoint_id) {
                tracing::warn!(
                    "checkpoint {checkpoint_id} of {} is already in progress, ignoring trigger",
                    self.task.attempt_id()
                );
                return Ok(TriggerOutcome::Skipped);
            }
            in_flight.insert(checkpoint_id, Arc::clone(&registry));
        }
        let task_registration = {
            let checkpoint_registry = Arc::clone(&registry);
            self.task
                .closeables()
                .register(move || checkpoint_registry.close_all())
        };
        let task_registration = match task_registration {
            Ok(key) => key,
            Err(err) => {
                // The task registry is already closed: the task is going away.
                self.forget(checkpoint_id);
                tracing::debug!("skipping checkpoint {checkpoint_id}: {err:#}");
                return Ok(TriggerOutcome::Skipped);
            }
        };

        let mut metrics = CheckpointMetricsBuilder::new(checkpoint_id);
        metrics.set_alignment_duration(alignment_duration);
        let sync_start = Instant::now();
        let ctx = SyncSnapshotContext {
            checkpoint_id,
            timestamp: metadata.timestamp,
            options,
            stream_factory: &self.task.environment().stream_factory,
            registry: &registry,
        };
        let mut futures = Vec::with_capacity(participants.len());
        let sync_result = participants.iter_mut().try_for_each(|participant| {
            let operator_id = participant.operator_id();
            let pending = participant
                .snapshot_sync(&ctx)
                .with_context(|| format!("snapshot of operator {operator_id} failed"))?;
            futures.push((operator_id, pending));
            Ok::<_, anyhow::Error>(())
        });
        metrics.set_sync_duration(sync_start.elapsed());

        if let Err(err) = sync_result {
            drop(futures);
            self.release(checkpoint_id, &registry, task_registration);
            return self.handle_sync_failure(checkpoint_id, err);
        }
        tracing::debug!(
            "synchronous part of checkpoint {checkpoint_id} of {} took {:?}",
            self.task.info().name_with_subtask(),
            sync_start.elapsed()
        );

        let env = self.task.environment();
        if env.checkpointing.report_sync_progress {
            let partial = metrics.snapshot_partial();
            let info = self.task.info();
            self.task.report_if_running(|| {
                env.responder.report_checkpoint_metrics(
                    info.job_id,
                    info.attempt_id,
                    checkpoint_id,
                    partial,
                )
            });
        }

        let runnable = AsyncCheckpointRunnable {
            task: Arc::clone(&self.task),
            in_flight: Arc::clone(&self.in_flight),
            checkpoint_id,
            registry,
            task_registration,
            futures,
            metrics,
        };
        env.async_executor.execute(move || runnable.run());
        Ok(TriggerOutcome::Triggered)
    }

    pub fn notify_checkpoint_complete<P: SnapshotParticipant>(
        &mut self,
        checkpoint_id: CheckpointId,
        participants: &mut [P],
    ) -> Result<()> {
        if self.task.is_stop_requested() {
            return Ok(());
        }
        for participant in participants.iter_mut() {
            participant
                .notify_checkpoint_complete(checkpoint_id)
                .with_context(|| {
                    format!(
                        "operator {} failed to handle completion of checkpoint {checkpoint_id}",
                        participant.operator_id()
                    )
                })?;
        }
        Ok(())
    }

    fn handle_sync_failure(
        &self,
        checkpoint_id: CheckpointId,
        err: anyhow::Error,
    ) -> Result<TriggerOutcome> {
        if self.task.is_stop_requested() {
            tracing::debug!(
                "synchronous part of checkpoint {checkpoint_id} aborted by cancellation: {err:#}"
            );
            return Ok(TriggerOutcome::Skipped);
        }

        let exception =
            CheckpointException::from_error(CheckpointFailureReason::SyncSnapshotFailed, &err);
        let declined = decline(&self.task, checkpoint_id, exception);
        let policy = self.task.environment().checkpointing.failure_policy;
        match policy.action_for(SnapshotPhase::Synchronous) {
            FailureAction::DeclineAndFailTask => Err(TaskError::SynchronousSnapshotFailure {
                checkpoint_id,
                source: err,
            }
            .into()),
            FailureAction::DeclineOnly if declined => Ok(TriggerOutcome::Declined),
            FailureAction::DeclineOnly => Ok(TriggerOutcome::Skipped),
        }
    }

    fn release(
        &self,
        checkpoint_id: CheckpointId,
        registry: &CloseableRegistry,
        task_registration: RegistrationKey,
    ) {
        self.task.closeables().unregister(task_registration);
        if let Err(err) = registry.close_all() {
            tracing::warn!("failed to release resources of checkpoint {checkpoint_id}: {err:#}");
        }
        self.forget(checkpoint_id);
    }

    fn forget(&self, checkpoint_id: CheckpointId) {
        self.in_flight
            .lock()
            .expect("in-flight checkpoints poisoned")
            .remove(&checkpoint_id);
    }
}

/// Report a decline while the task is RUNNING. Returns whether it was sent.
fn decline(task: &Task, checkpoint_id: CheckpointId, exception: CheckpointException) -> bool {
    let info = task.info();
    let responder = &task.environment().responder;
    task.report_if_running(|| {
        tracing::warn!(
            "declining checkpoint {checkpoint_id} of {} ({}): {exception}",
            info.name_with_subtask(),
            info.attempt_id
        );
        responder.decline_checkpoint(info.job_id, info.attempt_id, checkpoint_id, exception)
    })
    .is_some()
}

/// Asynchronous phase of one checkpoint.
struct AsyncCheckpointRunnable {
    task: Arc<Task>,
    in_flight: InFlight,
    checkpoint_id: CheckpointId,
    registry: Arc<CloseableRegistry>,
    task_registration: RegistrationKey,
    futures: Vec<(OperatorId, OperatorSnapshotFutures)>,
    metrics: CheckpointMetricsBuilder,
}

impl AsyncCheckpointRunnable {
    fn run(self) {
        let Self {
            task,
            in_flight,
            checkpoint_id,
            registry,
            task_registration,
            futures,
            mut metrics,
        } = self;

        let async_start = Instant::now();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            write_snapshot(futures, &registry)
        }))
        .unwrap_or_else(|_| Err(anyhow!("asynchronous snapshot of checkpoint {checkpoint_id} panicked")));
        metrics.set_async_duration(async_start.elapsed());

        let canceled = registry.is_closed();
        task.closeables().unregister(task_registration);
        in_flight
            .lock()
            .expect("in-flight checkpoints poisoned")
            .remove(&checkpoint_id);

        match result {
            Ok(snapshot) => acknowledge(&task, checkpoint_id, snapshot, metrics),
            Err(err) if canceled || task.is_stop_requested() => {
                tracing::debug!(
                    "asynchronous part of checkpoint {checkpoint_id} aborted by cancellation: {err:#}"
                );
            }
            Err(err) => {
                let exception = CheckpointException::from_error(
                    CheckpointFailureReason::AsyncSnapshotFailed,
                    &err,
                );
                let declined = decline(&task, checkpoint_id, exception);
                let policy = task.environment().checkpointing.failure_policy;
                if declined
                    && policy.action_for(SnapshotPhase::Asynchronous)
                        == FailureAction::DeclineAndFailTask
                {
                    task.fail_externally(
                        TaskError::AsynchronousSnapshotFailure {
                            checkpoint_id,
                            source: err,
                        }
                        .into(),
                    );
                }
            }
        }
        if let Err(err) = registry.close_all() {
            tracing::warn!("failed to release resources of checkpoint {checkpoint_id}: {err:#}");
        }
    }
}

fn write_snapshot(
    futures: Vec<(OperatorId, OperatorSnapshotFutures)>,
    registry: &CloseableRegistry,
) -> Result<TaskStateSnapshot> {
    let mut snapshot = TaskStateSnapshot::new();
    for (operator_id, pending) in futures {
        match pending.run(registry) {
            Ok(state) => {
                snapshot.put_subtask_state(operator_id, state);
            }
            Err(err) => {
                if let Err(discard_err) = snapshot.discard_state() {
                    tracing::warn!("failed to discard partial task snapshot: {discard_err:#}");
                }
                // Keep the phase visible to whoever inspects the decline.
                return Err(if err.is::<SnapshotError>() {
                    err
                } else {
                    err.context(format!("asynchronous snapshot of operator {operator_id} failed"))
                });
            }
        }
    }
    Ok(snapshot)
}

/// Hand the snapshot to the coordinator, or discard it if the task stopped meanwhile.
fn acknowledge(
    task: &Task,
    checkpoint_id: CheckpointId,
    snapshot: TaskStateSnapshot,
    mut metrics: CheckpointMetricsBuilder,
) {
    metrics.set_bytes_persisted(snapshot.state_size());
    let metrics = metrics.build();
    let info = task.info();
    let responder = &task.environment().responder;

    let mut pending = Some(snapshot);
    let reported = task.report_if_running(|| {
        let snapshot = pending.take().filter(TaskStateSnapshot::has_state);
        responder.acknowledge_checkpoint(
            info.job_id,
            info.attempt_id,
            checkpoint_id,
            metrics,
            snapshot,
        );
        tracing::debug!(
            "acknowledged checkpoint {checkpoint_id} of {}",
            info.name_with_subtask()
        );
    });
    if reported.is_none()
        && let Some(snapshot) = pending
    {
        tracing::debug!("discarding state of checkpoint {checkpoint_id}: task is no longer running");
        if let Err(err) = snapshot.discard_state() {
            tracing::warn!("failed to discard state of checkpoint {checkpoint_id}: {err:#}");
        }
    }
}
