//! Worker-side facade: owns the slots, admits deployments through the
//! allocation guard and routes control messages to running attempts.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::checkpoint::CheckpointResponder;
use crate::config::TaskExecutorConfig;
use crate::error::TaskError;
use crate::execution::{
    AsyncSnapshotExecutor, ExecutionState, ExecutionStateUpdate, Invokable, Task,
    TaskEnvironment, TaskInfo,
};
use crate::partition::{InputChannelDescriptor, PartitionInfo, PartitionLocationProvider};
use crate::slot::{SlotError, TaskSlotTable};
use crate::state::{CheckpointStreamFactory, create_checkpoint_stream_factory};
use crate::types::{
    AllocationId, CheckpointId, CheckpointMetaData, CheckpointOptions, ExecutionAttemptId, JobId,
};

/// Everything needed to deploy one attempt into a slot.
#[derive(Debug, Clone)]
pub struct TaskDeploymentDescriptor {
    pub job_id: JobId,
    pub attempt_id: ExecutionAttemptId,
    pub allocation_id: AllocationId,
    pub task_name: String,
    /// Name of the invokable in the executor's [`InvokableRegistry`].
    pub invokable: String,
    pub subtask_index: usize,
    pub parallelism: usize,
    pub max_parallelism: u32,
    pub input_channels: Vec<InputChannelDescriptor>,
}

impl TaskDeploymentDescriptor {
    pub fn validate(&self) -> Result<()> {
        if self.max_parallelism == 0 {
            return Err(anyhow!("max_parallelism must be at least 1"));
        }
        if self.parallelism == 0 {
            return Err(anyhow!("parallelism must be at least 1"));
        }
        if self.subtask_index >= self.parallelism {
            return Err(anyhow!(
                "subtask index {} out of range for parallelism {}",
                self.subtask_index,
                self.parallelism
            ));
        }
        if self.parallelism > self.max_parallelism as usize {
            return Err(anyhow!(
                "parallelism {} exceeds max_parallelism {}",
                self.parallelism,
                self.max_parallelism
            ));
        }
        let mut seen = HashSet::new();
        for channel in &self.input_channels {
            if !seen.insert(channel.channel) {
                return Err(anyhow!("duplicate input channel {}", channel.channel));
            }
        }
        Ok(())
    }

    fn task_info(&self) -> TaskInfo {
        TaskInfo {
            job_id: self.job_id,
            attempt_id: self.attempt_id,
            allocation_id: self.allocation_id,
            task_name: self.task_name.clone(),
            subtask_index: self.subtask_index,
            parallelism: self.parallelism,
            max_parallelism: self.max_parallelism,
        }
    }
}

pub type InvokableFactory = Arc<dyn Fn(&TaskInfo) -> Result<Box<dyn Invokable>> + Send + Sync>;

/// Invokables this executor can instantiate, by name.
#[derive(Clone, Default)]
pub struct InvokableRegistry {
    factories: HashMap<String, InvokableFactory>,
}

impl InvokableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_invokable<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&TaskInfo) -> Result<Box<dyn Invokable>> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&TaskInfo) -> Result<Box<dyn Invokable>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    fn instantiate(&self, name: &str, info: &TaskInfo) -> Result<Box<dyn Invokable>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow!("unknown invokable {name}"))?;
        factory(info).with_context(|| format!("failed to instantiate invokable {name}"))
    }
}

impl fmt::Debug for InvokableRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("InvokableRegistry")
            .field("invokables", &names)
            .finish()
    }
}

pub struct TaskExecutor {
    config: TaskExecutorConfig,
    invokables: InvokableRegistry,
    responder: Arc<dyn CheckpointResponder>,
    partition_provider: Arc<dyn PartitionLocationProvider>,
    stream_factory: Arc<dyn CheckpointStreamFactory>,
    slots: Mutex<TaskSlotTable<Task>>,
    state_listeners: Mutex<Vec<Sender<ExecutionStateUpdate>>>,
    runtime: Option<tokio::runtime::Runtime>,
}

impl TaskExecutor {
    pub fn new(
        config: TaskExecutorConfig,
        invokables: InvokableRegistry,
        responder: Arc<dyn CheckpointResponder>,
        partition_provider: Arc<dyn PartitionLocationProvider>,
    ) -> Result<Self> {
        config
            .partition_request_backoff
            .validate()
            .context("invalid partition request backoff")?;
        let snapshot_threads = config.async_snapshot_threads.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(snapshot_threads)
            .max_blocking_threads(snapshot_threads)
            .thread_name("async-snapshot")
            .enable_time()
            .build()
            .context("failed to build asynchronous snapshot runtime")?;
        let stream_factory = create_checkpoint_stream_factory(&config.state_backend)?;
        tracing::info!(
            "task executor started with {} slots, state backend {:?}",
            config.num_slots,
            config.state_backend
        );
        Ok(Self {
            slots: Mutex::new(TaskSlotTable::new(config.num_slots)),
            config,
            invokables,
            responder,
            partition_provider,
            stream_factory,
            state_listeners: Mutex::new(Vec::new()),
            runtime: Some(runtime),
        })
    }

    pub fn config(&self) -> &TaskExecutorConfig {
        &self.config
    }

    // ========================================================================
    // Slots
    // ========================================================================

    pub fn allocate_slot(
        &self,
        slot_index: usize,
        job_id: JobId,
        allocation_id: AllocationId,
        timeout: Duration,
    ) -> Result<(), SlotError> {
        let mut slots = self.slots.lock().expect("slot table poisoned");
        slots.free_expired_slots(Instant::now());
        slots.allocate_slot(slot_index, job_id, allocation_id, timeout)
    }

    /// Free the slot and cancel whatever still runs in it.
    pub fn free_slot(&self, allocation_id: AllocationId) -> usize {
        let tasks = self
            .slots
            .lock()
            .expect("slot table poisoned")
            .free_slot(allocation_id);
        for task in &tasks {
            tracing::info!(
                "canceling {} ({}): slot {allocation_id} was freed",
                task.info().name_with_subtask(),
                task.attempt_id()
            );
            task.cancel();
        }
        tasks.len()
    }

    // ========================================================================
    // Deployment
    // ========================================================================

    /// Admit, create and start an attempt.
    ///
    /// Every admission failure is a [`TaskError::DeploymentRejected`]; the
    /// submitter must not retry it with the same descriptor.
    pub fn submit_task(&self, tdd: TaskDeploymentDescriptor) -> Result<Arc<Task>, TaskError> {
        let attempt_id = tdd.attempt_id;
        let reject = |err: anyhow::Error| {
            tracing::warn!("rejecting deployment of {} ({attempt_id}): {err:#}", tdd.task_name);
            TaskError::rejected(attempt_id, err)
        };

        {
            let mut slots = self
                .slots
                .lock()
                .map_err(|_| reject(anyhow!("slot table lock poisoned")))?;
            slots
                .mark_slot_active(tdd.allocation_id)
                .and_then(|()| slots.verify_allocation(tdd.job_id, tdd.allocation_id))
                .map_err(|err| reject(err.into()))?;
        }
        tdd.validate().map_err(reject)?;

        let info = tdd.task_info();
        let invokable = self
            .invokables
            .instantiate(&tdd.invokable, &info)
            .map_err(reject)?;
        let task = Task::new(
            info,
            self.environment().map_err(reject)?,
            tdd.input_channels.clone(),
            invokable,
        );
        {
            // Under the slot lock so a concurrent subscriber reaches this task
            // either here or through the slot table.
            let mut slots = self.slots.lock().expect("slot table poisoned");
            for listener in self
                .state_listeners
                .lock()
                .expect("state listeners poisoned")
                .iter()
            {
                task.add_state_listener(listener.clone());
            }
            slots
                .add_task(tdd.job_id, tdd.allocation_id, attempt_id, Arc::clone(&task))
                .map_err(|err| reject(err.into()))?;
        }

        let started = task.deploy().and_then(|()| task.start());
        if let Err(err) = started {
            self.slots
                .lock()
                .expect("slot table poisoned")
                .remove_task(attempt_id);
            return Err(err);
        }
        tracing::info!(
            "deployed {} ({attempt_id}) into {}",
            task.info().name_with_subtask(),
            tdd.allocation_id
        );
        Ok(task)
    }

    /// Runs asynchronous snapshot phases, at most `async_snapshot_threads` at a time.
    pub fn snapshot_executor(&self) -> Result<AsyncSnapshotExecutor> {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| anyhow!("task executor is shut down"))?;
        Ok(AsyncSnapshotExecutor::new(runtime.handle().clone()))
    }

    fn environment(&self) -> Result<TaskEnvironment> {
        Ok(TaskEnvironment {
            responder: Arc::clone(&self.responder),
            partition_provider: Arc::clone(&self.partition_provider),
            stream_factory: Arc::clone(&self.stream_factory),
            async_executor: self.snapshot_executor()?,
            checkpointing: self.config.checkpointing.clone(),
            partition_backoff: self.config.partition_request_backoff.clone(),
        })
    }

    // ========================================================================
    // Control
    // ========================================================================

    pub fn get_task(&self, attempt_id: ExecutionAttemptId) -> Option<Arc<Task>> {
        self.slots
            .lock()
            .expect("slot table poisoned")
            .get_task(attempt_id)
    }

    pub fn task_state(&self, attempt_id: ExecutionAttemptId) -> Option<ExecutionState> {
        self.get_task(attempt_id).map(|task| task.execution_state())
    }

    fn require_task(&self, attempt_id: ExecutionAttemptId) -> Result<Arc<Task>> {
        self.get_task(attempt_id)
            .ok_or_else(|| anyhow!("no task for attempt {attempt_id}"))
    }

    pub fn cancel_task(&self, attempt_id: ExecutionAttemptId) -> Result<()> {
        self.require_task(attempt_id)?.cancel();
        Ok(())
    }

    pub fn fail_task(&self, attempt_id: ExecutionAttemptId, cause: anyhow::Error) -> Result<()> {
        self.require_task(attempt_id)?.fail_externally(cause);
        Ok(())
    }

    /// Returns false when the attempt is not RUNNING and the trigger was dropped.
    pub fn trigger_checkpoint(
        &self,
        attempt_id: ExecutionAttemptId,
        metadata: CheckpointMetaData,
        options: CheckpointOptions,
    ) -> Result<bool> {
        Ok(self
            .require_task(attempt_id)?
            .trigger_checkpoint(metadata, options))
    }

    pub fn confirm_checkpoint(
        &self,
        attempt_id: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
    ) -> Result<bool> {
        Ok(self
            .require_task(attempt_id)?
            .notify_checkpoint_complete(checkpoint_id))
    }

    /// Apply producer location updates. An update the task cannot apply fails the task.
    pub fn update_partitions(
        &self,
        attempt_id: ExecutionAttemptId,
        infos: Vec<PartitionInfo>,
    ) -> Result<()> {
        let task = self.require_task(attempt_id)?;
        for info in infos {
            let partition_id = info.partition_id;
            if let Err(err) = task.update_partition_info(info) {
                tracing::warn!(
                    "failed to update partition {partition_id} of {attempt_id}, failing task: {err:#}"
                );
                task.fail_externally(err);
                return Err(anyhow!(
                    "update of partition {partition_id} failed, attempt {attempt_id} was failed"
                ));
            }
        }
        Ok(())
    }

    /// State updates of every task deployed from now on, plus the ones already deployed.
    pub fn subscribe_state_updates(&self) -> Receiver<ExecutionStateUpdate> {
        let (tx, rx) = unbounded();
        let slots = self.slots.lock().expect("slot table poisoned");
        for task in slots.all_tasks() {
            task.add_state_listener(tx.clone());
        }
        self.state_listeners
            .lock()
            .expect("state listeners poisoned")
            .push(tx);
        drop(slots);
        rx
    }

    /// Drop terminal attempts from their slots and return their ids.
    pub fn release_terminal_tasks(&self) -> Vec<ExecutionAttemptId> {
        let mut slots = self.slots.lock().expect("slot table poisoned");
        let terminal: Vec<ExecutionAttemptId> = slots
            .all_tasks()
            .iter()
            .filter(|task| task.execution_state().is_terminal())
            .map(|task| task.attempt_id())
            .collect();
        for attempt_id in &terminal {
            slots.remove_task(*attempt_id);
        }
        terminal
    }

    /// Cancel every attempt and wait for their threads.
    pub fn shutdown(&mut self) {
        let tasks = self.slots.lock().expect("slot table poisoned").all_tasks();
        for task in &tasks {
            task.cancel();
        }
        for task in &tasks {
            if let Err(err) = task.join() {
                tracing::warn!("{err:#}");
            }
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        tracing::info!("task executor shut down ({} tasks canceled)", tasks.len());
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        if self.runtime.is_some() {
            self.shutdown();
        }
    }
}
