use std::fmt;
use std::sync::Arc;

use crate::checkpoint::CheckpointResponder;
use crate::config::{BackoffConfig, CheckpointingConfig};
use crate::partition::PartitionLocationProvider;
use crate::state::CheckpointStreamFactory;
use crate::types::{AllocationId, ExecutionAttemptId, JobId};

/// Static identity of a deployed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub job_id: JobId,
    pub attempt_id: ExecutionAttemptId,
    pub allocation_id: AllocationId,
    pub task_name: String,
    pub subtask_index: usize,
    pub parallelism: usize,
    pub max_parallelism: u32,
}

impl TaskInfo {
    /// `name (index+1/parallelism)`, used in thread names and logs.
    pub fn name_with_subtask(&self) -> String {
        format!(
            "{} ({}/{})",
            self.task_name,
            self.subtask_index + 1,
            self.parallelism
        )
    }
}

/// Shared executor for asynchronous snapshot phases and retry timers.
#[derive(Clone)]
pub struct AsyncSnapshotExecutor {
    handle: tokio::runtime::Handle,
}

impl AsyncSnapshotExecutor {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &tokio::runtime::Handle {
        &self.handle
    }

    /// Run blocking snapshot work off the task thread.
    pub fn execute<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        drop(self.handle.spawn_blocking(work));
    }
}

impl fmt::Debug for AsyncSnapshotExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AsyncSnapshotExecutor")
    }
}

/// Collaborators a task needs beyond its own code.
#[derive(Clone)]
pub struct TaskEnvironment {
    pub responder: Arc<dyn CheckpointResponder>,
    pub partition_provider: Arc<dyn PartitionLocationProvider>,
    pub stream_factory: Arc<dyn CheckpointStreamFactory>,
    pub async_executor: AsyncSnapshotExecutor,
    pub checkpointing: CheckpointingConfig,
    pub partition_backoff: BackoffConfig,
}
