use super::*;

/// Which snapshot failures also fail the task. A failed checkpoint is always declined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointFailurePolicy {
    pub fail_task_on_sync_failure: bool,
    pub fail_task_on_async_failure: bool,
}

impl Default for CheckpointFailurePolicy {
    fn default() -> Self {
        Self {
            fail_task_on_sync_failure: true,
            fail_task_on_async_failure: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPhase {
    Synchronous,
    Asynchronous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    DeclineOnly,
    DeclineAndFailTask,
}

impl CheckpointFailurePolicy {
    pub fn action_for(&self, phase: SnapshotPhase) -> FailureAction {
        let fail_task = match phase {
            SnapshotPhase::Synchronous => self.fail_task_on_sync_failure,
            SnapshotPhase::Asynchronous => self.fail_task_on_async_failure,
        };
        if fail_task {
            FailureAction::DeclineAndFailTask
        } else {
            FailureAction::DeclineOnly
        }
    }
}
