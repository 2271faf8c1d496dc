use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError};

use super::{CloseableRegistry, Task, TaskEnvironment, TaskInfo};
use crate::partition::{PartitionInfo, ResolvedChannel};
use crate::types::{CheckpointId, CheckpointMetaData, CheckpointOptions};

/// User code run on the task thread.
///
/// Returning `Ok` finishes the attempt. Returning an error fails it, unless the
/// attempt is being canceled, in which case the error is expected and ignored.
/// Long-running invokables should poll [`TaskContext::is_running`] and drain the
/// mailbox.
pub trait Invokable: Send + 'static {
    fn invoke(&mut self, ctx: &mut TaskContext) -> Result<()>;
}

impl<F> Invokable for F
where
    F: FnMut(&mut TaskContext) -> Result<()> + Send + 'static,
{
    fn invoke(&mut self, ctx: &mut TaskContext) -> Result<()> {
        self(ctx)
    }
}

/// Actions executed on the task thread in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskMail {
    TriggerCheckpoint {
        metadata: CheckpointMetaData,
        options: CheckpointOptions,
    },
    NotifyCheckpointComplete(CheckpointId),
    PartitionUpdated(PartitionInfo),
    /// Wakes a blocked mailbox reader after cancellation.
    Wake,
}

/// What an [`Invokable`] sees of its task.
pub struct TaskContext {
    task: Arc<Task>,
    mailbox: Receiver<TaskMail>,
    inputs: Vec<ResolvedChannel>,
}

impl TaskContext {
    pub(crate) fn new(task: Arc<Task>, mailbox: Receiver<TaskMail>, inputs: Vec<ResolvedChannel>) -> Self {
        Self {
            task,
            mailbox,
            inputs,
        }
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn info(&self) -> &TaskInfo {
        self.task.info()
    }

    pub fn environment(&self) -> &TaskEnvironment {
        self.task.environment()
    }

    /// Resources registered here are released when the attempt is canceled or exits.
    pub fn closeables(&self) -> &Arc<CloseableRegistry> {
        self.task.closeables()
    }

    /// False once cancellation or an external failure has been requested.
    pub fn is_running(&self) -> bool {
        !self.task.is_stop_requested()
    }

    pub fn resolved_inputs(&self) -> &[ResolvedChannel] {
        &self.inputs
    }

    /// For waiting on mail together with other channels (`crossbeam_channel::select!`).
    pub fn mailbox(&self) -> &Receiver<TaskMail> {
        &self.mailbox
    }

    pub fn try_next_mail(&self) -> Option<TaskMail> {
        self.mailbox.try_recv().ok()
    }

    pub fn next_mail(&self, timeout: Duration) -> Option<TaskMail> {
        match self.mailbox.recv_timeout(timeout) {
            Ok(mail) => Some(mail),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}
