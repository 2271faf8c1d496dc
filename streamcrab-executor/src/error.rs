//! Error taxonomy shared across the task execution core.
//!
//! Module-local failures live next to their module (`SnapshotError`,
//! `PartitionError`, `SlotError`); this file holds the task-level errors and the
//! serializable checkpoint failure that travels back to the coordinator.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execution::ExecutionState;
use crate::types::{CheckpointId, ExecutionAttemptId};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("deployment of {attempt_id} rejected: {source}")]
    DeploymentRejected {
        attempt_id: ExecutionAttemptId,
        #[source]
        source: anyhow::Error,
    },

    #[error("illegal execution state transition from {from} to {to}")]
    IllegalStateTransition {
        from: ExecutionState,
        to: ExecutionState,
    },

    #[error("synchronous part of checkpoint {checkpoint_id} could not be completed")]
    SynchronousSnapshotFailure {
        checkpoint_id: CheckpointId,
        #[source]
        source: anyhow::Error,
    },

    #[error("asynchronous part of checkpoint {checkpoint_id} could not be completed")]
    AsynchronousSnapshotFailure {
        checkpoint_id: CheckpointId,
        #[source]
        source: anyhow::Error,
    },

    #[error("task execution failed")]
    ExecutionFailure {
        #[source]
        source: anyhow::Error,
    },
}

impl TaskError {
    pub fn rejected(attempt_id: ExecutionAttemptId, source: impl Into<anyhow::Error>) -> Self {
        Self::DeploymentRejected {
            attempt_id,
            source: source.into(),
        }
    }
}

/// Why a task declined a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckpointFailureReason {
    /// Preparing the snapshot on the task thread failed.
    SyncSnapshotFailed,
    /// Writing or finalizing the snapshot in the background failed.
    AsyncSnapshotFailed,
}

impl fmt::Display for CheckpointFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SyncSnapshotFailed => "synchronous snapshot phase failed",
            Self::AsyncSnapshotFailed => "asynchronous snapshot phase failed",
        })
    }
}

/// Serializable decline cause sent to the checkpoint coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{reason}: {message}")]
pub struct CheckpointException {
    pub reason: CheckpointFailureReason,
    pub message: String,
}

impl CheckpointException {
    pub fn new(reason: CheckpointFailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    /// Keep the full cause chain of `err`; the coordinator only sees this text.
    pub fn from_error(reason: CheckpointFailureReason, err: &anyhow::Error) -> Self {
        Self::new(reason, format!("{err:#}"))
    }
}
