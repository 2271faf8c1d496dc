//! Slots of a task executor and the allocation guard in front of deployments.

use crate::types::{AllocationId, ExecutionAttemptId, JobId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

mod table;

pub use table::*;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("slot {index} does not exist (executor has {num_slots} slots)")]
    UnknownSlot { index: usize, num_slots: usize },

    #[error("slot {index} is already allocated to {allocation_id}")]
    SlotOccupied {
        index: usize,
        allocation_id: AllocationId,
    },

    #[error("no slot holds allocation {allocation_id}")]
    AllocationMismatch { allocation_id: AllocationId },

    #[error("allocation {allocation_id} belongs to {actual}, not {expected}")]
    JobMismatch {
        allocation_id: AllocationId,
        expected: JobId,
        actual: JobId,
    },

    #[error("slot of allocation {allocation_id} is not active")]
    SlotNotActive { allocation_id: AllocationId },

    #[error("allocation {allocation_id} timed out before it was activated")]
    AllocationExpired { allocation_id: AllocationId },

    #[error("attempt {attempt_id} is already deployed")]
    DuplicateAttempt { attempt_id: ExecutionAttemptId },
}

#[cfg(test)]
#[path = "tests/slot_tests.rs"]
mod tests;
