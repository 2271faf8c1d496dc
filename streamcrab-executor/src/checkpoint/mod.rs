//! Task-side checkpointing: per-checkpoint metrics, the snapshot data model,
//! the responder that reports to the coordinator, and the barrier handler that
//! drives the synchronous and asynchronous snapshot phases.

use crate::error::{CheckpointException, CheckpointFailureReason, TaskError};
use crate::execution::{CloseableRegistry, Task};
use crate::state::{
    CheckpointStreamFactory, InputChannelStateHandle, KeyGroupsStateHandle,
    OperatorStateHandle, ResultSubpartitionStateHandle, SnapshotResult, SnapshotResultSupplier,
    StateObject, completed_snapshot,
};
use crate::types::{
    CheckpointId, CheckpointMetaData, CheckpointOptions, EventTime, ExecutionAttemptId, JobId,
    OperatorId,
};
use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

mod handler;
mod metrics;
mod policy;
mod responder;
mod snapshot;

pub use handler::*;
pub use metrics::*;
pub use policy::*;
pub use responder::*;
pub use snapshot::*;

#[cfg(test)]
#[path = "tests/checkpoint_tests.rs"]
mod tests;

#[cfg(test)]
#[path = "tests/handler_tests.rs"]
mod handler_tests;
