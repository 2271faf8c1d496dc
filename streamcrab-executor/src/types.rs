use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event time in milliseconds since epoch.
pub type EventTime = i64;

/// Unique identifier for checkpoints, monotonically assigned by the coordinator.
pub type CheckpointId = u64;

macro_rules! random_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random id.
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Build a deterministic id, mostly useful in tests.
            pub fn from_u128(value: u128) -> Self {
                Self(Uuid::from_u128(value))
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0.simple())
            }
        }
    };
}

random_id!(
    /// Identifies a job across all of its executions.
    JobId,
    "job"
);
random_id!(
    /// Identifies one execution attempt of one subtask.
    ExecutionAttemptId,
    "attempt"
);
random_id!(
    /// Identifies a slot allocation handed out by the resource manager.
    AllocationId,
    "alloc"
);
random_id!(
    /// Identifies an operator inside a task's chain.
    OperatorId,
    "op"
);
random_id!(
    /// Identifies a logical intermediate result partition.
    IntermediateResultPartitionId,
    "irp"
);

/// A produced partition instance: the logical partition plus the attempt that produces it.
///
/// A new producer attempt yields a new id, so lookups for an old attempt never
/// resolve to the restarted producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResultPartitionId {
    pub partition_id: IntermediateResultPartitionId,
    pub producer_id: ExecutionAttemptId,
}

impl ResultPartitionId {
    pub fn new(partition_id: IntermediateResultPartitionId, producer_id: ExecutionAttemptId) -> Self {
        Self {
            partition_id,
            producer_id,
        }
    }

    pub fn generate() -> Self {
        Self::new(
            IntermediateResultPartitionId::generate(),
            ExecutionAttemptId::generate(),
        )
    }
}

impl fmt::Display for ResultPartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition_id, self.producer_id)
    }
}

/// Identity and timing of one checkpoint as seen by a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetaData {
    pub checkpoint_id: CheckpointId,
    pub timestamp: EventTime,
}

impl CheckpointMetaData {
    pub fn new(checkpoint_id: CheckpointId, timestamp: EventTime) -> Self {
        Self {
            checkpoint_id,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointType {
    Checkpoint,
    Savepoint,
    /// Savepoint that blocks the task until the checkpoint completes.
    SyncSavepoint,
}

impl CheckpointType {
    pub fn is_savepoint(self) -> bool {
        matches!(self, Self::Savepoint | Self::SyncSavepoint)
    }

    pub fn is_synchronous(self) -> bool {
        matches!(self, Self::SyncSavepoint)
    }
}

/// Where the checkpoint streams of one checkpoint should be written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointStorageLocation {
    /// Use the task executor's configured checkpoint storage.
    Default,
    /// Write below an explicit directory (savepoints).
    Path(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointOptions {
    pub checkpoint_type: CheckpointType,
    pub target_location: CheckpointStorageLocation,
}

impl CheckpointOptions {
    pub fn for_checkpoint_with_default_location() -> Self {
        Self {
            checkpoint_type: CheckpointType::Checkpoint,
            target_location: CheckpointStorageLocation::Default,
        }
    }

    pub fn savepoint(target: PathBuf) -> Self {
        Self {
            checkpoint_type: CheckpointType::Savepoint,
            target_location: CheckpointStorageLocation::Path(target),
        }
    }
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self::for_checkpoint_with_default_location()
    }
}

/// A record in the stream, carrying user data and optional event time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamRecord<T> {
    pub value: T,
    pub timestamp: Option<EventTime>,
}

impl<T> StreamRecord<T> {
    /// Create a record with no event time.
    pub fn new(value: T) -> Self {
        Self {
            value,
            timestamp: None,
        }
    }

    /// Create a record with an explicit event time.
    pub fn with_timestamp(value: T, timestamp: EventTime) -> Self {
        Self {
            value,
            timestamp: Some(timestamp),
        }
    }
}

/// Checkpoint barrier injected by sources and forwarded downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Barrier {
    pub checkpoint_id: CheckpointId,
    pub timestamp: EventTime,
    pub options: CheckpointOptions,
}

impl Barrier {
    pub fn new(checkpoint_id: CheckpointId, timestamp: EventTime) -> Self {
        Self {
            checkpoint_id,
            timestamp,
            options: CheckpointOptions::default(),
        }
    }

    pub fn metadata(&self) -> CheckpointMetaData {
        CheckpointMetaData::new(self.checkpoint_id, self.timestamp)
    }
}

/// Unit flowing through a task's input: data records, barriers, and the end marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StreamElement<T> {
    Record(StreamRecord<T>),
    CheckpointBarrier(Barrier),
    /// End of bounded stream.
    End,
}

impl<T> StreamElement<T> {
    pub fn record(value: T) -> Self {
        Self::Record(StreamRecord::new(value))
    }

    pub fn timestamped_record(value: T, timestamp: EventTime) -> Self {
        Self::Record(StreamRecord::with_timestamp(value, timestamp))
    }

    pub fn barrier(checkpoint_id: CheckpointId, timestamp: EventTime) -> Self {
        Self::CheckpointBarrier(Barrier::new(checkpoint_id, timestamp))
    }
}

/// Milliseconds since the Unix epoch.
pub fn current_millis() -> EventTime {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as EventTime)
        .unwrap_or(0)
}

#[cfg(test)]
#[path = "tests/types_tests.rs"]
mod tests;
