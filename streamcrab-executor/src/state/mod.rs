//! # State
//!
//! Durable state handles, checkpoint output streams, and the two-phase
//! snapshot strategy implemented by the heap state backends.
//!
//! - [`SnapshotStrategy`]: `prepare` on the task thread, then a supplier that
//!   writes the prepared view in the background.
//! - [`HeapOperatorStateBackend`]: named list states redistributed by split or union.
//! - [`HeapKeyedStateBackend`]: value/list/map state per key, grouped into key groups.
//! - [`MemCheckpointStreamFactory`] / [`FsCheckpointStreamFactory`]: where snapshot bytes go.

use crate::execution::{Closeable, CloseableRegistry};
use crate::types::{CheckpointId, CheckpointOptions, CheckpointStorageLocation, EventTime};
use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;

mod handle;
mod keyed;
mod operator;
mod strategy;
mod stream;

pub use handle::*;
pub use keyed::*;
pub use operator::*;
pub use strategy::*;
pub use stream::*;

/// Failure of a snapshot strategy, tagged with the phase it happened in.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("{description}: synchronous snapshot of checkpoint {checkpoint_id} failed")]
    Synchronous {
        description: String,
        checkpoint_id: CheckpointId,
        #[source]
        source: anyhow::Error,
    },

    #[error("{description}: asynchronous snapshot of checkpoint {checkpoint_id} failed")]
    Asynchronous {
        description: String,
        checkpoint_id: CheckpointId,
        #[source]
        source: anyhow::Error,
    },
}

impl SnapshotError {
    pub fn checkpoint_id(&self) -> CheckpointId {
        match self {
            Self::Synchronous { checkpoint_id, .. } | Self::Asynchronous { checkpoint_id, .. } => {
                *checkpoint_id
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/state_tests.rs"]
mod tests;
