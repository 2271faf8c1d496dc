use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::types::ResultPartitionId;

/// Position of an input channel inside a task: `(gate, channel)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InputChannelId {
    pub gate_index: usize,
    pub channel_index: usize,
}

impl InputChannelId {
    pub fn new(gate_index: usize, channel_index: usize) -> Self {
        Self {
            gate_index,
            channel_index,
        }
    }
}

impl fmt::Display for InputChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.gate_index, self.channel_index)
    }
}

/// Where a produced partition can be read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionLocation {
    /// Produced on this task executor.
    Local,
    /// Produced on another task executor, reachable at this data-plane address.
    Remote(SocketAddr),
}

impl fmt::Display for PartitionLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote(addr) => write!(f, "remote({addr})"),
        }
    }
}

/// One input channel of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputChannelDescriptor {
    pub channel: InputChannelId,
    pub partition_id: ResultPartitionId,
    /// Set when the producer location was already known at deployment time.
    pub known_location: Option<PartitionLocation>,
}

impl InputChannelDescriptor {
    pub fn unknown(channel: InputChannelId, partition_id: ResultPartitionId) -> Self {
        Self {
            channel,
            partition_id,
            known_location: None,
        }
    }

    pub fn known(
        channel: InputChannelId,
        partition_id: ResultPartitionId,
        location: PartitionLocation,
    ) -> Self {
        Self {
            channel,
            partition_id,
            known_location: Some(location),
        }
    }
}

/// Location update pushed to a consumer when its producer becomes available or moves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub partition_id: ResultPartitionId,
    pub location: PartitionLocation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionLookup {
    Found(PartitionLocation),
    /// Not registered (yet). Retryable.
    NotFound,
}

/// Answers "where is this partition?".
///
/// Errors other than [`PartitionLookup::NotFound`] are treated as fatal by the
/// resolver. Repeated lookups of the same id must return the same location.
pub trait PartitionLocationProvider: Send + Sync {
    fn lookup(&self, partition_id: &ResultPartitionId) -> Result<PartitionLookup>;
}

/// In-memory provider fed by producers as they register their partitions.
#[derive(Debug, Default)]
pub struct PartitionRegistry {
    partitions: Mutex<HashMap<ResultPartitionId, PartitionLocation>>,
}

impl PartitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, partition_id: ResultPartitionId, location: PartitionLocation) {
        self.partitions
            .lock()
            .expect("partition registry poisoned")
            .insert(partition_id, location);
    }

    pub fn unregister(&self, partition_id: &ResultPartitionId) -> Option<PartitionLocation> {
        self.partitions
            .lock()
            .expect("partition registry poisoned")
            .remove(partition_id)
    }
}

impl PartitionLocationProvider for PartitionRegistry {
    fn lookup(&self, partition_id: &ResultPartitionId) -> Result<PartitionLookup> {
        let partitions = self
            .partitions
            .lock()
            .map_err(|_| anyhow!("partition registry lock poisoned"))?;
        Ok(match partitions.get(partition_id) {
            Some(location) => PartitionLookup::Found(location.clone()),
            None => PartitionLookup::NotFound,
        })
    }
}
