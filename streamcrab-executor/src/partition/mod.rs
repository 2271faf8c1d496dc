//! Resolution of the upstream partitions a task consumes.
//!
//! A consumer may start before its producer has registered the partition. The
//! resolver keeps asking the location provider with capped exponential backoff
//! until the partition shows up, the lookup fails for another reason, or the
//! consuming attempt is canceled.

use std::time::Duration;

use thiserror::Error;

use crate::types::ResultPartitionId;

mod backoff;
mod location;
mod resolver;

pub use backoff::*;
pub use location::*;
pub use resolver::*;

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("partition {partition_id} consumed by input channel {channel} not found")]
    NotFound {
        channel: InputChannelId,
        partition_id: ResultPartitionId,
    },

    #[error("lookup of partition {partition_id} for input channel {channel} failed")]
    LookupFailed {
        channel: InputChannelId,
        partition_id: ResultPartitionId,
        #[source]
        source: anyhow::Error,
    },

    #[error("resolution of partition {partition_id} for input channel {channel} was canceled")]
    Canceled {
        channel: InputChannelId,
        partition_id: ResultPartitionId,
    },

    #[error(
        "gave up on partition {partition_id} for input channel {channel} after {attempts} lookups and {waited:?} of backoff"
    )]
    RetryBudgetExhausted {
        channel: InputChannelId,
        partition_id: ResultPartitionId,
        attempts: u32,
        waited: Duration,
        #[source]
        last: Box<PartitionError>,
    },

    #[error("no input channel consumes partition {partition_id}")]
    UnknownPartition { partition_id: ResultPartitionId },
}

impl PartitionError {
    /// True for errors caused by the consumer stopping rather than the lookup.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }
}

#[cfg(test)]
#[path = "tests/partition_tests.rs"]
mod tests;
