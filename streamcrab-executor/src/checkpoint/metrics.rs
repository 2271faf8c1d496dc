use super::*;

/// Finalized metrics of one checkpoint on one task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetrics {
    pub bytes_persisted: u64,
    pub alignment_duration: Duration,
    pub sync_duration: Duration,
    pub async_duration: Duration,
}

/// Accumulates metrics for exactly one checkpoint id.
///
/// Owned by the checkpoint it measures and consumed by [`build`](Self::build),
/// so one checkpoint can never report the numbers of another.
#[derive(Debug, Clone)]
pub struct CheckpointMetricsBuilder {
    checkpoint_id: CheckpointId,
    bytes_persisted: Option<u64>,
    alignment_duration: Option<Duration>,
    sync_duration: Option<Duration>,
    async_duration: Option<Duration>,
}

impl CheckpointMetricsBuilder {
    pub fn new(checkpoint_id: CheckpointId) -> Self {
        Self {
            checkpoint_id,
            bytes_persisted: None,
            alignment_duration: None,
            sync_duration: None,
            async_duration: None,
        }
    }

    pub fn checkpoint_id(&self) -> CheckpointId {
        self.checkpoint_id
    }

    pub fn set_bytes_persisted(&mut self, bytes: u64) -> &mut Self {
        self.bytes_persisted = Some(bytes);
        self
    }

    pub fn set_alignment_duration(&mut self, duration: Duration) -> &mut Self {
        self.alignment_duration = Some(duration);
        self
    }

    pub fn set_sync_duration(&mut self, duration: Duration) -> &mut Self {
        self.sync_duration = Some(duration);
        self
    }

    pub fn set_async_duration(&mut self, duration: Duration) -> &mut Self {
        self.async_duration = Some(duration);
        self
    }

    /// Metrics recorded so far; unset values are zero.
    pub fn snapshot_partial(&self) -> CheckpointMetrics {
        CheckpointMetrics {
            bytes_persisted: self.bytes_persisted.unwrap_or(0),
            alignment_duration: self.alignment_duration.unwrap_or_default(),
            sync_duration: self.sync_duration.unwrap_or_default(),
            async_duration: self.async_duration.unwrap_or_default(),
        }
    }

    pub fn build(self) -> CheckpointMetrics {
        self.snapshot_partial()
    }
}
