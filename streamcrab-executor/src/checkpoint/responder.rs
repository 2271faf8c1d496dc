use super::*;

/// Task -> coordinator checkpoint reporting. All calls are fire-and-forget.
pub trait CheckpointResponder: Send + Sync {
    fn acknowledge_checkpoint(
        &self,
        job_id: JobId,
        attempt_id: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        metrics: CheckpointMetrics,
        snapshot: Option<TaskStateSnapshot>,
    );

    /// Partial progress of a checkpoint that has not been acknowledged yet.
    fn report_checkpoint_metrics(
        &self,
        job_id: JobId,
        attempt_id: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        metrics: CheckpointMetrics,
    );

    fn decline_checkpoint(
        &self,
        job_id: JobId,
        attempt_id: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        reason: CheckpointException,
    );
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgeCheckpoint {
    pub job_id: JobId,
    pub attempt_id: ExecutionAttemptId,
    pub checkpoint_id: CheckpointId,
    pub metrics: CheckpointMetrics,
    /// `None` when the task has no state at all.
    pub snapshot: Option<TaskStateSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclineCheckpoint {
    pub job_id: JobId,
    pub attempt_id: ExecutionAttemptId,
    pub checkpoint_id: CheckpointId,
    pub reason: CheckpointException,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetricsReport {
    pub job_id: JobId,
    pub attempt_id: ExecutionAttemptId,
    pub checkpoint_id: CheckpointId,
    pub metrics: CheckpointMetrics,
}

/// One message on the task -> coordinator checkpoint channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointResponse {
    Acknowledge(AcknowledgeCheckpoint),
    Decline(DeclineCheckpoint),
    Metrics(CheckpointMetricsReport),
}

impl CheckpointResponse {
    pub fn checkpoint_id(&self) -> CheckpointId {
        match self {
            Self::Acknowledge(ack) => ack.checkpoint_id,
            Self::Decline(decline) => decline.checkpoint_id,
            Self::Metrics(report) => report.checkpoint_id,
        }
    }

    pub fn attempt_id(&self) -> ExecutionAttemptId {
        match self {
            Self::Acknowledge(ack) => ack.attempt_id,
            Self::Decline(decline) => decline.attempt_id,
            Self::Metrics(report) => report.attempt_id,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("serialize checkpoint response failed")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).context("deserialize checkpoint response failed")
    }
}

/// Responder that forwards every call as a [`CheckpointResponse`] on a channel.
#[derive(Debug, Clone)]
pub struct ChannelCheckpointResponder {
    tx: Sender<CheckpointResponse>,
}

impl ChannelCheckpointResponder {
    pub fn new(tx: Sender<CheckpointResponse>) -> Self {
        Self { tx }
    }

    pub fn unbounded() -> (Self, Receiver<CheckpointResponse>) {
        let (tx, rx) = unbounded();
        (Self::new(tx), rx)
    }

    fn send(&self, response: CheckpointResponse) {
        let checkpoint_id = response.checkpoint_id();
        if self.tx.send(response).is_err() {
            tracing::warn!("checkpoint response for {checkpoint_id} dropped: receiver is gone");
        }
    }
}

impl CheckpointResponder for ChannelCheckpointResponder {
    fn acknowledge_checkpoint(
        &self,
        job_id: JobId,
        attempt_id: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        metrics: CheckpointMetrics,
        snapshot: Option<TaskStateSnapshot>,
    ) {
        self.send(CheckpointResponse::Acknowledge(AcknowledgeCheckpoint {
            job_id,
            attempt_id,
            checkpoint_id,
            metrics,
            snapshot,
        }));
    }

    fn report_checkpoint_metrics(
        &self,
        job_id: JobId,
        attempt_id: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        metrics: CheckpointMetrics,
    ) {
        self.send(CheckpointResponse::Metrics(CheckpointMetricsReport {
            job_id,
            attempt_id,
            checkpoint_id,
            metrics,
        }));
    }

    fn decline_checkpoint(
        &self,
        job_id: JobId,
        attempt_id: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        reason: CheckpointException,
    ) {
        self.send(CheckpointResponse::Decline(DeclineCheckpoint {
            job_id,
            attempt_id,
            checkpoint_id,
            reason,
        }));
    }
}
