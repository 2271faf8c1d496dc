use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointFailurePolicy;

/// Retry schedule for partition lookups that report "not found".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    /// `None` retries until success, a fatal lookup error, or cancellation.
    pub max_total_wait: Option<Duration>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            max_total_wait: None,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max.is_zero() {
            return Err(anyhow!("maximum partition request backoff must be positive"));
        }
        if self.initial > self.max {
            return Err(anyhow!(
                "initial partition request backoff {:?} exceeds maximum {:?}",
                self.initial,
                self.max
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointingConfig {
    pub failure_policy: CheckpointFailurePolicy,
    /// Report metrics right after the synchronous phase, before the acknowledgement.
    pub report_sync_progress: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBackendConfig {
    pub max_state_size: usize,
}

impl Default for MemoryBackendConfig {
    fn default() -> Self {
        Self {
            max_state_size: 5 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsBackendConfig {
    pub checkpoint_dir: PathBuf,
}

/// Where checkpoint streams are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateBackendConfig {
    Memory(MemoryBackendConfig),
    Filesystem(FsBackendConfig),
}

impl Default for StateBackendConfig {
    fn default() -> Self {
        Self::Memory(MemoryBackendConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExecutorConfig {
    pub num_slots: usize,
    /// Asynchronous snapshot phases that may run at once; later ones queue.
    /// Also the worker thread count of the runtime driving retry timers.
    pub async_snapshot_threads: usize,
    pub partition_request_backoff: BackoffConfig,
    pub checkpointing: CheckpointingConfig,
    pub state_backend: StateBackendConfig,
}

impl Default for TaskExecutorConfig {
    fn default() -> Self {
        Self {
            num_slots: 1,
            async_snapshot_threads: 2,
            partition_request_backoff: BackoffConfig::default(),
            checkpointing: CheckpointingConfig::default(),
            state_backend: StateBackendConfig::default(),
        }
    }
}
