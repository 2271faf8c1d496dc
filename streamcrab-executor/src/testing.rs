//! Helpers shared by the unit tests of this crate.

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Result, anyhow};
use crossbeam_channel::Receiver;

use crate::checkpoint::{ChannelCheckpointResponder, CheckpointResponse};
use crate::config::{BackoffConfig, CheckpointingConfig};
use crate::execution::{
    AsyncSnapshotExecutor, Closeable, ExecutionState, ExecutionStateUpdate, TaskEnvironment,
    TaskInfo,
};
use crate::partition::PartitionRegistry;
use crate::state::{
    CheckpointStateOutputStream, CheckpointStreamFactory, MemCheckpointStreamFactory,
    StreamStateHandle,
};
use crate::types::{
    AllocationId, CheckpointId, CheckpointStorageLocation, ExecutionAttemptId, JobId,
};

pub(crate) fn unique_temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!(
        "streamcrab-{prefix}-{}-{nanos}",
        std::process::id()
    ))
}

pub(crate) fn test_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_time()
        .build()
        .unwrap()
}

pub(crate) fn task_info(name: &str) -> TaskInfo {
    TaskInfo {
        job_id: JobId::generate(),
        attempt_id: ExecutionAttemptId::generate(),
        allocation_id: AllocationId::generate(),
        task_name: name.to_string(),
        subtask_index: 0,
        parallelism: 1,
        max_parallelism: 128,
    }
}

/// Environment whose responses land on the returned channel.
pub(crate) struct TestEnvironment {
    pub env: TaskEnvironment,
    pub responses: Receiver<CheckpointResponse>,
    pub partitions: Arc<PartitionRegistry>,
}

pub(crate) fn test_environment(runtime: &tokio::runtime::Runtime) -> TestEnvironment {
    test_environment_with(
        runtime,
        Arc::new(MemCheckpointStreamFactory::new(1024 * 1024)),
        CheckpointingConfig::default(),
    )
}

pub(crate) fn test_environment_with(
    runtime: &tokio::runtime::Runtime,
    stream_factory: Arc<dyn CheckpointStreamFactory>,
    checkpointing: CheckpointingConfig,
) -> TestEnvironment {
    let (responder, responses) = ChannelCheckpointResponder::unbounded();
    let partitions = Arc::new(PartitionRegistry::new());
    let env = TaskEnvironment {
        responder: Arc::new(responder),
        partition_provider: partitions.clone(),
        stream_factory,
        async_executor: AsyncSnapshotExecutor::new(runtime.handle().clone()),
        checkpointing,
        partition_backoff: BackoffConfig {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(10),
            max_total_wait: None,
        },
    };
    TestEnvironment {
        env,
        responses,
        partitions,
    }
}

/// Wait until an update reports `state`, returning every update seen on the way.
pub(crate) fn wait_for_state(
    updates: &Receiver<ExecutionStateUpdate>,
    state: ExecutionState,
) -> Vec<ExecutionStateUpdate> {
    let mut seen = Vec::new();
    loop {
        let update = updates
            .recv_timeout(Duration::from_secs(5))
            .unwrap_or_else(|_| panic!("timed out waiting for {state}, saw {seen:?}"));
        let reached = update.state == state;
        seen.push(update);
        if reached {
            return seen;
        }
    }
}

/// Stream whose writes block until the stream is closed, ignoring every other
/// signal. Only an explicit close unblocks it.
pub(crate) struct LockingOutputStream {
    closed: Mutex<bool>,
    cond: Condvar,
    pub entered: crossbeam_channel::Sender<()>,
}

impl LockingOutputStream {
    pub fn new(entered: crossbeam_channel::Sender<()>) -> Self {
        Self {
            closed: Mutex::new(false),
            cond: Condvar::new(),
            entered,
        }
    }
}

impl Closeable for LockingOutputStream {
    fn close(&self) -> Result<()> {
        *self.closed.lock().unwrap() = true;
        self.cond.notify_all();
        Ok(())
    }
}

impl CheckpointStateOutputStream for LockingOutputStream {
    fn write(&self, _bytes: &[u8]) -> Result<()> {
        let _ = self.entered.send(());
        let mut closed = self.closed.lock().unwrap();
        while !*closed {
            closed = self.cond.wait(closed).unwrap();
        }
        Err(anyhow!("stream closed while writing"))
    }

    fn pos(&self) -> u64 {
        0
    }

    fn close_and_get_handle(&self) -> Result<Option<StreamStateHandle>> {
        Err(anyhow!("locking stream never produces a handle"))
    }
}

pub(crate) struct LockingStreamFactory {
    pub entered: crossbeam_channel::Sender<()>,
}

impl CheckpointStreamFactory for LockingStreamFactory {
    fn create_output_stream(
        &self,
        _checkpoint_id: CheckpointId,
        _location: &CheckpointStorageLocation,
    ) -> Result<Arc<dyn CheckpointStateOutputStream>> {
        Ok(Arc::new(LockingOutputStream::new(self.entered.clone())))
    }
}

/// Factory whose streams accept writes but fail when asked for their handle.
pub(crate) struct FailingHandleStreamFactory;

struct FailingHandleStream;

impl Closeable for FailingHandleStream {
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl CheckpointStateOutputStream for FailingHandleStream {
    fn write(&self, _bytes: &[u8]) -> Result<()> {
        Ok(())
    }

    fn pos(&self) -> u64 {
        0
    }

    fn close_and_get_handle(&self) -> Result<Option<StreamStateHandle>> {
        Err(anyhow!("storage unavailable"))
    }
}

impl CheckpointStreamFactory for FailingHandleStreamFactory {
    fn create_output_stream(
        &self,
        _checkpoint_id: CheckpointId,
        _location: &CheckpointStorageLocation,
    ) -> Result<Arc<dyn CheckpointStateOutputStream>> {
        Ok(Arc::new(FailingHandleStream))
    }
}
