use super::*;
use crate::partition::InputChannelId;

/// Anything that references persisted state.
pub trait StateObject {
    /// Persisted size in bytes.
    fn state_size(&self) -> u64;

    /// Delete the persisted bytes. Best effort; discarding twice is fine.
    fn discard_state(&self) -> Result<()>;
}

/// Opaque durable reference to one written stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamStateHandle {
    /// Bytes kept inline, shipped with the acknowledgement.
    ByteStream { name: String, data: Vec<u8> },
    /// Bytes written to a file.
    File { path: PathBuf, size: u64 },
}

impl StreamStateHandle {
    pub fn as_bytes_if_in_memory(&self) -> Option<&[u8]> {
        match self {
            Self::ByteStream { data, .. } => Some(data),
            Self::File { .. } => None,
        }
    }

    pub fn read_all(&self) -> Result<Vec<u8>> {
        match self {
            Self::ByteStream { data, .. } => Ok(data.clone()),
            Self::File { path, .. } => {
                fs::read(path).with_context(|| format!("read state file {} failed", path.display()))
            }
        }
    }
}

impl StateObject for StreamStateHandle {
    fn state_size(&self) -> u64 {
        match self {
            Self::ByteStream { data, .. } => data.len() as u64,
            Self::File { size, .. } => *size,
        }
    }

    fn discard_state(&self) -> Result<()> {
        match self {
            Self::ByteStream { .. } => Ok(()),
            Self::File { path, .. } => match fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => {
                    Err(err).with_context(|| format!("discard state file {} failed", path.display()))
                }
            },
        }
    }
}

/// Inclusive range of key groups `[start, end]`; empty when `end < start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyGroupRange {
    pub start: u32,
    pub end: u32,
}

impl KeyGroupRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn empty() -> Self {
        Self { start: 1, end: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    pub fn contains(&self, key_group: u32) -> bool {
        key_group >= self.start && key_group <= self.end
    }

    pub fn intersection(&self, other: &KeyGroupRange) -> KeyGroupRange {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if end < start {
            Self::empty()
        } else {
            Self::new(start, end)
        }
    }

    pub fn iter(&self) -> std::ops::RangeInclusive<u32> {
        self.start..=self.end
    }
}

/// How an operator list state is redistributed on restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DistributionMode {
    /// Elements are split among the new subtasks.
    SplitDistribute,
    /// Every subtask receives all elements.
    Union,
}

/// Offsets of the elements of one named state inside the delegate stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMetaInfo {
    pub offsets: Vec<u64>,
    pub distribution: DistributionMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorStateHandle {
    pub state_name_to_partition_offsets: BTreeMap<String, StateMetaInfo>,
    pub delegate: StreamStateHandle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGroupsStateHandle {
    pub key_group_range: KeyGroupRange,
    /// `offsets[i]` is where key group `key_group_range.start + i` begins.
    pub offsets: Vec<u64>,
    pub delegate: StreamStateHandle,
}

impl KeyGroupsStateHandle {
    pub fn offset_for(&self, key_group: u32) -> Option<u64> {
        if !self.key_group_range.contains(key_group) {
            return None;
        }
        self.offsets
            .get((key_group - self.key_group_range.start) as usize)
            .copied()
    }
}

/// In-flight data of one input channel captured with an unaligned checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputChannelStateHandle {
    pub channel: InputChannelId,
    pub offsets: Vec<u64>,
    pub delegate: StreamStateHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultSubpartitionInfo {
    pub partition_index: usize,
    pub subpartition_index: usize,
}

/// In-flight data of one produced subpartition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSubpartitionStateHandle {
    pub subpartition: ResultSubpartitionInfo,
    pub offsets: Vec<u64>,
    pub delegate: StreamStateHandle,
}

macro_rules! delegate_state_object {
    ($($handle:ty),*) => {
        $(
            impl StateObject for $handle {
                fn state_size(&self) -> u64 {
                    self.delegate.state_size()
                }

                fn discard_state(&self) -> Result<()> {
                    self.delegate.discard_state()
                }
            }
        )*
    };
}

delegate_state_object!(
    OperatorStateHandle,
    KeyGroupsStateHandle,
    InputChannelStateHandle,
    ResultSubpartitionStateHandle
);

/// Result of one snapshot: the copy owned by the coordinator and an optional
/// task-local copy used for fast local recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotResult<H> {
    pub job_manager_owned: Option<H>,
    pub task_local: Option<H>,
}

impl<H> SnapshotResult<H> {
    pub fn empty() -> Self {
        Self {
            job_manager_owned: None,
            task_local: None,
        }
    }

    pub fn of(handle: H) -> Self {
        Self {
            job_manager_owned: Some(handle),
            task_local: None,
        }
    }

    pub fn with_local_state(job_manager_owned: H, task_local: H) -> Self {
        Self {
            job_manager_owned: Some(job_manager_owned),
            task_local: Some(task_local),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.job_manager_owned.is_none() && self.task_local.is_none()
    }
}

impl<H: StateObject> SnapshotResult<H> {
    pub fn discard_state(&self) -> Result<()> {
        if let Some(handle) = &self.job_manager_owned {
            handle.discard_state()?;
        }
        if let Some(handle) = &self.task_local {
            handle.discard_state()?;
        }
        Ok(())
    }
}
