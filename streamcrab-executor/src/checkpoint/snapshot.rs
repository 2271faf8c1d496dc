use super::*;

/// Unordered collection of state handles of one category.
///
/// Equality ignores order: two collections are equal when they hold the same
/// handles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateCollection<T>(Vec<T>);

impl<T> StateCollection<T> {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn singleton(handle: T) -> Self {
        Self(vec![handle])
    }

    pub fn push(&mut self, handle: T) {
        self.0.push(handle);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.0.iter()
    }
}

impl<T> Default for StateCollection<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> FromIterator<T> for StateCollection<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<T: PartialEq> PartialEq for StateCollection<T> {
    fn eq(&self, other: &Self) -> bool {
        if self.0.len() != other.0.len() {
            return false;
        }
        let mut matched = vec![false; other.0.len()];
        self.0.iter().all(|handle| {
            let found = other
                .0
                .iter()
                .enumerate()
                .position(|(i, candidate)| !matched[i] && candidate == handle);
            match found {
                Some(i) => {
                    matched[i] = true;
                    true
                }
                None => false,
            }
        })
    }
}

impl<T: Eq> Eq for StateCollection<T> {}

impl<T: StateObject> StateCollection<T> {
    pub fn state_size(&self) -> u64 {
        self.0.iter().map(StateObject::state_size).sum()
    }

    pub fn discard_state(&self) -> Result<()> {
        for handle in &self.0 {
            handle.discard_state()?;
        }
        Ok(())
    }
}

/// All state of one operator of one subtask, by category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorSubtaskState {
    pub managed_operator_state: StateCollection<OperatorStateHandle>,
    pub raw_operator_state: StateCollection<OperatorStateHandle>,
    pub managed_keyed_state: StateCollection<KeyGroupsStateHandle>,
    pub raw_keyed_state: StateCollection<KeyGroupsStateHandle>,
    pub input_channel_state: StateCollection<InputChannelStateHandle>,
    pub result_subpartition_state: StateCollection<ResultSubpartitionStateHandle>,
}

impl OperatorSubtaskState {
    pub fn has_state(&self) -> bool {
        !(self.managed_operator_state.is_empty()
            && self.raw_operator_state.is_empty()
            && self.managed_keyed_state.is_empty()
            && self.raw_keyed_state.is_empty()
            && self.input_channel_state.is_empty()
            && self.result_subpartition_state.is_empty())
    }

    pub fn state_size(&self) -> u64 {
        self.managed_operator_state.state_size()
            + self.raw_operator_state.state_size()
            + self.managed_keyed_state.state_size()
            + self.raw_keyed_state.state_size()
            + self.input_channel_state.state_size()
            + self.result_subpartition_state.state_size()
    }

    /// Delete everything referenced. Keeps going after a failure and returns the first one.
    pub fn discard_state(&self) -> Result<()> {
        let results = [
            self.managed_operator_state.discard_state(),
            self.raw_operator_state.discard_state(),
            self.managed_keyed_state.discard_state(),
            self.raw_keyed_state.discard_state(),
            self.input_channel_state.discard_state(),
            self.result_subpartition_state.discard_state(),
        ];
        results.into_iter().collect()
    }
}

/// State of every operator of one task for one checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStateSnapshot {
    subtask_states: BTreeMap<OperatorId, OperatorSubtaskState>,
}

impl TaskStateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the previous state of the operator, if any.
    pub fn put_subtask_state(
        &mut self,
        operator_id: OperatorId,
        state: OperatorSubtaskState,
    ) -> Option<OperatorSubtaskState> {
        self.subtask_states.insert(operator_id, state)
    }

    pub fn subtask_state(&self, operator_id: &OperatorId) -> Option<&OperatorSubtaskState> {
        self.subtask_states.get(operator_id)
    }

    pub fn subtask_states(&self) -> impl Iterator<Item = (&OperatorId, &OperatorSubtaskState)> {
        self.subtask_states.iter()
    }

    pub fn has_state(&self) -> bool {
        self.subtask_states.values().any(OperatorSubtaskState::has_state)
    }

    pub fn state_size(&self) -> u64 {
        self.subtask_states
            .values()
            .map(OperatorSubtaskState::state_size)
            .sum()
    }

    pub fn discard_state(&self) -> Result<()> {
        let mut first_err = None;
        for state in self.subtask_states.values() {
            if let Err(err) = state.discard_state() {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Pending asynchronous parts of one operator's snapshot, one per state category.
///
/// Produced by the synchronous phase on the task thread and run on the
/// asynchronous snapshot executor.
pub struct OperatorSnapshotFutures {
    pub managed_operator_state: SnapshotResultSupplier<OperatorStateHandle>,
    pub raw_operator_state: SnapshotResultSupplier<OperatorStateHandle>,
    pub managed_keyed_state: SnapshotResultSupplier<KeyGroupsStateHandle>,
    pub raw_keyed_state: SnapshotResultSupplier<KeyGroupsStateHandle>,
    pub input_channel_state: SnapshotResultSupplier<InputChannelStateHandle>,
    pub result_subpartition_state: SnapshotResultSupplier<ResultSubpartitionStateHandle>,
}

impl Default for OperatorSnapshotFutures {
    fn default() -> Self {
        Self {
            managed_operator_state: completed_snapshot(SnapshotResult::empty()),
            raw_operator_state: completed_snapshot(SnapshotResult::empty()),
            managed_keyed_state: completed_snapshot(SnapshotResult::empty()),
            raw_keyed_state: completed_snapshot(SnapshotResult::empty()),
            input_channel_state: completed_snapshot(SnapshotResult::empty()),
            result_subpartition_state: completed_snapshot(SnapshotResult::empty()),
        }
    }
}

impl OperatorSnapshotFutures {
    /// Run every supplier. On failure, handles already written are discarded.
    pub fn run(self, registry: &CloseableRegistry) -> Result<OperatorSubtaskState> {
        let mut state = OperatorSubtaskState::default();
        match self.run_into(registry, &mut state) {
            Ok(()) => Ok(state),
            Err(err) => {
                if let Err(discard_err) = state.discard_state() {
                    tracing::warn!("failed to discard partial operator snapshot: {discard_err:#}");
                }
                Err(err)
            }
        }
    }

    fn run_into(self, registry: &CloseableRegistry, state: &mut OperatorSubtaskState) -> Result<()> {
        state.managed_operator_state = collect_handle((self.managed_operator_state)(registry)?);
        state.raw_operator_state = collect_handle((self.raw_operator_state)(registry)?);
        state.managed_keyed_state = collect_handle((self.managed_keyed_state)(registry)?);
        state.raw_keyed_state = collect_handle((self.raw_keyed_state)(registry)?);
        state.input_channel_state = collect_handle((self.input_channel_state)(registry)?);
        state.result_subpartition_state =
            collect_handle((self.result_subpartition_state)(registry)?);
        Ok(())
    }
}

/// Only the coordinator-owned copy is reported; a task-local copy stays on the task.
fn collect_handle<H>(result: SnapshotResult<H>) -> StateCollection<H> {
    result.job_manager_owned.into_iter().collect()
}
