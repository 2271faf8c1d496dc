use super::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredListState {
    pub distribution: DistributionMode,
    pub elements: Vec<Vec<u8>>,
}

/// Non-keyed operator state: named lists of serialized elements.
#[derive(Debug, Default)]
pub struct HeapOperatorStateBackend {
    states: BTreeMap<String, RegisteredListState>,
}

impl HeapOperatorStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.states.values().all(|state| state.elements.is_empty())
    }

    pub fn state_names(&self) -> impl Iterator<Item = &str> {
        self.states.keys().map(String::as_str)
    }

    /// Append to a list state that is split among subtasks on restore.
    pub fn add_to_list<V: Serialize>(&mut self, name: &str, value: &V) -> Result<()> {
        self.add(name, value, DistributionMode::SplitDistribute)
    }

    /// Append to a list state that every subtask receives in full on restore.
    pub fn add_to_union_list<V: Serialize>(&mut self, name: &str, value: &V) -> Result<()> {
        self.add(name, value, DistributionMode::Union)
    }

    pub fn get_list<V: DeserializeOwned>(&self, name: &str) -> Result<Vec<V>> {
        match self.states.get(name) {
            Some(state) => state
                .elements
                .iter()
                .map(|bytes| bincode::deserialize(bytes).context("deserialize operator state failed"))
                .collect(),
            None => Ok(Vec::new()),
        }
    }

    /// Replace the content of a list state, keeping its distribution mode.
    pub fn update_list<V: Serialize>(&mut self, name: &str, values: &[V]) -> Result<()> {
        let elements = values
            .iter()
            .map(|value| bincode::serialize(value).context("serialize operator state failed"))
            .collect::<Result<Vec<_>>>()?;
        self.states
            .entry(name.to_string())
            .or_insert_with(|| RegisteredListState {
                distribution: DistributionMode::SplitDistribute,
                elements: Vec::new(),
            })
            .elements = elements;
        Ok(())
    }

    pub fn clear(&mut self, name: &str) {
        self.states.remove(name);
    }

    /// Load the elements referenced by `handles`, appending to existing lists.
    pub fn restore(&mut self, handles: &[OperatorStateHandle]) -> Result<()> {
        for handle in handles {
            let bytes = handle.delegate.read_all()?;
            for (name, meta) in &handle.state_name_to_partition_offsets {
                let state = self
                    .states
                    .entry(name.clone())
                    .or_insert_with(|| RegisteredListState {
                        distribution: meta.distribution,
                        elements: Vec::new(),
                    });
                if state.distribution != meta.distribution {
                    return Err(anyhow!(
                        "operator state {name} restored as {:?} but registered as {:?}",
                        meta.distribution,
                        state.distribution
                    ));
                }
                for offset in &meta.offsets {
                    state.elements.push(read_record(&bytes, *offset)?);
                }
            }
        }
        Ok(())
    }

    fn add<V: Serialize>(&mut self, name: &str, value: &V, mode: DistributionMode) -> Result<()> {
        let bytes = bincode::serialize(value).context("serialize operator state failed")?;
        let state = self
            .states
            .entry(name.to_string())
            .or_insert_with(|| RegisteredListState {
                distribution: mode,
                elements: Vec::new(),
            });
        if state.distribution != mode {
            return Err(anyhow!(
                "operator state {name} already registered as {:?}",
                state.distribution
            ));
        }
        state.elements.push(bytes);
        Ok(())
    }
}

impl SnapshotStrategy for HeapOperatorStateBackend {
    type Resources = BTreeMap<String, RegisteredListState>;
    type Handle = OperatorStateHandle;

    fn description(&self) -> &str {
        "heap operator state backend"
    }

    fn prepare(&mut self, _checkpoint_id: CheckpointId) -> Result<Self::Resources> {
        Ok(self.states.clone())
    }

    fn snapshot(
        &self,
        resources: Self::Resources,
        checkpoint_id: CheckpointId,
        _timestamp: EventTime,
        streams: Arc<dyn CheckpointStreamFactory>,
        options: &CheckpointOptions,
    ) -> SnapshotResultSupplier<Self::Handle> {
        if resources.values().all(|state| state.elements.is_empty()) {
            return completed_snapshot(SnapshotResult::empty());
        }
        let location = options.target_location.clone();
        Box::new(move |registry: &CloseableRegistry| {
            let mut offsets = BTreeMap::new();
            let delegate =
                write_registered_stream(&streams, registry, checkpoint_id, &location, |stream| {
                    for (name, state) in &resources {
                        let mut element_offsets = Vec::with_capacity(state.elements.len());
                        for element in &state.elements {
                            element_offsets.push(write_record(stream, element)?);
                        }
                        offsets.insert(
                            name.clone(),
                            StateMetaInfo {
                                offsets: element_offsets,
                                distribution: state.distribution,
                            },
                        );
                    }
                    Ok(())
                })?;
            Ok(match delegate {
                Some(delegate) => SnapshotResult::of(OperatorStateHandle {
                    state_name_to_partition_offsets: offsets,
                    delegate,
                }),
                None => SnapshotResult::empty(),
            })
        })
    }
}
