//! Heap keyed state backend.
//!
//! State is addressed by `(current key, state name)`; every key belongs to one
//! key group, and a subtask owns a contiguous [`KeyGroupRange`]. Snapshots are
//! written key group by key group so a restore can pick just the groups it owns.

use super::*;
use ahash::AHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

type StateKey = (Vec<u8>, String);

/// Map a serialized key to its key group in `[0, max_parallelism)`.
pub fn assign_to_key_group(key: &[u8], max_parallelism: u32) -> u32 {
    let mut hasher = AHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() % u64::from(max_parallelism.max(1))) as u32
}

/// Key groups owned by subtask `operator_index` out of `parallelism`.
pub fn compute_key_group_range_for_operator_index(
    max_parallelism: u32,
    parallelism: u32,
    operator_index: u32,
) -> KeyGroupRange {
    let max = u64::from(max_parallelism);
    let p = u64::from(parallelism.max(1));
    let i = u64::from(operator_index);
    let start = (i * max).div_ceil(p);
    let end = ((i + 1) * max).div_ceil(p);
    if end == start {
        return KeyGroupRange::empty();
    }
    KeyGroupRange::new(start as u32, (end - 1) as u32)
}

/// Everything stored for the keys of one key group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGroupEntries {
    pub value_states: HashMap<StateKey, Vec<u8>>,
    pub list_states: HashMap<StateKey, Vec<Vec<u8>>>,
    pub map_states: HashMap<StateKey, HashMap<Vec<u8>, Vec<u8>>>,
}

impl KeyGroupEntries {
    fn is_empty(&self) -> bool {
        self.value_states.is_empty() && self.list_states.is_empty() && self.map_states.is_empty()
    }
}

/// In-memory keyed state for one subtask.
#[derive(Debug)]
pub struct HeapKeyedStateBackend {
    key_group_range: KeyGroupRange,
    max_parallelism: u32,
    value_states: HashMap<StateKey, Vec<u8>>,
    list_states: HashMap<StateKey, Vec<Vec<u8>>>,
    map_states: HashMap<StateKey, HashMap<Vec<u8>, Vec<u8>>>,
    current_key: Option<Vec<u8>>,
}

impl HeapKeyedStateBackend {
    pub fn new(max_parallelism: u32, key_group_range: KeyGroupRange) -> Self {
        Self {
            key_group_range,
            max_parallelism,
            value_states: HashMap::new(),
            list_states: HashMap::new(),
            map_states: HashMap::new(),
            current_key: None,
        }
    }

    /// Backend owning the key groups of one subtask.
    pub fn for_subtask(max_parallelism: u32, parallelism: usize, subtask_index: usize) -> Self {
        let range = compute_key_group_range_for_operator_index(
            max_parallelism,
            parallelism as u32,
            subtask_index as u32,
        );
        Self::new(max_parallelism, range)
    }

    pub fn key_group_range(&self) -> KeyGroupRange {
        self.key_group_range
    }

    pub fn max_parallelism(&self) -> u32 {
        self.max_parallelism
    }

    /// Scope following operations to `key`. Keys outside the owned key groups are rejected.
    pub fn set_current_key(&mut self, key: Vec<u8>) -> Result<()> {
        let key_group = assign_to_key_group(&key, self.max_parallelism);
        if !self.key_group_range.contains(key_group) {
            return Err(anyhow!(
                "key group {key_group} is not in {:?}; the key was routed to the wrong subtask",
                self.key_group_range
            ));
        }
        self.current_key = Some(key);
        Ok(())
    }

    fn state_key(&self, name: &str) -> Result<StateKey> {
        let key = self
            .current_key
            .as_ref()
            .ok_or_else(|| anyhow!("No current key set"))?;
        Ok((key.clone(), name.to_string()))
    }

    // ========== ValueState operations ==========

    pub fn get_value<V: DeserializeOwned>(&self, name: &str) -> Result<Option<V>> {
        match self.value_states.get(&self.state_key(name)?) {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_value<V: Serialize>(&mut self, name: &str, value: &V) -> Result<()> {
        let state_key = self.state_key(name)?;
        self.value_states
            .insert(state_key, bincode::serialize(value)?);
        Ok(())
    }

    pub fn clear_value(&mut self, name: &str) -> Result<()> {
        let state_key = self.state_key(name)?;
        self.value_states.remove(&state_key);
        Ok(())
    }

    // ========== ListState operations ==========

    pub fn get_list<V: DeserializeOwned>(&self, name: &str) -> Result<Vec<V>> {
        match self.list_states.get(&self.state_key(name)?) {
            Some(elems) => elems
                .iter()
                .map(|bytes| Ok(bincode::deserialize(bytes)?))
                .collect(),
            None => Ok(Vec::new()),
        }
    }

    pub fn add_to_list<V: Serialize>(&mut self, name: &str, value: &V) -> Result<()> {
        let state_key = self.state_key(name)?;
        let bytes = bincode::serialize(value)?;
        self.list_states.entry(state_key).or_default().push(bytes);
        Ok(())
    }

    pub fn clear_list(&mut self, name: &str) -> Result<()> {
        let state_key = self.state_key(name)?;
        self.list_states.remove(&state_key);
        Ok(())
    }

    // ========== MapState operations ==========

    pub fn get_from_map<K: Serialize, V: DeserializeOwned>(
        &self,
        name: &str,
        key: &K,
    ) -> Result<Option<V>> {
        let kbytes = bincode::serialize(key)?;
        match self
            .map_states
            .get(&self.state_key(name)?)
            .and_then(|map| map.get(&kbytes))
        {
            Some(vbytes) => Ok(Some(bincode::deserialize(vbytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_in_map<K: Serialize, V: Serialize>(
        &mut self,
        name: &str,
        key: &K,
        value: &V,
    ) -> Result<()> {
        let state_key = self.state_key(name)?;
        let kbytes = bincode::serialize(key)?;
        let vbytes = bincode::serialize(value)?;
        self.map_states
            .entry(state_key)
            .or_default()
            .insert(kbytes, vbytes);
        Ok(())
    }

    pub fn remove_from_map<K: Serialize, V: DeserializeOwned>(
        &mut self,
        name: &str,
        key: &K,
    ) -> Result<Option<V>> {
        let state_key = self.state_key(name)?;
        let kbytes = bincode::serialize(key)?;
        match self
            .map_states
            .get_mut(&state_key)
            .and_then(|map| map.remove(&kbytes))
        {
            Some(vbytes) => Ok(Some(bincode::deserialize(&vbytes)?)),
            None => Ok(None),
        }
    }

    pub fn clear_map(&mut self, name: &str) -> Result<()> {
        let state_key = self.state_key(name)?;
        self.map_states.remove(&state_key);
        Ok(())
    }

    // ========== Snapshot/Restore ==========

    fn group_of(&self, state_key: &StateKey) -> u32 {
        assign_to_key_group(&state_key.0, self.max_parallelism)
    }

    /// Load the key groups this backend owns from `handles`.
    pub fn restore(&mut self, handles: &[KeyGroupsStateHandle]) -> Result<()> {
        for handle in handles {
            let owned = handle.key_group_range.intersection(&self.key_group_range);
            if owned.is_empty() {
                continue;
            }
            let bytes = handle.delegate.read_all()?;
            for key_group in owned.iter() {
                let offset = handle
                    .offset_for(key_group)
                    .ok_or_else(|| anyhow!("no offset for key group {key_group} in state handle"))?;
                let entries: KeyGroupEntries = read_record(&bytes, offset)
                    .with_context(|| format!("restore of key group {key_group} failed"))?;
                self.value_states.extend(entries.value_states);
                self.list_states.extend(entries.list_states);
                self.map_states.extend(entries.map_states);
            }
        }
        Ok(())
    }
}

impl SnapshotStrategy for HeapKeyedStateBackend {
    type Resources = BTreeMap<u32, KeyGroupEntries>;
    type Handle = KeyGroupsStateHandle;

    fn description(&self) -> &str {
        "heap keyed state backend"
    }

    fn prepare(&mut self, _checkpoint_id: CheckpointId) -> Result<Self::Resources> {
        let mut groups: BTreeMap<u32, KeyGroupEntries> = BTreeMap::new();
        for (state_key, value) in &self.value_states {
            groups
                .entry(self.group_of(state_key))
                .or_default()
                .value_states
                .insert(state_key.clone(), value.clone());
        }
        for (state_key, list) in &self.list_states {
            groups
                .entry(self.group_of(state_key))
                .or_default()
                .list_states
                .insert(state_key.clone(), list.clone());
        }
        for (state_key, map) in &self.map_states {
            groups
                .entry(self.group_of(state_key))
                .or_default()
                .map_states
                .insert(state_key.clone(), map.clone());
        }
        groups.retain(|_, entries| !entries.is_empty());
        Ok(groups)
    }

    fn snapshot(
        &self,
        resources: Self::Resources,
        checkpoint_id: CheckpointId,
        _timestamp: EventTime,
        streams: Arc<dyn CheckpointStreamFactory>,
        options: &CheckpointOptions,
    ) -> SnapshotResultSupplier<Self::Handle> {
        if resources.is_empty() {
            return completed_snapshot(SnapshotResult::empty());
        }
        let key_group_range = self.key_group_range;
        let location = options.target_location.clone();
        Box::new(move |registry: &CloseableRegistry| {
            let mut offsets = Vec::with_capacity(key_group_range.len());
            let empty = KeyGroupEntries::default();
            let delegate =
                write_registered_stream(&streams, registry, checkpoint_id, &location, |stream| {
                    for key_group in key_group_range.iter() {
                        let entries = resources.get(&key_group).unwrap_or(&empty);
                        offsets.push(write_record(stream, entries)?);
                    }
                    Ok(())
                })?;
            Ok(match delegate {
                Some(delegate) => SnapshotResult::of(KeyGroupsStateHandle {
                    key_group_range,
                    offsets,
                    delegate,
                }),
                None => SnapshotResult::empty(),
            })
        })
    }
}

// ============================================================================
// Descriptors
// ============================================================================

/// Typed name of a value state. Does not borrow the backend.
#[derive(Debug, Clone)]
pub struct ValueStateHandle<V> {
    name: String,
    _marker: PhantomData<fn() -> V>,
}

impl<V: Serialize + DeserializeOwned> ValueStateHandle<V> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }

    pub fn get(&self, backend: &HeapKeyedStateBackend) -> Result<Option<V>> {
        backend.get_value(&self.name)
    }

    pub fn put(&self, backend: &mut HeapKeyedStateBackend, value: &V) -> Result<()> {
        backend.put_value(&self.name, value)
    }

    pub fn clear(&self, backend: &mut HeapKeyedStateBackend) -> Result<()> {
        backend.clear_value(&self.name)
    }
}

/// Typed name of a list state. Does not borrow the backend.
#[derive(Debug, Clone)]
pub struct ListStateHandle<V> {
    name: String,
    _marker: PhantomData<fn() -> V>,
}

impl<V: Serialize + DeserializeOwned> ListStateHandle<V> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }

    pub fn get(&self, backend: &HeapKeyedStateBackend) -> Result<Vec<V>> {
        backend.get_list(&self.name)
    }

    pub fn add(&self, backend: &mut HeapKeyedStateBackend, value: &V) -> Result<()> {
        backend.add_to_list(&self.name, value)
    }

    pub fn clear(&self, backend: &mut HeapKeyedStateBackend) -> Result<()> {
        backend.clear_list(&self.name)
    }
}

/// Typed name of a map state. Does not borrow the backend.
#[derive(Debug, Clone)]
pub struct MapStateHandle<K, V> {
    name: String,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K: Serialize, V: Serialize + DeserializeOwned> MapStateHandle<K, V> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }

    pub fn get(&self, backend: &HeapKeyedStateBackend, key: &K) -> Result<Option<V>> {
        backend.get_from_map(&self.name, key)
    }

    pub fn put(&self, backend: &mut HeapKeyedStateBackend, key: &K, value: &V) -> Result<()> {
        backend.put_in_map(&self.name, key, value)
    }

    pub fn remove(&self, backend: &mut HeapKeyedStateBackend, key: &K) -> Result<Option<V>> {
        backend.remove_from_map(&self.name, key)
    }

    pub fn clear(&self, backend: &mut HeapKeyedStateBackend) -> Result<()> {
        backend.clear_map(&self.name)
    }
}
