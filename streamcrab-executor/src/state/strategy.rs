use super::*;
use std::time::Instant;

/// Deferred second phase of a snapshot. Runs off the task thread; streams it
/// opens must be registered with the given registry so cancellation can close them.
pub type SnapshotResultSupplier<H> =
    Box<dyn FnOnce(&CloseableRegistry) -> Result<SnapshotResult<H>> + Send>;

/// Supplier for a result that is already complete.
pub fn completed_snapshot<H: Send + 'static>(result: SnapshotResult<H>) -> SnapshotResultSupplier<H> {
    Box::new(move |_: &CloseableRegistry| Ok(result))
}

/// Two-phase snapshot of one state backend.
///
/// `prepare` runs on the task thread while processing is paused and captures a
/// point-in-time view. `snapshot` turns that view into a supplier which does the
/// expensive writing later; later state changes must not leak into it.
pub trait SnapshotStrategy {
    type Resources: Send + 'static;
    type Handle: Send + 'static;

    fn description(&self) -> &str;

    fn prepare(&mut self, checkpoint_id: CheckpointId) -> Result<Self::Resources>;

    fn snapshot(
        &self,
        resources: Self::Resources,
        checkpoint_id: CheckpointId,
        timestamp: EventTime,
        streams: Arc<dyn CheckpointStreamFactory>,
        options: &CheckpointOptions,
    ) -> SnapshotResultSupplier<Self::Handle>;
}

/// Run the synchronous phase of `strategy` and wrap the supplier so that
/// failures from either phase come back as a [`SnapshotError`] of that phase.
pub fn run_snapshot<S>(
    strategy: &mut S,
    checkpoint_id: CheckpointId,
    timestamp: EventTime,
    streams: &Arc<dyn CheckpointStreamFactory>,
    options: &CheckpointOptions,
) -> Result<SnapshotResultSupplier<S::Handle>, SnapshotError>
where
    S: SnapshotStrategy + ?Sized,
{
    let description = strategy.description().to_string();
    let sync_start = Instant::now();
    let resources = strategy
        .prepare(checkpoint_id)
        .map_err(|err| SnapshotError::Synchronous {
            description: description.clone(),
            checkpoint_id,
            source: err,
        })?;
    let supplier = strategy.snapshot(
        resources,
        checkpoint_id,
        timestamp,
        Arc::clone(streams),
        options,
    );
    tracing::debug!(
        "{description} (checkpoint {checkpoint_id}): synchronous part took {:?}",
        sync_start.elapsed()
    );

    Ok(Box::new(move |registry: &CloseableRegistry| {
        let async_start = Instant::now();
        let result = supplier(registry).map_err(|err| {
            anyhow::Error::from(SnapshotError::Asynchronous {
                description: description.clone(),
                checkpoint_id,
                source: err,
            })
        });
        tracing::debug!(
            "{description} (checkpoint {checkpoint_id}): asynchronous part took {:?}",
            async_start.elapsed()
        );
        result
    }))
}

/// Write `value` as one length-prefixed bincode record and return its offset.
pub(crate) fn write_record<T: Serialize>(
    stream: &dyn CheckpointStateOutputStream,
    value: &T,
) -> Result<u64> {
    let offset = stream.pos();
    let bytes = bincode::serialize(value).context("serialize state record failed")?;
    stream.write(&bytes)?;
    Ok(offset)
}

/// Read a record written by [`write_record`] starting at `offset`.
pub(crate) fn read_record<T: DeserializeOwned>(bytes: &[u8], offset: u64) -> Result<T> {
    let start = usize::try_from(offset).context("state offset out of range")?;
    let slice = bytes
        .get(start..)
        .ok_or_else(|| anyhow!("state offset {offset} beyond end of stream ({} bytes)", bytes.len()))?;
    bincode::deserialize(slice).context("deserialize state record failed")
}

/// Open a stream for `checkpoint_id` and register it with `registry` for the
/// duration of `write`. The handle is only produced after `write` returned Ok.
pub(crate) fn write_registered_stream<F>(
    streams: &Arc<dyn CheckpointStreamFactory>,
    registry: &CloseableRegistry,
    checkpoint_id: CheckpointId,
    location: &CheckpointStorageLocation,
    write: F,
) -> Result<Option<StreamStateHandle>>
where
    F: FnOnce(&dyn CheckpointStateOutputStream) -> Result<()>,
{
    let stream = streams.create_output_stream(checkpoint_id, location)?;
    let key = registry.register_closeable(Arc::clone(&stream))?;
    let written = write(stream.as_ref()).and_then(|()| stream.close_and_get_handle());
    registry.unregister(key);
    match written {
        Ok(handle) => Ok(handle),
        Err(err) => {
            if let Err(close_err) = stream.close() {
                tracing::warn!("failed to close checkpoint stream after error: {close_err:#}");
            }
            Err(err)
        }
    }
}
