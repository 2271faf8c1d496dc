//! Mailbox-driven stream task.
//!
//! ```text
//! loop {
//!     select {
//!         mail    => TriggerCheckpoint -> snapshot chain -> emit barrier
//!                    NotifyCheckpointComplete -> notify chain
//!         element => Record  -> chain.process_batch() -> output
//!                    Barrier -> snapshot chain -> forward barrier
//!                    End     -> forward End, finish
//!     }
//!     if cancellation requested { return }
//! }
//! ```
//!
//! Mail and records are handled on the task thread only, so the synchronous
//! snapshot phase never races with record processing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender};

use crate::checkpoint::{
    CheckpointBarrierHandler, OperatorSnapshotFutures, SnapshotParticipant, SyncSnapshotContext,
};
use crate::execution::{CloseableRegistry, Invokable, TaskContext, TaskMail};
use crate::state::{
    CheckpointStateOutputStream, DistributionMode, HeapKeyedStateBackend,
    HeapOperatorStateBackend, OperatorStateHandle, SnapshotResult, SnapshotResultSupplier,
    StateMetaInfo, completed_snapshot, run_snapshot,
};
use crate::types::{
    Barrier, CheckpointId, CheckpointMetaData, CheckpointOptions, EventTime, OperatorId,
    StreamElement, StreamRecord,
};

/// Name under which raw operator state partitions are recorded.
pub const RAW_OPERATOR_STATE_NAME: &str = "_raw_operator_state";

/// Managed state an operator reads and writes while processing.
#[derive(Debug, Default)]
pub struct OperatorStateStore {
    pub operator_state: HeapOperatorStateBackend,
    pub keyed_state: Option<HeapKeyedStateBackend>,
}

impl OperatorStateStore {
    pub fn with_keyed_state(keyed_state: HeapKeyedStateBackend) -> Self {
        Self {
            operator_state: HeapOperatorStateBackend::new(),
            keyed_state: Some(keyed_state),
        }
    }

    pub fn keyed(&mut self) -> Result<&mut HeapKeyedStateBackend> {
        self.keyed_state
            .as_mut()
            .ok_or_else(|| anyhow!("operator has no keyed state backend"))
    }
}

/// One operator of a chain.
pub trait StreamOperator: Send {
    fn operator_id(&self) -> OperatorId;

    fn open(&mut self, _state: &mut OperatorStateStore) -> Result<()> {
        Ok(())
    }

    /// Process a batch of inputs, pushing outputs to the provided buffer.
    fn process_batch(
        &mut self,
        input: &[Vec<u8>],
        output: &mut Vec<Vec<u8>>,
        state: &mut OperatorStateStore,
    ) -> Result<()>;

    /// Called in the synchronous phase before managed state is captured.
    /// Raw state goes through [`StateSnapshotContext::write_raw_partition`].
    fn snapshot_state(
        &mut self,
        _ctx: &mut StateSnapshotContext<'_, '_>,
        _state: &mut OperatorStateStore,
    ) -> Result<()> {
        Ok(())
    }

    fn notify_checkpoint_complete(&mut self, _checkpoint_id: CheckpointId) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Raw state access during the synchronous phase.
///
/// The raw stream is opened on first use and registered with the checkpoint's
/// registry; it is finalized in the asynchronous phase.
pub struct StateSnapshotContext<'s, 'a> {
    sync: &'s SyncSnapshotContext<'a>,
    raw_stream: Option<Arc<dyn CheckpointStateOutputStream>>,
    raw_offsets: Vec<u64>,
}

impl<'s, 'a> StateSnapshotContext<'s, 'a> {
    fn new(sync: &'s SyncSnapshotContext<'a>) -> Self {
        Self {
            sync,
            raw_stream: None,
            raw_offsets: Vec::new(),
        }
    }

    pub fn checkpoint_id(&self) -> CheckpointId {
        self.sync.checkpoint_id
    }

    pub fn timestamp(&self) -> EventTime {
        self.sync.timestamp
    }

    /// Write one raw state partition. Blocks as long as the stream blocks.
    pub fn write_raw_partition(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = match &self.raw_stream {
            Some(stream) => Arc::clone(stream),
            None => {
                let stream = self
                    .sync
                    .stream_factory
                    .create_output_stream(self.sync.checkpoint_id, &self.sync.options.target_location)
                    .context("open raw operator state stream failed")?;
                self.sync.registry.register_closeable(Arc::clone(&stream))?;
                self.raw_stream = Some(Arc::clone(&stream));
                stream
            }
        };
        self.raw_offsets.push(stream.pos());
        stream.write(bytes)
    }

    fn into_raw_operator_state(self) -> SnapshotResultSupplier<OperatorStateHandle> {
        let Some(stream) = self.raw_stream else {
            return completed_snapshot(SnapshotResult::empty());
        };
        let offsets = self.raw_offsets;
        Box::new(move |_: &CloseableRegistry| {
            let Some(delegate) = stream.close_and_get_handle()? else {
                return Ok(SnapshotResult::empty());
            };
            let mut partitions = BTreeMap::new();
            partitions.insert(
                RAW_OPERATOR_STATE_NAME.to_string(),
                StateMetaInfo {
                    offsets,
                    distribution: DistributionMode::SplitDistribute,
                },
            );
            Ok(SnapshotResult::of(OperatorStateHandle {
                state_name_to_partition_offsets: partitions,
                delegate,
            }))
        })
    }
}

/// An operator together with the state it owns.
pub struct ChainedOperator {
    operator: Box<dyn StreamOperator>,
    state: OperatorStateStore,
}

impl ChainedOperator {
    pub fn new(operator: Box<dyn StreamOperator>, state: OperatorStateStore) -> Self {
        Self { operator, state }
    }

    pub fn stateless(operator: Box<dyn StreamOperator>) -> Self {
        Self::new(operator, OperatorStateStore::default())
    }

    pub fn state(&self) -> &OperatorStateStore {
        &self.state
    }
}

impl SnapshotParticipant for ChainedOperator {
    fn operator_id(&self) -> OperatorId {
        self.operator.operator_id()
    }

    fn snapshot_sync(&mut self, ctx: &SyncSnapshotContext<'_>) -> Result<OperatorSnapshotFutures> {
        let mut raw = StateSnapshotContext::new(ctx);
        self.operator.snapshot_state(&mut raw, &mut self.state)?;
        let raw_operator_state = raw.into_raw_operator_state();

        let managed_operator_state = run_snapshot(
            &mut self.state.operator_state,
            ctx.checkpoint_id,
            ctx.timestamp,
            ctx.stream_factory,
            ctx.options,
        )?;
        let managed_keyed_state = match self.state.keyed_state.as_mut() {
            Some(keyed) => run_snapshot(
                keyed,
                ctx.checkpoint_id,
                ctx.timestamp,
                ctx.stream_factory,
                ctx.options,
            )?,
            None => completed_snapshot(SnapshotResult::empty()),
        };

        Ok(OperatorSnapshotFutures {
            managed_operator_state,
            raw_operator_state,
            managed_keyed_state,
            ..OperatorSnapshotFutures::default()
        })
    }

    fn notify_checkpoint_complete(&mut self, checkpoint_id: CheckpointId) -> Result<()> {
        self.operator.notify_checkpoint_complete(checkpoint_id)
    }
}

/// Reads elements from one input, runs them through the chain and writes the
/// results to an optional output.
pub struct StreamTask {
    input: Receiver<StreamElement<Vec<u8>>>,
    output: Option<Sender<StreamElement<Vec<u8>>>>,
    chain: Vec<ChainedOperator>,
}

enum Step {
    Continue,
    Finished,
}

impl StreamTask {
    pub fn new(
        input: Receiver<StreamElement<Vec<u8>>>,
        output: Option<Sender<StreamElement<Vec<u8>>>>,
        chain: Vec<ChainedOperator>,
    ) -> Self {
        Self {
            input,
            output,
            chain,
        }
    }

    fn emit(&self, element: StreamElement<Vec<u8>>) -> Result<()> {
        if let Some(output) = &self.output {
            output
                .send(element)
                .map_err(|_| anyhow!("downstream receiver dropped"))?;
        }
        Ok(())
    }

    fn process_record(&mut self, record: StreamRecord<Vec<u8>>) -> Result<()> {
        let timestamp = record.timestamp;
        let mut batch = vec![record.value];
        let mut next = Vec::new();
        for chained in &mut self.chain {
            next.clear();
            chained
                .operator
                .process_batch(&batch, &mut next, &mut chained.state)?;
            std::mem::swap(&mut batch, &mut next);
        }
        for value in batch {
            self.emit(StreamElement::Record(StreamRecord { value, timestamp }))?;
        }
        Ok(())
    }

    /// `barrier_received` is set for checkpoints started by an in-band barrier.
    fn checkpoint(
        &mut self,
        handler: &mut CheckpointBarrierHandler,
        metadata: CheckpointMetaData,
        options: CheckpointOptions,
        barrier_received: Option<Instant>,
    ) -> Result<()> {
        // One input: the barrier is aligned once it has been received.
        let alignment = barrier_received.map_or(Duration::ZERO, |received| received.elapsed());
        let outcome = handler.trigger_checkpoint_after_alignment(
            metadata,
            &options,
            alignment,
            &mut self.chain,
        )?;
        tracing::debug!(
            "checkpoint {} finished its synchronous part: {outcome:?}",
            metadata.checkpoint_id
        );
        self.emit(StreamElement::CheckpointBarrier(Barrier {
            checkpoint_id: metadata.checkpoint_id,
            timestamp: metadata.timestamp,
            options,
        }))
    }

    fn handle_mail(&mut self, mail: TaskMail, handler: &mut CheckpointBarrierHandler) -> Result<()> {
        match mail {
            TaskMail::TriggerCheckpoint { metadata, options } => {
                self.checkpoint(handler, metadata, options, None)
            }
            TaskMail::NotifyCheckpointComplete(checkpoint_id) => {
                handler.notify_checkpoint_complete(checkpoint_id, &mut self.chain)
            }
            TaskMail::PartitionUpdated(info) => {
                tracing::debug!("input partition {} moved to {}", info.partition_id, info.location);
                Ok(())
            }
            TaskMail::Wake => Ok(()),
        }
    }

    fn handle_element(
        &mut self,
        element: StreamElement<Vec<u8>>,
        received: Instant,
        handler: &mut CheckpointBarrierHandler,
    ) -> Result<Step> {
        match element {
            StreamElement::Record(record) => self.process_record(record)?,
            StreamElement::CheckpointBarrier(barrier) => {
                let metadata = barrier.metadata();
                self.checkpoint(handler, metadata, barrier.options, Some(received))?;
            }
            StreamElement::End => {
                self.emit(StreamElement::End)?;
                return Ok(Step::Finished);
            }
        }
        Ok(Step::Continue)
    }

    fn close_chain(&mut self) -> Result<()> {
        let mut first_err = None;
        for chained in &mut self.chain {
            if let Err(err) = chained.operator.close() {
                tracing::warn!("failed to close operator {}: {err:#}", chained.operator.operator_id());
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Invokable for StreamTask {
    fn invoke(&mut self, ctx: &mut TaskContext) -> Result<()> {
        let mut handler = CheckpointBarrierHandler::new(Arc::clone(ctx.task()));
        for chained in &mut self.chain {
            chained.operator.open(&mut chained.state)?;
        }

        let mailbox = ctx.mailbox().clone();
        let input = self.input.clone();
        let result = loop {
            if !ctx.is_running() {
                break Ok(());
            }
            let step = crossbeam_channel::select! {
                recv(mailbox) -> mail => match mail {
                    Ok(mail) => self.handle_mail(mail, &mut handler).map(|()| Step::Continue),
                    Err(_) => Err(anyhow!("task mailbox closed")),
                },
                recv(input) -> element => match element {
                    Ok(element) => self.handle_element(element, Instant::now(), &mut handler),
                    Err(_) => Err(anyhow!("input closed before end of stream")),
                },
            };
            match step {
                Ok(Step::Continue) => {}
                Ok(Step::Finished) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        let closed = self.close_chain();
        result.and(closed)
    }
}
