//! # StreamCrab Executor
//!
//! Worker-side task execution core of the StreamCrab stream processing engine.
//!
//! - [`execution`]: per-attempt [`ExecutionStateMachine`](execution::ExecutionStateMachine),
//!   the task thread, and the [`CloseableRegistry`](execution::CloseableRegistry) that
//!   makes cancellation cooperative.
//! - [`checkpoint`]: the [`CheckpointBarrierHandler`](checkpoint::CheckpointBarrierHandler)
//!   running synchronous and asynchronous snapshot phases, and the
//!   [`CheckpointResponder`](checkpoint::CheckpointResponder) reporting to the coordinator.
//! - [`state`]: state handles, checkpoint streams and the heap backends implementing
//!   [`SnapshotStrategy`](state::SnapshotStrategy).
//! - [`partition`]: input partition resolution with exponential backoff.
//! - [`slot`]: slot table and the allocation guard in front of deployments.
//! - [`stream_task`]: mailbox-driven invokable running a chain of operators.
//! - [`task_executor`]: the facade tying it all together.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod execution;
pub mod partition;
pub mod slot;
pub mod state;
pub mod stream_task;
pub mod task_executor;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
#[path = "tests/task_executor_tests.rs"]
mod task_executor_tests;
