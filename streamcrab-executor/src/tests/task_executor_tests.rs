use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::checkpoint::{ChannelCheckpointResponder, CheckpointResponse};
use crate::config::{BackoffConfig, FsBackendConfig, StateBackendConfig, TaskExecutorConfig};
use crate::error::TaskError;
use crate::execution::{ExecutionState, ExecutionStateUpdate, Invokable, TaskContext, TaskInfo};
use crate::partition::{
    InputChannelDescriptor, InputChannelId, PartitionError, PartitionInfo, PartitionLocation,
    PartitionRegistry,
};
use crate::slot::SlotError;
use crate::stream_task::StreamTask;
use crate::task_executor::{InvokableRegistry, TaskDeploymentDescriptor, TaskExecutor};
use crate::testing::unique_temp_dir;
use crate::types::{
    AllocationId, CheckpointMetaData, CheckpointOptions, ExecutionAttemptId,
    IntermediateResultPartitionId, JobId, ResultPartitionId, StreamElement,
};

const SLOT_TIMEOUT: Duration = Duration::from_secs(60);

fn idle(ctx: &mut TaskContext) -> anyhow::Result<()> {
    while ctx.is_running() {
        ctx.next_mail(Duration::from_millis(20));
    }
    Ok(())
}

struct Fixture {
    executor: TaskExecutor,
    responses: Receiver<CheckpointResponse>,
    /// Feeds every "stream" task deployed by this fixture.
    stream_input: Sender<StreamElement<Vec<u8>>>,
}

fn fixture(num_slots: usize) -> Fixture {
    let (stream_input, stream_rx) = unbounded();
    let invokables = InvokableRegistry::new()
        .with_invokable("idle", |_: &TaskInfo| Ok(Box::new(idle) as Box<dyn Invokable>))
        .with_invokable("stream", move |_: &TaskInfo| {
            Ok(Box::new(StreamTask::new(stream_rx.clone(), None, Vec::new())) as Box<dyn Invokable>)
        })
        .with_invokable("broken", |info: &TaskInfo| {
            Err(anyhow::anyhow!("cannot build {}", info.task_name))
        });
    let (responder, responses) = ChannelCheckpointResponder::unbounded();
    let config = TaskExecutorConfig {
        num_slots,
        ..TaskExecutorConfig::default()
    };
    let executor = TaskExecutor::new(
        config,
        invokables,
        Arc::new(responder),
        Arc::new(PartitionRegistry::new()),
    )
    .unwrap();
    Fixture {
        executor,
        responses,
        stream_input,
    }
}

fn descriptor(job_id: JobId, allocation_id: AllocationId, invokable: &str) -> TaskDeploymentDescriptor {
    TaskDeploymentDescriptor {
        job_id,
        attempt_id: ExecutionAttemptId::generate(),
        allocation_id,
        task_name: format!("{invokable}-task"),
        invokable: invokable.to_string(),
        subtask_index: 0,
        parallelism: 1,
        max_parallelism: 128,
        input_channels: Vec::new(),
    }
}

fn wait_for_attempt(
    updates: &Receiver<ExecutionStateUpdate>,
    attempt_id: ExecutionAttemptId,
    state: ExecutionState,
) {
    loop {
        let update = updates
            .recv_timeout(Duration::from_secs(5))
            .unwrap_or_else(|_| panic!("timed out waiting for {attempt_id} to reach {state}"));
        if update.attempt_id == attempt_id && update.state == state {
            return;
        }
    }
}

fn rejection_source(err: TaskError) -> String {
    match err {
        TaskError::DeploymentRejected { source, .. } => source.to_string(),
        other => panic!("expected DeploymentRejected, got {other:?}"),
    }
}

#[test]
fn test_cancel_one_attempt_leaves_other_running() {
    let fixture = fixture(2);
    let executor = &fixture.executor;
    let updates = executor.subscribe_state_updates();
    let job_id = JobId::generate();
    let first_slot = AllocationId::generate();
    let second_slot = AllocationId::generate();
    executor.allocate_slot(0, job_id, first_slot, SLOT_TIMEOUT).unwrap();
    executor.allocate_slot(1, job_id, second_slot, SLOT_TIMEOUT).unwrap();

    let first = executor.submit_task(descriptor(job_id, first_slot, "idle")).unwrap();
    let second = executor.submit_task(descriptor(job_id, second_slot, "idle")).unwrap();
    wait_for_attempt(&updates, first.attempt_id(), ExecutionState::Running);
    wait_for_attempt(&updates, second.attempt_id(), ExecutionState::Running);

    executor.cancel_task(first.attempt_id()).unwrap();
    wait_for_attempt(&updates, first.attempt_id(), ExecutionState::Canceled);
    assert_eq!(
        executor.task_state(first.attempt_id()),
        Some(ExecutionState::Canceled)
    );
    assert_eq!(
        executor.task_state(second.attempt_id()),
        Some(ExecutionState::Running)
    );

    assert_eq!(executor.release_terminal_tasks(), vec![first.attempt_id()]);
    assert!(executor.get_task(first.attempt_id()).is_none());
    assert!(executor.get_task(second.attempt_id()).is_some());
}

#[test]
fn test_submit_into_foreign_allocation_is_rejected() {
    let fixture = fixture(1);
    let executor = &fixture.executor;
    let job_id = JobId::generate();
    let allocation_id = AllocationId::generate();
    executor.allocate_slot(0, job_id, allocation_id, SLOT_TIMEOUT).unwrap();

    let unknown = AllocationId::generate();
    let tdd = descriptor(job_id, unknown, "idle");
    let attempt_id = tdd.attempt_id;
    let err = executor.submit_task(tdd).unwrap_err();
    match &err {
        TaskError::DeploymentRejected {
            attempt_id: rejected,
            source,
        } => {
            assert_eq!(*rejected, attempt_id);
            assert_eq!(
                source.downcast_ref::<SlotError>(),
                Some(&SlotError::AllocationMismatch {
                    allocation_id: unknown
                })
            );
            assert!(source.to_string().contains(&unknown.to_string()));
        }
        other => panic!("expected DeploymentRejected, got {other:?}"),
    }
    assert!(executor.get_task(attempt_id).is_none());

    let other_job = descriptor(JobId::generate(), allocation_id, "idle");
    let message = rejection_source(executor.submit_task(other_job).unwrap_err());
    assert!(message.contains("belongs to"), "{message}");
}

#[test]
fn test_malformed_descriptors_are_rejected() {
    let fixture = fixture(1);
    let executor = &fixture.executor;
    let job_id = JobId::generate();
    let allocation_id = AllocationId::generate();
    executor.allocate_slot(0, job_id, allocation_id, SLOT_TIMEOUT).unwrap();

    let mut zero_max = descriptor(job_id, allocation_id, "idle");
    zero_max.max_parallelism = 0;
    let message = rejection_source(executor.submit_task(zero_max).unwrap_err());
    assert!(message.contains("max_parallelism"), "{message}");

    let mut out_of_range = descriptor(job_id, allocation_id, "idle");
    out_of_range.parallelism = 2;
    out_of_range.subtask_index = 2;
    assert!(executor.submit_task(out_of_range).is_err());

    let mut duplicate_channels = descriptor(job_id, allocation_id, "idle");
    let channel = InputChannelDescriptor::known(
        InputChannelId::new(0, 0),
        ResultPartitionId::generate(),
        PartitionLocation::Local,
    );
    duplicate_channels.input_channels = vec![channel.clone(), channel];
    assert!(executor.submit_task(duplicate_channels).is_err());

    let message = rejection_source(
        executor
            .submit_task(descriptor(job_id, allocation_id, "missing"))
            .unwrap_err(),
    );
    assert!(message.contains("unknown invokable missing"), "{message}");

    let message = rejection_source(
        executor
            .submit_task(descriptor(job_id, allocation_id, "broken"))
            .unwrap_err(),
    );
    assert!(message.contains("failed to instantiate invokable broken"), "{message}");
}

#[test]
fn test_expired_allocation_rejects_deployment() {
    let fixture = fixture(1);
    let executor = &fixture.executor;
    let job_id = JobId::generate();
    let allocation_id = AllocationId::generate();
    executor
        .allocate_slot(0, job_id, allocation_id, Duration::ZERO)
        .unwrap();

    let message = rejection_source(
        executor
            .submit_task(descriptor(job_id, allocation_id, "idle"))
            .unwrap_err(),
    );
    assert!(message.contains("timed out"), "{message}");
    // The slot was freed and can be allocated again.
    executor
        .allocate_slot(0, job_id, AllocationId::generate(), SLOT_TIMEOUT)
        .unwrap();
}

#[test]
fn test_allocating_reclaims_slot_of_unactivated_allocation() {
    let fixture = fixture(1);
    let executor = &fixture.executor;
    let stale = AllocationId::generate();
    executor
        .allocate_slot(0, JobId::generate(), stale, Duration::ZERO)
        .unwrap();

    let job_id = JobId::generate();
    let fresh = AllocationId::generate();
    executor.allocate_slot(0, job_id, fresh, SLOT_TIMEOUT).unwrap();
    let task = executor.submit_task(descriptor(job_id, fresh, "idle")).unwrap();
    assert_eq!(executor.free_slot(fresh), 1);
    task.join().unwrap();
}

#[test]
fn test_duplicate_attempt_is_rejected() {
    let fixture = fixture(1);
    let executor = &fixture.executor;
    let job_id = JobId::generate();
    let allocation_id = AllocationId::generate();
    executor.allocate_slot(0, job_id, allocation_id, SLOT_TIMEOUT).unwrap();

    let tdd = descriptor(job_id, allocation_id, "idle");
    let task = executor.submit_task(tdd.clone()).unwrap();
    assert!(matches!(
        executor.submit_task(tdd),
        Err(TaskError::DeploymentRejected { .. })
    ));
    assert!(Arc::ptr_eq(&executor.get_task(task.attempt_id()).unwrap(), &task));
}

#[test]
fn test_checkpoint_round_trip_through_executor() {
    let fixture = fixture(1);
    let executor = &fixture.executor;
    let updates = executor.subscribe_state_updates();
    let job_id = JobId::generate();
    let allocation_id = AllocationId::generate();
    executor.allocate_slot(0, job_id, allocation_id, SLOT_TIMEOUT).unwrap();
    let task = executor
        .submit_task(descriptor(job_id, allocation_id, "stream"))
        .unwrap();
    wait_for_attempt(&updates, task.attempt_id(), ExecutionState::Running);

    assert!(
        executor
            .trigger_checkpoint(
                task.attempt_id(),
                CheckpointMetaData::new(1, 100),
                CheckpointOptions::default()
            )
            .unwrap()
    );
    match fixture.responses.recv_timeout(Duration::from_secs(5)).unwrap() {
        CheckpointResponse::Acknowledge(ack) => {
            assert_eq!(ack.job_id, job_id);
            assert_eq!(ack.attempt_id, task.attempt_id());
            assert_eq!(ack.checkpoint_id, 1);
            assert!(ack.snapshot.is_none());
        }
        other => panic!("expected an acknowledgement, got {other:?}"),
    }
    assert!(executor.confirm_checkpoint(task.attempt_id(), 1).unwrap());

    fixture.stream_input.send(StreamElement::End).unwrap();
    wait_for_attempt(&updates, task.attempt_id(), ExecutionState::Finished);
    assert!(
        !executor
            .trigger_checkpoint(
                task.attempt_id(),
                CheckpointMetaData::new(2, 200),
                CheckpointOptions::default()
            )
            .unwrap()
    );
    assert!(
        executor
            .trigger_checkpoint(
                ExecutionAttemptId::generate(),
                CheckpointMetaData::new(2, 200),
                CheckpointOptions::default()
            )
            .is_err()
    );
}

#[test]
fn test_partition_update_moves_input_channel() {
    let fixture = fixture(1);
    let executor = &fixture.executor;
    let updates = executor.subscribe_state_updates();
    let job_id = JobId::generate();
    let allocation_id = AllocationId::generate();
    executor.allocate_slot(0, job_id, allocation_id, SLOT_TIMEOUT).unwrap();

    let partition = ResultPartitionId::generate();
    let channel = InputChannelId::new(0, 0);
    let mut tdd = descriptor(job_id, allocation_id, "idle");
    tdd.input_channels = vec![InputChannelDescriptor::known(
        channel,
        partition,
        PartitionLocation::Local,
    )];
    let task = executor.submit_task(tdd).unwrap();
    wait_for_attempt(&updates, task.attempt_id(), ExecutionState::Running);

    let restarted_producer = ResultPartitionId::new(partition.partition_id, ExecutionAttemptId::generate());
    let remote = PartitionLocation::Remote("10.0.0.7:6121".parse().unwrap());
    executor
        .update_partitions(
            task.attempt_id(),
            vec![PartitionInfo {
                partition_id: restarted_producer,
                location: remote.clone(),
            }],
        )
        .unwrap();
    assert_eq!(task.input_location(channel), Some(remote));
    assert_eq!(task.execution_state(), ExecutionState::Running);
}

#[test]
fn test_failed_partition_update_fails_task() {
    let fixture = fixture(1);
    let executor = &fixture.executor;
    let updates = executor.subscribe_state_updates();
    let job_id = JobId::generate();
    let allocation_id = AllocationId::generate();
    executor.allocate_slot(0, job_id, allocation_id, SLOT_TIMEOUT).unwrap();
    let task = executor
        .submit_task(descriptor(job_id, allocation_id, "idle"))
        .unwrap();
    wait_for_attempt(&updates, task.attempt_id(), ExecutionState::Running);

    let stranger = ResultPartitionId::new(
        IntermediateResultPartitionId::generate(),
        ExecutionAttemptId::generate(),
    );
    let result = executor.update_partitions(
        task.attempt_id(),
        vec![PartitionInfo {
            partition_id: stranger,
            location: PartitionLocation::Local,
        }],
    );
    assert!(result.is_err());
    wait_for_attempt(&updates, task.attempt_id(), ExecutionState::Failed);

    let cause = task.failure_cause().unwrap();
    assert!(matches!(
        cause.downcast_ref::<PartitionError>(),
        Some(PartitionError::UnknownPartition { partition_id }) if *partition_id == stranger
    ));
}

#[test]
fn test_fail_task_records_cause() {
    let fixture = fixture(1);
    let executor = &fixture.executor;
    let updates = executor.subscribe_state_updates();
    let job_id = JobId::generate();
    let allocation_id = AllocationId::generate();
    executor.allocate_slot(0, job_id, allocation_id, SLOT_TIMEOUT).unwrap();
    let task = executor
        .submit_task(descriptor(job_id, allocation_id, "idle"))
        .unwrap();
    wait_for_attempt(&updates, task.attempt_id(), ExecutionState::Running);

    executor
        .fail_task(task.attempt_id(), anyhow::anyhow!("job master lost"))
        .unwrap();
    wait_for_attempt(&updates, task.attempt_id(), ExecutionState::Failed);
    assert_eq!(task.failure_cause().unwrap().to_string(), "job master lost");

    executor.cancel_task(task.attempt_id()).unwrap();
    assert_eq!(task.execution_state(), ExecutionState::Failed);
}

#[test]
fn test_free_slot_cancels_its_tasks() {
    let fixture = fixture(1);
    let executor = &fixture.executor;
    let updates = executor.subscribe_state_updates();
    let job_id = JobId::generate();
    let allocation_id = AllocationId::generate();
    executor.allocate_slot(0, job_id, allocation_id, SLOT_TIMEOUT).unwrap();
    let task = executor
        .submit_task(descriptor(job_id, allocation_id, "idle"))
        .unwrap();
    wait_for_attempt(&updates, task.attempt_id(), ExecutionState::Running);

    assert_eq!(executor.free_slot(allocation_id), 1);
    wait_for_attempt(&updates, task.attempt_id(), ExecutionState::Canceled);
    assert!(executor.get_task(task.attempt_id()).is_none());
    assert!(
        executor
            .submit_task(descriptor(job_id, allocation_id, "idle"))
            .is_err()
    );
}

#[test]
fn test_shutdown_cancels_running_tasks() {
    let mut fixture = fixture(1);
    let job_id = JobId::generate();
    let allocation_id = AllocationId::generate();
    fixture
        .executor
        .allocate_slot(0, job_id, allocation_id, SLOT_TIMEOUT)
        .unwrap();
    let task = fixture
        .executor
        .submit_task(descriptor(job_id, allocation_id, "idle"))
        .unwrap();

    fixture.executor.shutdown();
    assert_eq!(task.execution_state(), ExecutionState::Canceled);
}

#[test]
fn test_filesystem_backend_from_config() {
    let dir = unique_temp_dir("executor-fs");
    let config = TaskExecutorConfig {
        state_backend: StateBackendConfig::Filesystem(FsBackendConfig {
            checkpoint_dir: dir.clone(),
        }),
        ..TaskExecutorConfig::default()
    };
    let (responder, _responses) = ChannelCheckpointResponder::unbounded();
    let executor = TaskExecutor::new(
        config,
        InvokableRegistry::new(),
        Arc::new(responder),
        Arc::new(PartitionRegistry::new()),
    )
    .unwrap();
    assert!(dir.is_dir());
    assert_eq!(executor.config().num_slots, 1);
    drop(executor);
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn test_backoff_above_maximum_is_rejected_at_startup() {
    let config = TaskExecutorConfig {
        partition_request_backoff: BackoffConfig {
            initial: Duration::from_millis(500),
            max: Duration::from_millis(200),
            max_total_wait: None,
        },
        ..TaskExecutorConfig::default()
    };
    let (responder, _responses) = ChannelCheckpointResponder::unbounded();
    let err = match TaskExecutor::new(
        config,
        InvokableRegistry::new(),
        Arc::new(responder),
        Arc::new(PartitionRegistry::new()),
    ) {
        Ok(_) => panic!("backoff with initial above max was accepted"),
        Err(err) => err,
    };
    assert!(format!("{err:#}").contains("exceeds maximum"), "{err:#}");
}

#[test]
fn test_async_snapshot_threads_bound_concurrent_snapshots() {
    let (responder, _responses) = ChannelCheckpointResponder::unbounded();
    let config = TaskExecutorConfig {
        async_snapshot_threads: 2,
        ..TaskExecutorConfig::default()
    };
    let executor = TaskExecutor::new(
        config,
        InvokableRegistry::new(),
        Arc::new(responder),
        Arc::new(PartitionRegistry::new()),
    )
    .unwrap();
    let snapshots = executor.snapshot_executor().unwrap();

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = unbounded();
    for _ in 0..8 {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        let done_tx = done_tx.clone();
        snapshots.execute(move || {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            running.fetch_sub(1, Ordering::SeqCst);
            done_tx.send(()).unwrap();
        });
    }
    for _ in 0..8 {
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 2, "peak {}", peak.load(Ordering::SeqCst));
}

#[test]
fn test_subscriber_racing_submissions_sees_every_task() {
    const TASKS: usize = 8;
    let fixture = fixture(TASKS);
    let executor = &fixture.executor;
    let job_id = JobId::generate();
    let allocations: Vec<AllocationId> = (0..TASKS)
        .map(|index| {
            let allocation_id = AllocationId::generate();
            executor
                .allocate_slot(index, job_id, allocation_id, SLOT_TIMEOUT)
                .unwrap();
            allocation_id
        })
        .collect();

    let (tasks, updates) = std::thread::scope(|scope| {
        let subscriber = scope.spawn(|| executor.subscribe_state_updates());
        let tasks: Vec<ExecutionAttemptId> = allocations
            .iter()
            .map(|allocation_id| {
                executor
                    .submit_task(descriptor(job_id, *allocation_id, "idle"))
                    .unwrap()
                    .attempt_id()
            })
            .collect();
        (tasks, subscriber.join().unwrap())
    });

    for attempt_id in &tasks {
        executor.cancel_task(*attempt_id).unwrap();
    }
    let mut canceled = std::collections::HashSet::new();
    while canceled.len() < TASKS {
        let update = updates
            .recv_timeout(Duration::from_secs(5))
            .expect("a task was never reported canceled");
        if update.state == ExecutionState::Canceled {
            canceled.insert(update.attempt_id);
        }
    }
    assert_eq!(canceled, tasks.into_iter().collect());
}
