use super::*;

const TIMEOUT: Duration = Duration::from_secs(60);

fn table_with_active_slot(num_slots: usize) -> (TaskSlotTable<String>, JobId, AllocationId) {
    let mut table = TaskSlotTable::new(num_slots);
    let job_id = JobId::generate();
    let allocation_id = AllocationId::generate();
    table.allocate_slot(0, job_id, allocation_id, TIMEOUT).unwrap();
    table.mark_slot_active(allocation_id).unwrap();
    (table, job_id, allocation_id)
}

#[test]
fn test_allocate_and_activate() {
    let mut table: TaskSlotTable<String> = TaskSlotTable::new(2);
    let job_id = JobId::generate();
    let allocation_id = AllocationId::generate();

    table.allocate_slot(1, job_id, allocation_id, TIMEOUT).unwrap();
    assert_eq!(table.slot_state(allocation_id), Some(SlotState::Allocated));
    assert_eq!(table.owning_job(allocation_id), Some(job_id));
    assert_eq!(table.slot_index(allocation_id), Some(1));
    assert_eq!(
        table.verify_allocation(job_id, allocation_id),
        Err(SlotError::SlotNotActive { allocation_id })
    );

    table.mark_slot_active(allocation_id).unwrap();
    assert_eq!(table.slot_state(allocation_id), Some(SlotState::Active));
    table.verify_allocation(job_id, allocation_id).unwrap();
}

#[test]
fn test_allocation_is_idempotent_for_same_allocation() {
    let mut table: TaskSlotTable<String> = TaskSlotTable::new(1);
    let job_id = JobId::generate();
    let allocation_id = AllocationId::generate();
    table.allocate_slot(0, job_id, allocation_id, TIMEOUT).unwrap();
    table.allocate_slot(0, job_id, allocation_id, TIMEOUT).unwrap();

    let other = AllocationId::generate();
    assert_eq!(
        table.allocate_slot(0, job_id, other, TIMEOUT),
        Err(SlotError::SlotOccupied {
            index: 0,
            allocation_id
        })
    );
    assert!(matches!(
        table.allocate_slot(0, JobId::generate(), allocation_id, TIMEOUT),
        Err(SlotError::JobMismatch { .. })
    ));
}

#[test]
fn test_allocation_cannot_hold_two_slots() {
    let mut table: TaskSlotTable<String> = TaskSlotTable::new(2);
    let job_id = JobId::generate();
    let allocation_id = AllocationId::generate();
    table.allocate_slot(0, job_id, allocation_id, TIMEOUT).unwrap();
    assert!(matches!(
        table.allocate_slot(1, job_id, allocation_id, TIMEOUT),
        Err(SlotError::SlotOccupied { index: 0, .. })
    ));
}

#[test]
fn test_unknown_slot_index() {
    let mut table: TaskSlotTable<String> = TaskSlotTable::new(2);
    assert_eq!(
        table.allocate_slot(2, JobId::generate(), AllocationId::generate(), TIMEOUT),
        Err(SlotError::UnknownSlot {
            index: 2,
            num_slots: 2
        })
    );
}

#[test]
fn test_verify_rejects_foreign_allocation_and_job() {
    let (table, job_id, allocation_id) = table_with_active_slot(1);
    let unknown = AllocationId::generate();
    assert_eq!(
        table.verify_allocation(job_id, unknown),
        Err(SlotError::AllocationMismatch {
            allocation_id: unknown
        })
    );

    let other_job = JobId::generate();
    assert_eq!(
        table.verify_allocation(other_job, allocation_id),
        Err(SlotError::JobMismatch {
            allocation_id,
            expected: other_job,
            actual: job_id,
        })
    );
}

#[test]
fn test_expired_allocation_is_freed_on_activation() {
    let mut table: TaskSlotTable<String> = TaskSlotTable::new(1);
    let job_id = JobId::generate();
    let allocation_id = AllocationId::generate();
    table
        .allocate_slot(0, job_id, allocation_id, Duration::from_millis(10))
        .unwrap();

    let later = Instant::now() + Duration::from_secs(1);
    assert_eq!(
        table.mark_slot_active_at(allocation_id, later),
        Err(SlotError::AllocationExpired { allocation_id })
    );
    assert_eq!(table.slot_state(allocation_id), None);
    // The slot can be handed out again.
    table
        .allocate_slot(0, job_id, AllocationId::generate(), TIMEOUT)
        .unwrap();
}

#[test]
fn test_free_expired_slots_skips_active_ones() {
    let mut table: TaskSlotTable<String> = TaskSlotTable::new(3);
    let job_id = JobId::generate();
    let active = AllocationId::generate();
    let pending = AllocationId::generate();
    let fresh = AllocationId::generate();
    table.allocate_slot(0, job_id, active, Duration::ZERO).unwrap();
    table.mark_slot_active_at(active, Instant::now() - Duration::from_secs(1)).unwrap();
    table
        .allocate_slot(1, job_id, pending, Duration::from_millis(5))
        .unwrap();
    table.allocate_slot(2, job_id, fresh, TIMEOUT).unwrap();

    let expired = table.free_expired_slots(Instant::now() + Duration::from_secs(1));
    assert_eq!(expired, vec![pending]);
    assert_eq!(table.slot_state(active), Some(SlotState::Active));
    assert_eq!(table.slot_state(fresh), Some(SlotState::Allocated));
    assert_eq!(table.slot_state(pending), None);
}

#[test]
fn test_tasks_follow_their_slot() {
    let (mut table, job_id, allocation_id) = table_with_active_slot(2);
    let first = ExecutionAttemptId::generate();
    let second = ExecutionAttemptId::generate();
    table
        .add_task(job_id, allocation_id, first, Arc::new("first".to_string()))
        .unwrap();
    table
        .add_task(job_id, allocation_id, second, Arc::new("second".to_string()))
        .unwrap();
    assert_eq!(
        table.add_task(job_id, allocation_id, first, Arc::new("again".to_string())),
        Err(SlotError::DuplicateAttempt { attempt_id: first })
    );

    assert_eq!(table.get_task(first).as_deref().map(String::as_str), Some("first"));
    assert_eq!(table.tasks(allocation_id).len(), 2);
    assert_eq!(table.all_tasks().len(), 2);

    assert_eq!(table.remove_task(first).as_deref().map(String::as_str), Some("first"));
    assert!(table.get_task(first).is_none());

    let mut released = table.free_slot(allocation_id);
    assert_eq!(released.len(), 1);
    assert_eq!(released.pop().unwrap().as_str(), "second");
    assert!(table.get_task(second).is_none());
    assert!(table.all_tasks().is_empty());
    assert!(table.free_slot(allocation_id).is_empty());
}

#[test]
fn test_add_task_requires_active_matching_slot() {
    let mut table: TaskSlotTable<String> = TaskSlotTable::new(1);
    let job_id = JobId::generate();
    let allocation_id = AllocationId::generate();
    table.allocate_slot(0, job_id, allocation_id, TIMEOUT).unwrap();

    let attempt_id = ExecutionAttemptId::generate();
    assert_eq!(
        table.add_task(job_id, allocation_id, attempt_id, Arc::new("t".to_string())),
        Err(SlotError::SlotNotActive { allocation_id })
    );
    assert!(matches!(
        table.add_task(
            job_id,
            AllocationId::generate(),
            attempt_id,
            Arc::new("t".to_string())
        ),
        Err(SlotError::AllocationMismatch { .. })
    ));
    assert!(table.get_task(attempt_id).is_none());
}
