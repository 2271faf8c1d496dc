use super::*;

#[test]
fn test_stream_element_barrier_carries_default_options() {
    let elem = StreamElement::<Vec<u8>>::barrier(11, 1234);
    match elem {
        StreamElement::CheckpointBarrier(b) => {
            assert_eq!(b.metadata(), CheckpointMetaData::new(11, 1234));
            assert_eq!(b.options.checkpoint_type, CheckpointType::Checkpoint);
            assert_eq!(b.options.target_location, CheckpointStorageLocation::Default);
        }
        _ => panic!("expected Barrier"),
    }
}

#[test]
fn test_stream_record_with_timestamp() {
    let rec = StreamRecord::with_timestamp("hello", 999);
    assert_eq!(rec.value, "hello");
    assert_eq!(rec.timestamp, Some(999));
}

#[test]
fn test_ids_are_unique_and_display_with_prefix() {
    let a = ExecutionAttemptId::generate();
    let b = ExecutionAttemptId::generate();
    assert_ne!(a, b);
    assert!(a.to_string().starts_with("attempt-"));
    assert_eq!(JobId::from_u128(7), JobId::from_u128(7));
}

#[test]
fn test_result_partition_id_distinguishes_producer_attempts() {
    let partition = IntermediateResultPartitionId::from_u128(1);
    let first = ResultPartitionId::new(partition, ExecutionAttemptId::from_u128(10));
    let restarted = ResultPartitionId::new(partition, ExecutionAttemptId::from_u128(11));
    assert_ne!(first, restarted);
    assert_eq!(first.partition_id, restarted.partition_id);
}

#[test]
fn test_checkpoint_type_flags() {
    assert!(!CheckpointType::Checkpoint.is_savepoint());
    assert!(CheckpointType::Savepoint.is_savepoint());
    assert!(CheckpointType::SyncSavepoint.is_synchronous());
    let options = CheckpointOptions::savepoint(PathBuf::from("/tmp/sp"));
    assert!(options.checkpoint_type.is_savepoint());
}
