//! Delta file manager: part file bookkeeping, cancellation and flushing.

#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;
use std::thread;

use tempfile::tempdir;

use pgdelta::compression::{CompressionMethod, CompressionRegistry};
use pgdelta::delta::{record_wal_segment, DeltaFile, DeltaFileManager, WalPartRecorder};
use pgdelta::pg::{BlockLocation, RelFileNode, WalSegmentNo};
use pgdelta::storage::{DataFolder, Folder, StorageFolder};
use pgdelta::upload::Uploader;

const GROUP_0: &str = "000000010000000000000000_delta";
const GROUP_1: &str = "000000010000000000000010_delta";

fn rel() -> RelFileNode {
    RelFileNode::new(1663, 5, 16384)
}

fn uploader(storage: &StorageFolder) -> Uploader {
    Uploader::new(
        storage.clone(),
        Arc::new(CompressionRegistry::new()),
        CompressionMethod::Uncompressed,
    )
}

/// Marks every fragment of `delta_filename` as recorded with no split records.
fn complete_part(manager: &DeltaFileManager, delta_filename: &str) -> pgdelta::Result<()> {
    let part = manager.get_part_file(delta_filename)?;
    let mut guard = part.lock();
    let part = &mut *guard;
    part.previous_wal_head = Some(Vec::new());
    for slot in part.wal_heads.iter_mut().chain(part.wal_tails.iter_mut()) {
        *slot = Some(Vec::new());
    }
    Ok(())
}

fn send_location(manager: &DeltaFileManager, delta_filename: &str, block: u32) -> pgdelta::Result<()> {
    let consumer = manager.get_block_location_consumer(delta_filename)?;
    consumer.send(BlockLocation::new(rel(), block))?;
    Ok(())
}

#[test]
fn complete_group_is_uploaded() -> pgdelta::Result<()> {
    let dir = tempdir()?;
    let storage = StorageFolder::memory();
    let manager = DeltaFileManager::new(DataFolder::new(dir.path())?)?;
    complete_part(&manager, GROUP_0)?;
    send_location(&manager, GROUP_0, 3)?;
    send_location(&manager, GROUP_0, 9)?;

    let summary = manager.flush_files(&uploader(&storage))?;
    assert_eq!(vec![GROUP_0.to_string()], summary.completed_part_files);
    assert_eq!(vec![GROUP_0.to_string()], summary.uploaded_delta_files);
    assert!(summary.saved_delta_files.is_empty());

    let uploaded = DeltaFile::load(&mut storage.read_all(GROUP_0)?.as_slice())?;
    assert_eq!(
        vec![BlockLocation::new(rel(), 3), BlockLocation::new(rel(), 9)],
        uploaded.locations
    );
    assert!(!DataFolder::new(dir.path())?.file_exists(GROUP_0));
    Ok(())
}

#[test]
fn cancellation_covers_current_and_next_group() -> pgdelta::Result<()> {
    let dir = tempdir()?;
    let storage = StorageFolder::memory();
    let manager = DeltaFileManager::new(DataFolder::new(dir.path())?)?;
    for group in [GROUP_0, GROUP_1] {
        complete_part(&manager, group)?;
        send_location(&manager, group, 1)?;
    }
    manager.cancel_recording("00000001000000000000000F")?;

    let summary = manager.flush_files(&uploader(&storage))?;
    assert!(summary.uploaded_delta_files.is_empty());
    assert_eq!(
        vec![GROUP_0.to_string(), GROUP_1.to_string()],
        summary.canceled_delta_files
    );
    assert!(!storage.exists(GROUP_0)?);
    assert!(!storage.exists(GROUP_1)?);
    Ok(())
}

#[test]
fn cancellation_inside_a_group_spares_other_groups() -> pgdelta::Result<()> {
    let dir = tempdir()?;
    let storage = StorageFolder::memory();
    let manager = DeltaFileManager::new(DataFolder::new(dir.path())?)?;
    for group in [GROUP_0, GROUP_1] {
        complete_part(&manager, group)?;
        send_location(&manager, group, 1)?;
    }
    manager.cancel_recording("000000010000000000000005")?;

    let summary = manager.flush_files(&uploader(&storage))?;
    assert_eq!(vec![GROUP_0.to_string()], summary.canceled_delta_files);
    assert_eq!(vec![GROUP_1.to_string()], summary.uploaded_delta_files);
    assert!(!storage.exists(GROUP_0)?);
    assert!(storage.exists(GROUP_1)?);
    Ok(())
}

#[test]
fn concurrent_callers_share_one_part_file() -> pgdelta::Result<()> {
    let dir = tempdir()?;
    let manager = DeltaFileManager::new(DataFolder::new(dir.path())?)?;
    let parts = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| manager.get_part_file(GROUP_0)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker panicked"))
            .collect::<pgdelta::Result<Vec<_>>>()
    })?;
    for part in &parts[1..] {
        assert!(Arc::ptr_eq(&parts[0], part));
    }
    let writers = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| manager.get_delta_file_writer(GROUP_0)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker panicked"))
            .collect::<pgdelta::Result<Vec<_>>>()
    })?;
    for writer in &writers[1..] {
        assert!(Arc::ptr_eq(&writers[0], writer));
    }
    Ok(())
}

#[test]
fn unfinished_state_survives_between_sessions() -> pgdelta::Result<()> {
    let dir = tempdir()?;
    let storage = StorageFolder::memory();

    let first = DeltaFileManager::new(DataFolder::new(dir.path())?)?;
    let recorder = WalPartRecorder::new("000000010000000000000003", &first)?;
    recorder.save_previous_wal_tail(Vec::new())?;
    recorder.save_next_wal_head(vec![1, 2, 3])?;
    send_location(&first, GROUP_0, 42)?;
    let summary = first.flush_files(&uploader(&storage))?;
    assert_eq!(vec![format!("{GROUP_0}_part")], summary.saved_part_files);
    assert_eq!(vec![GROUP_0.to_string()], summary.saved_delta_files);

    let second = DeltaFileManager::new(DataFolder::new(dir.path())?)?;
    let part = second.get_part_file(GROUP_0)?;
    assert_eq!(Some(vec![1, 2, 3]), part.lock().wal_heads[3]);
    assert_eq!(Some(Vec::new()), part.lock().wal_tails[3]);
    let writer = second.get_delta_file_writer(GROUP_0)?;
    assert_eq!(vec![BlockLocation::new(rel(), 42)], writer.snapshot().locations);
    Ok(())
}

#[test]
fn last_segment_hands_its_head_to_the_next_group() -> pgdelta::Result<()> {
    let dir = tempdir()?;
    let manager = DeltaFileManager::new(DataFolder::new(dir.path())?)?;
    let recorder = WalPartRecorder::new("00000001000000000000000F", &manager)?;
    recorder.save_next_wal_head(vec![7; 5])?;
    assert_eq!(Some(vec![7; 5]), manager.get_part_file(GROUP_0)?.lock().wal_heads[15]);
    assert_eq!(
        Some(vec![7; 5]),
        manager.get_part_file(GROUP_1)?.lock().previous_wal_head
    );
    Ok(())
}

#[test]
fn unparsable_segment_cancels_its_groups() -> pgdelta::Result<()> {
    let dir = tempdir()?;
    let storage = StorageFolder::memory();
    let manager = DeltaFileManager::new(DataFolder::new(dir.path())?)?;
    complete_part(&manager, GROUP_0)?;
    send_location(&manager, GROUP_0, 1)?;

    let (segment, _) = common::wal_segment(1, WalSegmentNo(7), 1, &vec![0u8; 9000], &[]);
    assert!(record_wal_segment(&manager, "000000010000000000000007", &mut segment.as_slice()).is_err());

    let summary = manager.flush_files(&uploader(&storage))?;
    assert_eq!(vec![GROUP_0.to_string()], summary.canceled_delta_files);
    assert!(summary.uploaded_delta_files.is_empty());
    Ok(())
}

#[test]
fn broken_split_record_cancels_the_group() -> pgdelta::Result<()> {
    let dir = tempdir()?;
    let storage = StorageFolder::memory();
    let manager = DeltaFileManager::new(DataFolder::new(dir.path())?)?;
    complete_part(&manager, GROUP_0)?;
    send_location(&manager, GROUP_0, 1)?;
    let record = common::block_record(&[(rel(), 5)], b"heap");
    manager.get_part_file(GROUP_0)?.lock().wal_heads[4] = Some(record[..30].to_vec());

    let summary = manager.flush_files(&uploader(&storage))?;
    assert!(summary.completed_part_files.is_empty());
    assert_eq!(vec![GROUP_0.to_string()], summary.canceled_delta_files);
    assert!(!storage.exists(GROUP_0)?);
    Ok(())
}

/// Group 0 is complete and group 1 still waits for segments; the storage
/// path for group 0 is taken by a directory so its upload fails.
fn flush_with_failing_upload(scratch: &std::path::Path) -> pgdelta::Result<pgdelta::delta::FlushSummary> {
    let storage_dir = tempdir()?;
    std::fs::create_dir(storage_dir.path().join(GROUP_0))?;
    let storage = StorageFolder::fs(storage_dir.path());

    let manager = DeltaFileManager::new(DataFolder::new(scratch)?)?;
    complete_part(&manager, GROUP_0)?;
    send_location(&manager, GROUP_0, 1)?;
    let recorder = WalPartRecorder::new("000000010000000000000013", &manager)?;
    recorder.save_previous_wal_tail(Vec::new())?;
    recorder.save_next_wal_head(vec![4, 5])?;
    send_location(&manager, GROUP_1, 42)?;
    manager.flush_files(&uploader(&storage))
}

#[test]
fn failed_upload_cancels_only_its_group() -> pgdelta::Result<()> {
    let scratch = tempdir()?;
    let summary = flush_with_failing_upload(scratch.path())?;
    assert!(summary.uploaded_delta_files.is_empty());
    assert_eq!(vec![GROUP_0.to_string()], summary.canceled_delta_files);
    assert_eq!(vec![GROUP_1.to_string()], summary.saved_delta_files);
    assert_eq!(vec![format!("{GROUP_1}_part")], summary.saved_part_files);

    let next = DeltaFileManager::new(DataFolder::new(scratch.path())?)?;
    assert_eq!(Some(vec![4, 5]), next.get_part_file(GROUP_1)?.lock().wal_heads[3]);
    assert_eq!(
        vec![BlockLocation::new(rel(), 42)],
        next.get_delta_file_writer(GROUP_1)?.snapshot().locations
    );
    // nothing of the canceled group is left to resume from
    assert!(!DataFolder::new(scratch.path())?.file_exists(&format!("{GROUP_0}_part")));
    assert!(!DataFolder::new(scratch.path())?.file_exists(GROUP_0));
    Ok(())
}

#[test]
fn part_file_is_dropped_when_its_delta_cannot_be_parked() -> pgdelta::Result<()> {
    let scratch = tempdir()?;
    let storage = StorageFolder::memory();
    let manager = DeltaFileManager::new(DataFolder::new(scratch.path())?)?;
    complete_part(&manager, GROUP_0)?;
    send_location(&manager, GROUP_0, 1)?;
    let recorder = WalPartRecorder::new("000000010000000000000013", &manager)?;
    recorder.save_previous_wal_tail(Vec::new())?;
    recorder.save_next_wal_head(vec![4, 5])?;
    send_location(&manager, GROUP_1, 42)?;
    // a directory survives cleaning and blocks the delta file
    std::fs::create_dir(scratch.path().join(GROUP_1))?;

    let summary = manager.flush_files(&uploader(&storage))?;
    assert_eq!(vec![GROUP_0.to_string()], summary.uploaded_delta_files);
    assert_eq!(vec![GROUP_1.to_string()], summary.canceled_delta_files);
    assert!(summary.saved_part_files.is_empty());
    assert!(!scratch.path().join(format!("{GROUP_1}_part")).exists());
    Ok(())
}
