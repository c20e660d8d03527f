//! Backup naming, sentinels and chain resolution.

use std::collections::HashSet;

use tempfile::tempdir;
use time::macros::datetime;

use pgdelta::backup::metadata::{
    backup_name, choose_tablespace_specification, get_base_files_to_unwrap,
    get_restored_backup_files_to_unwrap, list_backups, parse_backup_name, resolve_backup_name,
    Backup, BackupFileDescription, BackupSentinel, ExtendedMetadata, TablespaceSpec,
    LATEST_BACKUP, SENTINEL_SUFFIX,
};
use pgdelta::backup::{BackupChain, ChainIntegrity};
use pgdelta::pg::{Lsn, WalSegmentDescription, WalSegmentNo, WAL_SEGMENT_SIZE};
use pgdelta::storage::StorageFolder;
use pgdelta::Error;

fn seg(timeline: u32, no: u64) -> WalSegmentDescription {
    WalSegmentDescription::new(timeline, WalSegmentNo(no))
}

fn description(is_incremented: bool, is_skipped: bool) -> BackupFileDescription {
    BackupFileDescription::new(is_incremented, is_skipped, datetime!(2024-03-01 12:00 UTC))
}

fn expect_error<T: std::fmt::Debug>(result: pgdelta::Result<T>, expected: Error) {
    let err = result.expect_err("operation should fail");
    let actual = err
        .downcast_ref::<Error>()
        .unwrap_or_else(|| panic!("unexpected error type: {err:?}"));
    assert_eq!(
        std::mem::discriminant(actual),
        std::mem::discriminant(&expected)
    );
}

#[test]
fn full_and_delta_names() -> pgdelta::Result<()> {
    let full = backup_name(&seg(1, 3), None);
    assert_eq!("base_000000010000000000000003", full);
    let delta = backup_name(&seg(1, 0x1A), Some(&full));
    assert_eq!(
        "base_00000001000000000000001A_D_000000010000000000000003",
        delta
    );
    assert_eq!(seg(1, 3), parse_backup_name(&full)?);
    assert_eq!(seg(1, 0x1A), parse_backup_name(&delta)?);
    expect_error(parse_backup_name("backup_1"), Error::InvalidBackupName(String::new()));
    Ok(())
}

#[test]
fn corrupt_block_list_is_capped() {
    let mut desc = description(false, false);
    desc.set_corrupt_blocks(Vec::new(), false);
    assert!(desc.corrupt_blocks.is_none());

    desc.set_corrupt_blocks((0..15).collect(), false);
    let info = desc.corrupt_blocks.clone().expect("corrupt blocks recorded");
    assert_eq!(15, info.corrupt_blocks_count);
    assert_eq!((0..10).collect::<Vec<u32>>(), info.some_corrupt_blocks);

    desc.set_corrupt_blocks((0..15).collect(), true);
    assert_eq!(15, desc.corrupt_blocks.expect("all blocks").some_corrupt_blocks.len());
}

#[test]
fn sentinel_round_trips_through_storage() -> pgdelta::Result<()> {
    let storage = StorageFolder::memory();
    let mut sentinel = BackupSentinel {
        start_lsn: Lsn(0x0300_0028),
        finish_lsn: Lsn(0x0300_1000),
        timeline: 1,
        increment_from: Some("base_000000010000000000000001".into()),
        increment_from_lsn: Some(Lsn(0x0100_0028)),
        increment_full_name: Some("base_000000010000000000000001".into()),
        increment_count: Some(1),
        pg_version: Some(160002),
        ..Default::default()
    };
    sentinel
        .files
        .insert("base/5/16384".into(), description(true, false));
    let backup = Backup::new(&storage, "base_000000010000000000000003");
    backup.upload_sentinel(&sentinel)?;

    let raw = storage.read_all(&format!("base_000000010000000000000003{SENTINEL_SUFFIX}"))?;
    let json: serde_json::Value = serde_json::from_slice(&raw)?;
    assert_eq!("0/3000028", json["start_lsn"]);
    assert_eq!("0/1000028", json["increment_from_lsn"]);
    assert!(json.get("tablespace_spec").is_none());

    assert_eq!(sentinel, backup.fetch_sentinel()?);
    assert!(sentinel.is_incremental());
    Ok(())
}

#[test]
fn extended_metadata_round_trips() -> pgdelta::Result<()> {
    let storage = StorageFolder::memory();
    let meta = ExtendedMetadata {
        start_lsn: Lsn(0x0100_0028),
        finish_lsn: Lsn(0x0100_2000),
        start_time: datetime!(2024-03-01 12:00 UTC),
        finish_time: datetime!(2024-03-01 12:05:30.25 UTC),
        is_permanent: false,
        hostname: "db1".into(),
        data_dir: "/var/lib/postgresql/data".into(),
        uncompressed_size: 8192,
        compressed_size: 1024,
        increment_from: None,
    };
    let backup = Backup::new(&storage, "base_000000010000000000000001");
    backup.upload_meta(&meta)?;
    assert_eq!(meta, backup.fetch_meta()?);
    Ok(())
}

#[test]
fn missing_sentinel_is_missing_backup() {
    let storage = StorageFolder::memory();
    expect_error(
        Backup::new(&storage, "base_000000010000000000000009").fetch_sentinel(),
        Error::MissingBackup(String::new()),
    );
}

#[test]
fn latest_resolves_to_newest_backup() -> pgdelta::Result<()> {
    let storage = StorageFolder::memory();
    expect_error(
        resolve_backup_name(&storage, LATEST_BACKUP),
        Error::MissingBackup(String::new()),
    );

    for no in [1u64, 3] {
        let name = backup_name(&seg(1, no), None);
        Backup::new(&storage, &name).upload_sentinel(&BackupSentinel::default())?;
    }
    storage.put_bytes("unrelated.json", b"{}")?;

    let listed: Vec<String> = list_backups(&storage)?.into_iter().map(|(n, _)| n).collect();
    assert_eq!(
        vec![
            "base_000000010000000000000001".to_string(),
            "base_000000010000000000000003".to_string()
        ],
        listed
    );
    assert_eq!(
        "base_000000010000000000000003",
        resolve_backup_name(&storage, LATEST_BACKUP)?
    );
    assert_eq!("base_x", resolve_backup_name(&storage, "base_x")?);
    Ok(())
}

#[test]
fn base_files_are_the_skipped_and_incremented_ones() -> pgdelta::Result<()> {
    let mut sentinel = BackupSentinel::default();
    sentinel.files.insert("base/5/16384".into(), description(true, false));
    sentinel.files.insert("base/5/16390".into(), description(false, true));
    sentinel.files.insert("PG_VERSION".into(), description(false, false));

    let to_unwrap = get_restored_backup_files_to_unwrap(&sentinel);
    assert!(to_unwrap.contains("backup_label"));
    assert!(to_unwrap.contains("tablespace_map"));
    assert_eq!(5, to_unwrap.len());

    let base = get_base_files_to_unwrap(&sentinel.files, &to_unwrap)?;
    let expected: HashSet<String> = ["base/5/16384", "base/5/16390"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(expected, base);

    let mut unknown = to_unwrap.clone();
    unknown.insert("base/5/77777".into());
    expect_error(
        get_base_files_to_unwrap(&sentinel.files, &unknown),
        Error::MissingFileDescription(String::new()),
    );
    Ok(())
}

#[test]
fn permanent_range_covers_start_and_finish_segments() {
    let sentinel = BackupSentinel {
        start_lsn: Lsn(4 * WAL_SEGMENT_SIZE),
        finish_lsn: Lsn(6 * WAL_SEGMENT_SIZE + 5),
        ..Default::default()
    };
    assert_eq!((WalSegmentNo(3), WalSegmentNo(6)), sentinel.wal_segment_range());
}

#[test]
fn restore_spec_overrides_recorded_tablespaces() -> pgdelta::Result<()> {
    let dir = tempdir()?;
    let mut recorded = TablespaceSpec {
        base_prefix: "/var/lib/postgresql/data".into(),
        ..Default::default()
    };
    recorded.add("pg_tblspc/16500", "/mnt/fast/ts1");

    let spec_path = dir.path().join("restore_spec.json");
    std::fs::write(
        &spec_path,
        r#"{"base_prefix":"/restore","tablespaces":[{"location":"/restore/ts1","symlink":"pg_tblspc/16500"}]}"#,
    )?;
    let explicit = TablespaceSpec::read_restore_spec(&spec_path)?;

    let chosen = choose_tablespace_specification(Some(recorded.clone()), Some(explicit))
        .expect("a spec is chosen");
    assert_eq!(Some("/restore/ts1"), chosen.location_for("pg_tblspc/16500"));
    let fallback = choose_tablespace_specification(Some(recorded), None).expect("recorded spec");
    assert_eq!(Some("/mnt/fast/ts1"), fallback.location_for("pg_tblspc/16500"));
    assert_eq!(None, fallback.location_for("pg_tblspc/1"));
    Ok(())
}

fn store_chain_link(storage: &StorageFolder, name: &str, parent: Option<&str>) -> pgdelta::Result<()> {
    let sentinel = BackupSentinel {
        increment_from: parent.map(String::from),
        ..Default::default()
    };
    Backup::new(storage, name).upload_sentinel(&sentinel)
}

#[test]
fn chain_is_ordered_oldest_first() -> pgdelta::Result<()> {
    let storage = StorageFolder::memory();
    store_chain_link(&storage, "base_full", None)?;
    store_chain_link(&storage, "base_d1", Some("base_full"))?;
    store_chain_link(&storage, "base_d2", Some("base_d1"))?;

    let chain = BackupChain::from_target_backup(&storage, "base_d2")?;
    let names: Vec<&str> = chain.elements.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(vec!["base_full", "base_d1", "base_d2"], names);
    assert!(chain.is_complete());
    assert_eq!(Some("base_full"), chain.base().map(|e| e.name.as_str()));
    Ok(())
}

#[test]
fn chain_with_deleted_base_is_incomplete() -> pgdelta::Result<()> {
    let storage = StorageFolder::memory();
    store_chain_link(&storage, "base_d1", Some("base_gone"))?;
    store_chain_link(&storage, "base_d2", Some("base_d1"))?;

    let chain = BackupChain::from_target_backup(&storage, "base_d2")?;
    assert_eq!(ChainIntegrity::Incomplete, chain.integrity_state);
    assert_eq!(2, chain.elements.len());
    assert_eq!("base_d1", chain.elements[0].name);
    Ok(())
}

#[test]
fn chain_cycles_and_missing_targets_are_errors() -> pgdelta::Result<()> {
    let storage = StorageFolder::memory();
    store_chain_link(&storage, "base_a", Some("base_b"))?;
    store_chain_link(&storage, "base_b", Some("base_a"))?;
    expect_error(
        BackupChain::from_target_backup(&storage, "base_a"),
        Error::ChainCycle(String::new()),
    );
    expect_error(
        BackupChain::from_target_backup(&storage, "base_none"),
        Error::MissingBackup(String::new()),
    );
    Ok(())
}
