//! CLI contract tests for pgdelta argument validation and command wiring.

#[path = "../common/mod.rs"]
mod common;

use pgdelta::Error;
use tempfile::tempdir;

fn expect_error(args: &[&str], expected: Error) {
    let err = pgdelta::run(args.iter().copied()).expect_err("command should fail");
    let actual = err
        .downcast_ref::<Error>()
        .unwrap_or_else(|| panic!("unexpected error type: {err:?}"));
    assert_eq!(
        std::mem::discriminant(actual),
        std::mem::discriminant(&expected),
        "unexpected error: {actual}"
    );
}

fn path_str(path: &std::path::Path) -> &str {
    path.to_str().expect("utf-8 temp path")
}

#[test]
fn command_definition_is_consistent() {
    pgdelta::cli::clap_command().debug_assert();
}

#[test]
fn no_subcommand_is_a_no_op() -> pgdelta::Result<()> {
    pgdelta::run(["pgdelta"])
}

#[test]
fn missing_or_malformed_arguments_are_cli_errors() {
    expect_error(&["pgdelta", "backup-fetch"], Error::Cli(String::new()));
    expect_error(&["pgdelta", "mount"], Error::Cli(String::new()));
    expect_error(
        &[
            "pgdelta",
            "backup-push",
            "-s",
            "/tmp/storage",
            "-D",
            "/tmp/data",
            "--start-lsn",
            "not-an-lsn",
            "--finish-lsn",
            "0/1000000",
        ],
        Error::Cli(String::new()),
    );
    expect_error(
        &["pgdelta", "wal-verify", "-s", "/tmp/storage", "--current-segment", "0000000100", "bogus"],
        Error::Cli(String::new()),
    );
}

#[test]
fn wal_verify_rejects_bad_current_segment() {
    let storage = tempdir().expect("storage dir");
    let err = pgdelta::run([
        "pgdelta",
        "wal-verify",
        "-s",
        path_str(storage.path()),
        "--current-segment",
        "00000001000000000000000Z",
    ])
    .expect_err("segment name must parse");
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::Cli(msg)) if msg.contains("00000001000000000000000Z")
    ));
}

#[test]
fn fetch_requires_empty_destination() {
    let storage = tempdir().expect("storage dir");
    let dest = tempdir().expect("destination");
    common::write_file(dest.path(), "keep.txt", b"occupied");
    expect_error(
        &[
            "pgdelta",
            "backup-fetch",
            "-s",
            path_str(storage.path()),
            "LATEST",
            path_str(dest.path()),
        ],
        Error::NonEmptyDataDirectory(String::new()),
    );
}

#[test]
fn fetch_of_empty_storage_reports_missing_backup() {
    let storage = tempdir().expect("storage dir");
    let dest = tempdir().expect("destination");
    expect_error(
        &[
            "pgdelta",
            "backup-fetch",
            "-s",
            path_str(storage.path()),
            "LATEST",
            path_str(&dest.path().join("pgdata")),
        ],
        Error::MissingBackup(String::new()),
    );
}

#[test]
fn push_list_fetch_and_verify_through_the_cli() -> pgdelta::Result<()> {
    let storage = tempdir()?;
    let data = tempdir()?;
    let restored = tempdir()?;
    let spool = tempdir()?;
    let storage_path = path_str(storage.path());

    common::write_file(data.path(), "base/5/16384", &common::relation_file(&[(0x0080_0000, 1), (0x0080_0000, 2)]));
    common::write_file(data.path(), "PG_VERSION", b"16\n");

    pgdelta::run([
        "pgdelta",
        "backup-push",
        "-s",
        storage_path,
        "-D",
        path_str(data.path()),
        "--start-lsn",
        "0/1000028",
        "--finish-lsn",
        "0/1002000",
        "--pg-version",
        "160002",
    ])?;
    assert!(storage
        .path()
        .join("basebackups_005/base_000000010000000000000001_backup_stop_sentinel.json")
        .is_file());
    pgdelta::run(["pgdelta", "backup-list", "-s", storage_path])?;

    let dest = restored.path().join("pgdata");
    pgdelta::run([
        "pgdelta",
        "backup-fetch",
        "-s",
        storage_path,
        "LATEST",
        path_str(&dest),
        "--skip-redundant-tars",
    ])?;
    assert_eq!(common::tree_contents(data.path()), common::tree_contents(&dest));

    let forward = restored.path().join("forward");
    pgdelta::run([
        "pgdelta",
        "backup-fetch",
        "-s",
        storage_path,
        "base_000000010000000000000001",
        path_str(&forward),
        "--mode",
        "forward",
    ])?;
    assert_eq!(common::tree_contents(data.path()), common::tree_contents(&forward));

    let wal = common::write_file(spool.path(), "000000010000000000000001", &[0u8; 64]);
    pgdelta::run(["pgdelta", "wal-push", "-s", storage_path, path_str(&wal)])?;
    assert!(storage
        .path()
        .join("wal_005/000000010000000000000001.lz4")
        .is_file());

    pgdelta::run([
        "pgdelta",
        "wal-verify",
        "-s",
        storage_path,
        "--current-segment",
        "000000010000000000000002",
        "--json",
        "integrity",
    ])?;
    Ok(())
}
