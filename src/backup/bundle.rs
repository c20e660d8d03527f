//! Backup push: walks a data directory and uploads it as tar partitions plus
//! a sentinel, incrementally against a base backup when one is named.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use crossbeam_channel::{bounded, Receiver};
use tar::Header;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::compression::CompressionRegistry;
use crate::config::Settings;
use crate::delta::DeltaMap;
use crate::logging::{log_backup_push, BackupPushSnapshot};
use crate::pg::relfile::is_paged_file;
use crate::pg::{Lsn, WalSegmentDescription, WalSegmentNo};
use crate::storage::{StorageFolder, BASEBACKUPS_FOLDER, WAL_FOLDER};
use crate::upload::Uploader;
use crate::Result;

use super::metadata::{
    backup_name, resolve_backup_name, Backup, BackupSentinel, ExtendedMetadata, TablespaceSpec,
};
use super::packer::{
    BundleFiles, ComposeFileInfo, PackerOptions, RelFileStatistics, TarBallFilePacker,
};
use super::tarball::TarBallMaker;

/// Runtime state of a running cluster that never goes into a backup. Excluded
/// directories are recorded empty.
pub const EXCLUDED_FILENAMES: &[&str] = &[
    "pg_log",
    "pg_xlog",
    "pg_wal",
    "pgsql_tmp",
    "postgresql.auto.conf.tmp",
    "postmaster.pid",
    "postmaster.opts",
    "recovery.conf",
    "pg_dynshmem",
    "pg_notify",
    "pg_replslot",
    "pg_serial",
    "pg_stat_tmp",
    "pg_snapshots",
    "pg_subtrans",
];

const TABLESPACE_FOLDER: &str = "pg_tblspc";

fn is_excluded(name: &str) -> bool {
    EXCLUDED_FILENAMES.contains(&name)
}

#[derive(Debug, Clone)]
pub struct BackupPushRequest {
    pub data_dir: PathBuf,
    /// Position returned by `pg_backup_start`.
    pub start_lsn: Lsn,
    /// Position returned by `pg_backup_stop`.
    pub finish_lsn: Lsn,
    pub timeline: u32,
    /// Base backup name, or `LATEST`.
    pub delta_from: Option<String>,
    pub is_permanent: bool,
    pub rel_stats: Option<RelFileStatistics>,
    pub pg_version: Option<u32>,
}

impl BackupPushRequest {
    pub fn full(data_dir: impl Into<PathBuf>, start_lsn: Lsn, finish_lsn: Lsn, timeline: u32) -> Self {
        Self {
            data_dir: data_dir.into(),
            start_lsn,
            finish_lsn,
            timeline,
            delta_from: None,
            is_permanent: false,
            rel_stats: None,
            pg_version: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupPushResult {
    pub name: String,
    pub sentinel: BackupSentinel,
}

struct DirectoryEntry {
    name: String,
    mode: u32,
    mtime: OffsetDateTime,
}

#[derive(Default)]
struct WalkedTree {
    directories: Vec<DirectoryEntry>,
    files: Vec<ComposeFileInfo>,
    tablespaces: TablespaceSpec,
}

fn join_name(prefix: &str, relative: &Path) -> String {
    let relative = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if prefix.is_empty() {
        relative
    } else if relative.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}/{relative}")
    }
}

fn walk_tree(root: &Path, prefix: &str, tree: &mut WalkedTree) -> Result<()> {
    let mut entries = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();
    while let Some(entry) = entries.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                if err.io_error().map(|e| e.kind()) == Some(std::io::ErrorKind::NotFound) {
                    warn!(error = %err, "deleted_during_walk");
                    continue;
                }
                return Err(anyhow::Error::new(err).context("walking data directory"));
            }
        };
        let file_name = entry.file_name().to_string_lossy().to_string();
        let relative = entry.path().strip_prefix(root)?;
        let name = join_name(prefix, relative);
        let excluded = is_excluded(&file_name);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let in_tablespaces = relative.parent().map(|p| p == Path::new(TABLESPACE_FOLDER));
            if prefix.is_empty() && in_tablespaces == Some(true) {
                let target = fs::read_link(entry.path())?;
                let location = if target.is_absolute() {
                    target
                } else {
                    entry.path().parent().unwrap_or(root).join(target)
                };
                debug!(symlink = %name, location = %location.display(), "tablespace_found");
                tree.tablespaces.add(&name, location.display().to_string());
                walk_tree(&location, &name, tree)?;
            } else {
                warn!(file = %name, "symlink_not_backed_up");
            }
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(file = %name, error = %err, "deleted_during_walk");
                continue;
            }
        };
        let mtime = metadata
            .modified()
            .map(OffsetDateTime::from)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let mode = metadata.permissions().mode() & 0o7777;

        if file_type.is_dir() {
            tree.directories.push(DirectoryEntry { name, mode, mtime });
            if excluded {
                entries.skip_current_dir();
            }
        } else if file_type.is_file() && !excluded {
            tree.files.push(ComposeFileInfo {
                path: entry.path().to_path_buf(),
                name,
                file_size: metadata.len(),
                mtime,
                mode,
                is_incremented: false,
            });
        }
    }
    Ok(())
}

fn walk_data_directory(data_dir: &Path) -> Result<WalkedTree> {
    let mut tree = WalkedTree::default();
    walk_tree(data_dir, "", &mut tree)
        .with_context(|| format!("walking {}", data_dir.display()))?;
    tree.tablespaces.base_prefix = data_dir.display().to_string();
    Ok(tree)
}

fn pack_worker(
    maker: &TarBallMaker,
    packer: &TarBallFilePacker,
    receiver: Receiver<ComposeFileInfo>,
    tar_size_threshold: u64,
) -> Result<()> {
    let mut tar = maker.make();
    for mut file in receiver {
        packer.pack_file_into_tar(&mut file, &mut tar)?;
        if tar.size() >= tar_size_threshold {
            let full = std::mem::replace(&mut tar, maker.make());
            maker.finish(full)?;
        }
    }
    if !tar.files().is_empty() {
        maker.finish(tar)?;
    }
    Ok(())
}

/// Uploads a backup of `request.data_dir` into `storage`.
pub fn push_backup(
    storage: &StorageFolder,
    registry: Arc<CompressionRegistry>,
    settings: &Settings,
    request: BackupPushRequest,
) -> Result<BackupPushResult> {
    let base_folder = storage.sub_folder(BASEBACKUPS_FOLDER);
    let wal_folder = storage.sub_folder(WAL_FOLDER);
    let start_time = OffsetDateTime::now_utc();

    let base = match &request.delta_from {
        Some(requested) => {
            let name = resolve_backup_name(&base_folder, requested)?;
            let sentinel = Backup::new(&base_folder, &name)
                .fetch_sentinel()
                .with_context(|| format!("fetching base backup {name}"))?;
            Some((name, sentinel))
        }
        None => None,
    };

    let start = WalSegmentDescription::new(request.timeline, WalSegmentNo::from_lsn(request.start_lsn));
    let name = backup_name(&start, base.as_ref().map(|(n, _)| n.as_str()));
    info!(
        backup = %name,
        increment_from = base.as_ref().map(|(n, _)| n.as_str()).unwrap_or("none"),
        start_lsn = %request.start_lsn,
        "backup_push_started"
    );

    let delta_map = match &base {
        Some((_, sentinel)) if settings.use_wal_delta => match DeltaMap::load(
            &wal_folder,
            &registry,
            request.timeline,
            sentinel.start_lsn,
            request.start_lsn,
        ) {
            Ok(map) => Some(Arc::new(map)),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "delta_map_unavailable_using_full_scan");
                None
            }
        },
        _ => None,
    };

    let tree = walk_data_directory(&request.data_dir)?;
    let files = Arc::new(BundleFiles::new(request.rel_stats.clone()));
    let mut to_pack = Vec::with_capacity(tree.files.len());
    for mut file in tree.files {
        if let Some((_, sentinel)) = &base {
            if let Some(previous) = sentinel.files.get(&file.name) {
                if previous.mtime == file.mtime {
                    files.add_skipped_file(&file);
                    continue;
                }
                file.is_incremented = is_paged_file(Path::new(&file.name));
            }
        }
        to_pack.push(file);
    }

    let uploader = Uploader::new(
        base_folder.sub_folder(&name),
        Arc::clone(&registry),
        settings.compression_method,
    );
    let maker = TarBallMaker::new(&uploader);

    let mut directories = maker.make();
    for dir in &tree.directories {
        let mut header = Header::new_gnu();
        header.set_mode(dir.mode);
        header.set_mtime(dir.mtime.unix_timestamp().max(0) as u64);
        directories.append_directory(&dir.name, &mut header)?;
    }
    maker.finish(directories)?;

    let packer = TarBallFilePacker::new(
        delta_map,
        base.as_ref().map(|(_, s)| s.start_lsn),
        Arc::clone(&files),
        PackerOptions {
            verify_page_checksums: settings.verify_page_checksums,
            store_all_corrupt_blocks: settings.store_all_corrupt_blocks,
        },
    );
    let workers = settings.upload_concurrency.max(1);
    let threshold = settings.tar_size_threshold;
    let (sender, receiver) = bounded::<ComposeFileInfo>(workers);
    let results: Vec<Result<()>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let receiver = receiver.clone();
                let maker = &maker;
                let packer = &packer;
                scope.spawn(move || pack_worker(maker, packer, receiver, threshold))
            })
            .collect();
        drop(receiver);
        for file in to_pack {
            if sender.send(file).is_err() {
                break;
            }
        }
        drop(sender);
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("packing worker panicked")))
            })
            .collect()
    });
    for result in results {
        result?;
    }

    let file_list = files.to_file_list();
    let counters = uploader.counters();
    let (increment_from, increment_from_lsn, increment_full_name, increment_count) = match &base {
        Some((base_name, sentinel)) => (
            Some(base_name.clone()),
            Some(sentinel.start_lsn),
            Some(
                sentinel
                    .increment_full_name
                    .clone()
                    .unwrap_or_else(|| base_name.clone()),
            ),
            Some(sentinel.increment_count.unwrap_or(0) + 1),
        ),
        None => (None, None, None, None),
    };
    let sentinel = BackupSentinel {
        start_lsn: request.start_lsn,
        finish_lsn: request.finish_lsn,
        timeline: request.timeline,
        increment_from,
        increment_from_lsn,
        increment_full_name,
        increment_count,
        is_permanent: request.is_permanent,
        files: file_list,
        tar_file_sets: maker.tar_file_sets(),
        tablespace_spec: (!tree.tablespaces.is_empty()).then(|| tree.tablespaces.clone()),
        uncompressed_size: counters.uncompressed_size(),
        compressed_size: counters.compressed_size(),
        pg_version: request.pg_version,
    };

    let backup = Backup::new(&base_folder, &name);
    backup.upload_meta(&ExtendedMetadata {
        start_lsn: request.start_lsn,
        finish_lsn: request.finish_lsn,
        start_time,
        finish_time: OffsetDateTime::now_utc(),
        is_permanent: request.is_permanent,
        hostname: std::env::var("HOSTNAME").unwrap_or_default(),
        data_dir: request.data_dir.display().to_string(),
        uncompressed_size: sentinel.uncompressed_size,
        compressed_size: sentinel.compressed_size,
        increment_from: sentinel.increment_from.clone(),
    })?;
    // the sentinel marks the backup as finished, so it goes last
    backup.upload_sentinel(&sentinel)?;

    log_backup_push(
        &name,
        BackupPushSnapshot {
            files_total: sentinel.files.len(),
            files_incremented: sentinel.files.values().filter(|f| f.is_incremented).count(),
            files_skipped: sentinel.files.values().filter(|f| f.is_skipped).count(),
            corrupt_blocks: sentinel
                .files
                .values()
                .filter_map(|f| f.corrupt_blocks.as_ref())
                .map(|c| c.corrupt_blocks_count)
                .sum(),
            tar_partitions: sentinel.tar_file_sets.len(),
            uncompressed_bytes: sentinel.uncompressed_size,
            compressed_bytes: sentinel.compressed_size,
        },
    );

    Ok(BackupPushResult { name, sentinel })
}
