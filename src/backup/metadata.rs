use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use crate::pg::{Lsn, WalSegmentDescription, WalSegmentNo};
use crate::storage::{Folder, StorageFolder};
use crate::{Error, Result};

pub const SENTINEL_SUFFIX: &str = "_backup_stop_sentinel.json";
pub const METADATA_FILENAME: &str = "metadata.json";
pub const TAR_PARTITIONS_FOLDER: &str = "tar_partitions";
pub const BACKUP_NAME_PREFIX: &str = "base_";
pub const DELTA_NAME_SEPARATOR: &str = "_D_";
pub const LATEST_BACKUP: &str = "LATEST";
pub const MAX_CORRUPT_BLOCKS_IN_FILE_DESCRIPTION: usize = 10;

/// Files restored from the newest backup even when no older backup lists them.
const UTILITY_FILES: &[&str] = &["backup_label", "tablespace_map"];

pub fn is_utility_file(name: &str) -> bool {
    UTILITY_FILES.contains(&name)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorruptBlocksInfo {
    pub corrupt_blocks_count: usize,
    pub some_corrupt_blocks: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupFileDescription {
    pub is_incremented: bool,
    pub is_skipped: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub mtime: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrupt_blocks: Option<CorruptBlocksInfo>,
    #[serde(default)]
    pub update_count: u64,
}

impl BackupFileDescription {
    pub fn new(is_incremented: bool, is_skipped: bool, mtime: OffsetDateTime) -> Self {
        Self {
            is_incremented,
            is_skipped,
            mtime,
            corrupt_blocks: None,
            update_count: 0,
        }
    }

    /// Keeps every block number when `store_all` is set, otherwise the first few.
    pub fn set_corrupt_blocks(&mut self, mut blocks: Vec<u32>, store_all: bool) {
        if blocks.is_empty() {
            return;
        }
        let count = blocks.len();
        if !store_all {
            blocks.truncate(MAX_CORRUPT_BLOCKS_IN_FILE_DESCRIPTION);
        }
        self.corrupt_blocks = Some(CorruptBlocksInfo {
            corrupt_blocks_count: count,
            some_corrupt_blocks: blocks,
        });
    }
}

pub type BackupFileList = BTreeMap<String, BackupFileDescription>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TablespaceLocation {
    pub location: String,
    pub symlink: String,
}

/// Where the named tablespaces of a cluster live, keyed by their
/// `pg_tblspc/<oid>` link name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TablespaceSpec {
    #[serde(default)]
    pub base_prefix: String,
    #[serde(default)]
    pub tablespaces: Vec<TablespaceLocation>,
}

impl TablespaceSpec {
    pub fn is_empty(&self) -> bool {
        self.tablespaces.is_empty()
    }

    pub fn add(&mut self, symlink: impl Into<String>, location: impl Into<String>) {
        self.tablespaces.push(TablespaceLocation {
            location: location.into(),
            symlink: symlink.into(),
        });
    }

    pub fn location_for(&self, symlink: &str) -> Option<&str> {
        self.tablespaces
            .iter()
            .find(|t| t.symlink == symlink)
            .map(|t| t.location.as_str())
    }

    pub fn read_restore_spec(path: &Path) -> Result<Self> {
        debug!(spec = %path.display(), "reading_restore_spec");
        Ok(serde_json::from_slice(&std::fs::read(path)?)?)
    }
}

/// An explicit restore spec wins over the one recorded by the backup.
pub fn choose_tablespace_specification(
    from_sentinel: Option<TablespaceSpec>,
    explicit: Option<TablespaceSpec>,
) -> Option<TablespaceSpec> {
    explicit.or(from_sentinel)
}

/// Manifest uploaded when a backup finishes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupSentinel {
    pub start_lsn: Lsn,
    pub finish_lsn: Lsn,
    pub timeline: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub increment_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub increment_from_lsn: Option<Lsn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub increment_full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub increment_count: Option<u32>,
    #[serde(default)]
    pub is_permanent: bool,
    #[serde(default)]
    pub files: BackupFileList,
    /// Files packed into each tar partition, keyed by object name.
    #[serde(default)]
    pub tar_file_sets: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tablespace_spec: Option<TablespaceSpec>,
    #[serde(default)]
    pub uncompressed_size: u64,
    #[serde(default)]
    pub compressed_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pg_version: Option<u32>,
}

impl BackupSentinel {
    pub fn is_incremental(&self) -> bool {
        self.increment_from.is_some()
    }

    /// WAL segments needed to make this backup consistent.
    pub fn wal_segment_range(&self) -> (WalSegmentNo, WalSegmentNo) {
        (
            WalSegmentNo::from_lsn(self.start_lsn.saturating_sub(1)),
            WalSegmentNo::from_lsn(self.finish_lsn.saturating_sub(1)),
        )
    }
}

/// Summary stored next to the tar partitions, read by retention and listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtendedMetadata {
    pub start_lsn: Lsn,
    pub finish_lsn: Lsn,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finish_time: OffsetDateTime,
    pub is_permanent: bool,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub data_dir: String,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub increment_from: Option<String>,
}

/// `base_<start WAL>` for full backups, `base_<start WAL>_D_<base start WAL>`
/// for deltas.
pub fn backup_name(start: &WalSegmentDescription, base: Option<&str>) -> String {
    let own = format!("{BACKUP_NAME_PREFIX}{}", start.filename());
    match base {
        Some(base) => {
            let base_wal = base
                .strip_prefix(BACKUP_NAME_PREFIX)
                .map(|rest| &rest[..rest.len().min(24)])
                .unwrap_or(base);
            format!("{own}{DELTA_NAME_SEPARATOR}{base_wal}")
        }
        None => own,
    }
}

/// Start segment encoded in a backup name.
pub fn parse_backup_name(name: &str) -> Result<WalSegmentDescription> {
    let invalid = || Error::InvalidBackupName(name.to_string());
    let rest = name.strip_prefix(BACKUP_NAME_PREFIX).ok_or_else(invalid)?;
    let wal = rest.get(..24).ok_or_else(invalid)?;
    WalSegmentDescription::parse(wal).map_err(|_| invalid().into())
}

/// Handle to one backup in the `basebackups_005` folder. Only the name is
/// held; metadata is fetched on demand.
#[derive(Debug, Clone)]
pub struct Backup {
    pub name: String,
    base_folder: StorageFolder,
}

impl Backup {
    pub fn new(base_folder: &StorageFolder, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_folder: base_folder.clone(),
        }
    }

    pub fn sentinel_name(&self) -> String {
        format!("{}{SENTINEL_SUFFIX}", self.name)
    }

    pub fn fetch_sentinel(&self) -> Result<BackupSentinel> {
        let name = self.sentinel_name();
        if !self.base_folder.exists(&name)? {
            return Err(Error::MissingBackup(self.name.clone()).into());
        }
        let sentinel = serde_json::from_slice(&self.base_folder.read_all(&name)?)?;
        debug!(backup = %self.name, "sentinel_fetched");
        Ok(sentinel)
    }

    pub fn fetch_meta(&self) -> Result<ExtendedMetadata> {
        let folder = self.base_folder.sub_folder(&self.name);
        Ok(serde_json::from_slice(&folder.read_all(METADATA_FILENAME)?)?)
    }

    pub fn upload_sentinel(&self, sentinel: &BackupSentinel) -> Result<()> {
        self.base_folder
            .put_bytes(&self.sentinel_name(), &serde_json::to_vec_pretty(sentinel)?)
    }

    pub fn upload_meta(&self, meta: &ExtendedMetadata) -> Result<()> {
        self.base_folder
            .sub_folder(&self.name)
            .put_bytes(METADATA_FILENAME, &serde_json::to_vec_pretty(meta)?)
    }

    pub fn tar_folder(&self) -> StorageFolder {
        self.base_folder
            .sub_folder(&self.name)
            .sub_folder(TAR_PARTITIONS_FOLDER)
    }

    pub fn tar_names(&self) -> Result<Vec<String>> {
        let (objects, _) = self.tar_folder().list_folder()?;
        let mut names: Vec<String> = objects.into_iter().map(|o| o.name).collect();
        names.sort_by_key(|name| tar_partition_number(name));
        Ok(names)
    }
}

fn tar_partition_number(name: &str) -> (u64, String) {
    let number = name
        .strip_prefix("part_")
        .and_then(|rest| rest.split('.').next())
        .and_then(|n| n.parse().ok())
        .unwrap_or(u64::MAX);
    (number, name.to_string())
}

/// Names of every backup with a sentinel, oldest modification first.
pub fn list_backups(base_folder: &StorageFolder) -> Result<Vec<(String, OffsetDateTime)>> {
    let (objects, _) = base_folder.list_folder()?;
    let mut backups: Vec<(String, OffsetDateTime)> = objects
        .into_iter()
        .filter_map(|o| {
            o.name
                .strip_suffix(SENTINEL_SUFFIX)
                .map(|name| (name.to_string(), o.last_modified))
        })
        .collect();
    backups.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    Ok(backups)
}

/// Resolves `LATEST` to the most recently finished backup.
pub fn resolve_backup_name(base_folder: &StorageFolder, name: &str) -> Result<String> {
    if name != LATEST_BACKUP {
        return Ok(name.to_string());
    }
    list_backups(base_folder)?
        .pop()
        .map(|(name, _)| name)
        .ok_or_else(|| Error::MissingBackup(LATEST_BACKUP.to_string()).into())
}

/// Files that must come from the base of a backup: those the backup skipped
/// or stored as increments.
pub fn get_base_files_to_unwrap(
    files: &BackupFileList,
    current_to_unwrap: &HashSet<String>,
) -> Result<HashSet<String>> {
    let mut base = HashSet::new();
    for name in current_to_unwrap {
        match files.get(name) {
            Some(desc) if desc.is_skipped || desc.is_incremented => {
                base.insert(name.clone());
            }
            Some(_) => {}
            None if is_utility_file(name) => {}
            None => return Err(Error::MissingFileDescription(name.clone()).into()),
        }
    }
    Ok(base)
}

/// Every file of the target backup, plus the utility files it may carry.
pub fn get_restored_backup_files_to_unwrap(sentinel: &BackupSentinel) -> HashSet<String> {
    sentinel
        .files
        .keys()
        .cloned()
        .chain(UTILITY_FILES.iter().map(|f| f.to_string()))
        .collect()
}
