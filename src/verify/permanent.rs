//! WAL segments that permanent backups keep alive.

use std::collections::HashSet;

use tracing::warn;

use crate::backup::metadata::{list_backups, Backup, BackupSentinel};
use crate::storage::{StorageFolder, BASEBACKUPS_FOLDER};
use crate::Result;

/// Segment filenames from the one holding `start_lsn - 1` through the one
/// holding `finish_lsn - 1`.
pub fn permanent_backup_wal_segments(sentinel: &BackupSentinel) -> Vec<String> {
    let (first, last) = sentinel.wal_segment_range();
    let mut names = Vec::new();
    let mut no = first;
    while no <= last {
        names.push(no.filename(sentinel.timeline));
        no = no.next();
    }
    names
}

/// Segments needed by every permanent backup in storage.
pub fn permanent_wal_segments(storage: &StorageFolder) -> Result<HashSet<String>> {
    let base_folder = storage.sub_folder(BASEBACKUPS_FOLDER);
    let mut segments = HashSet::new();
    for (name, _) in list_backups(&base_folder)? {
        let sentinel = match Backup::new(&base_folder, &name).fetch_sentinel() {
            Ok(sentinel) => sentinel,
            Err(err) => {
                warn!(backup = %name, error = %format!("{err:#}"), "sentinel_unreadable");
                continue;
            }
        };
        if sentinel.is_permanent {
            segments.extend(permanent_backup_wal_segments(&sentinel));
        }
    }
    Ok(segments)
}
