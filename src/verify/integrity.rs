use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backup::metadata::{list_backups, parse_backup_name, Backup};
use crate::compression::CompressionRegistry;
use crate::pg::history::{history_filename, parse_history_file};
use crate::pg::{WalSegmentDescription, WalSegmentNo};
use crate::storage::{StorageFolder, BASEBACKUPS_FOLDER, WAL_FOLDER};
use crate::{Error, Result};

use super::runner::{
    segments_from_filenames, timeline_switch_map, ScannedSegmentDescription,
    ScannedSegmentStatus, SegmentScanConfig, TimelineSwitchMap, WalSegmentRunner,
    WalSegmentScanner,
};
use super::{CheckDetails, CheckStatus, WalVerifyCheckResult};

/// A run of consecutive segments sharing a timeline and a status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityScanSegmentSequence {
    pub timeline_id: u32,
    pub start_segment: String,
    pub end_segment: String,
    pub segments_count: usize,
    pub status: ScannedSegmentStatus,
}

/// Walks archived WAL backward from the cluster's current segment down to
/// the start of the earliest usable backup, classifying every gap.
#[derive(Debug)]
pub struct IntegrityCheckRunner {
    start_segment: WalSegmentDescription,
    stop_segment_no: WalSegmentNo,
    uploading_segment_range_size: usize,
    delayed_segment_range_size: usize,
    wal_folder_filenames: Vec<String>,
    switch_map: TimelineSwitchMap,
    no_backups_found: bool,
}

/// Switch map from the current timeline's history file; empty when the
/// cluster never switched timelines.
pub fn load_timeline_switch_map(
    wal_folder: &StorageFolder,
    registry: &CompressionRegistry,
    timeline: u32,
) -> Result<TimelineSwitchMap> {
    let name = history_filename(timeline);
    let bytes = match registry.download_all(wal_folder, &name) {
        Ok(bytes) => bytes,
        Err(err) if matches!(err.downcast_ref::<Error>(), Some(Error::ArchiveNonExistence(_))) => {
            return Ok(TimelineSwitchMap::new());
        }
        Err(err) => return Err(err),
    };
    let records = parse_history_file(&String::from_utf8_lossy(&bytes))?;
    Ok(timeline_switch_map(records))
}

/// A backup can bound the scan when it is not permanent and its start lies
/// on the current timeline lineage.
fn backup_is_correct(
    name: &str,
    current_timeline: u32,
    is_permanent: bool,
    backup_segment: WalSegmentDescription,
    switch_by_timeline: &HashMap<u32, WalSegmentNo>,
) -> bool {
    if is_permanent {
        warn!(backup = name, "permanent_backup_not_eligible_as_scan_boundary");
        return false;
    }
    if switch_by_timeline.is_empty() {
        return true;
    }
    if backup_segment.timeline > 1 {
        if let Some(start) = switch_by_timeline.get(&(backup_segment.timeline - 1)) {
            if backup_segment.number < *start {
                warn!(backup = name, "backup_starts_before_its_timeline");
                return false;
            }
        }
    }
    if backup_segment.timeline == current_timeline {
        return true;
    }
    match switch_by_timeline.get(&backup_segment.timeline) {
        None => {
            warn!(backup = name, timeline = backup_segment.timeline, "backup_timeline_not_in_history");
            false
        }
        Some(end) if backup_segment.number >= *end => {
            warn!(backup = name, "backup_starts_after_its_timeline_ended");
            false
        }
        Some(_) => true,
    }
}

fn earliest_backup_start_segment(
    storage: &StorageFolder,
    switch_map: &TimelineSwitchMap,
    current_timeline: u32,
) -> Result<WalSegmentNo> {
    let base_folder = storage.sub_folder(BASEBACKUPS_FOLDER);
    let switch_by_timeline: HashMap<u32, WalSegmentNo> = switch_map
        .values()
        .map(|record| (record.timeline, WalSegmentNo::from_lsn(record.switch_lsn)))
        .collect();

    let mut earliest: Option<(String, WalSegmentNo)> = None;
    for (name, _) in list_backups(&base_folder)? {
        let segment = parse_backup_name(&name)?;
        let sentinel = Backup::new(&base_folder, &name).fetch_sentinel()?;
        if !backup_is_correct(
            &name,
            current_timeline,
            sentinel.is_permanent,
            segment,
            &switch_by_timeline,
        ) {
            continue;
        }
        if earliest.as_ref().map_or(true, |(_, no)| segment.number < *no) {
            earliest = Some((name, segment.number));
        }
    }
    let (name, segment) = earliest.ok_or(Error::NoCorrectBackupFound)?;
    info!(backup = %name, "earliest_backup_detected");
    Ok(segment)
}

/// Groups scanned segments into runs, lowest segment first.
pub fn collapse_segments(mut scanned: Vec<ScannedSegmentDescription>) -> Vec<IntegrityScanSegmentSequence> {
    scanned.sort_by_key(|s| s.segment.number);
    let mut sequences: Vec<IntegrityScanSegmentSequence> = Vec::new();
    let mut current: Option<(WalSegmentDescription, WalSegmentDescription, usize, ScannedSegmentStatus)> =
        None;
    for s in scanned {
        current = match current {
            Some((first, _, count, status))
                if status == s.status && first.timeline == s.segment.timeline =>
            {
                Some((first, s.segment, count + 1, status))
            }
            Some(done) => {
                sequences.push(sequence_from(done));
                Some((s.segment, s.segment, 1, s.status))
            }
            None => Some((s.segment, s.segment, 1, s.status)),
        };
    }
    if let Some(done) = current {
        sequences.push(sequence_from(done));
    }
    sequences
}

fn sequence_from(
    (first, last, count, status): (WalSegmentDescription, WalSegmentDescription, usize, ScannedSegmentStatus),
) -> IntegrityScanSegmentSequence {
    IntegrityScanSegmentSequence {
        timeline_id: first.timeline,
        start_segment: first.filename(),
        end_segment: last.number.filename(first.timeline),
        segments_count: count,
        status,
    }
}

impl IntegrityCheckRunner {
    pub fn new(
        storage: &StorageFolder,
        registry: &CompressionRegistry,
        wal_folder_filenames: &[String],
        current_segment: WalSegmentDescription,
        upload_concurrency: usize,
        max_delayed_segments_count: usize,
    ) -> Result<Self> {
        let wal_folder = storage.sub_folder(WAL_FOLDER);
        let switch_map = load_timeline_switch_map(&wal_folder, registry, current_segment.timeline)?;

        let (stop_segment_no, no_backups_found) =
            match earliest_backup_start_segment(storage, &switch_map, current_segment.timeline) {
                Ok(segment) => (segment, false),
                Err(err) => {
                    warn!(
                        error = %format!("{err:#}"),
                        "earliest_backup_not_detected_scanning_to_first_segment"
                    );
                    (WalSegmentNo(1), true)
                }
            };

        Ok(Self {
            start_segment: current_segment,
            stop_segment_no,
            uploading_segment_range_size: upload_concurrency,
            delayed_segment_range_size: max_delayed_segments_count,
            wal_folder_filenames: wal_folder_filenames.to_vec(),
            switch_map,
            no_backups_found,
        })
    }

    pub fn stop_segment_no(&self) -> WalSegmentNo {
        self.stop_segment_no
    }

    /// Three passes, each resuming where the last stopped: up to the first
    /// archived segment (delayed), then the upload window (uploading), then
    /// down to the stop segment (lost).
    pub fn scan(&self) -> Vec<ScannedSegmentDescription> {
        let runner = WalSegmentRunner::new(
            self.start_segment,
            segments_from_filenames(&self.wal_folder_filenames),
            self.stop_segment_no,
            self.switch_map.clone(),
        );
        let mut scanner = WalSegmentScanner::new(runner);
        scanner.scan(SegmentScanConfig {
            limit: Some(self.delayed_segment_range_size),
            stop_on_first_found: true,
            missing_status: ScannedSegmentStatus::ProbablyDelayed,
        });
        scanner.scan(SegmentScanConfig {
            limit: Some(self.uploading_segment_range_size),
            stop_on_first_found: false,
            missing_status: ScannedSegmentStatus::ProbablyUploading,
        });
        scanner.scan(SegmentScanConfig {
            limit: None,
            stop_on_first_found: false,
            missing_status: ScannedSegmentStatus::Lost,
        });
        scanner.scanned
    }

    pub fn run(&self) -> WalVerifyCheckResult {
        let sequences = collapse_segments(self.scan());
        WalVerifyCheckResult {
            status: self.status_of(&sequences),
            details: CheckDetails::Integrity(sequences),
        }
    }

    fn status_of(&self, sequences: &[IntegrityScanSegmentSequence]) -> CheckStatus {
        let mut status = CheckStatus::Ok;
        let mut found_before = false;
        for sequence in sequences {
            match sequence.status {
                ScannedSegmentStatus::Found => found_before = true,
                // without backups the lower bound is a guess
                ScannedSegmentStatus::Lost if self.no_backups_found && !found_before => {
                    status = CheckStatus::Warning
                }
                ScannedSegmentStatus::Lost => return CheckStatus::Failure,
                ScannedSegmentStatus::ProbablyDelayed | ScannedSegmentStatus::ProbablyUploading => {
                    status = CheckStatus::Warning
                }
            }
        }
        status
    }
}
