//! WAL verification: walks archived segments backward from the cluster's
//! current one and reports gaps, and compares storage and cluster timelines.

pub mod integrity;
pub mod permanent;
pub mod runner;
pub mod timeline;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::compression::CompressionRegistry;
use crate::pg::WalSegmentDescription;
use crate::storage::{Folder, StorageFolder};
use crate::Result;

pub use integrity::{IntegrityCheckRunner, IntegrityScanSegmentSequence};
pub use permanent::{permanent_backup_wal_segments, permanent_wal_segments};
pub use runner::{ScannedSegmentStatus, SegmentScanConfig, WalSegmentRunner, WalSegmentScanner};
pub use timeline::{TimelineCheckDetails, TimelineCheckRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalVerifyCheckType {
    Integrity,
    Timeline,
}

impl fmt::Display for WalVerifyCheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalVerifyCheckType::Integrity => f.write_str("integrity"),
            WalVerifyCheckType::Timeline => f.write_str("timeline"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    Ok,
    Warning,
    Failure,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckStatus::Ok => f.write_str("OK"),
            CheckStatus::Warning => f.write_str("WARNING"),
            CheckStatus::Failure => f.write_str("FAILURE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckDetails {
    Integrity(Vec<IntegrityScanSegmentSequence>),
    Timeline(TimelineCheckDetails),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalVerifyCheckResult {
    pub status: CheckStatus,
    pub details: CheckDetails,
}

impl WalVerifyCheckResult {
    pub fn plain_text(&self) -> String {
        match &self.details {
            CheckDetails::Integrity(sequences) => {
                let mut table = comfy_table::Table::new();
                table.set_header(["TLI", "Start", "End", "Segments count", "Status"]);
                for row in sequences {
                    table.add_row([
                        row.timeline_id.to_string(),
                        row.start_segment.clone(),
                        row.end_segment.clone(),
                        row.segments_count.to_string(),
                        row.status.to_string(),
                    ]);
                }
                table.to_string()
            }
            CheckDetails::Timeline(details) => format!(
                "Highest timeline found in storage: {}\nCurrent cluster timeline: {}",
                details.highest_storage_timeline_id, details.current_timeline_id
            ),
        }
    }
}

pub type WalVerifyReport = BTreeMap<WalVerifyCheckType, WalVerifyCheckResult>;

/// Runs the requested checks against `storage` for a cluster currently
/// writing `current_segment`.
pub fn verify_wal(
    storage: &StorageFolder,
    registry: &CompressionRegistry,
    checks: &[WalVerifyCheckType],
    current_segment: WalSegmentDescription,
    upload_concurrency: usize,
    max_delayed_segments_count: usize,
) -> Result<WalVerifyReport> {
    let wal_folder = storage.sub_folder(crate::storage::WAL_FOLDER);
    let (objects, _) = wal_folder.list_folder()?;
    let filenames: Vec<String> = objects.into_iter().map(|o| o.name).collect();

    let mut report = WalVerifyReport::new();
    for check in checks {
        let result = match check {
            WalVerifyCheckType::Integrity => IntegrityCheckRunner::new(
                storage,
                registry,
                &filenames,
                current_segment,
                upload_concurrency,
                max_delayed_segments_count,
            )?
            .run(),
            WalVerifyCheckType::Timeline => {
                TimelineCheckRunner::new(&filenames, current_segment).run()
            }
        };
        report.insert(*check, result);
    }
    Ok(report)
}

pub fn render_json(report: &WalVerifyReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

pub fn render_plain_text(report: &WalVerifyReport) -> String {
    let mut out = String::new();
    for (check, result) in report {
        out.push_str(&format!("[wal-verify] {check} check status: {}\n", result.status));
        out.push_str(&format!("[wal-verify] {check} check details:\n"));
        out.push_str(&result.plain_text());
        out.push('\n');
    }
    out
}
