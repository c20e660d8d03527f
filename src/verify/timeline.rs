use serde::{Deserialize, Serialize};

use crate::pg::WalSegmentDescription;

use super::runner::segments_from_filenames;
use super::{CheckDetails, CheckStatus, WalVerifyCheckResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineCheckDetails {
    pub current_timeline_id: u32,
    /// Zero when storage holds no segments.
    pub highest_storage_timeline_id: u32,
}

/// Compares the cluster timeline with the highest one archived.
#[derive(Debug)]
pub struct TimelineCheckRunner {
    current_timeline: u32,
    highest_timeline: u32,
}

impl TimelineCheckRunner {
    pub fn new(wal_folder_filenames: &[String], current_segment: WalSegmentDescription) -> Self {
        let highest_timeline = segments_from_filenames(wal_folder_filenames)
            .into_iter()
            .map(|s| s.timeline)
            .max()
            .unwrap_or(0);
        Self {
            current_timeline: current_segment.timeline,
            highest_timeline,
        }
    }

    pub fn run(&self) -> WalVerifyCheckResult {
        let status = match self.highest_timeline.cmp(&self.current_timeline) {
            std::cmp::Ordering::Equal => CheckStatus::Ok,
            std::cmp::Ordering::Less => CheckStatus::Warning,
            std::cmp::Ordering::Greater => CheckStatus::Failure,
        };
        WalVerifyCheckResult {
            status,
            details: CheckDetails::Timeline(TimelineCheckDetails {
                current_timeline_id: self.current_timeline,
                highest_storage_timeline_id: self.highest_timeline,
            }),
        }
    }
}
