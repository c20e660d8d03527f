//! Backward walk over WAL segments and the bounded scan passes built on it.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::pg::history::TimelineHistoryRecord;
use crate::pg::{WalSegmentDescription, WalSegmentNo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScannedSegmentStatus {
    /// Present in storage.
    #[serde(rename = "FOUND")]
    Found,
    /// Missing with no recent segment to excuse it.
    #[serde(rename = "MISSING_LOST")]
    Lost,
    /// Missing but within the in-flight upload window.
    #[serde(rename = "MISSING_UPLOADING")]
    ProbablyUploading,
    /// Missing but newer than anything archived yet.
    #[serde(rename = "MISSING_DELAYED")]
    ProbablyDelayed,
}

impl fmt::Display for ScannedSegmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScannedSegmentStatus::Found => "FOUND",
            ScannedSegmentStatus::Lost => "MISSING_LOST",
            ScannedSegmentStatus::ProbablyUploading => "MISSING_UPLOADING",
            ScannedSegmentStatus::ProbablyDelayed => "MISSING_DELAYED",
        })
    }
}

/// Segment descriptions of every well-formed WAL object name. Compression
/// extensions are ignored; delta, part and history files are not segments.
pub fn segments_from_filenames<'a, I>(names: I) -> HashSet<WalSegmentDescription>
where
    I: IntoIterator<Item = &'a String>,
{
    names
        .into_iter()
        .filter_map(|name| {
            let stem = name.split('.').next().unwrap_or(name);
            WalSegmentDescription::parse(stem).ok()
        })
        .collect()
}

/// Timeline switches keyed by the segment holding the switch point.
pub type TimelineSwitchMap = HashMap<WalSegmentNo, TimelineHistoryRecord>;

pub fn timeline_switch_map(records: Vec<TimelineHistoryRecord>) -> TimelineSwitchMap {
    records
        .into_iter()
        .map(|record| (WalSegmentNo::from_lsn(record.switch_lsn), record))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStep {
    Found(WalSegmentDescription),
    Missing,
    ReachedStop,
}

/// Moves from the current segment toward `stop`, following timeline switches.
#[derive(Debug)]
pub struct WalSegmentRunner {
    current: WalSegmentDescription,
    storage_segments: HashSet<WalSegmentDescription>,
    stop: WalSegmentNo,
    switch_map: TimelineSwitchMap,
}

impl WalSegmentRunner {
    pub fn new(
        start: WalSegmentDescription,
        storage_segments: HashSet<WalSegmentDescription>,
        stop: WalSegmentNo,
        switch_map: TimelineSwitchMap,
    ) -> Self {
        Self {
            current: start,
            storage_segments,
            stop,
            switch_map,
        }
    }

    pub fn current(&self) -> WalSegmentDescription {
        self.current
    }

    fn next_segment(&self) -> WalSegmentDescription {
        let timeline = self
            .switch_map
            .get(&self.current.number)
            .map(|record| record.timeline)
            .unwrap_or(self.current.timeline);
        WalSegmentDescription::new(timeline, self.current.number.previous())
    }

    /// Steps back one segment if it is in storage. A missing segment leaves
    /// the runner in place; call `force_move_next` to pass it.
    pub fn next(&mut self) -> RunnerStep {
        if self.current.number <= self.stop {
            return RunnerStep::ReachedStop;
        }
        let next = self.next_segment();
        if !self.storage_segments.contains(&next) {
            return RunnerStep::Missing;
        }
        self.current = next;
        RunnerStep::Found(next)
    }

    pub fn force_move_next(&mut self) {
        self.current = self.next_segment();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannedSegmentDescription {
    pub segment: WalSegmentDescription,
    pub status: ScannedSegmentStatus,
}

#[derive(Debug, Clone, Copy)]
pub struct SegmentScanConfig {
    /// `None` scans until the stop segment.
    pub limit: Option<usize>,
    pub stop_on_first_found: bool,
    pub missing_status: ScannedSegmentStatus,
}

/// Records what each pass saw. Passes continue where the previous one
/// stopped.
#[derive(Debug)]
pub struct WalSegmentScanner {
    runner: WalSegmentRunner,
    pub scanned: Vec<ScannedSegmentDescription>,
}

impl WalSegmentScanner {
    pub fn new(runner: WalSegmentRunner) -> Self {
        Self {
            runner,
            scanned: Vec::new(),
        }
    }

    pub fn scan(&mut self, config: SegmentScanConfig) {
        let mut i = 0;
        while config.limit.map_or(true, |limit| i < limit) {
            match self.runner.next() {
                RunnerStep::Found(segment) => {
                    self.scanned.push(ScannedSegmentDescription {
                        segment,
                        status: ScannedSegmentStatus::Found,
                    });
                    if config.stop_on_first_found {
                        return;
                    }
                }
                RunnerStep::Missing => {
                    self.runner.force_move_next();
                    self.scanned.push(ScannedSegmentDescription {
                        segment: self.runner.current(),
                        status: config.missing_status,
                    });
                }
                RunnerStep::ReachedStop => return,
            }
            i += 1;
        }
    }
}
