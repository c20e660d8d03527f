//! Timeline history files (`TTTTTTTT.history`).

use crate::{Error, Result};

use super::Lsn;

/// One line of a history file: the parent timeline and the LSN where the
/// child timeline branched off it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineHistoryRecord {
    pub timeline: u32,
    pub switch_lsn: Lsn,
    pub comment: String,
}

pub fn history_filename(timeline: u32) -> String {
    format!("{timeline:08X}.history")
}

pub fn parse_history_file(content: &str) -> Result<Vec<TimelineHistoryRecord>> {
    let mut records = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.splitn(3, |c: char| c == '\t' || c == ' ');
        let invalid = || Error::InvalidHistoryRecord(line.to_string());
        let timeline = fields
            .next()
            .and_then(|f| f.trim().parse::<u32>().ok())
            .ok_or_else(invalid)?;
        let switch_lsn = fields
            .next()
            .and_then(|f| f.trim().parse::<Lsn>().ok())
            .ok_or_else(invalid)?;
        let comment = fields.next().unwrap_or_default().trim().to_string();
        records.push(TimelineHistoryRecord {
            timeline,
            switch_lsn,
            comment,
        });
    }
    Ok(records)
}
