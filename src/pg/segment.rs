//! WAL segment numbering and the 24 hex digit segment filenames.

use std::fmt;

use crate::{Error, Result};

use super::{Lsn, SEGMENTS_PER_XLOG_ID, WAL_SEGMENT_SIZE};

pub const WAL_FILENAME_LEN: usize = 24;

/// Sequence number of a WAL segment, `lsn / segment size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct WalSegmentNo(pub u64);

impl WalSegmentNo {
    pub fn from_lsn(lsn: Lsn) -> Self {
        WalSegmentNo(lsn.0 / WAL_SEGMENT_SIZE)
    }

    pub fn next(self) -> Self {
        WalSegmentNo(self.0 + 1)
    }

    pub fn previous(self) -> Self {
        WalSegmentNo(self.0.saturating_sub(1))
    }

    pub fn add(self, n: u64) -> Self {
        WalSegmentNo(self.0 + n)
    }

    pub fn sub(self, n: u64) -> Self {
        WalSegmentNo(self.0.saturating_sub(n))
    }

    /// LSN of the first byte of this segment.
    pub fn first_lsn(self) -> Lsn {
        Lsn(self.0 * WAL_SEGMENT_SIZE)
    }

    pub fn filename(self, timeline: u32) -> String {
        format!(
            "{:08X}{:08X}{:08X}",
            timeline,
            self.0 / SEGMENTS_PER_XLOG_ID,
            self.0 % SEGMENTS_PER_XLOG_ID
        )
    }
}

impl fmt::Display for WalSegmentNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Splits a WAL filename into `(timeline, segment number)`.
pub fn parse_wal_filename(name: &str) -> Result<(u32, WalSegmentNo)> {
    let invalid = || Error::InvalidWalFilename(name.to_string());
    if name.len() != WAL_FILENAME_LEN || !name.is_ascii() {
        return Err(invalid().into());
    }
    let timeline = u32::from_str_radix(&name[0..8], 16).map_err(|_| invalid())?;
    let hi = u64::from_str_radix(&name[8..16], 16).map_err(|_| invalid())?;
    let lo = u64::from_str_radix(&name[16..24], 16).map_err(|_| invalid())?;
    if lo >= SEGMENTS_PER_XLOG_ID {
        return Err(invalid().into());
    }
    Ok((timeline, WalSegmentNo(hi * SEGMENTS_PER_XLOG_ID + lo)))
}

pub fn next_wal_filename(name: &str) -> Result<String> {
    let (timeline, no) = parse_wal_filename(name)?;
    Ok(no.next().filename(timeline))
}

/// A WAL segment on a specific timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalSegmentDescription {
    pub timeline: u32,
    pub number: WalSegmentNo,
}

impl WalSegmentDescription {
    pub fn new(timeline: u32, number: WalSegmentNo) -> Self {
        Self { timeline, number }
    }

    pub fn parse(name: &str) -> Result<Self> {
        let (timeline, number) = parse_wal_filename(name)?;
        Ok(Self { timeline, number })
    }

    pub fn filename(&self) -> String {
        self.number.filename(self.timeline)
    }
}

impl fmt::Display for WalSegmentDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.filename())
    }
}
