use std::io::{self, Read, Write};

use crate::pg::segment::parse_wal_filename;
use crate::pg::{BlockLocation, Lsn, WalSegmentNo};
use crate::wal::WalParser;
use crate::{Error, Result};

/// Number of consecutive WAL segments described by one delta file.
pub const WAL_FILES_IN_DELTA: u64 = 16;
pub const DELTA_FILENAME_SUFFIX: &str = "_delta";
pub const PART_FILENAME_SUFFIX: &str = "_part";

/// Index of a group of `WAL_FILES_IN_DELTA` segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeltaNo(pub u64);

impl DeltaNo {
    pub fn from_wal_segment_no(segment: WalSegmentNo) -> Self {
        DeltaNo(segment.0 / WAL_FILES_IN_DELTA)
    }

    pub fn from_lsn(lsn: Lsn) -> Self {
        Self::from_wal_segment_no(WalSegmentNo::from_lsn(lsn))
    }

    pub fn next(self) -> Self {
        DeltaNo(self.0 + 1)
    }

    pub fn previous(self) -> Self {
        DeltaNo(self.0.saturating_sub(1))
    }

    pub fn first_wal_segment_no(self) -> WalSegmentNo {
        WalSegmentNo(self.0 * WAL_FILES_IN_DELTA)
    }

    pub fn filename(self, timeline: u32) -> String {
        format!(
            "{}{DELTA_FILENAME_SUFFIX}",
            self.first_wal_segment_no().filename(timeline)
        )
    }
}

/// Name of the delta file that covers `wal_filename`.
pub fn delta_filename_for(wal_filename: &str) -> Result<String> {
    let (timeline, segment) = parse_wal_filename(wal_filename)?;
    Ok(DeltaNo::from_wal_segment_no(segment).filename(timeline))
}

/// Position of `wal_filename` inside its delta group.
pub fn position_in_delta(wal_filename: &str) -> Result<usize> {
    let (_, segment) = parse_wal_filename(wal_filename)?;
    Ok((segment.0 % WAL_FILES_IN_DELTA) as usize)
}

pub fn part_filename(delta_filename: &str) -> String {
    format!("{delta_filename}{PART_FILENAME_SUFFIX}")
}

/// Block locations collected for one delta group plus the parser state at the
/// end of its last segment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeltaFile {
    pub locations: Vec<BlockLocation>,
    pub wal_parser: WalParser,
}

impl DeltaFile {
    pub fn new(wal_parser: WalParser) -> Self {
        Self {
            locations: Vec::new(),
            wal_parser,
        }
    }

    pub fn save<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        for location in &self.locations {
            location.write_to(writer)?;
        }
        BlockLocation::TERMINAL.write_to(writer)?;
        self.wal_parser.save(writer)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity((self.locations.len() + 1) * BlockLocation::ENCODED_LEN);
        // writing into a Vec cannot fail
        let _ = self.save(&mut out);
        out
    }

    pub fn load<R: Read>(reader: &mut R) -> Result<Self> {
        let mut locations = Vec::new();
        loop {
            let location = BlockLocation::read_from(reader).map_err(|e| {
                Error::InvalidDeltaFile(format!("reading block locations: {e}"))
            })?;
            if location.is_terminal() {
                break;
            }
            locations.push(location);
        }
        let wal_parser = WalParser::load(reader)?;
        Ok(Self {
            locations,
            wal_parser,
        })
    }
}
