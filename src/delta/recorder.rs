//! Delta recording for segments as they are archived.

use std::io::Read;

use anyhow::{anyhow, Context};
use tracing::{debug, warn};

use crate::wal::{extract_block_locations, WalParser};
use crate::Result;

use super::file::delta_filename_for;
use super::manager::DeltaFileManager;
use super::part::WalPartRecorder;

/// Parses one archived segment, feeding its block locations to the delta
/// writer of its group and its boundary fragments to the part file. Any
/// failure cancels the affected delta groups before it is returned.
pub fn record_wal_segment<R: Read>(
    manager: &DeltaFileManager,
    wal_filename: &str,
    segment: &mut R,
) -> Result<()> {
    match record(manager, wal_filename, segment) {
        Ok(count) => {
            debug!(wal = wal_filename, locations = count, "wal_delta_recorded");
            Ok(())
        }
        Err(err) => {
            warn!(wal = wal_filename, error = %err, "wal_delta_recording_failed");
            manager.cancel_recording(wal_filename)?;
            Err(err)
        }
    }
}

fn record<R: Read>(manager: &DeltaFileManager, wal_filename: &str, segment: &mut R) -> Result<usize> {
    let delta_filename = delta_filename_for(wal_filename)?;
    let recorder = WalPartRecorder::new(wal_filename, manager)?;

    let mut parser = WalParser::new();
    let parsed = parser
        .parse_segment(segment)
        .with_context(|| format!("parsing {wal_filename}"))?;
    recorder.save_previous_wal_tail(parsed.discarded_tail)?;

    let locations = extract_block_locations(&parsed.records);
    let count = locations.len();
    {
        let consumer = manager.get_block_location_consumer(&delta_filename)?;
        for location in locations {
            consumer
                .send(location)
                .map_err(|_| anyhow!("delta writer for {delta_filename} is closed"))?;
        }
    }
    recorder.save_next_wal_head(parser.current_record_head().to_vec())?;
    Ok(count)
}
