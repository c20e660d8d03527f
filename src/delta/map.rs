use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use roaring::RoaringBitmap;
use tracing::{debug, info};

use crate::compression::CompressionRegistry;
use crate::pg::relfile::rel_file_from_path;
use crate::pg::{BlockLocation, Lsn, RelFileNode, WalSegmentNo, BLOCKS_IN_REL_FILE};
use crate::storage::StorageFolder;
use crate::wal::{extract_block_locations, WalParser};
use crate::{Error, Result};

use super::file::{DeltaFile, DeltaNo};

/// Blocks changed since a base backup, per relation. Block numbers are global
/// to the relation, not to its segment files.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaMap {
    bitmaps: HashMap<RelFileNode, RoaringBitmap>,
}

impl DeltaMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_location(&mut self, location: BlockLocation) {
        self.bitmaps
            .entry(location.rel)
            .or_default()
            .insert(location.block_no);
    }

    pub fn add_locations<I>(&mut self, locations: I)
    where
        I: IntoIterator<Item = BlockLocation>,
    {
        for location in locations {
            self.add_location(location);
        }
    }

    pub fn merge(&mut self, other: &DeltaMap) {
        for (rel, bitmap) in &other.bitmaps {
            *self.bitmaps.entry(*rel).or_default() |= bitmap;
        }
    }

    pub fn relations(&self) -> impl Iterator<Item = &RelFileNode> {
        self.bitmaps.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.bitmaps.is_empty()
    }

    /// Changed blocks of the segment file at `path`, numbered from the start
    /// of that file. Fails with `NoBitmapFound` when the relation was not
    /// touched at all.
    pub fn get_delta_bitmap_for(&self, path: &Path) -> Result<RoaringBitmap> {
        let (rel, segment) = rel_file_from_path(path)?;
        let bitmap = self
            .bitmaps
            .get(&rel)
            .ok_or_else(|| Error::NoBitmapFound(path.display().to_string()))?;

        let first = segment as u64 * BLOCKS_IN_REL_FILE as u64;
        let end = first + BLOCKS_IN_REL_FILE as u64;
        let mut window = bitmap.clone();
        if first > u32::MAX as u64 {
            return Ok(RoaringBitmap::new());
        }
        window.remove_range(..first as u32);
        if end <= u32::MAX as u64 {
            window.remove_range(end as u32..);
        }
        let first = first as u32;
        Ok(window.iter().map(|block| block - first).collect())
    }

    /// Builds the map of blocks changed in `[first_used_lsn, first_not_used_lsn)`.
    /// Completed delta groups are read from their delta files; the remaining
    /// segments are parsed from the archived WAL, resuming from the last delta
    /// file's parser checkpoint.
    pub fn load(
        wal_folder: &StorageFolder,
        registry: &CompressionRegistry,
        timeline: u32,
        first_used_lsn: Lsn,
        first_not_used_lsn: Lsn,
    ) -> Result<DeltaMap> {
        let last_used_lsn = first_not_used_lsn.saturating_sub(1);
        let first_used_delta = DeltaNo::from_lsn(first_used_lsn);
        let first_not_used_delta = DeltaNo::from_lsn(last_used_lsn);
        info!(
            timeline,
            from = %first_used_lsn,
            to = %first_not_used_lsn,
            "loading_delta_map"
        );

        let mut map = DeltaMap::new();
        let parser = map.add_locations_from_deltas(
            wal_folder,
            registry,
            timeline,
            first_used_delta,
            first_not_used_delta,
        )?;
        let (first_wal, parser) = match parser {
            Some(parser) => (first_not_used_delta.first_wal_segment_no(), parser),
            None => (WalSegmentNo::from_lsn(first_used_lsn), WalParser::new()),
        };
        let last_wal = WalSegmentNo::from_lsn(last_used_lsn);
        map.add_locations_from_wals(wal_folder, registry, timeline, first_wal, last_wal, parser)?;
        Ok(map)
    }

    /// Merges delta files `[first, end)`. Returns the parser checkpoint of the
    /// last one, or `None` when the range is empty.
    pub fn add_locations_from_deltas(
        &mut self,
        wal_folder: &StorageFolder,
        registry: &CompressionRegistry,
        timeline: u32,
        first: DeltaNo,
        end: DeltaNo,
    ) -> Result<Option<WalParser>> {
        let mut parser = None;
        let mut delta_no = first;
        while delta_no < end {
            let name = delta_no.filename(timeline);
            let mut reader = registry
                .download_and_decompress(wal_folder, &name)
                .with_context(|| format!("downloading delta file {name}"))?;
            let delta = DeltaFile::load(&mut reader)
                .with_context(|| format!("reading delta file {name}"))?;
            debug!(delta = %name, locations = delta.locations.len(), "delta_file_merged");
            self.add_locations(delta.locations);
            parser = Some(delta.wal_parser);
            delta_no = delta_no.next();
        }
        Ok(parser)
    }

    /// Parses WAL segments `[first, last]` with `parser`.
    pub fn add_locations_from_wals(
        &mut self,
        wal_folder: &StorageFolder,
        registry: &CompressionRegistry,
        timeline: u32,
        first: WalSegmentNo,
        last: WalSegmentNo,
        mut parser: WalParser,
    ) -> Result<()> {
        let mut segment = first;
        while segment <= last {
            let name = segment.filename(timeline);
            let mut reader = registry
                .download_and_decompress(wal_folder, &name)
                .with_context(|| format!("downloading WAL segment {name}"))?;
            let parsed = parser
                .parse_segment(&mut reader)
                .with_context(|| format!("parsing WAL segment {name}"))?;
            debug!(segment = %name, records = parsed.records.len(), "wal_segment_scanned");
            self.add_locations(extract_block_locations(&parsed.records));
            segment = segment.next();
        }
        Ok(())
    }
}
