//! Delta map construction and per-segment-file bitmap windows.

use std::path::Path;

use pgdelta::delta::DeltaMap;
use pgdelta::pg::relfile::rel_file_from_path;
use pgdelta::pg::{BlockLocation, RelFileNode, BLOCKS_IN_REL_FILE};
use pgdelta::Error;

fn rel() -> RelFileNode {
    RelFileNode::new(1663, 5, 16384)
}

#[test]
fn second_segment_window_is_rebased() -> pgdelta::Result<()> {
    let mut map = DeltaMap::new();
    map.add_locations([
        BlockLocation::new(rel(), 4),
        BlockLocation::new(rel(), 9),
        BlockLocation::new(rel(), BLOCKS_IN_REL_FILE + 8),
    ]);

    let first = map.get_delta_bitmap_for(Path::new("base/5/16384"))?;
    assert_eq!(vec![4, 9], first.iter().collect::<Vec<_>>());
    let second = map.get_delta_bitmap_for(Path::new("base/5/16384.1"))?;
    assert_eq!(vec![8], second.iter().collect::<Vec<_>>());
    Ok(())
}

#[test]
fn segment_edges_stay_in_their_window() -> pgdelta::Result<()> {
    let mut map = DeltaMap::new();
    map.add_locations([
        BlockLocation::new(rel(), BLOCKS_IN_REL_FILE - 1),
        BlockLocation::new(rel(), BLOCKS_IN_REL_FILE),
        BlockLocation::new(rel(), 2 * BLOCKS_IN_REL_FILE - 1),
    ]);
    let first = map.get_delta_bitmap_for(Path::new("base/5/16384"))?;
    assert_eq!(vec![BLOCKS_IN_REL_FILE - 1], first.iter().collect::<Vec<_>>());
    let second = map.get_delta_bitmap_for(Path::new("base/5/16384.1"))?;
    assert_eq!(
        vec![0, BLOCKS_IN_REL_FILE - 1],
        second.iter().collect::<Vec<_>>()
    );
    assert!(map.get_delta_bitmap_for(Path::new("base/5/16384.7"))?.is_empty());
    Ok(())
}

#[test]
fn relations_are_kept_apart() -> pgdelta::Result<()> {
    let other = RelFileNode::new(1663, 5, 16390);
    let global = RelFileNode::new(1664, 0, 1262);
    let mut map = DeltaMap::new();
    map.add_location(BlockLocation::new(rel(), 1));
    map.add_location(BlockLocation::new(other, 2));
    map.add_location(BlockLocation::new(global, 3));

    let blocks = |path: &str| -> pgdelta::Result<Vec<u32>> {
        Ok(map.get_delta_bitmap_for(Path::new(path))?.iter().collect())
    };
    assert_eq!(vec![1], blocks("base/5/16384")?);
    assert_eq!(vec![2], blocks("base/5/16390")?);
    assert_eq!(vec![3], blocks("global/1262")?);
    assert_eq!(3, map.relations().count());
    Ok(())
}

#[test]
fn merge_unions_bitmaps() -> pgdelta::Result<()> {
    let mut left = DeltaMap::new();
    left.add_location(BlockLocation::new(rel(), 1));
    let mut right = DeltaMap::new();
    right.add_locations([BlockLocation::new(rel(), 1), BlockLocation::new(rel(), 7)]);
    left.merge(&right);
    let bitmap = left.get_delta_bitmap_for(Path::new("base/5/16384"))?;
    assert_eq!(vec![1, 7], bitmap.iter().collect::<Vec<_>>());
    Ok(())
}

#[test]
fn untouched_relation_reports_missing_bitmap() {
    let mut map = DeltaMap::new();
    map.add_location(BlockLocation::new(rel(), 1));
    let err = map
        .get_delta_bitmap_for(Path::new("base/5/99999"))
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::NoBitmapFound(_))));
    assert!(!map.is_empty());
    assert!(DeltaMap::new().is_empty());
}

#[test]
fn tablespace_paths_resolve_to_relations() -> pgdelta::Result<()> {
    let (node, segment) =
        rel_file_from_path(Path::new("pg_tblspc/16500/PG_16_202307071/5/16384.3"))?;
    assert_eq!(RelFileNode::new(16500, 5, 16384), node);
    assert_eq!(3, segment);
    assert!(rel_file_from_path(Path::new("base/5/pg_filenode.map")).is_err());
    Ok(())
}
