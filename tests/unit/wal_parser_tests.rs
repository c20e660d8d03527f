//! WAL page and record framing: records split across pages and segments,
//! parser synchronization and the conditions that end a segment.

#[path = "../common/mod.rs"]
mod common;

use bytes::{BufMut, Bytes};

use pgdelta::pg::{BlockLocation, RelFileNode, WalSegmentNo, WAL_PAGE_SIZE};
use pgdelta::wal::record::{BKPBLOCK_HAS_DATA, BKPBLOCK_SAME_REL, RM_XLOG_ID, XLOG_SWITCH};
use pgdelta::wal::{extract_block_locations, WalPageHeader, WalParser, XLogRecord};
use pgdelta::Error;

const TIMELINE: u32 = 1;

fn rel() -> RelFileNode {
    RelFileNode::new(1663, 5, 16384)
}

fn touched(blocks: &[u32]) -> Vec<u8> {
    let refs: Vec<_> = blocks.iter().map(|b| (rel(), *b)).collect();
    common::block_record(&refs, b"heap")
}

fn locations(blocks: &[u32]) -> Vec<BlockLocation> {
    blocks.iter().map(|b| BlockLocation::new(rel(), *b)).collect()
}

fn switch_record() -> Vec<u8> {
    let mut record = common::filler_record(40);
    record[16] = XLOG_SWITCH;
    record[17] = RM_XLOG_ID;
    record
}

fn raw_record(body: &[u8]) -> Bytes {
    let mut out = Vec::new();
    out.put_u32_le((24 + body.len()) as u32);
    out.put_u32_le(0);
    out.put_u64_le(0);
    out.put_u8(0);
    out.put_u8(common::RM_HEAP_ID);
    out.put_u16_le(0);
    out.put_u32_le(0);
    out.extend_from_slice(body);
    Bytes::from(out)
}

#[test]
fn long_page_header_is_decoded() -> pgdelta::Result<()> {
    let (segment, _) = common::wal_segment(TIMELINE, WalSegmentNo(3), 1, &[], &[touched(&[1])]);
    let header = WalPageHeader::parse(&segment)?;
    assert!(header.is_long());
    assert!(!header.is_continuation());
    assert_eq!(40, header.len());
    assert_eq!(WalSegmentNo(3).first_lsn().0, header.page_address);
    assert_eq!(Some(WAL_PAGE_SIZE as u32), header.block_size);
    Ok(())
}

#[test]
fn records_on_one_page() -> pgdelta::Result<()> {
    let records = [touched(&[1, 2]), common::filler_record(100), touched(&[7])];
    let (segment, overflow) = common::wal_segment(TIMELINE, WalSegmentNo(3), 1, &[], &records);
    assert!(overflow.is_empty());

    let mut parser = WalParser::new();
    let parsed = parser.parse_segment(&mut segment.as_slice())?;
    assert!(parsed.discarded_tail.is_empty());
    assert_eq!(3, parsed.records.len());
    assert_eq!(locations(&[1, 2, 7]), extract_block_locations(&parsed.records));
    assert!(parser.is_synchronized());
    assert!(parser.current_record_head().is_empty());
    Ok(())
}

#[test]
fn record_split_across_pages() -> pgdelta::Result<()> {
    let records = [common::filler_record(8100), touched(&[3, 4])];
    let (segment, _) = common::wal_segment(TIMELINE, WalSegmentNo(3), 2, &[], &records);
    let second = WalPageHeader::parse(&segment[WAL_PAGE_SIZE..])?;
    assert!(second.is_continuation());

    let parsed = WalParser::new().parse_segment(&mut segment.as_slice())?;
    assert_eq!(2, parsed.records.len());
    assert_eq!(locations(&[3, 4]), extract_block_locations(&parsed.records));
    Ok(())
}

#[test]
fn record_split_across_segments() -> pgdelta::Result<()> {
    let (first, overflow) = common::wal_segment(
        TIMELINE,
        WalSegmentNo(3),
        1,
        &[],
        &[common::filler_record(8100), touched(&[11])],
    );
    assert!(!overflow.is_empty());
    let (second, _) =
        common::wal_segment(TIMELINE, WalSegmentNo(4), 1, &overflow, &[touched(&[12])]);

    let mut continuous = WalParser::new();
    let parsed = continuous.parse_segment(&mut first.as_slice())?;
    assert_eq!(1, parsed.records.len());
    assert_eq!(8192 - 8144, continuous.current_record_head().len());
    let parsed = continuous.parse_segment(&mut second.as_slice())?;
    assert!(parsed.discarded_tail.is_empty());
    assert_eq!(locations(&[11, 12]), extract_block_locations(&parsed.records));

    let mut fresh = WalParser::new();
    let parsed = fresh.parse_segment(&mut second.as_slice())?;
    assert_eq!(overflow, parsed.discarded_tail);
    assert_eq!(locations(&[12]), extract_block_locations(&parsed.records));
    Ok(())
}

#[test]
fn resumed_parser_finishes_saved_head() -> pgdelta::Result<()> {
    let (first, overflow) = common::wal_segment(
        TIMELINE,
        WalSegmentNo(3),
        1,
        &[],
        &[common::filler_record(8100), touched(&[21])],
    );
    let (second, _) = common::wal_segment(TIMELINE, WalSegmentNo(4), 1, &overflow, &[]);

    let mut parser = WalParser::new();
    parser.parse_segment(&mut first.as_slice())?;
    let mut checkpoint = Vec::new();
    parser.save(&mut checkpoint)?;

    let mut resumed = WalParser::load(&mut checkpoint.as_slice())?;
    let parsed = resumed.parse_segment(&mut second.as_slice())?;
    assert_eq!(locations(&[21]), extract_block_locations(&parsed.records));
    Ok(())
}

#[test]
fn continuation_spanning_whole_segment_is_an_error() {
    let (segment, rest) = common::wal_segment(TIMELINE, WalSegmentNo(3), 1, &vec![9u8; 9000], &[]);
    assert!(!rest.is_empty());
    let err = WalParser::new()
        .parse_segment(&mut segment.as_slice())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::ContinuationMismatch(_))
    ));
}

#[test]
fn buffered_head_requires_continuation_page() {
    let (segment, _) = common::wal_segment(TIMELINE, WalSegmentNo(3), 1, &[], &[touched(&[1])]);
    let mut parser = WalParser::from_record_head(touched(&[2])[..20].to_vec());
    let err = parser.parse_records_from_page(&segment).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::ContinuationMismatch(_))
    ));
}

#[test]
fn stale_page_ends_segment() -> pgdelta::Result<()> {
    let records = [common::filler_record(8100), touched(&[5])];
    let (mut segment, _) = common::wal_segment(TIMELINE, WalSegmentNo(3), 2, &[], &records);
    let stale = WalSegmentNo(1).first_lsn().0.to_le_bytes();
    segment[WAL_PAGE_SIZE + 8..WAL_PAGE_SIZE + 16].copy_from_slice(&stale);

    let mut parser = WalParser::new();
    let parsed = parser.parse_segment(&mut segment.as_slice())?;
    assert_eq!(1, parsed.records.len());
    assert!(extract_block_locations(&parsed.records).is_empty());
    assert!(!parser.current_record_head().is_empty());
    Ok(())
}

#[test]
fn switch_record_ends_segment() -> pgdelta::Result<()> {
    let records = [touched(&[1]), switch_record(), touched(&[2])];
    let (segment, _) = common::wal_segment(TIMELINE, WalSegmentNo(3), 1, &[], &records);
    let parsed = WalParser::new().parse_segment(&mut segment.as_slice())?;
    assert_eq!(2, parsed.records.len());
    assert!(parsed.records[1].is_wal_switch());
    assert_eq!(locations(&[1]), extract_block_locations(&parsed.records));
    Ok(())
}

#[test]
fn short_segment_file_is_accepted() -> pgdelta::Result<()> {
    let (segment, _) = common::wal_segment(TIMELINE, WalSegmentNo(3), 1, &[], &[touched(&[8])]);
    let mut truncated = segment.clone();
    truncated.extend_from_slice(&[0u8; 100]);
    let parsed = WalParser::new().parse_segment(&mut truncated.as_slice())?;
    assert_eq!(locations(&[8]), extract_block_locations(&parsed.records));
    Ok(())
}

#[test]
fn malformed_block_references_are_rejected() {
    let mut unknown_id = vec![40u8, 0, 0, 0];
    unknown_id.extend_from_slice(&[0u8; 16]);
    let err = XLogRecord::decode(raw_record(&unknown_id)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::InvalidRecordBlockId(40))
    ));

    let mut data_flag_without_data = vec![0u8, BKPBLOCK_HAS_DATA, 0, 0];
    data_flag_without_data.extend_from_slice(&[0u8; 16]);
    let err = XLogRecord::decode(raw_record(&data_flag_without_data)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::InconsistentBlockDataState { block_id: 0, .. })
    ));

    let mut same_rel_first = vec![0u8, BKPBLOCK_SAME_REL, 0, 0];
    same_rel_first.extend_from_slice(&[0u8; 4]);
    let err = XLogRecord::decode(raw_record(&same_rel_first)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::NoPreviousRelFile(0))
    ));
}

#[test]
fn non_main_forks_are_not_tracked() -> pgdelta::Result<()> {
    let mut record = touched(&[1, 2]);
    // fork 1 (free space map) on the second block reference
    let second_block_flags = 24 + 20 + 1;
    record[second_block_flags] |= 1;
    let decoded = XLogRecord::decode(Bytes::from(record))?;
    assert_eq!(2, decoded.blocks.len());
    assert_eq!(locations(&[1]), extract_block_locations([&decoded]));
    Ok(())
}
