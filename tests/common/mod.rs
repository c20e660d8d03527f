//! Fixtures shared by the black-box tests: data pages with valid headers and
//! checksums, WAL records with block references, and short WAL segments
//! laid out the way the server writes them.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use bytes::BufMut;
use walkdir::WalkDir;

use pgdelta::pg::page::{expected_page_size_version, set_page_checksum};
use pgdelta::pg::{PageHeader, RelFileNode, WalSegmentNo, PAGE_SIZE, WAL_PAGE_SIZE};
use pgdelta::wal::parser::{XLP_FIRST_IS_CONTRECORD, XLP_LONG_HEADER};
use pgdelta::wal::record::{
    BKPBLOCK_SAME_REL, XLOG_RECORD_HEADER_SIZE, XLR_BLOCK_ID_DATA_LONG, XLR_BLOCK_ID_DATA_SHORT,
};

pub const WAL_PAGE_MAGIC: u16 = 0xD116;
pub const RM_HEAP_ID: u8 = 10;

/// A heap page stamped with `lsn` whose tuple area is filled with `fill`.
pub fn data_page(lsn: u64, block_no: u32, fill: u8) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    let header = PageHeader {
        lsn_hi: (lsn >> 32) as u32,
        lsn_lo: lsn as u32,
        checksum: 0,
        flags: 0,
        lower: 32,
        upper: 4096,
        special: PAGE_SIZE as u16,
        page_size_version: expected_page_size_version(),
    };
    let mut head = Vec::new();
    header.encode_into(&mut head);
    page[..head.len()].copy_from_slice(&head);
    page[4096..].fill(fill);
    set_page_checksum(&mut page, block_no);
    page
}

/// Concatenated pages `(lsn, fill)` forming one relation segment file.
pub fn relation_file(pages: &[(u64, u8)]) -> Vec<u8> {
    pages
        .iter()
        .enumerate()
        .flat_map(|(block, (lsn, fill))| data_page(*lsn, block as u32, *fill))
        .collect()
}

fn record_header(total: usize, out: &mut Vec<u8>) {
    out.put_u32_le(total as u32);
    out.put_u32_le(742);
    out.put_u64_le(0);
    out.put_u8(0);
    out.put_u8(RM_HEAP_ID);
    out.put_u16_le(0);
    out.put_u32_le(0);
}

/// A heap record touching `blocks` of the main fork. Consecutive blocks of
/// one relation use the same-relation shortcut.
pub fn block_record(blocks: &[(RelFileNode, u32)], main_data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    let mut previous: Option<RelFileNode> = None;
    for (id, (rel, block)) in blocks.iter().enumerate() {
        body.put_u8(id as u8);
        if previous == Some(*rel) {
            body.put_u8(BKPBLOCK_SAME_REL);
            body.put_u16_le(0);
        } else {
            body.put_u8(0);
            body.put_u16_le(0);
            body.put_u32_le(rel.spc_node);
            body.put_u32_le(rel.db_node);
            body.put_u32_le(rel.rel_node);
        }
        body.put_u32_le(*block);
        previous = Some(*rel);
    }
    if !main_data.is_empty() {
        body.put_u8(XLR_BLOCK_ID_DATA_SHORT);
        body.put_u8(main_data.len() as u8);
        body.extend_from_slice(main_data);
    }
    let mut out = Vec::with_capacity(XLOG_RECORD_HEADER_SIZE + body.len());
    record_header(XLOG_RECORD_HEADER_SIZE + body.len(), &mut out);
    out.extend_from_slice(&body);
    out
}

/// A record with no block references, exactly `total` bytes long.
pub fn filler_record(total: usize) -> Vec<u8> {
    let overhead = XLOG_RECORD_HEADER_SIZE + 5;
    assert!(total >= overhead, "filler must hold its own header");
    let mut out = Vec::with_capacity(total);
    record_header(total, &mut out);
    out.put_u8(XLR_BLOCK_ID_DATA_LONG);
    out.put_u32_le((total - overhead) as u32);
    out.resize(total, 0xAB);
    out
}

fn max_align(len: usize) -> usize {
    (len + 7) & !7
}

fn write_page_header(page: &mut [u8], timeline: u32, address: u64, long: bool, remaining: usize) {
    let mut info = 0u16;
    if long {
        info |= XLP_LONG_HEADER;
    }
    if remaining > 0 {
        info |= XLP_FIRST_IS_CONTRECORD;
    }
    let mut head = Vec::with_capacity(40);
    head.put_u16_le(WAL_PAGE_MAGIC);
    head.put_u16_le(info);
    head.put_u32_le(timeline);
    head.put_u64_le(address);
    head.put_u32_le(remaining as u32);
    head.put_u32_le(0);
    if long {
        head.put_u64_le(7_000_000_000_000_000_001);
        head.put_u32_le(16 * 1024 * 1024);
        head.put_u32_le(WAL_PAGE_SIZE as u32);
    }
    page[..head.len()].copy_from_slice(&head);
}

/// A WAL segment of `page_count` pages starting at `segment`. `leading` is the
/// rest of a record begun in the previous segment; `records` follow it,
/// 8-byte aligned and split across pages as needed. Returns the segment bytes
/// and the bytes of the last record that did not fit.
pub fn wal_segment(
    timeline: u32,
    segment: WalSegmentNo,
    page_count: usize,
    leading: &[u8],
    records: &[Vec<u8>],
) -> (Vec<u8>, Vec<u8>) {
    let first_address = segment.first_lsn().0;
    let mut pages = vec![vec![0u8; WAL_PAGE_SIZE]; page_count];
    let header_len = |page_no: usize| if page_no == 0 { 40 } else { 24 };

    write_page_header(&mut pages[0], timeline, first_address, true, leading.len());
    let mut page_no = 0;
    let mut pos = header_len(0);
    let mut pending = leading.to_vec();
    let mut records = records.iter();

    loop {
        if !pending.is_empty() {
            let take = (WAL_PAGE_SIZE - pos).min(pending.len());
            pages[page_no][pos..pos + take].copy_from_slice(&pending[..take]);
            pending.drain(..take);
            pos += max_align(take);
            if !pending.is_empty() {
                page_no += 1;
                if page_no == page_count {
                    assert!(records.next().is_none(), "records left after the segment is full");
                    return (pages.concat(), pending);
                }
                let address = first_address + (page_no * WAL_PAGE_SIZE) as u64;
                write_page_header(&mut pages[page_no], timeline, address, false, pending.len());
                pos = header_len(page_no);
                continue;
            }
        }
        let Some(record) = records.next() else {
            break;
        };
        if pos >= WAL_PAGE_SIZE {
            page_no += 1;
            assert!(page_no < page_count, "no room for the next record");
            let address = first_address + (page_no * WAL_PAGE_SIZE) as u64;
            write_page_header(&mut pages[page_no], timeline, address, false, 0);
            pos = header_len(page_no);
        }
        pending = record.clone();
    }
    (pages.concat(), Vec::new())
}

/// Regular files under `root` with their contents, keyed by `/`-joined
/// relative path. Symlinks are followed.
pub fn tree_contents(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = entry.expect("walk restored tree");
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .expect("inside root")
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        files.push((relative, fs::read(entry.path()).expect("read restored file")));
    }
    files
}

/// Writes `content` at `root/relative`, creating parent directories.
pub fn write_file(root: &Path, relative: &str, content: &[u8]) -> PathBuf {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(&path, content).expect("write fixture");
    path
}

/// Moves the modification time of `path` `seconds` into the future so a
/// delta backup sees the file as changed.
pub fn touch_forward(path: &Path, seconds: u64) {
    let when = std::time::SystemTime::now() + std::time::Duration::from_secs(seconds);
    fs::File::options()
        .write(true)
        .open(path)
        .and_then(|f| f.set_modified(when))
        .expect("set mtime");
}
