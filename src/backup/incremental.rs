//! Incremental page files: only the pages changed since a base LSN, preceded
//! by a header listing their block numbers.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;

use bytes::{Buf, BufMut, Bytes};
use roaring::RoaringBitmap;
use tracing::{trace, warn};

use crate::pg::page::verify_page;
use crate::pg::{Lsn, PageHeader, BLOCKS_IN_REL_FILE, PAGE_SIZE};
use crate::{Error, Result};

pub const SIGNATURE_MAGIC: u8 = 0x55;
pub const INCREMENT_FILE_MAGIC: [u8; 4] = [b'w', b'i', b'1', SIGNATURE_MAGIC];

/// Streams the increment of one paged file: the header first, then each
/// selected page read from the file on demand.
pub struct IncrementalPageReader<F> {
    paged_file: F,
    path: String,
    file_size: u64,
    lsn: Lsn,
    next: Bytes,
    blocks: VecDeque<u32>,
}

impl<F: Read + Seek> IncrementalPageReader<F> {
    pub fn new(paged_file: F, path: impl Into<String>, file_size: u64, lsn: Lsn) -> Self {
        Self {
            paged_file,
            path: path.into(),
            file_size,
            lsn,
            next: Bytes::new(),
            blocks: VecDeque::new(),
        }
    }

    /// Selects the pages to emit and materializes the header. Without a
    /// bitmap every page is scanned and chosen by its LSN. Returns the total
    /// size of the increment.
    pub fn initialize(&mut self, delta_bitmap: Option<&RoaringBitmap>) -> Result<u64> {
        match delta_bitmap {
            Some(bitmap) => self.delta_bitmap_initialize(bitmap),
            None => self.full_scan_initialize()?,
        }
        let mut header = Vec::with_capacity(16 + 4 * self.blocks.len());
        header.extend_from_slice(&INCREMENT_FILE_MAGIC);
        header.put_u64_le(self.file_size);
        self.write_diff_map_to_header(&mut header);
        let size = header.len() as u64 + self.blocks.len() as u64 * PAGE_SIZE as u64;
        self.next = Bytes::from(header);
        Ok(size)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &u32> {
        self.blocks.iter()
    }

    fn delta_bitmap_initialize(&mut self, bitmap: &RoaringBitmap) {
        for block in bitmap.iter() {
            // the file may have been truncated since the change was logged
            if block as u64 * PAGE_SIZE as u64 >= self.file_size {
                break;
            }
            self.blocks.push_back(block);
        }
    }

    fn full_scan_initialize(&mut self) -> Result<()> {
        self.paged_file.seek(SeekFrom::Start(0))?;
        let pages = self.file_size / PAGE_SIZE as u64;
        let mut page = vec![0u8; PAGE_SIZE];
        for block in 0..pages as u32 {
            self.paged_file.read_exact(&mut page)?;
            if !self.select_new_valid_page(&page, block)? {
                return Err(Error::InvalidBlock {
                    path: self.path.clone(),
                    block,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Queues `block` when it is new or changed since the base LSN. Returns
    /// false for pages that are neither valid nor new.
    fn select_new_valid_page(&mut self, page: &[u8], block: u32) -> Result<bool> {
        let header = PageHeader::parse(page)?;
        let is_new = header.is_new();
        if !header.is_valid() && !is_new {
            warn!(file = %self.path, block, "invalid_page_header");
            return Ok(false);
        }
        if is_new || header.lsn() >= self.lsn {
            self.blocks.push_back(block);
        }
        Ok(true)
    }

    fn write_diff_map_to_header(&self, header: &mut Vec<u8>) {
        header.put_u32_le(self.blocks.len() as u32);
        for block in &self.blocks {
            header.put_u32_le(*block);
        }
    }

    fn advance_file_reader(&mut self) -> io::Result<()> {
        let Some(block) = self.blocks.pop_front() else {
            return Ok(());
        };
        trace!(file = %self.path, block, "read_incremental_page");
        self.paged_file
            .seek(SeekFrom::Start(block as u64 * PAGE_SIZE as u64))?;
        let mut page = vec![0u8; PAGE_SIZE];
        self.paged_file.read_exact(&mut page)?;
        self.next = Bytes::from(page);
        Ok(())
    }
}

impl<F: Read + Seek> Read for IncrementalPageReader<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.next.is_empty() {
                let n = buf.len().min(self.next.len());
                buf[..n].copy_from_slice(&self.next[..n]);
                self.next.advance(n);
                return Ok(n);
            }
            if self.blocks.is_empty() {
                return Ok(0);
            }
            self.advance_file_reader()?;
        }
    }
}

/// Opens `path` and prepares its increment against `lsn`.
pub fn read_incremental_file(
    path: &Path,
    file_size: u64,
    lsn: Lsn,
    delta_bitmap: Option<&RoaringBitmap>,
) -> Result<(IncrementalPageReader<File>, u64)> {
    let file = File::open(path)?;
    let mut reader = IncrementalPageReader::new(file, path.display().to_string(), file_size, lsn);
    let size = reader.initialize(delta_bitmap)?;
    Ok((reader, size))
}

/// Decoded increment header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementHeader {
    pub file_size: u64,
    pub blocks: Vec<u32>,
}

impl IncrementHeader {
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut fixed = [0u8; 16];
        reader
            .read_exact(&mut fixed)
            .map_err(|e| Error::InvalidIncrement(format!("reading header: {e}")))?;
        if fixed[..4] != INCREMENT_FILE_MAGIC {
            return Err(Error::InvalidIncrement(format!("bad magic {:?}", &fixed[..4])).into());
        }
        let mut buf = &fixed[4..];
        let file_size = buf.get_u64_le();
        let count = buf.get_u32_le() as usize;
        let mut raw = vec![0u8; count * 4];
        reader
            .read_exact(&mut raw)
            .map_err(|e| Error::InvalidIncrement(format!("reading block list: {e}")))?;
        let blocks = raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self { file_size, blocks })
    }
}

fn read_page<R: Read>(reader: &mut R, page: &mut [u8]) -> Result<()> {
    reader
        .read_exact(page)
        .map_err(|e| Error::InvalidIncrement(format!("reading page: {e}")).into())
}

/// Applies an increment on top of the file already restored from its base.
pub fn apply_file_increment<R: Read>(increment: &mut R, target: &Path) -> Result<()> {
    let header = IncrementHeader::read_from(increment)?;
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(target)?;
    file.set_len(header.file_size)?;
    let mut page = vec![0u8; PAGE_SIZE];
    for block in header.blocks {
        read_page(increment, &mut page)?;
        file.write_all_at(&page, block as u64 * PAGE_SIZE as u64)?;
    }
    Ok(())
}

/// Creates `target` from an increment when restoring newest first. The file
/// gets the increment's size; pages not in the increment stay zeroed until an
/// older backup fills them. Returns the blocks written.
pub fn create_file_from_increment<R: Read>(increment: &mut R, target: &Path) -> Result<RoaringBitmap> {
    let header = IncrementHeader::read_from(increment)?;
    let file = File::create(target)?;
    file.set_len(header.file_size)?;
    let mut written = RoaringBitmap::new();
    let mut page = vec![0u8; PAGE_SIZE];
    for block in header.blocks {
        read_page(increment, &mut page)?;
        file.write_all_at(&page, block as u64 * PAGE_SIZE as u64)?;
        written.insert(block);
    }
    Ok(written)
}

/// Writes pages of an older increment that no newer backup has supplied.
pub fn write_pages_from_increment<R: Read>(
    increment: &mut R,
    target: &Path,
    written: &mut RoaringBitmap,
) -> Result<()> {
    let header = IncrementHeader::read_from(increment)?;
    let file = OpenOptions::new().write(true).open(target)?;
    let limit = file.metadata()?.len();
    let mut page = vec![0u8; PAGE_SIZE];
    for block in header.blocks {
        read_page(increment, &mut page)?;
        let offset = block as u64 * PAGE_SIZE as u64;
        if written.contains(block) || offset >= limit {
            continue;
        }
        file.write_all_at(&page, offset)?;
        written.insert(block);
    }
    Ok(())
}

/// Fills the pages of `target` that no increment supplied from the full copy
/// of the file in `content`.
pub fn restore_missing_pages<R: Read>(
    content: &mut R,
    target: &Path,
    written: &RoaringBitmap,
) -> Result<()> {
    let file = OpenOptions::new().write(true).open(target)?;
    let limit = file.metadata()?.len();
    let mut page = vec![0u8; PAGE_SIZE];
    let mut block: u32 = 0;
    loop {
        let offset = block as u64 * PAGE_SIZE as u64;
        if offset >= limit {
            break;
        }
        match content.read_exact(&mut page) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        if !written.contains(block) {
            file.write_all_at(&page, offset)?;
        }
        block += 1;
    }
    // drain so the tar stream stays aligned
    io::copy(content, &mut io::sink())?;
    Ok(())
}

/// Writes a full file, replacing whatever is at `target`.
pub fn write_full_file<R: Read>(content: &mut R, target: &Path) -> Result<()> {
    let mut file = File::create(target)?;
    io::copy(content, &mut file)?;
    file.flush()?;
    Ok(())
}

fn global_block(segment: u32, block: u32) -> u32 {
    segment.wrapping_mul(BLOCKS_IN_REL_FILE).wrapping_add(block)
}

/// Validates every page of a full copy of a relation segment file. Returns
/// the relation-wide numbers of the corrupt blocks.
pub fn verify_paged_file_base<R: Read>(content: &mut R, segment: u32) -> Result<Vec<u32>> {
    let mut corrupt = Vec::new();
    let mut page = vec![0u8; PAGE_SIZE];
    let mut block: u32 = 0;
    loop {
        match read_full_page(content, &mut page)? {
            0 => break,
            n if n < PAGE_SIZE => {
                // a torn trailing page cannot be checked
                corrupt.push(global_block(segment, block));
                break;
            }
            _ => {}
        }
        let number = global_block(segment, block);
        if !verify_page(&page, number) {
            corrupt.push(number);
        }
        block += 1;
    }
    Ok(corrupt)
}

/// Validates the pages carried by an increment.
pub fn verify_paged_file_increment<R: Read>(content: &mut R, segment: u32) -> Result<Vec<u32>> {
    let header = IncrementHeader::read_from(content)?;
    let mut corrupt = Vec::new();
    let mut page = vec![0u8; PAGE_SIZE];
    for block in header.blocks {
        read_page(content, &mut page)?;
        let number = global_block(segment, block);
        if !verify_page(&page, number) {
            corrupt.push(number);
        }
    }
    io::copy(content, &mut io::sink())?;
    Ok(corrupt)
}

fn read_full_page<R: Read>(reader: &mut R, page: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < page.len() {
        match reader.read(&mut page[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
