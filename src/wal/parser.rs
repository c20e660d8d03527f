use std::io::{self, Read, Write};

use bytes::{Buf, Bytes};
use tracing::debug;

use crate::pg::WAL_PAGE_SIZE;
use crate::{Error, Result};

use super::max_align;
use super::record::{XLogRecord, XLOG_RECORD_HEADER_SIZE};

pub const XLP_FIRST_IS_CONTRECORD: u16 = 0x0001;
pub const XLP_LONG_HEADER: u16 = 0x0002;
pub const WAL_SHORT_PAGE_HEADER_SIZE: usize = 24;
pub const WAL_LONG_PAGE_HEADER_SIZE: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalPageHeader {
    pub magic: u16,
    pub info: u16,
    pub timeline: u32,
    pub page_address: u64,
    pub remaining_data_len: u32,
    pub system_id: Option<u64>,
    pub segment_size: Option<u32>,
    pub block_size: Option<u32>,
}

impl WalPageHeader {
    pub fn parse(page: &[u8]) -> Result<Self> {
        if page.len() < WAL_SHORT_PAGE_HEADER_SIZE {
            return Err(Error::TruncatedRecord {
                needed: WAL_SHORT_PAGE_HEADER_SIZE,
                available: page.len(),
            }
            .into());
        }
        let mut buf = page;
        let mut header = WalPageHeader {
            magic: buf.get_u16_le(),
            info: buf.get_u16_le(),
            timeline: buf.get_u32_le(),
            page_address: buf.get_u64_le(),
            remaining_data_len: buf.get_u32_le(),
            ..Default::default()
        };
        if header.magic == 0 {
            return Err(Error::InvalidWalPageMagic(header.magic).into());
        }
        if header.is_long() {
            if page.len() < WAL_LONG_PAGE_HEADER_SIZE {
                return Err(Error::TruncatedRecord {
                    needed: WAL_LONG_PAGE_HEADER_SIZE,
                    available: page.len(),
                }
                .into());
            }
            let mut long = &page[WAL_SHORT_PAGE_HEADER_SIZE..];
            header.system_id = Some(long.get_u64_le());
            header.segment_size = Some(long.get_u32_le());
            header.block_size = Some(long.get_u32_le());
        }
        Ok(header)
    }

    pub fn is_long(&self) -> bool {
        self.info & XLP_LONG_HEADER != 0
    }

    pub fn is_continuation(&self) -> bool {
        self.info & XLP_FIRST_IS_CONTRECORD != 0
    }

    pub fn len(&self) -> usize {
        if self.is_long() {
            WAL_LONG_PAGE_HEADER_SIZE
        } else {
            WAL_SHORT_PAGE_HEADER_SIZE
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ParserState {
    /// No record boundary seen yet; continuation bytes are collected here.
    Unsynchronized { discarded: Vec<u8> },
    /// Aligned on records; `head` holds the unfinished record, if any.
    Synchronized { head: Vec<u8> },
}

/// Splits WAL pages into records, carrying an unfinished record across page
/// and segment boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalParser {
    state: ParserState,
}

/// Outcome of parsing one segment.
#[derive(Debug, Clone, Default)]
pub struct ParsedSegment {
    /// Continuation bytes at the start of the segment that belong to a record
    /// begun in the previous segment. Empty when the parser already knew that
    /// record or when the segment starts on a record boundary.
    pub discarded_tail: Vec<u8>,
    pub records: Vec<XLogRecord>,
}

impl Default for WalParser {
    fn default() -> Self {
        Self::new()
    }
}

impl WalParser {
    /// A parser that has not seen any WAL yet.
    pub fn new() -> Self {
        Self {
            state: ParserState::Unsynchronized {
                discarded: Vec::new(),
            },
        }
    }

    /// A parser resuming with `head` as the start of the record that
    /// continues on the next page.
    pub fn from_record_head(head: Vec<u8>) -> Self {
        Self {
            state: ParserState::Synchronized { head },
        }
    }

    pub fn is_synchronized(&self) -> bool {
        matches!(self.state, ParserState::Synchronized { .. })
    }

    /// Bytes of the record that was cut off at the end of the last page.
    pub fn current_record_head(&self) -> &[u8] {
        match &self.state {
            ParserState::Synchronized { head } => head,
            ParserState::Unsynchronized { .. } => &[],
        }
    }

    /// Parses one WAL page. Returns the bytes discarded before the first
    /// record boundary when this page synchronizes a fresh parser.
    pub fn parse_records_from_page(
        &mut self,
        page: &[u8],
    ) -> Result<(Option<Vec<u8>>, Vec<XLogRecord>)> {
        let header = WalPageHeader::parse(page)?;
        let mut pos = header.len();
        let mut discarded_tail = None;
        let mut records = Vec::new();

        if header.is_continuation() {
            let remaining = header.remaining_data_len as usize;
            let take = remaining.min(page.len().saturating_sub(pos));
            let chunk = &page[pos..pos + take];
            let finished = remaining <= take;
            match &mut self.state {
                ParserState::Unsynchronized { discarded } => {
                    discarded.extend_from_slice(chunk);
                    if finished {
                        discarded_tail = Some(std::mem::take(discarded));
                        self.state = ParserState::Synchronized { head: Vec::new() };
                    }
                }
                ParserState::Synchronized { head } => {
                    if head.len() < 4 {
                        return Err(Error::ContinuationMismatch(format!(
                            "page at {:X} continues a record the parser did not see",
                            header.page_address
                        ))
                        .into());
                    }
                    let total = u32::from_le_bytes([head[0], head[1], head[2], head[3]]) as usize;
                    if total != head.len() + remaining {
                        return Err(Error::ContinuationMismatch(format!(
                            "record of {total} bytes has {} buffered and {remaining} pending",
                            head.len()
                        ))
                        .into());
                    }
                    head.extend_from_slice(chunk);
                    if finished {
                        let complete = std::mem::take(head);
                        records.push(XLogRecord::decode(Bytes::from(complete))?);
                    }
                }
            }
            if !finished {
                return Ok((discarded_tail, records));
            }
            pos += max_align(take);
        } else {
            match &mut self.state {
                ParserState::Unsynchronized { discarded } => {
                    discarded_tail = Some(std::mem::take(discarded));
                    self.state = ParserState::Synchronized { head: Vec::new() };
                }
                ParserState::Synchronized { head } if !head.is_empty() => {
                    return Err(Error::ContinuationMismatch(format!(
                        "page at {:X} does not continue the buffered record",
                        header.page_address
                    ))
                    .into());
                }
                ParserState::Synchronized { .. } => {}
            }
        }

        while pos + 4 <= page.len() {
            let total = u32::from_le_bytes([page[pos], page[pos + 1], page[pos + 2], page[pos + 3]])
                as usize;
            if total < XLOG_RECORD_HEADER_SIZE {
                // zero fill or garbage: nothing more on this page
                break;
            }
            let available = page.len() - pos;
            if total > available {
                self.state = ParserState::Synchronized {
                    head: page[pos..].to_vec(),
                };
                break;
            }
            let record = XLogRecord::decode(Bytes::copy_from_slice(&page[pos..pos + total]))?;
            let switch = record.is_wal_switch();
            records.push(record);
            if switch {
                break;
            }
            pos += max_align(total);
        }
        Ok((discarded_tail, records))
    }

    /// Parses a whole segment from `reader`, stopping at the first zeroed
    /// page, at a page whose address does not follow its predecessor, at an
    /// `XLOG_SWITCH` record or at end of input.
    pub fn parse_segment<R: Read>(&mut self, reader: &mut R) -> Result<ParsedSegment> {
        let mut parsed = ParsedSegment::default();
        let mut page = vec![0u8; WAL_PAGE_SIZE];
        let mut page_no = 0usize;
        let mut expected_address: Option<u64> = None;

        loop {
            let filled = read_full(reader, &mut page)?;
            if filled == 0 {
                break;
            }
            if filled < WAL_PAGE_SIZE {
                debug!(page = page_no, bytes = filled, "wal_segment_partial_page");
                break;
            }
            if page.iter().all(|b| *b == 0) {
                break;
            }
            let address = WalPageHeader::parse(&page)?.page_address;
            if expected_address.is_some_and(|expected| expected != address) {
                // recycled segment: the rest is left over from an older one
                debug!(page = page_no, address, "wal_segment_stale_page");
                break;
            }
            expected_address = Some(address + WAL_PAGE_SIZE as u64);
            let (tail, records) = self.parse_records_from_page(&page)?;
            if let Some(tail) = tail {
                parsed.discarded_tail = tail;
            }
            let switched = records.last().map(XLogRecord::is_wal_switch).unwrap_or(false);
            parsed.records.extend(records);
            page_no += 1;
            if switched {
                break;
            }
        }

        if let ParserState::Unsynchronized { discarded } = &self.state {
            if !discarded.is_empty() {
                return Err(Error::ContinuationMismatch(
                    "record continuation spans the whole segment".to_string(),
                )
                .into());
            }
        }
        Ok(parsed)
    }

    /// Serializes the resumable state: synchronized flag, length, buffered bytes.
    pub fn save<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let (flag, bytes) = match &self.state {
            ParserState::Unsynchronized { discarded } => (0u8, discarded),
            ParserState::Synchronized { head } => (1u8, head),
        };
        writer.write_all(&[flag])?;
        writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
        writer.write_all(bytes)
    }

    pub fn load<R: Read>(reader: &mut R) -> Result<Self> {
        let mut flag = [0u8; 1];
        reader.read_exact(&mut flag)?;
        let mut len = [0u8; 4];
        reader.read_exact(&mut len)?;
        let mut bytes = vec![0u8; u32::from_le_bytes(len) as usize];
        reader.read_exact(&mut bytes)?;
        let state = match flag[0] {
            0 => ParserState::Unsynchronized { discarded: bytes },
            1 => ParserState::Synchronized { head: bytes },
            other => {
                return Err(Error::InvalidDeltaFile(format!("unknown parser state {other}")).into())
            }
        };
        Ok(Self { state })
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
