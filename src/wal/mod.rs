//! Write-ahead log decoding: page headers, record framing across pages and
//! segments, and the block references carried by each record.

pub mod parser;
pub mod push;
pub mod record;

pub use parser::{ParsedSegment, WalPageHeader, WalParser};
pub use push::{push_wal_file, WalPushOutcome};
pub use record::{extract_block_locations, XLogRecord};

/// WAL records start on 8 byte boundaries.
pub(crate) fn max_align(len: usize) -> usize {
    (len + 7) & !7
}
