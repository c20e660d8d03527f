//! PostgreSQL on-disk conventions: LSNs, WAL segment naming, relation file
//! paths, data page headers and timeline history files.

pub mod history;
pub mod lsn;
pub mod page;
pub mod relfile;
pub mod segment;

pub use lsn::Lsn;
pub use page::PageHeader;
pub use relfile::{BlockLocation, RelFileNode};
pub use segment::{WalSegmentDescription, WalSegmentNo};

/// Size of a relation data page (`BLCKSZ`).
pub const PAGE_SIZE: usize = 8192;
/// Size of a WAL page (`XLOG_BLCKSZ`).
pub const WAL_PAGE_SIZE: usize = 8192;
/// Size of a WAL segment file.
pub const WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;
/// Number of WAL segments addressed by one "xlog id" (the middle 8 hex digits).
pub const SEGMENTS_PER_XLOG_ID: u64 = 0x1_0000_0000 / WAL_SEGMENT_SIZE;
/// Relations are split into segment files of at most this many bytes.
pub const RELFILE_SIZE_BOUND: u64 = 1 << 30;
/// Number of pages held by one relation segment file.
pub const BLOCKS_IN_REL_FILE: u32 = (RELFILE_SIZE_BOUND / PAGE_SIZE as u64) as u32;

pub const DEFAULT_SPC_NODE: u32 = 1663;
pub const GLOBAL_SPC_NODE: u32 = 1664;
