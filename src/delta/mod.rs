//! Changed-block tracking between backups: the in-memory delta map, the
//! per-group delta files written while WAL is archived, and the manager that
//! stitches records split across segment boundaries.

pub mod file;
pub mod manager;
pub mod map;
pub mod part;
pub mod recorder;

pub use file::{DeltaFile, DeltaNo, WAL_FILES_IN_DELTA};
pub use manager::{DeltaFileManager, FlushSummary};
pub use map::DeltaMap;
pub use part::{WalPartFile, WalPartRecorder};
pub use recorder::record_wal_segment;
