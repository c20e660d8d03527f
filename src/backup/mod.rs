//! Base and delta backups: pushing a data directory, chains of increments,
//! and restoring them.

pub mod bundle;
pub mod chain;
pub mod fetch;
pub mod incremental;
pub mod metadata;
pub mod packer;
pub mod tarball;

pub use bundle::{push_backup, BackupPushRequest, BackupPushResult};
pub use chain::{BackupChain, BackupChainElement, ChainIntegrity};
pub use fetch::{fetch_backup, fetch_backup_old, FetchOptions};
pub use incremental::{read_incremental_file, IncrementHeader, IncrementalPageReader};
pub use metadata::{
    backup_name, list_backups, resolve_backup_name, Backup, BackupFileDescription, BackupFileList,
    BackupSentinel, ExtendedMetadata, TablespaceSpec,
};
pub use packer::{BundleFiles, ComposeFileInfo, PackerOptions, RelFileStatistics, RelationStat, TarBallFilePacker};
pub use tarball::{TarBall, TarBallMaker};
