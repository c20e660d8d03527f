use thiserror::Error;

pub mod backup;
pub mod cache;
pub mod cli;
pub mod compression;
pub mod config;
pub mod delta;
pub mod logging;
pub mod pg;
pub mod storage;
pub mod upload;
pub mod verify;
pub mod wal;

pub type Result<T> = anyhow::Result<T>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("page header is too short: {0} bytes")]
    ShortPageHeader(usize),
    #[error("invalid block {block} in {path}")]
    InvalidBlock { path: String, block: u32 },
    #[error("no delta bitmap found for {0}")]
    NoBitmapFound(String),
    #[error("tar size mismatch for {name}: header declares {expected} bytes, packed {actual}")]
    TarSize {
        name: String,
        expected: u64,
        actual: u64,
    },
    #[error("inconsistent block data state in block {block_id}: has_data={has_data}, data_length={data_length}")]
    InconsistentBlockDataState {
        block_id: u8,
        has_data: bool,
        data_length: u16,
    },
    #[error("invalid WAL record block id {0}")]
    InvalidRecordBlockId(u8),
    #[error("block {0} reuses the previous relation but none was seen")]
    NoPreviousRelFile(u8),
    #[error("WAL record is truncated: needed {needed} bytes, {available} available")]
    TruncatedRecord { needed: usize, available: usize },
    #[error("WAL continuation mismatch: {0}")]
    ContinuationMismatch(String),
    #[error("invalid WAL page magic {0:#06x}")]
    InvalidWalPageMagic(u16),
    #[error("invalid WAL filename: {0}")]
    InvalidWalFilename(String),
    #[error("invalid LSN: {0}")]
    InvalidLsn(String),
    #[error("unknown tablespace for path {0}")]
    UnknownTablespace(String),
    #[error("not a paged file: {0}")]
    NotPagedFile(String),
    #[error("invalid delta file: {0}")]
    InvalidDeltaFile(String),
    #[error("invalid increment file: {0}")]
    InvalidIncrement(String),
    #[error("delta file writer not found: {0}")]
    DeltaFileWriterNotFound(String),
    #[error("part file is not complete: {0}")]
    PartFileNotComplete(String),
    #[error("archive {0} does not exist in storage")]
    ArchiveNonExistence(String),
    #[error("archive entry escapes the destination: {0}")]
    UnsafeArchivePath(String),
    #[error("data directory is not empty: {0}")]
    NonEmptyDataDirectory(String),
    #[error("missing file description for {0}")]
    MissingFileDescription(String),
    #[error("backup chain contains a cycle near {0}")]
    ChainCycle(String),
    #[error("missing backup: {0}")]
    MissingBackup(String),
    #[error("no backup usable as the scan boundary was found")]
    NoCorrectBackupFound,
    #[error("invalid backup name: {0}")]
    InvalidBackupName(String),
    #[error("invalid timeline history record: {0}")]
    InvalidHistoryRecord(String),
    #[error("unsupported compression method: {0}")]
    UnsupportedCompression(String),
    #[error("invalid setting {name}: {value}")]
    InvalidSetting { name: String, value: String },
    #[error("serialization error")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cli error: {0}")]
    Cli(String),
}

/// Entry point for the library, called by the CLI thin wrapper.
pub fn run<I, S>(args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    logging::init_logging(logging::LogFormat::Human)?;

    let cli_args = cli::parse_args(args.into_iter().map(Into::into))?;
    cli::dispatch(cli_args)
}
