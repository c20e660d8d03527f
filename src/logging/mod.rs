//! Logging initialization using `tracing` and `tracing-subscriber`.

use tracing::{info, warn};
use tracing_subscriber::{fmt, util::SubscriberInitExt, EnvFilter};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

/// Outcome of one delta flush, emitted after part and delta files were
/// combined, uploaded or parked locally.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaFlushSnapshot {
    pub part_files_completed: usize,
    pub part_files_saved: usize,
    pub delta_files_uploaded: usize,
    pub delta_files_saved: usize,
    pub delta_files_canceled: usize,
}

/// Totals for one backup push.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackupPushSnapshot {
    pub files_total: usize,
    pub files_incremented: usize,
    pub files_skipped: usize,
    pub corrupt_blocks: usize,
    pub tar_partitions: usize,
    pub uncompressed_bytes: u64,
    pub compressed_bytes: u64,
}

/// Initialize global tracing subscriber. Safe to call multiple times; subsequent
/// calls will no-op.
pub fn init_logging(format: LogFormat) -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Human => {
            let _ = builder.finish().try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().finish().try_init();
        }
    };

    Ok(())
}

pub fn log_delta_flush(snapshot: DeltaFlushSnapshot) {
    if snapshot.delta_files_canceled > 0 {
        warn!(
            target = "pgdelta::delta",
            part_files_completed = snapshot.part_files_completed,
            part_files_saved = snapshot.part_files_saved,
            delta_files_uploaded = snapshot.delta_files_uploaded,
            delta_files_saved = snapshot.delta_files_saved,
            delta_files_canceled = snapshot.delta_files_canceled,
            "delta_flush_with_cancellations"
        );
    } else {
        info!(
            target = "pgdelta::delta",
            part_files_completed = snapshot.part_files_completed,
            part_files_saved = snapshot.part_files_saved,
            delta_files_uploaded = snapshot.delta_files_uploaded,
            delta_files_saved = snapshot.delta_files_saved,
            "delta_flush"
        );
    }
}

pub fn log_backup_push(name: &str, snapshot: BackupPushSnapshot) {
    info!(
        target = "pgdelta::backup",
        backup = name,
        files_total = snapshot.files_total,
        files_incremented = snapshot.files_incremented,
        files_skipped = snapshot.files_skipped,
        corrupt_blocks = snapshot.corrupt_blocks,
        tar_partitions = snapshot.tar_partitions,
        uncompressed_bytes = snapshot.uncompressed_bytes,
        compressed_bytes = snapshot.compressed_bytes,
        "backup_push_finished"
    );
}
