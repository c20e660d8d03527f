//! Archiving a single WAL file, with delta recording for segments.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::compression::CompressionRegistry;
use crate::config::Settings;
use crate::delta::{record_wal_segment, DeltaFileManager, FlushSummary};
use crate::pg::WalSegmentDescription;
use crate::storage::{DataFolder, StorageFolder, WAL_FOLDER};
use crate::upload::Uploader;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct WalPushOutcome {
    pub object: String,
    pub delta: Option<FlushSummary>,
}

/// Compresses and uploads the file at `path` into the WAL folder. When delta
/// recording is enabled, segments are also parsed into their delta group; a
/// recording failure cancels that group but never fails the push.
pub fn push_wal_file(
    storage: &StorageFolder,
    registry: Arc<CompressionRegistry>,
    settings: &Settings,
    path: &Path,
) -> Result<WalPushOutcome> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| Error::InvalidWalFilename(path.display().to_string()))?;
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;

    let uploader = Uploader::new(
        storage.sub_folder(WAL_FOLDER),
        registry,
        settings.compression_method,
    );
    let object = uploader.upload(&name, &bytes)?;
    info!(wal = %name, object = %object, "wal_pushed");

    let delta_folder = match (&settings.delta_data_folder, settings.use_wal_delta) {
        (Some(folder), true) if WalSegmentDescription::parse(&name).is_ok() => folder,
        _ => return Ok(WalPushOutcome { object, delta: None }),
    };
    let manager = DeltaFileManager::new(DataFolder::new(delta_folder)?)?;
    if let Err(err) = record_wal_segment(&manager, &name, &mut bytes.as_slice()) {
        warn!(wal = %name, error = %format!("{err:#}"), "delta_recording_canceled");
    }
    let summary = manager.flush_files(&uploader)?;
    Ok(WalPushOutcome {
        object,
        delta: Some(summary),
    })
}
