//! Runtime settings: an optional JSON file overlaid with `PGDELTA_*`
//! environment variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::compression::CompressionMethod;
use crate::{Error, Result};

pub const ENV_PREFIX: &str = "PGDELTA_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Number of concurrent packing workers; also the in-flight window used
    /// when classifying missing WAL segments.
    pub upload_concurrency: usize,
    pub max_delayed_segments_count: usize,
    pub compression_method: CompressionMethod,
    pub verify_page_checksums: bool,
    pub store_all_corrupt_blocks: bool,
    pub use_wal_delta: bool,
    pub tar_size_threshold: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_data_folder: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            upload_concurrency: 16,
            max_delayed_segments_count: 0,
            compression_method: CompressionMethod::Lz4,
            verify_page_checksums: false,
            store_all_corrupt_blocks: false,
            use_wal_delta: false,
            tar_size_threshold: 1 << 30,
            delta_data_folder: None,
        }
    }
}

impl Settings {
    /// Reads `path` when given, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => {
                debug!(config = %path.display(), "loading_settings");
                serde_json::from_slice(&std::fs::read(path)?)?
            }
            None => Settings::default(),
        };
        settings.apply_overrides(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok())?;
        Ok(settings)
    }

    /// Applies overrides from `lookup`, which maps an upper-case setting name
    /// (without prefix) to its raw value.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_with(&lookup, "UPLOAD_CONCURRENCY", &mut self.upload_concurrency)?;
        override_with(
            &lookup,
            "MAX_DELAYED_SEGMENTS_COUNT",
            &mut self.max_delayed_segments_count,
        )?;
        override_with(&lookup, "COMPRESSION_METHOD", &mut self.compression_method)?;
        override_with(&lookup, "VERIFY_PAGE_CHECKSUMS", &mut self.verify_page_checksums)?;
        override_with(
            &lookup,
            "STORE_ALL_CORRUPT_BLOCKS",
            &mut self.store_all_corrupt_blocks,
        )?;
        override_with(&lookup, "USE_WAL_DELTA", &mut self.use_wal_delta)?;
        override_with(&lookup, "TAR_SIZE_THRESHOLD", &mut self.tar_size_threshold)?;
        if let Some(folder) = lookup("DELTA_DATA_FOLDER") {
            self.delta_data_folder = Some(PathBuf::from(folder));
        }
        if self.upload_concurrency == 0 {
            return Err(Error::InvalidSetting {
                name: "upload_concurrency".into(),
                value: "0".into(),
            }
            .into());
        }
        Ok(())
    }
}

fn override_with<F, T>(lookup: &F, name: &str, slot: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(name) {
        *slot = raw.trim().parse().map_err(|_| Error::InvalidSetting {
            name: format!("{ENV_PREFIX}{name}"),
            value: raw.clone(),
        })?;
    }
    Ok(())
}
