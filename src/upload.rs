//! Compressing uploader with size counters shared by all of its clones.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::compression::{CompressionMethod, CompressionRegistry};
use crate::storage::StorageFolder;
use crate::Result;

/// Byte counters owned jointly by an uploader and every clone of it.
#[derive(Debug, Default)]
pub struct UploadCounters {
    uncompressed: AtomicU64,
    compressed: AtomicU64,
}

impl UploadCounters {
    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed.load(Ordering::Relaxed)
    }

    pub fn compressed_size(&self) -> u64 {
        self.compressed.load(Ordering::Relaxed)
    }

    fn record(&self, uncompressed: u64, compressed: u64) {
        self.uncompressed.fetch_add(uncompressed, Ordering::Relaxed);
        self.compressed.fetch_add(compressed, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
pub struct Uploader {
    folder: StorageFolder,
    registry: Arc<CompressionRegistry>,
    method: CompressionMethod,
    counters: Arc<UploadCounters>,
}

impl Uploader {
    pub fn new(
        folder: StorageFolder,
        registry: Arc<CompressionRegistry>,
        method: CompressionMethod,
    ) -> Self {
        Self {
            folder,
            registry,
            method,
            counters: Arc::new(UploadCounters::default()),
        }
    }

    pub fn folder(&self) -> &StorageFolder {
        &self.folder
    }

    pub fn registry(&self) -> &CompressionRegistry {
        &self.registry
    }

    pub fn method(&self) -> CompressionMethod {
        self.method
    }

    pub fn counters(&self) -> &Arc<UploadCounters> {
        &self.counters
    }

    /// An uploader targeting a sub-folder that still feeds the same counters.
    pub fn sub_uploader(&self, name: &str) -> Uploader {
        Uploader {
            folder: self.folder.sub_folder(name),
            registry: Arc::clone(&self.registry),
            method: self.method,
            counters: Arc::clone(&self.counters),
        }
    }

    /// Compresses and stores `data` as `<base>.<ext>`; returns the object name.
    pub fn upload(&self, base: &str, data: &[u8]) -> Result<String> {
        let compressed = self.registry.compress(self.method, data)?;
        let name = self.method.object_name(base);
        self.folder.put_bytes(&name, &compressed)?;
        self.counters
            .record(data.len() as u64, compressed.len() as u64);
        debug!(
            object = %name,
            uncompressed = data.len(),
            compressed = compressed.len(),
            "uploaded_object"
        );
        Ok(name)
    }

    /// Stores `data` as-is, used for JSON metadata.
    pub fn upload_raw(&self, name: &str, data: &[u8]) -> Result<()> {
        self.folder.put_bytes(name, data)
    }
}
