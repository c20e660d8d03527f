//! Packs one data-directory file into a tar partition, as a full copy or as
//! an increment against the base backup.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use dashmap::DashMap;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use tar::Header;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::delta::DeltaMap;
use crate::pg::relfile::{is_paged_file, rel_file_from_path};
use crate::pg::{Lsn, RelFileNode};
use crate::{Error, Result};

use super::incremental::{read_incremental_file, verify_paged_file_base, verify_paged_file_increment};
use super::metadata::{BackupFileDescription, BackupFileList};
use super::tarball::TarBall;

const TEE_CHANNEL_DEPTH: usize = 16;

/// A regular file found while walking the data directory.
#[derive(Debug, Clone)]
pub struct ComposeFileInfo {
    pub path: PathBuf,
    /// Name inside the backup, relative to the data directory.
    pub name: String,
    pub file_size: u64,
    pub mtime: OffsetDateTime,
    pub mode: u32,
    pub is_incremented: bool,
}

impl ComposeFileInfo {
    fn tar_header(&self, size: u64) -> Result<Header> {
        let mut header = Header::new_gnu();
        header.set_path(&self.name)?;
        header.set_size(size);
        header.set_mode(self.mode);
        header.set_mtime(self.mtime.unix_timestamp().max(0) as u64);
        header.set_cksum();
        Ok(header)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PackerOptions {
    pub verify_page_checksums: bool,
    pub store_all_corrupt_blocks: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationStat {
    pub inserted_tuples: u64,
    pub updated_tuples: u64,
    pub deleted_tuples: u64,
}

pub type RelFileStatistics = HashMap<RelFileNode, RelationStat>;

/// File descriptions collected by all packing workers.
#[derive(Debug, Default)]
pub struct BundleFiles {
    files: DashMap<String, BackupFileDescription>,
    stats: Option<RelFileStatistics>,
}

impl BundleFiles {
    pub fn new(stats: Option<RelFileStatistics>) -> Self {
        Self {
            files: DashMap::new(),
            stats,
        }
    }

    fn update_count(&self, name: &str) -> u64 {
        let Some(stats) = &self.stats else {
            return 0;
        };
        match rel_file_from_path(Path::new(name)) {
            Ok((rel, _)) => stats
                .get(&rel)
                .map(|s| s.inserted_tuples + s.updated_tuples + s.deleted_tuples)
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    fn describe(&self, name: &str, mut description: BackupFileDescription) {
        description.update_count = self.update_count(name);
        self.files.insert(name.to_string(), description);
    }

    pub fn add_file(&self, info: &ComposeFileInfo) {
        self.describe(
            &info.name,
            BackupFileDescription::new(info.is_incremented, false, info.mtime),
        );
    }

    pub fn add_skipped_file(&self, info: &ComposeFileInfo) {
        self.describe(&info.name, BackupFileDescription::new(false, true, info.mtime));
    }

    pub fn add_file_with_corrupt_blocks(&self, info: &ComposeFileInfo, blocks: Vec<u32>, store_all: bool) {
        let mut description = BackupFileDescription::new(info.is_incremented, false, info.mtime);
        if !blocks.is_empty() {
            warn!(file = %info.name, corrupt = blocks.len(), "corrupt_blocks_found");
        }
        description.set_corrupt_blocks(blocks, store_all);
        self.describe(&info.name, description);
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn to_file_list(&self) -> BackupFileList {
        self.files
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

enum FileSource {
    Read { reader: Box<dyn Read + Send>, size: u64 },
    Skipped,
    Vanished,
}

fn is_not_found(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<io::Error>() {
        Some(e) => e.kind() == io::ErrorKind::NotFound,
        None => matches!(err.downcast_ref::<Error>(), Some(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound),
    }
}

/// Reads the file padded with zeros to the size seen during the walk, so a
/// file that shrinks mid-read still matches its tar header.
fn start_reading_file(info: &ComposeFileInfo) -> Result<FileSource> {
    match File::open(&info.path) {
        Ok(file) => Ok(FileSource::Read {
            reader: Box::new(file.chain(io::repeat(0)).take(info.file_size)),
            size: info.file_size,
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(FileSource::Vanished),
        Err(e) => Err(e.into()),
    }
}

/// Forwards every chunk read to a verifier thread.
struct TeeReader<R> {
    inner: R,
    sender: Sender<Vec<u8>>,
}

impl<R: Read> Read for TeeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.sender
                .send(buf[..n].to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "page verifier stopped"))?;
        }
        Ok(n)
    }
}

/// The receiving end of a `TeeReader`.
struct ChannelReader {
    receiver: Receiver<Vec<u8>>,
    current: Vec<u8>,
    offset: usize,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.offset == self.current.len() {
            match self.receiver.recv() {
                Ok(chunk) => {
                    self.current = chunk;
                    self.offset = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len() - self.offset);
        buf[..n].copy_from_slice(&self.current[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

fn verify_file<R: Read>(name: &str, reader: &mut R, is_incremented: bool) -> Result<Vec<u32>> {
    let path = Path::new(name);
    if !is_paged_file(path) {
        io::copy(reader, &mut io::sink())?;
        return Ok(Vec::new());
    }
    let segment = rel_file_from_path(path).map(|(_, seg)| seg).unwrap_or(0);
    if is_incremented {
        verify_paged_file_increment(reader, segment)
    } else {
        verify_paged_file_base(reader, segment)
    }
}

pub struct TarBallFilePacker {
    delta_map: Option<Arc<DeltaMap>>,
    increment_from_lsn: Option<Lsn>,
    files: Arc<BundleFiles>,
    options: PackerOptions,
}

impl TarBallFilePacker {
    pub fn new(
        delta_map: Option<Arc<DeltaMap>>,
        increment_from_lsn: Option<Lsn>,
        files: Arc<BundleFiles>,
        options: PackerOptions,
    ) -> Self {
        Self {
            delta_map,
            increment_from_lsn,
            files,
            options,
        }
    }

    pub fn files(&self) -> &Arc<BundleFiles> {
        &self.files
    }

    fn get_delta_bitmap_for(&self, name: &str) -> Result<Option<RoaringBitmap>> {
        match &self.delta_map {
            Some(map) => map.get_delta_bitmap_for(Path::new(name)).map(Some),
            None => Ok(None),
        }
    }

    fn create_file_read_closer(&self, info: &mut ComposeFileInfo) -> Result<FileSource> {
        let base_lsn = match self.increment_from_lsn {
            Some(lsn) if info.is_incremented => lsn,
            _ => {
                info.is_incremented = false;
                return start_reading_file(info);
            }
        };
        let bitmap = match self.get_delta_bitmap_for(&info.name) {
            Ok(bitmap) => bitmap,
            Err(err) => {
                if let Some(Error::NoBitmapFound(_)) = err.downcast_ref::<Error>() {
                    return Ok(FileSource::Skipped);
                }
                return Err(err.context(format!("finding delta bitmap for {}", info.name)));
            }
        };
        match read_incremental_file(&info.path, info.file_size, base_lsn, bitmap.as_ref()) {
            Ok((reader, size)) => Ok(FileSource::Read {
                reader: Box::new(reader.chain(io::repeat(0)).take(size)),
                size,
            }),
            Err(err) if is_not_found(&err) => Ok(FileSource::Vanished),
            Err(err) => match err.downcast_ref::<Error>() {
                Some(Error::InvalidBlock { .. }) => {
                    warn!(file = %info.name, error = %err, "incremental_read_failed_packing_full");
                    info.is_incremented = false;
                    start_reading_file(info)
                }
                _ => Err(err.context(format!("reading incremental file {}", info.name))),
            },
        }
    }

    /// Packs `info` into `tar` and records its description. Files unchanged
    /// since the delta base are recorded as skipped; files removed since the
    /// walk are ignored.
    pub fn pack_file_into_tar(&self, info: &mut ComposeFileInfo, tar: &mut TarBall) -> Result<()> {
        let (reader, size) = match self.create_file_read_closer(info)? {
            FileSource::Read { reader, size } => (reader, size),
            FileSource::Skipped => {
                debug!(file = %info.name, "file_skipped");
                self.files.add_skipped_file(info);
                return Ok(());
            }
            FileSource::Vanished => {
                warn!(file = %info.name, "file_deleted_before_packing");
                return Ok(());
            }
        };
        let header = info.tar_header(size)?;

        if !self.options.verify_page_checksums {
            tar.append(&header, reader)?;
            self.files.add_file(info);
            return Ok(());
        }

        let (sender, receiver) = bounded(TEE_CHANNEL_DEPTH);
        let name = info.name.clone();
        let is_incremented = info.is_incremented;
        let (packed, verified) = thread::scope(|scope| {
            let verifier = scope.spawn(move || {
                let mut reader = ChannelReader {
                    receiver,
                    current: Vec::new(),
                    offset: 0,
                };
                verify_file(&name, &mut reader, is_incremented)
            });
            let packed = tar.append(&header, TeeReader { inner: reader, sender });
            let verified = verifier
                .join()
                .unwrap_or_else(|_| Err(anyhow::anyhow!("page verifier panicked")));
            (packed, verified)
        });
        // a verifier failure explains a broken tee, so report it first
        let corrupt = verified?;
        packed?;
        self.files
            .add_file_with_corrupt_blocks(info, corrupt, self.options.store_all_corrupt_blocks);
        Ok(())
    }
}
