//! Tar partitions of a backup. Each packing worker fills its own partition
//! and hands it back for upload once it grows past the size threshold.

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tar::{Builder, Header};
use tracing::debug;

use crate::upload::Uploader;
use crate::{Error, Result};

use super::metadata::TAR_PARTITIONS_FOLDER;

struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

pub struct TarBall {
    number: u64,
    builder: Builder<Vec<u8>>,
    size: u64,
    files: Vec<String>,
}

impl TarBall {
    fn new(number: u64) -> Self {
        Self {
            number,
            builder: Builder::new(Vec::new()),
            size: 0,
            files: Vec::new(),
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /// Bytes of file content appended so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// Appends one entry; the reader must yield exactly the size declared by
    /// `header`.
    pub fn append<R: Read>(&mut self, header: &Header, reader: R) -> Result<u64> {
        let name = header.path()?.display().to_string();
        let expected = header.size()?;
        let mut counting = CountingReader {
            inner: reader.take(expected),
            count: 0,
        };
        self.builder.append(header, &mut counting)?;
        if counting.count != expected {
            return Err(Error::TarSize {
                name,
                expected,
                actual: counting.count,
            }
            .into());
        }
        self.size += expected;
        if header.entry_type().is_file() {
            self.files.push(name);
        }
        Ok(expected)
    }

    pub fn append_directory(&mut self, name: &str, header: &mut Header) -> Result<()> {
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        self.builder.append_data(header, name, io::empty())?;
        Ok(())
    }

    fn into_bytes(self) -> Result<(Vec<u8>, Vec<String>)> {
        Ok((self.builder.into_inner()?, self.files))
    }
}

/// Hands out numbered partitions and uploads them, recording which files
/// went into which object.
#[derive(Clone)]
pub struct TarBallMaker {
    uploader: Uploader,
    counter: Arc<AtomicU64>,
    tar_file_sets: Arc<Mutex<BTreeMap<String, Vec<String>>>>,
}

impl TarBallMaker {
    /// `uploader` points at the backup's folder; partitions go below it.
    pub fn new(backup_uploader: &Uploader) -> Self {
        Self {
            uploader: backup_uploader.sub_uploader(TAR_PARTITIONS_FOLDER),
            counter: Arc::new(AtomicU64::new(0)),
            tar_file_sets: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn make(&self) -> TarBall {
        TarBall::new(self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn finish(&self, tar: TarBall) -> Result<String> {
        let number = tar.number;
        let (bytes, files) = tar.into_bytes()?;
        let name = self.uploader.upload(&format!("part_{number}.tar"), &bytes)?;
        debug!(tar = %name, files = files.len(), bytes = bytes.len(), "tar_partition_uploaded");
        self.tar_file_sets.lock().insert(name.clone(), files);
        Ok(name)
    }

    pub fn tar_file_sets(&self) -> BTreeMap<String, Vec<String>> {
        self.tar_file_sets.lock().clone()
    }

    pub fn partitions(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}
