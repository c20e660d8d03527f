use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::LazyCache;
use crate::logging::{self, DeltaFlushSnapshot};
use crate::pg::segment::next_wal_filename;
use crate::pg::BlockLocation;
use crate::storage::DataFolder;
use crate::upload::Uploader;
use crate::wal::{extract_block_locations, WalParser};
use crate::{Error, Result};

use super::file::{delta_filename_for, part_filename, DeltaFile};
use super::part::WalPartFile;

/// Owns one delta file and the thread that appends locations to it.
pub struct DeltaFileChanWriter {
    delta_file: Arc<Mutex<DeltaFile>>,
    sender: Mutex<Option<Sender<BlockLocation>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl DeltaFileChanWriter {
    pub fn new(delta_file: DeltaFile) -> Result<Self> {
        let delta_file = Arc::new(Mutex::new(delta_file));
        let (sender, receiver) = unbounded::<BlockLocation>();
        let sink = Arc::clone(&delta_file);
        let consumer = thread::Builder::new()
            .name("delta-writer".into())
            .spawn(move || {
                for location in receiver {
                    sink.lock().locations.push(location);
                }
            })?;
        Ok(Self {
            delta_file,
            sender: Mutex::new(Some(sender)),
            consumer: Mutex::new(Some(consumer)),
        })
    }

    /// A producer handle. Every handle must be dropped before the manager is
    /// flushed, otherwise the drain never finishes.
    pub fn consumer(&self) -> Result<Sender<BlockLocation>> {
        self.sender
            .lock()
            .as_ref()
            .cloned()
            .ok_or_else(|| anyhow!("delta file writer is already closed"))
    }

    pub fn set_wal_parser(&self, parser: WalParser) {
        self.delta_file.lock().wal_parser = parser;
    }

    pub fn snapshot(&self) -> DeltaFile {
        self.delta_file.lock().clone()
    }

    fn close(&self) {
        self.sender.lock().take();
    }

    fn wait(&self) -> Result<()> {
        if let Some(handle) = self.consumer.lock().take() {
            handle
                .join()
                .map_err(|_| anyhow!("delta writer thread panicked"))?;
        }
        Ok(())
    }
}

/// What a flush did with each delta group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub completed_part_files: Vec<String>,
    pub saved_part_files: Vec<String>,
    pub uploaded_delta_files: Vec<String>,
    pub saved_delta_files: Vec<String>,
    pub canceled_delta_files: Vec<String>,
}

/// In-flight delta state for a WAL archiving session. Part files and delta
/// writers are keyed by delta filename and loaded at most once, resuming from
/// whatever a previous session left in the data folder.
pub struct DeltaFileManager {
    data_folder: DataFolder,
    part_files: LazyCache<String, Mutex<WalPartFile>>,
    delta_file_writers: LazyCache<String, DeltaFileChanWriter>,
    canceled_sender: Sender<String>,
    canceled_collector: JoinHandle<()>,
    canceled: Arc<Mutex<HashSet<String>>>,
}

impl DeltaFileManager {
    pub fn new(data_folder: DataFolder) -> Result<Self> {
        let parts_folder = data_folder.clone();
        let part_files = LazyCache::new(move |delta_filename: &String| {
            let name = part_filename(delta_filename);
            let part = match parts_folder.open_readonly(&name)? {
                Some(mut file) => {
                    debug!(part = %name, "part_file_resumed");
                    WalPartFile::load(&mut file).with_context(|| format!("loading {name}"))?
                }
                None => WalPartFile::new(),
            };
            Ok(Mutex::new(part))
        });

        let deltas_folder = data_folder.clone();
        let delta_file_writers = LazyCache::new(move |delta_filename: &String| {
            let delta = match deltas_folder.open_readonly(delta_filename)? {
                Some(mut file) => {
                    debug!(delta = %delta_filename, "delta_file_resumed");
                    DeltaFile::load(&mut file)
                        .with_context(|| format!("loading {delta_filename}"))?
                }
                None => DeltaFile::new(WalParser::new()),
            };
            DeltaFileChanWriter::new(delta)
        });

        let canceled = Arc::new(Mutex::new(HashSet::new()));
        let (canceled_sender, receiver) = unbounded::<String>();
        let sink = Arc::clone(&canceled);
        let canceled_collector = thread::Builder::new()
            .name("delta-cancel".into())
            .spawn(move || {
                for delta_filename in receiver {
                    sink.lock().insert(delta_filename);
                }
            })?;

        Ok(Self {
            data_folder,
            part_files,
            delta_file_writers,
            canceled_sender,
            canceled_collector,
            canceled,
        })
    }

    pub fn get_part_file(&self, delta_filename: &str) -> Result<Arc<Mutex<WalPartFile>>> {
        Ok(self.part_files.load(&delta_filename.to_string())?.0)
    }

    pub fn get_delta_file_writer(&self, delta_filename: &str) -> Result<Arc<DeltaFileChanWriter>> {
        Ok(self.delta_file_writers.load(&delta_filename.to_string())?.0)
    }

    /// Channel feeding the delta file `delta_filename`.
    pub fn get_block_location_consumer(&self, delta_filename: &str) -> Result<Sender<BlockLocation>> {
        self.get_delta_file_writer(delta_filename)?.consumer()
    }

    /// Marks the delta groups of `wal_filename` and of the segment after it as
    /// untrustworthy; neither will be uploaded by this session.
    pub fn cancel_recording(&self, wal_filename: &str) -> Result<()> {
        let current = delta_filename_for(wal_filename)?;
        let next = delta_filename_for(&next_wal_filename(wal_filename)?)?;
        warn!(wal = wal_filename, delta = %current, next_delta = %next, "delta_recording_canceled");
        for name in [current, next] {
            self.canceled_sender
                .send(name)
                .map_err(|_| anyhow!("cancellation collector is gone"))?;
        }
        Ok(())
    }

    /// Finishes the session: complete part files are folded into their delta
    /// files, which are uploaded; everything unfinished is parked in the data
    /// folder for the next session. Consumes the manager so no recording can
    /// race with the flush.
    ///
    /// A group that cannot be combined, uploaded or parked is canceled and
    /// leaves nothing in the data folder. A part file is parked only after
    /// its delta file.
    pub fn flush_files(self, uploader: &Uploader) -> Result<FlushSummary> {
        let DeltaFileManager {
            data_folder,
            part_files,
            delta_file_writers,
            canceled_sender,
            canceled_collector,
            canceled,
        } = self;

        let mut summary = FlushSummary::default();

        // Part files first: combining them produces locations for the writers.
        drop(canceled_sender);
        canceled_collector
            .join()
            .map_err(|_| anyhow!("cancellation collector panicked"))?;
        let mut canceled = std::mem::take(&mut *canceled.lock());

        let mut parts = part_files.snapshot();
        parts.sort_by(|a, b| a.0.cmp(&b.0));
        let mut pending_parts = Vec::new();
        for (delta_filename, part) in parts {
            if canceled.contains(&delta_filename) {
                continue;
            }
            let part = part.lock();
            if part.is_complete() {
                match combine_part_file(&delta_file_writers, &delta_filename, &part) {
                    Ok(()) => summary.completed_part_files.push(delta_filename),
                    Err(err) => {
                        warn!(delta = %delta_filename, error = %format!("{err:#}"), "part_file_combine_failed");
                        canceled.insert(delta_filename);
                    }
                }
            } else {
                match delta_file_writers.load(&delta_filename) {
                    Ok(_) => pending_parts.push((delta_filename, part.to_bytes())),
                    Err(err) => {
                        warn!(delta = %delta_filename, error = %format!("{err:#}"), "delta_file_load_failed");
                        canceled.insert(delta_filename);
                    }
                }
            }
        }

        if let Err(err) = data_folder.clean_folder() {
            warn!(folder = %data_folder.path().display(), error = %format!("{err:#}"), "delta_folder_clean_failed");
        }

        let mut writers = delta_file_writers.snapshot();
        writers.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, writer) in &writers {
            writer.close();
        }
        for (delta_filename, writer) in &writers {
            if let Err(err) = writer.wait() {
                warn!(delta = %delta_filename, error = %format!("{err:#}"), "delta_writer_failed");
                canceled.insert(delta_filename.clone());
            }
        }

        for (delta_filename, writer) in writers {
            if canceled.contains(&delta_filename) {
                summary.canceled_delta_files.push(delta_filename);
                continue;
            }
            let bytes = writer.snapshot().to_bytes();
            if summary.completed_part_files.contains(&delta_filename) {
                match uploader.upload(&delta_filename, &bytes) {
                    Ok(_) => summary.uploaded_delta_files.push(delta_filename),
                    Err(err) => {
                        warn!(delta = %delta_filename, error = %format!("{err:#}"), "delta_file_upload_failed");
                        canceled.insert(delta_filename.clone());
                        summary.canceled_delta_files.push(delta_filename);
                    }
                }
            } else {
                match data_folder.save(&delta_filename, &bytes) {
                    Ok(()) => summary.saved_delta_files.push(delta_filename),
                    Err(err) => {
                        warn!(delta = %delta_filename, error = %format!("{err:#}"), "delta_file_save_failed");
                        discard(&data_folder, &delta_filename);
                        canceled.insert(delta_filename.clone());
                        summary.canceled_delta_files.push(delta_filename);
                    }
                }
            }
        }

        for (delta_filename, bytes) in pending_parts {
            if canceled.contains(&delta_filename) {
                continue;
            }
            let name = part_filename(&delta_filename);
            match data_folder.save(&name, &bytes) {
                Ok(()) => summary.saved_part_files.push(name),
                Err(err) => {
                    warn!(part = %name, error = %format!("{err:#}"), "part_file_save_failed");
                    discard(&data_folder, &name);
                    discard(&data_folder, &delta_filename);
                    summary.saved_delta_files.retain(|saved| saved != &delta_filename);
                    summary.canceled_delta_files.push(delta_filename);
                }
            }
        }

        logging::log_delta_flush(DeltaFlushSnapshot {
            part_files_completed: summary.completed_part_files.len(),
            part_files_saved: summary.saved_part_files.len(),
            delta_files_uploaded: summary.uploaded_delta_files.len(),
            delta_files_saved: summary.saved_delta_files.len(),
            delta_files_canceled: summary.canceled_delta_files.len(),
        });
        Ok(summary)
    }
}

/// Best-effort removal of a half-written scratch file.
fn discard(data_folder: &DataFolder, name: &str) {
    if let Err(err) = data_folder.delete(name) {
        warn!(file = name, error = %format!("{err:#}"), "scratch_file_delete_failed");
    }
}

fn combine_part_file(
    writers: &LazyCache<String, DeltaFileChanWriter>,
    delta_filename: &String,
    part: &WalPartFile,
) -> Result<()> {
    let writer = writers
        .load_existing(delta_filename)
        .ok_or_else(|| Error::DeltaFileWriterNotFound(delta_filename.clone()))?;
    let records = part.combine_records()?;
    writer.set_wal_parser(WalParser::from_record_head(part.last_head()));
    let consumer = writer.consumer()?;
    for location in extract_block_locations(&records) {
        consumer
            .send(location)
            .map_err(|_| anyhow!("delta writer for {delta_filename} is closed"))?;
    }
    Ok(())
}
