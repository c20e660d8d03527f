use std::io::{self, Read, Write};

use bytes::Bytes;
use tracing::debug;

use crate::pg::segment::next_wal_filename;
use crate::wal::XLogRecord;
use crate::{Error, Result};

use super::file::{delta_filename_for, position_in_delta, WAL_FILES_IN_DELTA};
use super::manager::DeltaFileManager;

const SLOTS: usize = WAL_FILES_IN_DELTA as usize;

/// Record fragments cut at segment boundaries inside one delta group.
///
/// `wal_heads[i]` is the unfinished record at the end of segment `i`,
/// `wal_tails[i]` the continuation bytes at the start of segment `i`, and
/// `previous_wal_head` the unfinished record at the end of the last segment of
/// the previous group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalPartFile {
    pub wal_tails: Vec<Option<Vec<u8>>>,
    pub previous_wal_head: Option<Vec<u8>>,
    pub wal_heads: Vec<Option<Vec<u8>>>,
}

impl Default for WalPartFile {
    fn default() -> Self {
        Self::new()
    }
}

impl WalPartFile {
    pub fn new() -> Self {
        Self {
            wal_tails: vec![None; SLOTS],
            previous_wal_head: None,
            wal_heads: vec![None; SLOTS],
        }
    }

    /// Every fragment of the group has been recorded.
    pub fn is_complete(&self) -> bool {
        self.previous_wal_head.is_some()
            && self.wal_heads.iter().all(Option::is_some)
            && self.wal_tails.iter().all(Option::is_some)
    }

    /// Joins each head with the following segment's tail and decodes the
    /// records that straddled a boundary.
    pub fn combine_records(&self) -> Result<Vec<XLogRecord>> {
        let mut records = Vec::new();
        let mut previous = self.previous_wal_head.as_deref().unwrap_or_default();
        for (i, tail) in self.wal_tails.iter().enumerate() {
            let tail = tail.as_deref().unwrap_or_default();
            let mut data = Vec::with_capacity(previous.len() + tail.len());
            data.extend_from_slice(previous);
            data.extend_from_slice(tail);
            previous = self.wal_heads[i].as_deref().unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            records.push(XLogRecord::decode(Bytes::from(data))?);
        }
        Ok(records)
    }

    /// The unfinished record at the end of the group, which seeds the parser
    /// checkpoint of the group's delta file.
    pub fn last_head(&self) -> Vec<u8> {
        self.wal_heads[SLOTS - 1].clone().unwrap_or_default()
    }

    pub fn save<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        write_slot(writer, &self.previous_wal_head)?;
        for head in &self.wal_heads {
            write_slot(writer, head)?;
        }
        for tail in &self.wal_tails {
            write_slot(writer, tail)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        // writing into a Vec cannot fail
        let _ = self.save(&mut out);
        out
    }

    pub fn load<R: Read>(reader: &mut R) -> Result<Self> {
        let mut part = WalPartFile::new();
        part.previous_wal_head = read_slot(reader)?;
        for head in part.wal_heads.iter_mut() {
            *head = read_slot(reader)?;
        }
        for tail in part.wal_tails.iter_mut() {
            *tail = read_slot(reader)?;
        }
        Ok(part)
    }
}

fn write_slot<W: Write>(writer: &mut W, slot: &Option<Vec<u8>>) -> io::Result<()> {
    match slot {
        None => writer.write_all(&[0]),
        Some(bytes) => {
            writer.write_all(&[1])?;
            writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
            writer.write_all(bytes)
        }
    }
}

fn read_slot<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let invalid = |e: io::Error| Error::InvalidDeltaFile(format!("reading part file: {e}"));
    let mut present = [0u8; 1];
    reader.read_exact(&mut present).map_err(invalid)?;
    if present[0] == 0 {
        return Ok(None);
    }
    let mut len = [0u8; 4];
    reader.read_exact(&mut len).map_err(invalid)?;
    let mut bytes = vec![0u8; u32::from_le_bytes(len) as usize];
    reader.read_exact(&mut bytes).map_err(invalid)?;
    Ok(Some(bytes))
}

/// Stores the boundary fragments of one archived segment into the part files
/// held by a [`DeltaFileManager`].
pub struct WalPartRecorder<'a> {
    wal_filename: String,
    manager: &'a DeltaFileManager,
}

impl<'a> WalPartRecorder<'a> {
    pub fn new(wal_filename: &str, manager: &'a DeltaFileManager) -> Result<Self> {
        delta_filename_for(wal_filename)?;
        Ok(Self {
            wal_filename: wal_filename.to_string(),
            manager,
        })
    }

    pub fn save_previous_wal_tail(&self, tail: Vec<u8>) -> Result<()> {
        let delta_filename = delta_filename_for(&self.wal_filename)?;
        let position = position_in_delta(&self.wal_filename)?;
        let part = self.manager.get_part_file(&delta_filename)?;
        part.lock().wal_tails[position] = Some(tail);
        Ok(())
    }

    /// Records the trailing fragment; the last segment of a group also hands
    /// it to the next group as its previous head.
    pub fn save_next_wal_head(&self, head: Vec<u8>) -> Result<()> {
        let delta_filename = delta_filename_for(&self.wal_filename)?;
        let position = position_in_delta(&self.wal_filename)?;
        let part = self.manager.get_part_file(&delta_filename)?;
        part.lock().wal_heads[position] = Some(head.clone());

        if position == SLOTS - 1 {
            let next_delta = delta_filename_for(&next_wal_filename(&self.wal_filename)?)?;
            debug!(wal = %self.wal_filename, next_delta = %next_delta, "wal_head_handed_over");
            let next_part = self.manager.get_part_file(&next_delta)?;
            next_part.lock().previous_wal_head = Some(head);
        }
        Ok(())
    }
}
