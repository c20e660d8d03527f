//! Relation file identity and data-directory path conventions.

use std::fmt;
use std::io::{self, Read, Write};
use std::path::Path;

use bytes::{Buf, BufMut};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{Error, Result};

use super::{DEFAULT_SPC_NODE, GLOBAL_SPC_NODE};

static PAGED_FILENAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)(\.\d+)?$").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RelFileNode {
    pub spc_node: u32,
    pub db_node: u32,
    pub rel_node: u32,
}

impl RelFileNode {
    pub fn new(spc_node: u32, db_node: u32, rel_node: u32) -> Self {
        Self {
            spc_node,
            db_node,
            rel_node,
        }
    }
}

impl fmt::Display for RelFileNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.spc_node, self.db_node, self.rel_node)
    }
}

/// A single block of a relation, as referenced by a WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BlockLocation {
    pub rel: RelFileNode,
    pub block_no: u32,
}

impl BlockLocation {
    pub const ENCODED_LEN: usize = 16;
    /// Marks the end of a serialized location list.
    pub const TERMINAL: BlockLocation = BlockLocation {
        rel: RelFileNode {
            spc_node: 0,
            db_node: 0,
            rel_node: 0,
        },
        block_no: 0,
    };

    pub fn new(rel: RelFileNode, block_no: u32) -> Self {
        Self { rel, block_no }
    }

    pub fn is_terminal(&self) -> bool {
        *self == Self::TERMINAL
    }

    pub fn encode_into(&self, out: &mut impl BufMut) {
        out.put_u32_le(self.rel.spc_node);
        out.put_u32_le(self.rel.db_node);
        out.put_u32_le(self.rel.rel_node);
        out.put_u32_le(self.block_no);
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut buf = Vec::with_capacity(Self::ENCODED_LEN);
        self.encode_into(&mut buf);
        writer.write_all(&buf)
    }

    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut raw = [0u8; Self::ENCODED_LEN];
        reader.read_exact(&mut raw)?;
        let mut buf = &raw[..];
        let rel = RelFileNode::new(buf.get_u32_le(), buf.get_u32_le(), buf.get_u32_le());
        Ok(Self::new(rel, buf.get_u32_le()))
    }
}

/// Returns true for main-fork relation files (`16384`, `16384.2`).
pub fn is_paged_file_name(name: &str) -> bool {
    PAGED_FILENAME.is_match(name)
}

pub fn is_paged_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(is_paged_file_name)
        .unwrap_or(false)
}

/// Resolves a data file path into its relation and segment index.
pub fn rel_file_from_path(path: &Path) -> Result<(RelFileNode, u32)> {
    let display = path.display().to_string();
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::NotPagedFile(display.clone()))?;
    let caps = PAGED_FILENAME
        .captures(name)
        .ok_or_else(|| Error::NotPagedFile(display.clone()))?;
    let rel_node: u32 = caps[1]
        .parse()
        .map_err(|_| Error::NotPagedFile(display.clone()))?;
    let segment: u32 = match caps.get(2) {
        Some(suffix) => suffix.as_str()[1..]
            .parse()
            .map_err(|_| Error::NotPagedFile(display.clone()))?,
        None => 0,
    };

    let folders: Vec<&str> = path
        .parent()
        .map(|p| p.iter().filter_map(|c| c.to_str()).collect())
        .unwrap_or_default();
    let unknown = || Error::UnknownTablespace(display.clone());
    let len = folders.len();

    if len >= 1 && folders[len - 1] == "global" {
        return Ok((RelFileNode::new(GLOBAL_SPC_NODE, 0, rel_node), segment));
    }
    if len < 2 {
        return Err(unknown().into());
    }
    let db_node: u32 = folders[len - 1].parse().map_err(|_| unknown())?;
    if folders[len - 2] == "base" {
        return Ok((RelFileNode::new(DEFAULT_SPC_NODE, db_node, rel_node), segment));
    }
    if len >= 4 && folders[len - 4] == "pg_tblspc" {
        let spc_node: u32 = folders[len - 3].parse().map_err(|_| unknown())?;
        return Ok((RelFileNode::new(spc_node, db_node, rel_node), segment));
    }
    Err(unknown().into())
}
