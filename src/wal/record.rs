use bytes::{Buf, Bytes};
use tracing::trace;

use crate::pg::{BlockLocation, Lsn, RelFileNode, PAGE_SIZE};
use crate::{Error, Result};

pub const XLOG_RECORD_HEADER_SIZE: usize = 24;

pub const XLR_MAX_BLOCK_ID: u8 = 32;
pub const XLR_BLOCK_ID_DATA_SHORT: u8 = 255;
pub const XLR_BLOCK_ID_DATA_LONG: u8 = 254;
pub const XLR_BLOCK_ID_ORIGIN: u8 = 253;
pub const XLR_BLOCK_ID_TOPLEVEL_XID: u8 = 252;

pub const BKPBLOCK_FORK_MASK: u8 = 0x0F;
pub const BKPBLOCK_HAS_IMAGE: u8 = 0x10;
pub const BKPBLOCK_HAS_DATA: u8 = 0x20;
pub const BKPBLOCK_WILL_INIT: u8 = 0x40;
pub const BKPBLOCK_SAME_REL: u8 = 0x80;

pub const BKPIMAGE_HAS_HOLE: u8 = 0x01;
pub const BKPIMAGE_APPLY: u8 = 0x02;
pub const BKPIMAGE_COMPRESS_PGLZ: u8 = 0x04;
pub const BKPIMAGE_COMPRESS_LZ4: u8 = 0x08;
pub const BKPIMAGE_COMPRESS_ZSTD: u8 = 0x10;

pub const MAIN_FORKNUM: u8 = 0;
pub const RM_XLOG_ID: u8 = 0;
pub const XLOG_SWITCH: u8 = 0x40;
const XLR_RMGR_INFO_MASK: u8 = 0xF0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XLogRecordHeader {
    pub total_record_length: u32,
    pub xact_id: u32,
    pub prev_record_ptr: Lsn,
    pub info: u8,
    pub resource_manager_id: u8,
    pub crc32: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XLogRecordBlockImageHeader {
    pub image_length: u16,
    pub hole_offset: u16,
    pub info: u8,
    pub hole_length: u16,
}

impl XLogRecordBlockImageHeader {
    pub fn has_hole(&self) -> bool {
        self.info & BKPIMAGE_HAS_HOLE != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.info & (BKPIMAGE_COMPRESS_PGLZ | BKPIMAGE_COMPRESS_LZ4 | BKPIMAGE_COMPRESS_ZSTD) != 0
    }

    pub fn apply(&self) -> bool {
        self.info & BKPIMAGE_APPLY != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XLogRecordBlockHeader {
    pub block_id: u8,
    pub fork_flags: u8,
    pub data_length: u16,
    pub image_header: Option<XLogRecordBlockImageHeader>,
    pub location: BlockLocation,
}

impl XLogRecordBlockHeader {
    pub fn fork_num(&self) -> u8 {
        self.fork_flags & BKPBLOCK_FORK_MASK
    }

    pub fn has_image(&self) -> bool {
        self.fork_flags & BKPBLOCK_HAS_IMAGE != 0
    }

    pub fn has_data(&self) -> bool {
        self.fork_flags & BKPBLOCK_HAS_DATA != 0
    }

    pub fn will_init(&self) -> bool {
        self.fork_flags & BKPBLOCK_WILL_INIT != 0
    }

    pub fn has_same_rel(&self) -> bool {
        self.fork_flags & BKPBLOCK_SAME_REL != 0
    }

    /// `HAS_DATA` and a non-zero payload length must agree.
    pub fn check_data_state_consistency(&self) -> Result<()> {
        if self.has_data() != (self.data_length > 0) {
            return Err(Error::InconsistentBlockDataState {
                block_id: self.block_id,
                has_data: self.has_data(),
                data_length: self.data_length,
            }
            .into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XLogRecordBlock {
    pub header: XLogRecordBlockHeader,
    pub image: Bytes,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XLogRecord {
    pub header: XLogRecordHeader,
    pub origin: Option<u16>,
    pub toplevel_xid: Option<u32>,
    pub blocks: Vec<XLogRecordBlock>,
    pub main_data: Bytes,
}

fn ensure(buf: &Bytes, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(Error::TruncatedRecord {
            needed,
            available: buf.remaining(),
        }
        .into());
    }
    Ok(())
}

fn take_u8(buf: &mut Bytes) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut Bytes) -> Result<u16> {
    ensure(buf, 2)?;
    Ok(buf.get_u16_le())
}

fn take_u32(buf: &mut Bytes) -> Result<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32_le())
}

fn take_bytes(buf: &mut Bytes, len: usize) -> Result<Bytes> {
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

impl XLogRecordHeader {
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        ensure(buf, XLOG_RECORD_HEADER_SIZE)?;
        let total_record_length = buf.get_u32_le();
        let xact_id = buf.get_u32_le();
        let prev_record_ptr = Lsn(buf.get_u64_le());
        let info = buf.get_u8();
        let resource_manager_id = buf.get_u8();
        buf.advance(2);
        let crc32 = buf.get_u32_le();
        Ok(Self {
            total_record_length,
            xact_id,
            prev_record_ptr,
            info,
            resource_manager_id,
            crc32,
        })
    }
}

impl XLogRecord {
    /// Decodes one complete record. `record` must hold exactly the record bytes
    /// (trailing alignment padding is ignored).
    pub fn decode(record: Bytes) -> Result<Self> {
        let mut buf = record;
        let header = XLogRecordHeader::decode(&mut buf)?;
        let body_len = (header.total_record_length as usize)
            .checked_sub(XLOG_RECORD_HEADER_SIZE)
            .ok_or(Error::TruncatedRecord {
                needed: XLOG_RECORD_HEADER_SIZE,
                available: header.total_record_length as usize,
            })?;
        ensure(&buf, body_len)?;
        buf.truncate(body_len);

        trace!(
            rmid = header.resource_manager_id,
            info = header.info,
            len = header.total_record_length,
            "decode_wal_record"
        );

        let mut record = XLogRecord {
            header,
            ..Default::default()
        };
        let mut headers: Vec<XLogRecordBlockHeader> = Vec::new();
        let mut previous_rel: Option<RelFileNode> = None;
        let mut main_data_len: usize = 0;
        let mut datatotal: usize = 0;

        while buf.remaining() > datatotal {
            let block_id = take_u8(&mut buf)?;
            match block_id {
                XLR_BLOCK_ID_DATA_SHORT => {
                    main_data_len = take_u8(&mut buf)? as usize;
                    datatotal += main_data_len;
                }
                XLR_BLOCK_ID_DATA_LONG => {
                    main_data_len = take_u32(&mut buf)? as usize;
                    datatotal += main_data_len;
                }
                XLR_BLOCK_ID_ORIGIN => record.origin = Some(take_u16(&mut buf)?),
                XLR_BLOCK_ID_TOPLEVEL_XID => record.toplevel_xid = Some(take_u32(&mut buf)?),
                0..=XLR_MAX_BLOCK_ID => {
                    let block = decode_block_header(&mut buf, block_id, &mut previous_rel)?;
                    datatotal += block.data_length as usize;
                    if let Some(image) = &block.image_header {
                        datatotal += image.image_length as usize;
                    }
                    headers.push(block);
                }
                other => return Err(Error::InvalidRecordBlockId(other).into()),
            }
        }

        for header in headers {
            let image = match &header.image_header {
                Some(image) => take_bytes(&mut buf, image.image_length as usize)?,
                None => Bytes::new(),
            };
            let data = take_bytes(&mut buf, header.data_length as usize)?;
            record.blocks.push(XLogRecordBlock {
                header,
                image,
                data,
            });
        }
        record.main_data = take_bytes(&mut buf, main_data_len)?;
        Ok(record)
    }

    pub fn is_wal_switch(&self) -> bool {
        self.header.resource_manager_id == RM_XLOG_ID
            && self.header.info & XLR_RMGR_INFO_MASK == XLOG_SWITCH
    }
}

fn decode_block_header(
    buf: &mut Bytes,
    block_id: u8,
    previous_rel: &mut Option<RelFileNode>,
) -> Result<XLogRecordBlockHeader> {
    let mut header = XLogRecordBlockHeader {
        block_id,
        fork_flags: take_u8(buf)?,
        data_length: take_u16(buf)?,
        ..Default::default()
    };
    header.check_data_state_consistency()?;

    if header.has_image() {
        let mut image = XLogRecordBlockImageHeader {
            image_length: take_u16(buf)?,
            hole_offset: take_u16(buf)?,
            info: take_u8(buf)?,
            hole_length: 0,
        };
        image.hole_length = if image.is_compressed() {
            if image.has_hole() {
                take_u16(buf)?
            } else {
                0
            }
        } else {
            (PAGE_SIZE as u16).saturating_sub(image.image_length)
        };
        header.image_header = Some(image);
    }

    let rel = if header.has_same_rel() {
        previous_rel.ok_or(Error::NoPreviousRelFile(block_id))?
    } else {
        RelFileNode::new(take_u32(buf)?, take_u32(buf)?, take_u32(buf)?)
    };
    *previous_rel = Some(rel);
    header.location = BlockLocation::new(rel, take_u32(buf)?);
    Ok(header)
}

/// Main-fork blocks touched by `records`.
pub fn extract_block_locations<'a, I>(records: I) -> Vec<BlockLocation>
where
    I: IntoIterator<Item = &'a XLogRecord>,
{
    records
        .into_iter()
        .flat_map(|record| record.blocks.iter())
        .filter(|block| block.header.fork_num() == MAIN_FORKNUM)
        .map(|block| block.header.location)
        .collect()
}
