//! Data page header codec and the page checksum algorithm.

use bytes::{Buf, BufMut};

use crate::{Error, Result};

use super::{Lsn, PAGE_SIZE};

pub const PAGE_HEADER_SIZE: usize = 24;
pub const PAGE_LAYOUT_VERSION: u16 = 4;
/// `PD_HAS_FREE_LINES | PD_PAGE_FULL | PD_ALL_VISIBLE`
pub const PD_VALID_FLAG_BITS: u16 = 0x0007;
const CHECKSUM_OFFSET: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageHeader {
    pub lsn_hi: u32,
    pub lsn_lo: u32,
    pub checksum: u16,
    pub flags: u16,
    pub lower: u16,
    pub upper: u16,
    pub special: u16,
    pub page_size_version: u16,
}

impl PageHeader {
    /// Decodes the fixed header at the start of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PAGE_HEADER_SIZE {
            return Err(Error::ShortPageHeader(bytes.len()).into());
        }
        let mut buf = &bytes[..PAGE_HEADER_SIZE];
        Ok(Self {
            lsn_hi: buf.get_u32_le(),
            lsn_lo: buf.get_u32_le(),
            checksum: buf.get_u16_le(),
            flags: buf.get_u16_le(),
            lower: buf.get_u16_le(),
            upper: buf.get_u16_le(),
            special: buf.get_u16_le(),
            page_size_version: buf.get_u16_le(),
        })
    }

    pub fn encode_into(&self, out: &mut impl BufMut) {
        out.put_u32_le(self.lsn_hi);
        out.put_u32_le(self.lsn_lo);
        out.put_u16_le(self.checksum);
        out.put_u16_le(self.flags);
        out.put_u16_le(self.lower);
        out.put_u16_le(self.upper);
        out.put_u16_le(self.special);
        out.put_u16_le(self.page_size_version);
    }

    pub fn lsn(&self) -> Lsn {
        Lsn::from_parts(self.lsn_hi, self.lsn_lo)
    }

    /// A page that was allocated but never initialized.
    pub fn is_new(&self) -> bool {
        self.upper == 0
    }

    pub fn is_valid(&self) -> bool {
        self.flags & !PD_VALID_FLAG_BITS == 0
            && self.lower as usize >= PAGE_HEADER_SIZE
            && self.lower <= self.upper
            && self.upper <= self.special
            && self.special as usize <= PAGE_SIZE
            && self.lsn().is_valid()
            && self.page_size_version == expected_page_size_version()
    }
}

pub fn expected_page_size_version() -> u16 {
    PAGE_SIZE as u16 | PAGE_LAYOUT_VERSION
}

const N_SUMS: usize = 32;
const FNV_PRIME: u32 = 16_777_619;
const CHECKSUM_BASE_OFFSETS: [u32; N_SUMS] = [
    0x5B1F36E9, 0xB8525960, 0x02AB50AA, 0x1DE66D2A, 0x79FF467A, 0x9BB9F8A3, 0x217E7CD2,
    0x83E13D2C, 0xF8D4474F, 0xE39EB970, 0x42C6AE16, 0x993216FA, 0x7B093B5D, 0x98DAFF3C,
    0xF718902A, 0x0B1C9CDB, 0xE58F764B, 0x187636BC, 0x5D7B3BB1, 0xE73DE7DE, 0x92BEC979,
    0xCCA6C0B2, 0x304A0979, 0x85AA43D4, 0x783125BB, 0x6CA8EAA2, 0xE407EAC6, 0x4B5CFC3E,
    0x9FBF8C76, 0x15CA20BE, 0xF2CA9FFF, 0x3ED7DDE0,
];

#[inline]
fn checksum_comp(sum: u32, value: u32) -> u32 {
    let tmp = sum ^ value;
    tmp.wrapping_mul(FNV_PRIME) ^ (tmp >> 17)
}

fn checksum_block(page: &[u8]) -> u32 {
    let mut sums = CHECKSUM_BASE_OFFSETS;
    for row in page.chunks_exact(4 * N_SUMS) {
        for (j, word) in row.chunks_exact(4).enumerate() {
            let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            sums[j] = checksum_comp(sums[j], value);
        }
    }
    for _ in 0..2 {
        for sum in sums.iter_mut() {
            *sum = checksum_comp(*sum, 0);
        }
    }
    sums.iter().fold(0, |acc, s| acc ^ s)
}

/// Computes the checksum PostgreSQL stores in `pd_checksum` for block `block_no`.
/// `page` must be exactly one page long.
pub fn page_checksum(page: &[u8], block_no: u32) -> u16 {
    let mut copy = page[..PAGE_SIZE].to_vec();
    copy[CHECKSUM_OFFSET] = 0;
    copy[CHECKSUM_OFFSET + 1] = 0;
    let checksum = checksum_block(&copy) ^ block_no;
    ((checksum % 65535) + 1) as u16
}

pub fn set_page_checksum(page: &mut [u8], block_no: u32) {
    let checksum = page_checksum(page, block_no);
    page[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&checksum.to_le_bytes());
}

/// Checks one page the way the server does on read: new pages must be
/// zero-filled, other pages need a sane header and a matching checksum.
pub fn verify_page(page: &[u8], block_no: u32) -> bool {
    if page.len() != PAGE_SIZE {
        return false;
    }
    let header = match PageHeader::parse(page) {
        Ok(header) => header,
        Err(_) => return false,
    };
    if header.is_new() {
        return page.iter().all(|b| *b == 0);
    }
    header.is_valid() && header.checksum == page_checksum(page, block_no)
}
