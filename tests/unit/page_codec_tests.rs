//! Page header decoding, validity rules and checksums.

#[path = "../common/mod.rs"]
mod common;

use pgdelta::pg::page::{
    expected_page_size_version, page_checksum, verify_page, PAGE_HEADER_SIZE,
};
use pgdelta::pg::{Lsn, PageHeader, PAGE_SIZE};
use pgdelta::Error;

fn header(lower: u16, upper: u16, special: u16, lsn: u64) -> PageHeader {
    PageHeader {
        lsn_hi: (lsn >> 32) as u32,
        lsn_lo: lsn as u32,
        checksum: 0,
        flags: 0,
        lower,
        upper,
        special,
        page_size_version: expected_page_size_version(),
    }
}

fn encode(header: &PageHeader) -> Vec<u8> {
    let mut out = Vec::new();
    header.encode_into(&mut out);
    out
}

#[test]
fn well_formed_headers_are_valid() -> pgdelta::Result<()> {
    let page = PAGE_SIZE as u16;
    let cases = [
        (PAGE_HEADER_SIZE as u16, PAGE_HEADER_SIZE as u16, PAGE_HEADER_SIZE as u16, 1u64),
        (24, 100, page, 0x0100_0028),
        (200, 200, 8000, 0x7_0000_0000),
        (24, page, page, u64::MAX),
        (512, 4096, 8176, 0x16_B374_D848),
    ];
    for (lower, upper, special, lsn) in cases {
        let parsed = PageHeader::parse(&encode(&header(lower, upper, special, lsn)))?;
        assert!(parsed.is_valid(), "{parsed:?} should be valid");
        assert_eq!(Lsn(lsn), parsed.lsn());
        assert!(!parsed.is_new());
    }
    Ok(())
}

#[test]
fn broken_headers_are_invalid() {
    let page = PAGE_SIZE as u16;
    let invalid = [
        header(10, 100, page, 1),
        header(300, 200, page, 1),
        header(24, 500, 400, 1),
        header(24, 100, page + 8, 1),
        header(24, 100, page, 0),
        PageHeader {
            flags: 0x0010,
            ..header(24, 100, page, 1)
        },
        PageHeader {
            page_size_version: 8192 | 5,
            ..header(24, 100, page, 1)
        },
    ];
    for h in invalid {
        assert!(!h.is_valid(), "{h:?} should be invalid");
    }
}

#[test]
fn zero_upper_is_always_new() {
    for h in [
        header(0, 0, 0, 0),
        header(500, 0, 10, 42),
        PageHeader {
            flags: 0xFFFF,
            ..header(24, 0, 8192, 7)
        },
    ] {
        assert!(h.is_new());
    }
}

#[test]
fn header_needs_full_fixed_part() {
    let err = PageHeader::parse(&[0u8; PAGE_HEADER_SIZE - 1]).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::ShortPageHeader(23))
    ));
}

#[test]
fn checksum_is_bound_to_block_number() {
    let page = common::data_page(0x0300_0000, 11, 0x5A);
    assert!(verify_page(&page, 11));
    assert!(!verify_page(&page, 12));
    assert_ne!(page_checksum(&page, 11), page_checksum(&page, 12));
}

#[test]
fn uninitialized_page_must_be_zeroed() {
    let mut page = vec![0u8; PAGE_SIZE];
    assert!(verify_page(&page, 3));
    page[PAGE_SIZE - 1] = 1;
    assert!(!verify_page(&page, 3));
}
