//! On-disk page layout. Offsets are fixed by the file format and must not
//! change: the checksum variants and the zero-page rule depend on them.

use std::ops::Range;

use crate::types::{Lsn, PageId, PageNo, SpaceId};

/// First checksum field, covering the page minus the trailer.
pub const CHECKSUM_FIELD1: Range<usize> = 0..4;
pub const PAGE_OFFSET: Range<usize> = 4..8;
pub const PAGE_PREV: Range<usize> = 8..12;
pub const PAGE_NEXT: Range<usize> = 12..16;
pub const PAGE_LSN: Range<usize> = 16..24;
pub const PAGE_TYPE: Range<usize> = 24..26;
pub const PAGE_FLUSH_LSN: Range<usize> = 26..34;
pub const PAGE_SPACE_ID: Range<usize> = 34..38;
/// Start of the payload; everything before this is the header.
pub const PAGE_DATA: usize = 38;
/// Trailer: 4-byte checksum_field2 followed by the low 32 bits of the LSN.
pub const TRAILER_LEN: usize = 8;

pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;
pub const MIN_PAGE_SIZE: usize = 512;

fn read_u32(frame: &[u8], range: Range<usize>) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&frame[range]);
    u32::from_be_bytes(buf)
}

fn write_u32(frame: &mut [u8], range: Range<usize>, value: u32) {
    frame[range].copy_from_slice(&value.to_be_bytes());
}

fn read_u64(frame: &[u8], range: Range<usize>) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&frame[range]);
    u64::from_be_bytes(buf)
}

pub fn checksum_field1(frame: &[u8]) -> u32 {
    read_u32(frame, CHECKSUM_FIELD1)
}

pub fn set_checksum_field1(frame: &mut [u8], value: u32) {
    write_u32(frame, CHECKSUM_FIELD1, value);
}

pub fn checksum_field2(frame: &[u8]) -> u32 {
    let len = frame.len();
    read_u32(frame, len - TRAILER_LEN..len - 4)
}

pub fn set_checksum_field2(frame: &mut [u8], value: u32) {
    let len = frame.len();
    write_u32(frame, len - TRAILER_LEN..len - 4, value);
}

pub fn page_no(frame: &[u8]) -> PageNo {
    read_u32(frame, PAGE_OFFSET)
}

pub fn space_id(frame: &[u8]) -> SpaceId {
    read_u32(frame, PAGE_SPACE_ID)
}

pub fn page_id(frame: &[u8]) -> PageId {
    PageId::new(space_id(frame), page_no(frame))
}

pub fn page_lsn(frame: &[u8]) -> Lsn {
    Lsn(read_u64(frame, PAGE_LSN))
}

/// Low 32 bits of the LSN mirrored in the trailer.
pub fn trailer_lsn(frame: &[u8]) -> u32 {
    let len = frame.len();
    read_u32(frame, len - 4..len)
}

/// Stamps the LSN in the header and mirrors its low half in the trailer.
pub fn set_page_lsn(frame: &mut [u8], lsn: Lsn) {
    frame[PAGE_LSN].copy_from_slice(&lsn.0.to_be_bytes());
    let len = frame.len();
    write_u32(frame, len - 4..len, lsn.0 as u32);
}

/// Initializes a frame for a newly created page: zero payload, identity
/// stamped, LSN fields zero until the first flush stamps them.
pub fn init(frame: &mut [u8], id: PageId) {
    frame.fill(0);
    write_u32(frame, PAGE_OFFSET, id.page_no);
    write_u32(frame, PAGE_SPACE_ID, id.space);
}

/// A page of all zeros is "never written" and only acceptable as such.
pub fn is_zeroed(frame: &[u8]) -> bool {
    frame.iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_stamps_identity() {
        let mut frame = vec![0u8; MIN_PAGE_SIZE];
        init(&mut frame, PageId::new(7, 100));
        assert_eq!(page_no(&frame), 100);
        assert_eq!(space_id(&frame), 7);
        assert_eq!(page_id(&frame), PageId::new(7, 100));
        assert!(page_lsn(&frame).is_zero());
    }

    #[test]
    fn lsn_mirrors_into_trailer() {
        let mut frame = vec![0u8; MIN_PAGE_SIZE];
        set_page_lsn(&mut frame, Lsn(0x1_2345_6789));
        assert_eq!(page_lsn(&frame), Lsn(0x1_2345_6789));
        assert_eq!(trailer_lsn(&frame), 0x2345_6789);
    }

    #[test]
    fn checksum_fields_roundtrip() {
        let mut frame = vec![0u8; MIN_PAGE_SIZE];
        set_checksum_field1(&mut frame, 0xAABB_CCDD);
        set_checksum_field2(&mut frame, 0x1122_3344);
        assert_eq!(checksum_field1(&frame), 0xAABB_CCDD);
        assert_eq!(checksum_field2(&frame), 0x1122_3344);
        assert!(!is_zeroed(&frame));
    }
}
