#![forbid(unsafe_code)]

use crate::types::page;

/// Magic value stored in both checksum fields by the `none` algorithm.
pub const NO_CHECKSUM_MAGIC: u32 = 0xDEAD_BEEF;

const FOLD_PRIME_1: u64 = 1_653_893_711;
const FOLD_PRIME_2: u64 = 1_463_735_687;

/// Checksum algorithm stamped on pages at write time. Validation accepts a
/// page under any of the three, whichever it was written with.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ChecksumAlgorithm {
    #[default]
    Crc32,
    Legacy,
    None,
}

impl ChecksumAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Crc32 => "crc32",
            ChecksumAlgorithm::Legacy => "legacy",
            ChecksumAlgorithm::None => "none",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "crc32" => Some(ChecksumAlgorithm::Crc32),
            "legacy" => Some(ChecksumAlgorithm::Legacy),
            "none" => Some(ChecksumAlgorithm::None),
            _ => None,
        }
    }
}

fn fold_pair(n1: u64, n2: u64) -> u64 {
    (((n1 ^ n2 ^ FOLD_PRIME_1).wrapping_shl(8).wrapping_add(n1)) ^ FOLD_PRIME_2).wrapping_add(n2)
}

fn fold_bytes(bytes: &[u8]) -> u64 {
    let mut fold = 0u64;
    for &b in bytes {
        fold = fold_pair(fold, b as u64);
    }
    fold
}

fn checksummed_ranges(frame: &[u8]) -> (&[u8], &[u8]) {
    let len = frame.len();
    (
        &frame[page::PAGE_OFFSET.start..page::PAGE_FLUSH_LSN.start],
        &frame[page::PAGE_DATA..len - page::TRAILER_LEN],
    )
}

/// crc32 variant: XOR of the header and payload CRCs. Both checksum fields
/// carry the same value.
pub fn page_crc32(frame: &[u8]) -> u32 {
    let (head, body) = checksummed_ranges(frame);
    let mut h = crc32fast::Hasher::new();
    h.update(head);
    let head_crc = h.finalize();
    let mut h = crc32fast::Hasher::new();
    h.update(body);
    head_crc ^ h.finalize()
}

/// Legacy variant, field 1: byte fold of header and payload.
pub fn page_legacy_new(frame: &[u8]) -> u32 {
    let (head, body) = checksummed_ranges(frame);
    fold_bytes(head).wrapping_add(fold_bytes(body)) as u32
}

/// Legacy variant, field 2: byte fold of the first 26 header bytes.
pub fn page_legacy_old(frame: &[u8]) -> u32 {
    fold_bytes(&frame[..page::PAGE_FLUSH_LSN.start]) as u32
}

pub fn is_checksum_valid_crc32(frame: &[u8], field1: u32, field2: u32) -> bool {
    let crc = page_crc32(frame);
    field1 == crc && field2 == crc
}

pub fn is_checksum_valid_legacy(frame: &[u8], field1: u32, field2: u32) -> bool {
    field1 == page_legacy_new(frame) && field2 == page_legacy_old(frame)
}

pub fn is_checksum_valid_none(_frame: &[u8], field1: u32, field2: u32) -> bool {
    field1 == NO_CHECKSUM_MAGIC && field2 == NO_CHECKSUM_MAGIC
}

/// Computes and stamps both checksum fields. The LSN fields must already be
/// in place: the header range they live in is covered by the checksum.
///
/// The legacy variant's field 2 folds the first 26 bytes including the
/// stamped field 1, so field 1 goes in first.
pub fn stamp(frame: &mut [u8], algo: ChecksumAlgorithm) {
    match algo {
        ChecksumAlgorithm::Crc32 => {
            let crc = page_crc32(frame);
            page::set_checksum_field1(frame, crc);
            page::set_checksum_field2(frame, crc);
        }
        ChecksumAlgorithm::Legacy => {
            page::set_checksum_field1(frame, page_legacy_new(frame));
            page::set_checksum_field2(frame, page_legacy_old(frame));
        }
        ChecksumAlgorithm::None => {
            page::set_checksum_field1(frame, NO_CHECKSUM_MAGIC);
            page::set_checksum_field2(frame, NO_CHECKSUM_MAGIC);
        }
    }
}

/// Whether a page image fails validation under every accepted variant.
///
/// An all-zero image is accepted as "never written". When `check_lsn` is set
/// the trailer's LSN mirror must match the header LSN as well.
pub fn page_is_corrupted(check_lsn: bool, frame: &[u8]) -> bool {
    if page::is_zeroed(frame) {
        return false;
    }
    if check_lsn && page::page_lsn(frame).0 as u32 != page::trailer_lsn(frame) {
        return true;
    }
    let field1 = page::checksum_field1(frame);
    let field2 = page::checksum_field2(frame);
    !(is_checksum_valid_crc32(frame, field1, field2)
        || is_checksum_valid_legacy(frame, field1, field2)
        || is_checksum_valid_none(frame, field1, field2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{page, Lsn, PageId};
    use proptest::prelude::*;

    fn fresh_frame(lsn: u64) -> Vec<u8> {
        let mut frame = vec![0u8; page::MIN_PAGE_SIZE];
        page::init(&mut frame, PageId::new(3, 9));
        frame[page::PAGE_DATA..page::PAGE_DATA + 4].copy_from_slice(b"data");
        page::set_page_lsn(&mut frame, Lsn(lsn));
        frame
    }

    #[test]
    fn stamped_pages_validate_under_each_algorithm() {
        for algo in [
            ChecksumAlgorithm::Crc32,
            ChecksumAlgorithm::Legacy,
            ChecksumAlgorithm::None,
        ] {
            let mut frame = fresh_frame(42);
            stamp(&mut frame, algo);
            assert!(!page_is_corrupted(true, &frame), "algo {}", algo.as_str());
        }
    }

    #[test]
    fn corrupting_either_field_is_detected() {
        let mut frame = fresh_frame(42);
        stamp(&mut frame, ChecksumAlgorithm::Crc32);
        frame[0] ^= 0xFF;
        assert!(page_is_corrupted(true, &frame));

        let mut frame = fresh_frame(42);
        stamp(&mut frame, ChecksumAlgorithm::Crc32);
        let len = frame.len();
        frame[len - 8] ^= 0xFF;
        assert!(page_is_corrupted(true, &frame));
    }

    #[test]
    fn payload_corruption_is_detected() {
        let mut frame = fresh_frame(42);
        stamp(&mut frame, ChecksumAlgorithm::Legacy);
        frame[page::PAGE_DATA] ^= 0x01;
        assert!(page_is_corrupted(true, &frame));
    }

    #[test]
    fn zero_page_is_never_written_not_corrupt() {
        let frame = vec![0u8; page::MIN_PAGE_SIZE];
        assert!(!page_is_corrupted(true, &frame));
    }

    #[test]
    fn zero_page_with_lsn_is_corrupt() {
        let mut frame = vec![0u8; page::MIN_PAGE_SIZE];
        page::set_page_lsn(&mut frame, Lsn(5));
        // Not all-zero any more, and no checksum matches.
        assert!(page_is_corrupted(true, &frame));
    }

    #[test]
    fn trailer_lsn_mismatch_is_corrupt() {
        let mut frame = fresh_frame(42);
        stamp(&mut frame, ChecksumAlgorithm::Crc32);
        let len = frame.len();
        frame[len - 1] ^= 0x01;
        assert!(page_is_corrupted(true, &frame));
        // The trailer LSN mirror sits outside both checksummed ranges, so the
        // page only fails the explicit LSN check.
        assert!(!page_is_corrupted(false, &frame));
    }

    #[test]
    fn algorithm_names_roundtrip() {
        for algo in [
            ChecksumAlgorithm::Crc32,
            ChecksumAlgorithm::Legacy,
            ChecksumAlgorithm::None,
        ] {
            assert_eq!(ChecksumAlgorithm::from_str(algo.as_str()), Some(algo));
        }
        assert_eq!(ChecksumAlgorithm::from_str("sha256"), None);
    }

    proptest! {
        #[test]
        fn any_payload_roundtrips(payload in prop::collection::vec(any::<u8>(), 0..400), lsn in 1u64..u64::MAX) {
            let mut frame = vec![0u8; page::MIN_PAGE_SIZE];
            page::init(&mut frame, PageId::new(1, 1));
            let n = payload.len().min(page::MIN_PAGE_SIZE - page::PAGE_DATA - page::TRAILER_LEN);
            frame[page::PAGE_DATA..page::PAGE_DATA + n].copy_from_slice(&payload[..n]);
            page::set_page_lsn(&mut frame, Lsn(lsn));
            stamp(&mut frame, ChecksumAlgorithm::Crc32);
            prop_assert!(!page_is_corrupted(true, &frame));
        }
    }
}
