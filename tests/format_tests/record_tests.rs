//! Tests for the on-disk format
//!
//! These tests verify:
//! - Header layout, probing and byte-order detection
//! - Directory offset arithmetic
//! - Record header helpers
//! - The default hash

use tdbkv::format::{
    align, checked_align, default_hash, hash_top, heap_start, Endian, Header, RecordHeader,
    RecordState, DEAD_MAGIC, FREELIST_TOP, FREE_MAGIC, HEADER_SIZE, LIVE_MAGIC, MAGIC_FOOD,
    MIN_REC_SIZE, VERSION,
};
use tdbkv::TdbError;

// =============================================================================
// Header Tests
// =============================================================================

#[test]
fn test_header_layout() {
    let bytes = Header::new(131).encode(Endian::native());

    assert_eq!(bytes.len(), HEADER_SIZE as usize);
    assert_eq!(&bytes[..MAGIC_FOOD.len()], MAGIC_FOOD);
    assert!(bytes[MAGIC_FOOD.len()..32].iter().all(|&b| b == 0));
    assert_eq!(&bytes[32..36], &VERSION.to_ne_bytes());
    assert_eq!(&bytes[36..40], &131u32.to_ne_bytes());
    assert!(bytes[40..].iter().all(|&b| b == 0));
}

#[test]
fn test_probe_native_header() {
    let bytes = Header::new(17).encode(Endian::native());
    let probe = Header::probe(&bytes).unwrap();

    assert!(!probe.convert);
    assert_eq!(probe.big_endian, cfg!(target_endian = "big"));
    assert_eq!(probe.header, Header::new(17));
}

#[test]
fn test_probe_detects_swapped_header() {
    let bytes = Header::new(17).encode(Endian::new(true));
    let probe = Header::probe(&bytes).unwrap();

    assert!(probe.convert);
    assert_eq!(probe.big_endian, !cfg!(target_endian = "big"));
    assert_eq!(probe.header.hash_size, 17);
    assert_eq!(probe.header.version, VERSION);
}

#[test]
fn test_probe_rejects_garbage() {
    let mut bytes = Header::new(17).encode(Endian::native());
    bytes[0] = b'X';
    assert!(matches!(Header::probe(&bytes), Err(TdbError::BadFormat(_))));

    let mut bytes = Header::new(17).encode(Endian::native());
    bytes[32..36].copy_from_slice(&0x1234_5678u32.to_ne_bytes());
    assert!(matches!(Header::probe(&bytes), Err(TdbError::BadFormat(_))));

    let bytes = Header::new(0).encode(Endian::native());
    assert!(matches!(Header::probe(&bytes), Err(TdbError::BadFormat(_))));

    assert!(matches!(Header::probe(&[0u8; 10]), Err(TdbError::BadFormat(_))));
}

// =============================================================================
// Offset Arithmetic Tests
// =============================================================================

#[test]
fn test_directory_offsets() {
    assert_eq!(FREELIST_TOP, 168);
    assert_eq!(hash_top(0), 172);
    assert_eq!(hash_top(130), 168 + 131 * 4);
    assert_eq!(heap_start(131), 168 + 132 * 4);
    assert_eq!(Header::new(131).initial_size(), heap_start(131));
}

#[test]
fn test_alignment() {
    assert_eq!(align(0, 4), 0);
    assert_eq!(align(5, 4), 8);
    assert_eq!(align(8, 4), 8);
    assert_eq!(checked_align(0x1000, 0x2000), Some(0x2000));
    assert_eq!(checked_align(u32::MAX, 4), None);
}

// =============================================================================
// Record Header Tests
// =============================================================================

#[test]
fn test_record_offsets() {
    let rec = RecordHeader {
        next: 0,
        rec_len: 40,
        key_len: 3,
        data_len: 5,
        full_hash: 0,
        magic: LIVE_MAGIC,
    };

    assert_eq!(rec.total_size(), 64);
    assert_eq!(RecordHeader::key_offset(1000), 1024);
    assert_eq!(rec.data_offset(1000), 1027);
    assert_eq!(rec.tailer_offset(1000), 1060);
}

#[test]
fn test_record_fits_counts_tailer() {
    let rec = RecordHeader::free_space(12);

    assert!(rec.fits(4, 4));
    assert!(!rec.fits(4, 5));
    assert!(!rec.fits(usize::MAX, 1));
}

#[test]
fn test_magic_values() {
    assert_eq!(FREE_MAGIC, !LIVE_MAGIC);
    assert_eq!(MIN_REC_SIZE, 52);

    let mut rec = RecordHeader::default();
    for (magic, state) in [
        (LIVE_MAGIC, RecordState::Live),
        (FREE_MAGIC, RecordState::Free),
        (DEAD_MAGIC, RecordState::Dead),
        (0, RecordState::Corrupt),
    ] {
        rec.magic = magic;
        assert_eq!(rec.state(), state);
    }
}

// =============================================================================
// Hash Tests
// =============================================================================

#[test]
fn test_default_hash_depends_on_length_and_position() {
    assert_ne!(default_hash(b"a"), default_hash(b"aa"));
    assert_ne!(default_hash(b"ab"), default_hash(b"ba"));
    assert_eq!(default_hash(b"key"), default_hash(b"key"));
}
