//! On-disk Format Module
//!
//! Bit-exact layout of the database file.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Header (168 bytes)                                          │
//! │   magic_food [32] | version u32 | hash_size u32             │
//! │   rwlocks u32 | reserved [31 x u32]                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Free list head: u32 (offset 168)                            │
//! │ Hash directory: hash_size x u32 chain heads                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Heap: records, live and free, back to back                  │
//! │   ┌────────────────────────┬──────────────┬───────────────┐ │
//! │   │ RecordHeader (24)      │ key | data   │ tailer u32    │ │
//! │   └────────────────────────┴──────────────┴───────────────┘ │
//! │   tailer = 24 + rec_len                                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All 4-byte fields are stored in the byte order of the process that
//! created the file. A byte-swapped version number tells a reader to
//! convert every field it reads or writes.

mod hash;
mod record;

pub use hash::{default_hash, HashFn};
pub use record::{Endian, RecordHeader, RecordState};

use crate::error::{Result, TdbError};

// =============================================================================
// Shared Constants
// =============================================================================

/// Identifier at the start of every database file (NUL padded to 32 bytes)
pub const MAGIC_FOOD: &[u8] = b"TDB file\n";

/// Length of the magic identifier field
pub const MAGIC_FOOD_LEN: usize = 32;

/// Format version written in native byte order
pub const VERSION: u32 = 0x2601_1967 + 6;

/// Magic tag of a live record
pub const LIVE_MAGIC: u32 = 0x2601_1999;

/// Magic tag of a free record
pub const FREE_MAGIC: u32 = !LIVE_MAGIC;

/// Magic tag of a tombstoned record
pub const DEAD_MAGIC: u32 = 0xFEE1_DEAD;

/// Record sizes are kept 4-byte aligned when split
pub const ALIGNMENT: u32 = 4;

/// Size of one stored offset
pub const OFFSET_SIZE: u32 = 4;

/// Smallest remainder worth splitting off a free record
pub const MIN_REC_SIZE: u32 = 2 * RecordHeader::SIZE + ALIGNMENT;

/// Bucket count used when the caller passes 0
pub const DEFAULT_HASH_SIZE: u32 = 131;

/// File growth granularity
pub const PAGE_SIZE: u32 = 0x2000;

/// Serialized header size
pub const HEADER_SIZE: u32 = 168;

/// Offset of the free list head (directly after the header)
pub const FREELIST_TOP: u32 = HEADER_SIZE;

/// Byte locked while a process initializes the file
pub const GLOBAL_LOCK: u32 = 0;

/// Byte share-locked by every clear-if-first user
pub const ACTIVE_LOCK: u32 = 4;

const RESERVED_WORDS: usize = 31;

/// Round `x` up to a multiple of `a` (a power of two)
pub fn align(x: u32, a: u32) -> u32 {
    (x + a - 1) & !(a - 1)
}

/// Checked variant of [`align`] for sizes derived from the file length
pub fn checked_align(x: u32, a: u32) -> Option<u32> {
    x.checked_add(a - 1).map(|v| v & !(a - 1))
}

/// Largest bucket count whose directory still ends inside a u32 offset
pub const MAX_HASH_SIZE: u32 = (u32::MAX - FREELIST_TOP) / OFFSET_SIZE - 1;

/// Offset of the directory slot holding the head of `bucket`'s chain
///
/// `bucket` is always below a validated hash size, so this cannot overflow.
pub fn hash_top(bucket: u32) -> u32 {
    FREELIST_TOP + (bucket + 1) * OFFSET_SIZE
}

/// First heap byte for a database with `hash_size` buckets, `None` when
/// the directory would not fit in a u32 offset
pub fn checked_heap_start(hash_size: u32) -> Option<u32> {
    hash_size
        .checked_add(1)?
        .checked_mul(OFFSET_SIZE)?
        .checked_add(FREELIST_TOP)
}

/// First heap byte for a database with `hash_size` buckets
///
/// Saturates at `u32::MAX` for sizes above [`MAX_HASH_SIZE`], which no
/// file can hold.
pub fn heap_start(hash_size: u32) -> u32 {
    checked_heap_start(hash_size).unwrap_or(u32::MAX)
}

// =============================================================================
// File Header
// =============================================================================

/// Decoded file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub hash_size: u32,
    /// Offset of a spinlock table, 0 when absent
    pub rwlocks: u32,
}

/// Result of probing the version field of a raw header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderProbe {
    pub header: Header,
    /// Fields are stored in the opposite byte order to this process
    pub convert: bool,
    /// Fields are stored big-endian
    pub big_endian: bool,
}

impl Header {
    /// Header for a fresh database
    pub fn new(hash_size: u32) -> Self {
        Self {
            version: VERSION,
            hash_size,
            rwlocks: 0,
        }
    }

    /// Serialize, with fields in the byte order described by `endian`
    pub fn encode(&self, endian: Endian) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[..MAGIC_FOOD.len()].copy_from_slice(MAGIC_FOOD);
        endian.put(&mut buf[32..36], self.version);
        endian.put(&mut buf[36..40], self.hash_size);
        endian.put(&mut buf[40..44], self.rwlocks);
        // reserved words stay zero
        debug_assert_eq!(44 + RESERVED_WORDS * 4, HEADER_SIZE as usize);
        buf
    }

    /// Parse and validate a raw header, detecting its byte order
    pub fn probe(buf: &[u8]) -> Result<HeaderProbe> {
        if buf.len() < HEADER_SIZE as usize {
            return Err(TdbError::BadFormat(format!(
                "short header: {} bytes",
                buf.len()
            )));
        }

        let food = &buf[..MAGIC_FOOD_LEN];
        let food_end = food.iter().position(|&b| b == 0).unwrap_or(MAGIC_FOOD_LEN);
        if &food[..food_end] != MAGIC_FOOD {
            return Err(TdbError::BadFormat("bad magic identifier".to_string()));
        }

        let raw_version = [buf[32], buf[33], buf[34], buf[35]];
        let convert = match u32::from_ne_bytes(raw_version) {
            v if v == VERSION => false,
            v if v == VERSION.swap_bytes() => true,
            v => {
                return Err(TdbError::BadFormat(format!(
                    "unknown version 0x{:08x}",
                    v
                )))
            }
        };
        let endian = Endian::new(convert);
        let big_endian = u32::from_be_bytes(raw_version) == VERSION;

        let header = Header {
            version: endian.get(&buf[32..36]),
            hash_size: endian.get(&buf[36..40]),
            rwlocks: endian.get(&buf[40..44]),
        };
        if header.hash_size == 0 {
            return Err(TdbError::BadFormat("zero hash size".to_string()));
        }
        if header.hash_size > MAX_HASH_SIZE {
            return Err(TdbError::BadFormat(format!(
                "hash size {} overflows the file offsets",
                header.hash_size
            )));
        }

        Ok(HeaderProbe {
            header,
            convert,
            big_endian,
        })
    }

    /// Total size of a freshly initialized file: header, free list head, directory
    pub fn initial_size(&self) -> u32 {
        heap_start(self.hash_size)
    }
}
