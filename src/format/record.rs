//! Record header codec
//!
//! Every 4-byte field goes through [`Endian`], so a database written by a
//! process of the other byte order reads back identically. Key and value
//! bytes are never converted.

use super::{DEAD_MAGIC, FREE_MAGIC, LIVE_MAGIC, OFFSET_SIZE};

/// Byte order conversion for stored 4-byte fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Endian {
    convert: bool,
}

impl Endian {
    pub fn new(convert: bool) -> Self {
        Self { convert }
    }

    /// Native byte order, no conversion
    pub fn native() -> Self {
        Self { convert: false }
    }

    pub fn is_converting(&self) -> bool {
        self.convert
    }

    /// Decode a stored field
    pub fn get(&self, bytes: &[u8]) -> u32 {
        let v = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if self.convert {
            v.swap_bytes()
        } else {
            v
        }
    }

    /// Encode a field for storage
    pub fn put(&self, bytes: &mut [u8], v: u32) {
        let v = if self.convert { v.swap_bytes() } else { v };
        bytes[..4].copy_from_slice(&v.to_ne_bytes());
    }

    pub fn encode(&self, v: u32) -> [u8; 4] {
        let mut buf = [0u8; 4];
        self.put(&mut buf, v);
        buf
    }
}

/// Classification of a record by its magic tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Live,
    Free,
    Dead,
    Corrupt,
}

/// The fixed 24-byte header in front of every record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordHeader {
    /// Offset of the next record in the chain (0 = end)
    pub next: u32,
    /// Bytes following the header, tailer included
    pub rec_len: u32,
    pub key_len: u32,
    pub data_len: u32,
    /// Full 32-bit hash of the key
    pub full_hash: u32,
    pub magic: u32,
}

impl RecordHeader {
    /// Serialized header size
    pub const SIZE: u32 = 24;

    /// Header of a fresh free region spanning `rec_len` bytes after the header
    pub fn free_space(rec_len: u32) -> Self {
        Self {
            rec_len,
            ..Self::default()
        }
    }

    pub fn decode(buf: &[u8], endian: Endian) -> Self {
        Self {
            next: endian.get(&buf[0..4]),
            rec_len: endian.get(&buf[4..8]),
            key_len: endian.get(&buf[8..12]),
            data_len: endian.get(&buf[12..16]),
            full_hash: endian.get(&buf[16..20]),
            magic: endian.get(&buf[20..24]),
        }
    }

    pub fn encode(&self, endian: Endian) -> [u8; Self::SIZE as usize] {
        let mut buf = [0u8; Self::SIZE as usize];
        endian.put(&mut buf[0..4], self.next);
        endian.put(&mut buf[4..8], self.rec_len);
        endian.put(&mut buf[8..12], self.key_len);
        endian.put(&mut buf[12..16], self.data_len);
        endian.put(&mut buf[16..20], self.full_hash);
        endian.put(&mut buf[20..24], self.magic);
        buf
    }

    pub fn state(&self) -> RecordState {
        match self.magic {
            LIVE_MAGIC => RecordState::Live,
            FREE_MAGIC => RecordState::Free,
            DEAD_MAGIC => RecordState::Dead,
            _ => RecordState::Corrupt,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.magic == DEAD_MAGIC
    }

    /// Neither live nor tombstoned: not something a chain may contain
    pub fn has_bad_magic(&self) -> bool {
        self.magic != LIVE_MAGIC && !self.is_dead()
    }

    /// Header plus body, i.e. the value the tailer must hold
    pub fn total_size(&self) -> u32 {
        Self::SIZE.saturating_add(self.rec_len)
    }

    /// Offset of the tailer for a record starting at `offset`
    ///
    /// Saturates instead of wrapping, so a damaged length points past the
    /// end of any file and fails the bounds check.
    pub fn tailer_offset(&self, offset: u32) -> u32 {
        offset
            .saturating_add(self.total_size())
            .saturating_sub(OFFSET_SIZE)
    }

    /// Offset of the key bytes for a record starting at `offset`
    pub fn key_offset(offset: u32) -> u32 {
        offset.saturating_add(Self::SIZE)
    }

    /// Offset of the data bytes for a record starting at `offset`
    pub fn data_offset(&self, offset: u32) -> u32 {
        Self::key_offset(offset).saturating_add(self.key_len)
    }

    /// One past the last byte of a record starting at `offset`
    pub fn end(&self, offset: u32) -> u64 {
        offset as u64 + self.total_size() as u64
    }

    /// Whether key, data and tailer fit in this record's body
    pub fn fits(&self, key_len: usize, data_len: usize) -> bool {
        (self.rec_len as u64) >= key_len as u64 + data_len as u64 + OFFSET_SIZE as u64
    }
}
