//! Layout inspection
//!
//! Read-only views of the file's structure: the records of one chain, a
//! full heap walk that proves no space is leaked, and a content digest.

use tracing::error;

use crate::context::DbContext;
use crate::engine::Database;
use crate::error::{Result, TdbError};
use crate::format::{hash_top, heap_start, RecordHeader, RecordState, OFFSET_SIZE};
use crate::lock::{LockMode, LockTarget};
use crate::traverse::TraverseControl;

/// One record of a dumped chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainEntry {
    pub offset: u32,
    pub header: RecordHeader,
    /// The tailer matches the header's size
    pub tailer_ok: bool,
}

/// Space accounting of the whole file, from a linear heap walk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayoutReport {
    pub file_size: u32,
    /// Header, free list head and hash directory
    pub overhead: u32,
    pub live_records: usize,
    pub live_bytes: u64,
    pub dead_records: usize,
    pub dead_bytes: u64,
    pub free_records: usize,
    pub free_bytes: u64,
}

impl LayoutReport {
    /// Every byte of the file is accounted for exactly once
    pub fn is_conserved(&self) -> bool {
        self.overhead as u64 + self.live_bytes + self.dead_bytes + self.free_bytes
            == self.file_size as u64
    }
}

/// Order-independent summary of a database's contents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Digest {
    pub records: usize,
    pub checksum: u64,
}

impl DbContext {
    pub(crate) fn dump_chain(&mut self, bucket: u32) -> Result<Vec<ChainEntry>> {
        if bucket >= self.header.hash_size {
            return Err(TdbError::Config(format!(
                "bucket {} out of range (hash size {})",
                bucket, self.header.hash_size
            )));
        }
        self.with_lock(LockTarget::Bucket(bucket), LockMode::Read, |ctx| {
            let mut entries = Vec::new();
            let mut offset = ctx.read_off(hash_top(bucket))?;
            while offset != 0 {
                if entries.len() as u32 >= ctx.walk_limit() {
                    return Err(TdbError::corrupt(format!("loop in chain {}", bucket)));
                }
                let header = ctx.read_header(offset)?;
                let in_bounds = offset as u64 + RecordHeader::SIZE as u64 + header.rec_len as u64
                    <= ctx.storage.len() as u64;
                let tailer_ok = header.rec_len >= OFFSET_SIZE
                    && in_bounds
                    && matches!(ctx.read_off(header.tailer_offset(offset)), Ok(t) if t == header.total_size());
                entries.push(ChainEntry {
                    offset,
                    header,
                    tailer_ok,
                });
                // a record with unknown magic has no trustworthy next pointer
                if header.has_bad_magic() || header.next == offset {
                    break;
                }
                offset = header.next;
            }
            Ok(entries)
        })
    }

    /// Verify the heap tiles the file, free records never touch, and the
    /// free list and hash chains agree with what the heap holds
    pub(crate) fn check(&mut self) -> Result<LayoutReport> {
        if self.read_only {
            return self.check_layout();
        }
        self.lock_all()?;
        let checked = self.with_lock(LockTarget::Alloc, LockMode::Write, |ctx| ctx.check_layout());
        match self.unlock_all() {
            Ok(()) => checked,
            Err(e) => checked.and(Err(e)),
        }
    }

    fn check_layout(&mut self) -> Result<LayoutReport> {
        let _ = self.storage.ensure_capacity(self.storage.len() as u64 + 1, true);

        let file_size = self.storage.len();
        let start = heap_start(self.header.hash_size);
        let mut report = LayoutReport {
            file_size,
            overhead: start,
            ..LayoutReport::default()
        };

        // heap, left to right
        let mut offset = start;
        let mut prev_free = false;
        while offset < file_size {
            if file_size - offset < RecordHeader::SIZE + OFFSET_SIZE {
                return Err(layout_error(offset, "truncated record"));
            }
            let rec = self.read_header(offset)?;
            let total = RecordHeader::SIZE as u64 + rec.rec_len as u64;
            if rec.rec_len < OFFSET_SIZE || offset as u64 + total > file_size as u64 {
                return Err(layout_error(offset, "record overruns the file"));
            }
            let total = total as u32;
            if self.read_off(rec.tailer_offset(offset))? != total {
                return Err(layout_error(offset, "tailer does not match record size"));
            }

            let state = rec.state();
            match state {
                RecordState::Live => {
                    report.live_records += 1;
                    report.live_bytes += total as u64;
                }
                RecordState::Dead => {
                    report.dead_records += 1;
                    report.dead_bytes += total as u64;
                }
                RecordState::Free if prev_free => {
                    return Err(layout_error(offset, "adjacent free records"));
                }
                RecordState::Free => {
                    report.free_records += 1;
                    report.free_bytes += total as u64;
                }
                RecordState::Corrupt => return Err(layout_error(offset, "bad magic")),
            }
            prev_free = state == RecordState::Free;
            offset += total;
        }

        // free list
        let free = self.freelist()?;
        let listed: u64 = free
            .iter()
            .map(|e| (RecordHeader::SIZE + e.rec_len) as u64)
            .sum();
        if free.len() != report.free_records || listed != report.free_bytes {
            error!(
                listed = free.len(),
                heap = report.free_records,
                "free list disagrees with heap"
            );
            return Err(TdbError::corrupt("free list disagrees with the heap"));
        }

        // hash chains
        let mut linked = 0usize;
        for bucket in 0..self.header.hash_size {
            let mut offset = self.read_off(hash_top(bucket))?;
            while offset != 0 {
                linked += 1;
                if linked as u32 > self.walk_limit() {
                    return Err(TdbError::corrupt(format!("loop in chain {}", bucket)));
                }
                let rec = self.read_record(offset)?;
                if self.bucket_of(rec.full_hash) != bucket {
                    return Err(layout_error(offset, "record linked into the wrong chain"));
                }
                offset = rec.next;
            }
        }
        if linked != report.live_records + report.dead_records {
            error!(linked, "hash chains disagree with heap");
            return Err(TdbError::corrupt("hash chains disagree with the heap"));
        }

        Ok(report)
    }
}

fn layout_error(offset: u32, what: &str) -> TdbError {
    error!(offset, what, "layout check failed");
    TdbError::corrupt(format!("{} at offset {}", what, offset))
}

impl Database {
    /// CRC32 of every live record, combined so order does not matter
    pub fn digest(&self) -> Result<Digest> {
        let mut checksum = 0u64;
        let records = self.traverse(|key, value| {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&(key.len() as u32).to_le_bytes());
            hasher.update(key);
            hasher.update(value);
            checksum = checksum.wrapping_add(hasher.finalize() as u64);
            TraverseControl::Continue
        })?;
        Ok(Digest { records, checksum })
    }
}
