//! Free-List Allocator
//!
//! Free records are threaded through the file in a singly linked list whose
//! head sits at `FREELIST_TOP`. Newly freed space is pushed on the front.
//!
//! ## Allocation
//! - First fit: the first free record big enough wins
//! - A fitting record large enough to leave a viable remainder is split;
//!   the remainder goes straight back through [`DbContext::free`]
//! - Nothing fits: grow the file and retry once
//!
//! ## Freeing
//! ```text
//!   [ left ? ][ freed record ][ right ? ]
//!        ^          |              ^
//!        |  tailer  |  offset+size |
//!        +----------+--------------+
//! ```
//! The right neighbor is found arithmetically, the left one through the
//! tailer just before the record. Free neighbors are unlinked and absorbed
//! every time, so two free records are never adjacent.
//!
//! Every function here takes the allocation lock itself; it nests, so
//! callers already holding it are fine. Callers may hold a bucket lock
//! first, never the other way round.

use tracing::{debug, error, warn};

use crate::context::DbContext;
use crate::error::{Result, TdbError};
use crate::format::{
    align, checked_align, heap_start, RecordHeader, RecordState, ALIGNMENT, FREELIST_TOP,
    FREE_MAGIC, LIVE_MAGIC, MIN_REC_SIZE, OFFSET_SIZE, PAGE_SIZE,
};
use crate::lock::{LockMode, LockTarget};

/// One entry of the free list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeEntry {
    pub offset: u32,
    /// Bytes after the header, tailer included
    pub rec_len: u32,
}

impl DbContext {
    // =========================================================================
    // Allocate
    // =========================================================================

    /// Carve a live record with room for `length` bytes of key and data.
    ///
    /// The returned header is tagged live and already unlinked from the free
    /// list; the caller fills in the chain link, lengths and hash.
    pub(crate) fn allocate(&mut self, length: u32) -> Result<(u32, RecordHeader)> {
        // room for the tailer
        let length = length
            .checked_add(OFFSET_SIZE)
            .ok_or(TdbError::OutOfMemory(length as usize))?;

        self.with_lock(LockTarget::Alloc, LockMode::Write, |ctx| {
            if let Some(found) = ctx.allocate_first_fit(length)? {
                return Ok(found);
            }
            let wanted = length
                .checked_add(RecordHeader::SIZE)
                .ok_or(TdbError::OutOfMemory(length as usize))?;
            ctx.expand(wanted)?;
            ctx.allocate_first_fit(length)?.ok_or_else(|| {
                error!(length, "no free record fits after expanding");
                TdbError::corrupt("allocation failed after expanding the file")
            })
        })
    }

    fn allocate_first_fit(&mut self, length: u32) -> Result<Option<(u32, RecordHeader)>> {
        let mut last_ptr = FREELIST_TOP;
        let mut rec_ptr = self.read_off(FREELIST_TOP)?;
        let mut steps = 0u32;

        while rec_ptr != 0 {
            steps += 1;
            if steps > self.walk_limit() {
                error!(offset = rec_ptr, "loop in free list");
                return Err(TdbError::corrupt("loop in free list"));
            }

            let mut rec = self.read_free_record(rec_ptr)?;
            if rec.rec_len < length {
                last_ptr = rec_ptr;
                rec_ptr = rec.next;
                continue;
            }

            // split off the tail when what is left can hold a record
            let remainder = if rec.rec_len as u64 > length as u64 + MIN_REC_SIZE as u64 {
                let used = align(length, ALIGNMENT);
                let tail = RecordHeader::free_space(rec.rec_len - (RecordHeader::SIZE + used));
                rec.rec_len = used;
                Some((rec_ptr + RecordHeader::SIZE + used, tail))
            } else {
                None
            };

            // unlink, then tag live before the allocation lock can drop:
            // a concurrent free must not mistake us for a free neighbor
            self.write_off(last_ptr, rec.next)?;
            rec.magic = LIVE_MAGIC;
            self.write_record(rec_ptr, &rec)?;

            if let Some((tail_ptr, tail)) = remainder {
                self.update_tailer(rec_ptr, &rec)?;
                self.free(tail_ptr, tail)?;
            }
            return Ok(Some((rec_ptr, rec)));
        }
        Ok(None)
    }

    // =========================================================================
    // Free
    // =========================================================================

    /// Return the record at `offset` to the free list, merging with free
    /// neighbors on both sides.
    pub(crate) fn free(&mut self, offset: u32, rec: RecordHeader) -> Result<()> {
        self.with_lock(LockTarget::Alloc, LockMode::Write, |ctx| {
            ctx.free_locked(offset, rec)
        })
    }

    fn free_locked(&mut self, mut offset: u32, mut rec: RecordHeader) -> Result<()> {
        // a valid tailer first, so a failure below leaves a sane record
        self.update_tailer(offset, &rec).map_err(|e| {
            error!(offset, error = %e, "initial tailer update failed");
            e
        })?;

        // right neighbor
        let right = offset as u64 + rec.total_size() as u64;
        if right + RecordHeader::SIZE as u64 <= self.storage.len() as u64 {
            let right = right as u32;
            let len = self.storage.len() as u64;
            match self.read_header(right) {
                Ok(r) if r.magic == FREE_MAGIC && r.end(right) <= len => {
                    match self.remove_from_freelist(right, r.next) {
                        Ok(()) => rec.rec_len += r.total_size(),
                        Err(e) => warn!(offset = right, error = %e, "right merge failed"),
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(offset = right, error = %e, "right neighbor read failed"),
            }
        }

        // left neighbor, located through its tailer
        let start = heap_start(self.header.hash_size);
        if offset > start {
            match self.left_free_neighbor(offset, start) {
                Ok(Some((left, l))) => match self.remove_from_freelist(left, l.next) {
                    Ok(()) => {
                        rec.rec_len += offset - left;
                        offset = left;
                    }
                    Err(e) => warn!(offset = left, error = %e, "left merge failed"),
                },
                Ok(None) => {}
                Err(e) => warn!(offset, error = %e, "left neighbor read failed"),
            }
        }

        self.update_tailer(offset, &rec)?;

        // prepend to the free list
        rec.magic = FREE_MAGIC;
        rec.next = self.read_off(FREELIST_TOP)?;
        self.write_record(offset, &rec)?;
        self.write_off(FREELIST_TOP, offset).map_err(|e| {
            error!(offset, error = %e, "free list head update failed");
            e
        })
    }

    fn left_free_neighbor(&mut self, offset: u32, start: u32) -> Result<Option<(u32, RecordHeader)>> {
        let left_size = self.read_off(offset - OFFSET_SIZE)?;
        if left_size < RecordHeader::SIZE + OFFSET_SIZE || left_size > offset - start {
            warn!(offset, left_size, "implausible tailer before record");
            return Ok(None);
        }
        let left = offset - left_size;
        let l = self.read_header(left)?;
        if l.magic == FREE_MAGIC && l.total_size() == left_size {
            Ok(Some((left, l)))
        } else {
            Ok(None)
        }
    }

    /// Unlink the free record at `offset`, whose successor is `next`.
    /// Needs the allocation lock.
    fn remove_from_freelist(&mut self, offset: u32, next: u32) -> Result<()> {
        let mut last_ptr = FREELIST_TOP;
        let mut steps = 0u32;
        loop {
            let i = self.read_off(last_ptr)?;
            if i == 0 {
                break;
            }
            if i == offset {
                return self.write_off(last_ptr, next);
            }
            steps += 1;
            if steps > self.walk_limit() {
                break;
            }
            // the next pointer lives at the start of each record
            last_ptr = i;
        }
        error!(offset, "record not on the free list");
        Err(TdbError::corrupt(format!("offset {} not on the free list", offset)))
    }

    // =========================================================================
    // Growth
    // =========================================================================

    /// Grow the file by at least `size` bytes: room for ten more records of
    /// this size, rounded so the file stays a whole number of pages. The new
    /// space becomes one free record.
    pub(crate) fn expand(&mut self, size: u32) -> Result<()> {
        self.with_lock(LockTarget::Alloc, LockMode::Write, |ctx| {
            // catch up with growth by other processes first
            let _ = ctx.storage.ensure_capacity(ctx.storage.len() as u64 + 1, true);

            let map_size = ctx.storage.len();
            let addition = size
                .checked_mul(10)
                .and_then(|s| s.checked_add(map_size))
                .and_then(|s| checked_align(s, PAGE_SIZE))
                .map(|s| s - map_size)
                .ok_or(TdbError::OutOfMemory(size as usize))?;

            ctx.storage.expand(addition)?;
            debug!(from = map_size, to = map_size + addition, "expanded database");

            let rec = RecordHeader::free_space(addition - RecordHeader::SIZE);
            ctx.free(map_size, rec)
        })
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Every free record, in list order
    pub(crate) fn freelist(&mut self) -> Result<Vec<FreeEntry>> {
        self.with_lock(LockTarget::Alloc, LockMode::Write, |ctx| {
            let mut entries = Vec::new();
            let mut rec_ptr = ctx.read_off(FREELIST_TOP)?;
            while rec_ptr != 0 {
                if entries.len() as u32 >= ctx.walk_limit() {
                    return Err(TdbError::corrupt("loop in free list"));
                }
                let rec = ctx.read_header(rec_ptr)?;
                if rec.state() != RecordState::Free {
                    error!(offset = rec_ptr, magic = rec.magic, "bad magic in free list");
                    return Err(TdbError::corrupt(format!(
                        "bad magic 0x{:08x} in free list at offset {}",
                        rec.magic, rec_ptr
                    )));
                }
                entries.push(FreeEntry {
                    offset: rec_ptr,
                    rec_len: rec.rec_len,
                });
                rec_ptr = rec.next;
            }
            Ok(entries)
        })
    }
}
