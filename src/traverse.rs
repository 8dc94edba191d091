//! Traversal Engine
//!
//! Walks every live record, bucket by bucket, with a cursor that survives
//! concurrent mutation.
//!
//! ## Cursor States
//! ```text
//!   Idle ──first/next──▶ Positioned(bucket, offset) ──end/error──▶ Idle
//!                           │   bucket lock: until the caller copied the record
//!                           │   record lock: until the cursor moves again
//! ```
//!
//! A record a cursor is parked on cannot be unlinked: a delete that finds
//! it locked tombstones it instead, and a later pass over the bucket
//! reclaims it.
//!
//! Slot 0 of the cursor table belongs to `first_key`/`next_key`; every
//! running `traverse` takes its own slot, so traversals may nest.

use bytes::Bytes;
use tracing::{error, warn};

use crate::context::DbContext;
use crate::engine::Database;
use crate::error::{Result, TdbError};
use crate::format::{hash_top, RecordHeader};
use crate::lock::{LockMode, LockTarget};

/// What a traversal callback wants next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraverseControl {
    Continue,
    Stop,
}

// =============================================================================
// Cursor Table
// =============================================================================

/// Position of one cursor; offset 0 means "at the top of `bucket`"
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Cursor {
    pub(crate) bucket: u32,
    pub(crate) offset: u32,
}

/// Every cursor open on one handle
#[derive(Debug)]
pub(crate) struct Cursors {
    slots: Vec<Option<Cursor>>,
}

impl Cursors {
    /// Slot of the `first_key`/`next_key` cursor
    pub(crate) const KEYS: usize = 0;

    pub(crate) fn new() -> Self {
        Self {
            slots: vec![Some(Cursor::default())],
        }
    }

    pub(crate) fn get(&self, slot: usize) -> Cursor {
        self.slots.get(slot).copied().flatten().unwrap_or_default()
    }

    pub(crate) fn set(&mut self, slot: usize, cursor: Cursor) {
        if let Some(entry) = self.slots.get_mut(slot) {
            *entry = Some(cursor);
        }
    }

    fn set_offset(&mut self, slot: usize, offset: u32) {
        if let Some(Some(cursor)) = self.slots.get_mut(slot) {
            cursor.offset = offset;
        }
    }

    fn advance(&mut self, slot: usize) {
        if let Some(Some(cursor)) = self.slots.get_mut(slot) {
            cursor.bucket += 1;
            cursor.offset = 0;
        }
    }

    /// Claim a slot for a new traversal
    pub(crate) fn register(&mut self) -> usize {
        match self.slots.iter().skip(1).position(Option::is_none) {
            Some(i) => {
                self.slots[i + 1] = Some(Cursor::default());
                i + 1
            }
            None => {
                self.slots.push(Some(Cursor::default()));
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, slot: usize) {
        if slot != Self::KEYS {
            if let Some(entry) = self.slots.get_mut(slot) {
                *entry = None;
            }
        }
        while self.slots.len() > 1 && matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
    }

    /// How many cursors are parked on `offset`
    pub(crate) fn holders(&self, offset: u32) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|c| c.offset == offset)
            .count()
    }

    /// Distinct record offsets currently held
    pub(crate) fn offsets(&self) -> Vec<u32> {
        let mut offsets: Vec<u32> = self
            .slots
            .iter()
            .flatten()
            .map(|c| c.offset)
            .filter(|&o| o != 0)
            .collect();
        offsets.sort_unstable();
        offsets.dedup();
        offsets
    }
}

// =============================================================================
// Find Next
// =============================================================================

impl DbContext {
    /// Move cursor `slot` to the next live record.
    ///
    /// On `Some`, the record's bucket lock and record lock are held. On
    /// `None` the database is exhausted and nothing is held.
    pub(crate) fn next_lock(&mut self, slot: usize) -> Result<Option<RecordHeader>> {
        let mut want_next = self.cursors.get(slot).offset != 0;

        loop {
            let cursor = self.cursors.get(slot);
            if cursor.bucket >= self.header.hash_size {
                return Ok(None);
            }
            let bucket = cursor.bucket;

            // Unlocked peek at the chain head. Never on bucket 0: a scan must
            // take at least one real lock before trusting what it reads.
            if cursor.offset == 0 && bucket != 0 {
                if let Ok(0) = self.read_off(hash_top(bucket)) {
                    self.cursors.advance(slot);
                    continue;
                }
            }

            let target = LockTarget::Bucket(bucket);
            self.lock(target, LockMode::Write)?;
            match self.walk_bucket(slot, bucket, want_next) {
                Ok(Some(rec)) => return Ok(Some(rec)),
                Ok(None) => {
                    self.unlock(target)?;
                    want_next = false;
                    self.cursors.advance(slot);
                }
                Err(e) => {
                    self.cursors.set_offset(slot, 0);
                    self.unlock_logged(target);
                    return Err(e);
                }
            }
        }
    }

    fn walk_bucket(&mut self, slot: usize, bucket: u32, want_next: bool) -> Result<Option<RecordHeader>> {
        let mut offset = self.cursors.get(slot).offset;
        if offset == 0 {
            offset = self.read_off(hash_top(bucket))?;
        } else {
            self.unlock_record(offset)?;
        }

        if want_next {
            let rec = self.read_record(offset)?;
            offset = rec.next;
        }
        self.cursors.set_offset(slot, offset);

        let mut steps = 0u32;
        while offset != 0 {
            steps += 1;
            if steps > self.walk_limit() {
                error!(bucket, "loop in hash chain");
                return Err(TdbError::corrupt(format!("loop in chain {}", bucket)));
            }

            let rec = self.read_record(offset)?;
            if rec.next == offset {
                error!(offset, bucket, "chain record points at itself");
                return Err(TdbError::corrupt(format!("loop detected at offset {}", offset)));
            }

            if !rec.is_dead() && !self.owner_gone(offset, &rec)? {
                self.lock_record(offset)?;
                return Ok(Some(rec));
            }

            // reclaim what earlier traversals had to leave behind
            let current = offset;
            offset = rec.next;
            self.cursors.set_offset(slot, offset);
            if !self.read_only {
                self.do_delete(current, rec)?;
            }
        }
        Ok(None)
    }

    /// Advance a `traverse` cursor and copy out its record.
    /// Only the record lock is still held on return.
    fn traverse_step(&mut self, slot: usize) -> Result<Option<(Bytes, Bytes)>> {
        let Some(rec) = self.next_lock(slot)? else {
            return Ok(None);
        };
        let cursor = self.cursors.get(slot);
        let target = LockTarget::Bucket(cursor.bucket);

        let len = rec.key_len as u64 + rec.data_len as u64;
        let body = u32::try_from(len)
            .map_err(|_| TdbError::corrupt(format!("record at {} is too long", cursor.offset)))
            .and_then(|len| self.storage.read_vec(RecordHeader::key_offset(cursor.offset), len));

        match body {
            Ok(body) => {
                self.unlock(target)?;
                let body = Bytes::from(body);
                let key = body.slice(..rec.key_len as usize);
                let value = body.slice(rec.key_len as usize..);
                Ok(Some((key, value)))
            }
            Err(e) => {
                self.unlock_logged(target);
                if let Err(unlock_err) = self.unlock_record(cursor.offset) {
                    warn!(offset = cursor.offset, error = %unlock_err, "record unlock failed");
                }
                self.cursors.set_offset(slot, 0);
                Err(e)
            }
        }
    }

    fn release_cursor(&mut self, slot: usize) -> Result<()> {
        let offset = self.cursors.get(slot).offset;
        let unlocked = self.unlock_record(offset);
        self.cursors.release(slot);
        unlocked
    }

    // =========================================================================
    // Key Cursor
    // =========================================================================

    pub(crate) fn first_key(&mut self) -> Result<Option<Bytes>> {
        let slot = Cursors::KEYS;
        let parked = self.cursors.get(slot).offset;
        self.unlock_record(parked)?;
        self.cursors.set(slot, Cursor::default());

        let Some(rec) = self.next_lock(slot)? else {
            return Ok(None);
        };
        let cursor = self.cursors.get(slot);
        let key = self.read_key(cursor.offset, &rec);
        self.unlock_logged(LockTarget::Bucket(cursor.bucket));
        key.map(|k| Some(Bytes::from(k)))
    }

    pub(crate) fn next_key(&mut self, prev: &[u8]) -> Result<Option<Bytes>> {
        let slot = Cursors::KEYS;
        let cursor = self.cursors.get(slot);

        // still parked on `prev`? then the walk continues from there
        if cursor.offset != 0 {
            let target = LockTarget::Bucket(cursor.bucket);
            self.lock(target, LockMode::Write)?;
            if !self.cursor_holds_key(cursor.offset, prev) {
                let released = self.unlock_record(cursor.offset);
                self.cursors.set_offset(slot, 0);
                self.unlock(target)?;
                released?;
            }
        }

        if self.cursors.get(slot).offset == 0 {
            let hash = self.hash(prev);
            let Some(found) = self.find_lock_hash(prev, hash, LockMode::Write)? else {
                return Ok(None);
            };
            let bucket = self.bucket_of(found.rec.full_hash);
            self.cursors.set(
                slot,
                Cursor {
                    bucket,
                    offset: found.offset,
                },
            );
            if let Err(e) = self.lock_record(found.offset) {
                self.cursors.set_offset(slot, 0);
                self.unlock_logged(LockTarget::Bucket(bucket));
                return Err(e);
            }
        }
        let old_bucket = self.cursors.get(slot).bucket;

        let next = match self.next_lock(slot) {
            Ok(Some(rec)) => {
                let cursor = self.cursors.get(slot);
                let key = self.read_key(cursor.offset, &rec);
                self.unlock_logged(LockTarget::Bucket(cursor.bucket));
                key.map(|k| Some(Bytes::from(k)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        self.unlock_logged(LockTarget::Bucket(old_bucket));
        next
    }

    fn cursor_holds_key(&mut self, offset: u32, key: &[u8]) -> bool {
        match self.read_record(offset) {
            Ok(rec) if rec.key_len as usize == key.len() => {
                matches!(self.read_key(offset, &rec), Ok(k) if k == key)
            }
            _ => false,
        }
    }
}

// =============================================================================
// Public Traversal
// =============================================================================

impl Database {
    /// Call `f` on every live record, returning how many were visited.
    ///
    /// No chain lock is held while `f` runs, so it may use this handle,
    /// including deleting the record it was handed.
    pub fn traverse<F>(&self, mut f: F) -> Result<usize>
    where
        F: FnMut(&[u8], &[u8]) -> TraverseControl,
    {
        let slot = self.context().lock().cursors.register();
        let mut count = 0usize;

        let walked = loop {
            let step = self.context().lock().traverse_step(slot);
            match step {
                Ok(Some((key, value))) => {
                    count += 1;
                    if f(&key, &value) == TraverseControl::Stop {
                        break Ok(count);
                    }
                }
                Ok(None) => break Ok(count),
                Err(e) => break Err(e),
            }
        };

        let mut ctx = self.context().lock();
        let released = ctx.release_cursor(slot);
        let result = walked.and_then(|count| released.map(|_| count));
        if let Err(e) = &result {
            ctx.record_error(e);
        }
        result
    }

    /// Iterate over every key through the `first_key`/`next_key` cursor
    pub fn keys(&self) -> Keys<'_> {
        Keys {
            db: self,
            prev: None,
            done: false,
        }
    }
}

/// Iterator returned by [`Database::keys`]
pub struct Keys<'a> {
    db: &'a Database,
    prev: Option<Bytes>,
    done: bool,
}

impl Iterator for Keys<'_> {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = match &self.prev {
            None => self.db.first_key(),
            Some(prev) => self.db.next_key(prev),
        };
        match step {
            Ok(Some(key)) => {
                self.prev = Some(key.clone());
                Some(Ok(key))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
