//! Hash Chains & Record Operations
//!
//! Each bucket's chain is a singly linked list of records, newest first,
//! whose head lives in the hash directory. Everything here runs with the
//! bucket lock held by the caller (or takes it itself, for the `_lock_`
//! variants).
//!
//! ## Store Path
//! ```text
//! store(key, value, mode)
//!   ├─ Insert:          key present?            → RecordExists
//!   ├─ Replace/Modify:  fits the existing slot? → overwrite in place, done
//!   │                   missing and Modify?     → RecordNotFound
//!   ├─ delete the old record (frees its space before the allocation)
//!   └─ allocate, write header + key + value, link at the chain head
//! ```

use tracing::{error, trace};

use crate::context::DbContext;
use crate::error::{Result, TdbError};
use crate::format::{hash_top, RecordHeader, DEAD_MAGIC, LIVE_MAGIC};
use crate::lock::{LockMode, LockTarget};

/// How `store` treats an existing record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Fail with `RecordExists` if the key is present
    Insert,
    /// Insert or overwrite
    Replace,
    /// Fail with `RecordNotFound` if the key is absent
    Modify,
}

/// A located record
#[derive(Debug, Clone, Copy)]
pub(crate) struct Found {
    pub(crate) offset: u32,
    pub(crate) rec: RecordHeader,
}

/// Outcome of an in-place rewrite attempt
enum InPlace {
    Done,
    NoRoom(Found),
    Missing,
}

impl DbContext {
    // =========================================================================
    // Lookup
    // =========================================================================

    /// Walk `key`'s chain for a live record holding exactly `key`.
    ///
    /// Tombstones and records whose owner has exited are skipped; with
    /// `reap` set (caller holds the chain's write lock) they are also
    /// reclaimed on the way.
    pub(crate) fn find(&mut self, key: &[u8], hash: u32, reap: bool) -> Result<Option<Found>> {
        let reap = reap && !self.read_only;
        let bucket = self.bucket_of(hash);
        let mut offset = self.read_off(hash_top(bucket))?;
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
            let next = rec.next;

            if rec.is_dead() {
                if reap {
                    self.do_delete(offset, rec)?;
                }
            } else if rec.full_hash == hash
                && rec.key_len as usize == key.len()
                && self.read_key(offset, &rec)? == key
            {
                if !self.owner_gone(offset, &rec)? {
                    return Ok(Some(Found { offset, rec }));
                }
                trace!(offset, "record owner has exited");
                if reap {
                    self.do_delete(offset, rec)?;
                }
            }
            offset = next;
        }
        Ok(None)
    }

    /// [`find`](Self::find) under the bucket lock; on `Some` the lock stays held
    pub(crate) fn find_lock_hash(&mut self, key: &[u8], hash: u32, mode: LockMode) -> Result<Option<Found>> {
        let target = LockTarget::Bucket(self.bucket_of(hash));
        self.lock(target, mode)?;
        match self.find(key, hash, mode == LockMode::Write) {
            Ok(Some(found)) => Ok(Some(found)),
            Ok(None) => {
                self.unlock(target)?;
                Ok(None)
            }
            Err(e) => {
                self.unlock_logged(target);
                Err(e)
            }
        }
    }

    pub(crate) fn fetch(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let hash = self.hash(key);
        let target = LockTarget::Bucket(self.bucket_of(hash));
        let Some(found) = self.find_lock_hash(key, hash, LockMode::Read)? else {
            return Ok(None);
        };
        let data = self.read_data(found.offset, &found.rec);
        self.unlock_logged(target);
        data.map(Some)
    }

    pub(crate) fn exists(&mut self, key: &[u8]) -> Result<bool> {
        let hash = self.hash(key);
        let target = LockTarget::Bucket(self.bucket_of(hash));
        match self.find_lock_hash(key, hash, LockMode::Read)? {
            Some(_) => {
                self.unlock(target)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Unlink the record at `offset` and free it.
    ///
    /// A record some cursor is parked on is tombstoned instead and stays
    /// linked until a later traversal gets to reclaim it.
    pub(crate) fn do_delete(&mut self, offset: u32, mut rec: RecordHeader) -> Result<()> {
        self.ensure_writable()?;

        if !self.write_lock_record(offset)? {
            trace!(offset, "record in use by a traversal, tombstoning");
            rec.magic = DEAD_MAGIC;
            return self.write_record(offset, &rec);
        }
        self.write_unlock_record(offset)?;

        // find the predecessor; the next pointer sits at the start of a
        // record, so a record offset works as a link address just like the
        // directory slot does
        let top = hash_top(self.bucket_of(rec.full_hash));
        let mut last_ptr = top;
        let mut i = self.read_off(top)?;
        let mut steps = 0u32;
        while i != offset {
            steps += 1;
            if i == 0 || steps > self.walk_limit() {
                error!(offset, "record missing from its own chain");
                return Err(TdbError::corrupt(format!(
                    "record at {} is not in its chain",
                    offset
                )));
            }
            last_ptr = i;
            i = self.read_record(i)?.next;
        }

        self.write_off(last_ptr, rec.next)?;
        self.free(offset, rec)
    }

    pub(crate) fn delete_hash(&mut self, key: &[u8], hash: u32) -> Result<()> {
        let Some(found) = self.find_lock_hash(key, hash, LockMode::Write)? else {
            return Err(TdbError::RecordNotFound);
        };
        let target = LockTarget::Bucket(self.bucket_of(hash));
        let deleted = self.do_delete(found.offset, found.rec);
        match deleted {
            Ok(()) => self.unlock(target),
            Err(e) => {
                self.unlock_logged(target);
                Err(e)
            }
        }
    }

    pub(crate) fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let hash = self.hash(key);
        self.delete_hash(key, hash)
    }

    // =========================================================================
    // Store & Append
    // =========================================================================

    pub(crate) fn store(&mut self, key: &[u8], value: &[u8], mode: StoreMode) -> Result<()> {
        self.ensure_writable()?;
        let hash = self.hash(key);
        let target = LockTarget::Bucket(self.bucket_of(hash));
        self.with_lock(target, LockMode::Write, |ctx| {
            ctx.store_locked(key, value, hash, mode)
        })
    }

    fn store_locked(&mut self, key: &[u8], value: &[u8], hash: u32, mode: StoreMode) -> Result<()> {
        let existed = match mode {
            StoreMode::Insert => {
                if self.find(key, hash, true)?.is_some() {
                    return Err(TdbError::RecordExists);
                }
                false
            }
            StoreMode::Replace | StoreMode::Modify => match self.update_in_place(key, hash, value)? {
                InPlace::Done => return Ok(()),
                InPlace::Missing if mode == StoreMode::Modify => {
                    return Err(TdbError::RecordNotFound)
                }
                InPlace::Missing => false,
                InPlace::NoRoom(_) => true,
            },
        };

        // copy before allocating, so a failed buffer allocation cannot
        // leave an unlinked record behind
        let payload = build_payload(&[key, value])?;

        if existed {
            self.delete_ignoring_missing(key, hash)?;
        }
        self.link_new(hash, key.len(), value.len(), &payload)
    }

    pub(crate) fn append(&mut self, key: &[u8], extra: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let hash = self.hash(key);
        let target = LockTarget::Bucket(self.bucket_of(hash));
        self.with_lock(target, LockMode::Write, |ctx| match ctx.append_in_place(key, hash, extra)? {
            InPlace::Done => Ok(()),
            InPlace::Missing => ctx.store_locked(key, extra, hash, StoreMode::Insert),
            InPlace::NoRoom(found) => {
                let old = ctx.read_data(found.offset, &found.rec)?;
                let payload = build_payload(&[key, &old, extra])?;
                ctx.delete_ignoring_missing(key, hash)?;
                ctx.link_new(hash, key.len(), old.len() + extra.len(), &payload)
            }
        })
    }

    /// Overwrite the value if the existing slot has room
    fn update_in_place(&mut self, key: &[u8], hash: u32, value: &[u8]) -> Result<InPlace> {
        let Some(mut found) = self.find(key, hash, true)? else {
            return Ok(InPlace::Missing);
        };
        if !found.rec.fits(key.len(), value.len()) {
            return Ok(InPlace::NoRoom(found));
        }

        self.storage
            .write(found.rec.data_offset(found.offset), value)?;
        if value.len() as u32 != found.rec.data_len {
            found.rec.data_len = value.len() as u32;
            self.write_record(found.offset, &found.rec)?;
        }
        Ok(InPlace::Done)
    }

    /// Extend the value if the existing slot has room
    fn append_in_place(&mut self, key: &[u8], hash: u32, extra: &[u8]) -> Result<InPlace> {
        let Some(mut found) = self.find(key, hash, true)? else {
            return Ok(InPlace::Missing);
        };
        if extra.is_empty() {
            return Ok(InPlace::Done);
        }
        let new_len = found.rec.data_len as usize + extra.len();
        if !found.rec.fits(key.len(), new_len) {
            return Ok(InPlace::NoRoom(found));
        }

        let end = found.rec.data_offset(found.offset) + found.rec.data_len;
        self.storage.write(end, extra)?;
        found.rec.data_len = new_len as u32;
        self.write_record(found.offset, &found.rec)?;
        Ok(InPlace::Done)
    }

    fn delete_ignoring_missing(&mut self, key: &[u8], hash: u32) -> Result<()> {
        match self.delete_hash(key, hash) {
            Ok(()) | Err(TdbError::RecordNotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Allocate a record for `payload` (key then value) and make it the new
    /// head of the chain for `hash`. Needs the bucket lock.
    fn link_new(&mut self, hash: u32, key_len: usize, data_len: usize, payload: &[u8]) -> Result<()> {
        let length = u32::try_from(payload.len()).map_err(|_| TdbError::OutOfMemory(payload.len()))?;
        let (offset, mut rec) = self.allocate(length)?;

        let top = hash_top(self.bucket_of(hash));
        rec.next = self.read_off(top)?;
        rec.key_len = key_len as u32;
        rec.data_len = data_len as u32;
        rec.full_hash = hash;
        rec.magic = LIVE_MAGIC;

        self.write_record(offset, &rec)?;
        self.storage
            .write(RecordHeader::key_offset(offset), payload)?;
        self.write_off(top, offset)
    }
}

/// Concatenate record body parts into one buffer
fn build_payload(parts: &[&[u8]]) -> Result<Vec<u8>> {
    let len: usize = parts.iter().map(|p| p.len()).sum();
    if u32::try_from(len).is_err() {
        return Err(TdbError::OutOfMemory(len));
    }
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| TdbError::OutOfMemory(len))?;
    for part in parts {
        buf.extend_from_slice(part);
    }
    Ok(buf)
}
