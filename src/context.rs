//! Per-handle state
//!
//! ## Responsibilities
//! - Hold everything one open handle knows: storage, decoded header, byte
//!   order, the chain lock table and the traversal cursors
//! - Typed access to stored offsets and record headers
//! - Chain lock and record lock helpers used by every operation
//!
//! The allocator, chain operations and traversal engine are further
//! `impl DbContext` blocks in their own modules.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::error::{ErrorKind, Result, TdbError};
use crate::format::{
    Endian, HashFn, Header, RecordHeader, ACTIVE_LOCK, FREE_MAGIC, LIVE_MAGIC, OFFSET_SIZE,
};
use crate::liveness::{process_exists, OwnerProbe};
use crate::lock::{brlock, ChainLocks, LockMode, LockOp, LockTarget};
use crate::storage::{FileId, Storage};
use crate::traverse::Cursors;

/// State behind one open [`Database`](crate::Database)
pub(crate) struct DbContext {
    pub(crate) storage: Storage,
    pub(crate) header: Header,
    pub(crate) endian: Endian,
    pub(crate) big_endian: bool,
    pub(crate) locks: ChainLocks,
    pub(crate) cursors: Cursors,
    pub(crate) last_error: ErrorKind,
    pub(crate) read_only: bool,
    /// Holds a shared lock on the active byte for the handle's lifetime
    pub(crate) clear_if_first: bool,
    pub(crate) hash_fn: HashFn,
    pub(crate) owner_probe: Option<Arc<dyn OwnerProbe>>,
    pub(crate) file_id: Option<FileId>,
}

impl DbContext {
    // =========================================================================
    // Hashing
    // =========================================================================

    pub(crate) fn hash(&self, key: &[u8]) -> u32 {
        (self.hash_fn)(key)
    }

    pub(crate) fn bucket_of(&self, hash: u32) -> u32 {
        hash % self.header.hash_size
    }

    /// Upper bound on the records a chain or list walk can visit before it
    /// must be looping
    pub(crate) fn walk_limit(&self) -> u32 {
        self.storage.len() / RecordHeader::SIZE + 1
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(TdbError::ReadOnly);
        }
        Ok(())
    }

    pub(crate) fn record_error(&mut self, err: &TdbError) {
        self.last_error = err.kind();
    }

    // =========================================================================
    // Offsets & Records
    // =========================================================================

    pub(crate) fn read_off(&mut self, offset: u32) -> Result<u32> {
        let mut buf = [0u8; OFFSET_SIZE as usize];
        self.storage.read(offset, &mut buf)?;
        Ok(self.endian.get(&buf))
    }

    pub(crate) fn write_off(&mut self, offset: u32, value: u32) -> Result<()> {
        let buf = self.endian.encode(value);
        self.storage.write(offset, &buf)
    }

    /// Decode the header at `offset` without judging its magic
    pub(crate) fn read_header(&mut self, offset: u32) -> Result<RecordHeader> {
        let mut buf = [0u8; RecordHeader::SIZE as usize];
        self.storage.read(offset, &mut buf)?;
        Ok(RecordHeader::decode(&buf, self.endian))
    }

    /// Read a chain record: live or tombstoned, anything else is corruption
    pub(crate) fn read_record(&mut self, offset: u32) -> Result<RecordHeader> {
        let rec = self.read_header(offset)?;
        if rec.has_bad_magic() {
            error!(offset, magic = format_args!("0x{:08x}", rec.magic), "bad magic in chain record");
            return Err(TdbError::corrupt(format!(
                "bad magic 0x{:08x} at offset {}",
                rec.magic, offset
            )));
        }
        self.check_extent(offset, &rec)?;
        self.storage
            .ensure_capacity(rec.next as u64 + RecordHeader::SIZE as u64, false)?;
        Ok(rec)
    }

    /// Lengths must fit the body and the body must end inside the file
    fn check_extent(&mut self, offset: u32, rec: &RecordHeader) -> Result<()> {
        if !rec.fits(rec.key_len as usize, rec.data_len as usize) {
            error!(
                offset,
                rec_len = rec.rec_len,
                key_len = rec.key_len,
                data_len = rec.data_len,
                "record lengths exceed its body"
            );
            return Err(TdbError::corrupt(format!(
                "record at offset {} holds {} + {} bytes in a {} byte body",
                offset, rec.key_len, rec.data_len, rec.rec_len
            )));
        }
        match self.storage.ensure_capacity(rec.end(offset), true) {
            Err(TdbError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                error!(offset, rec_len = rec.rec_len, size = self.storage.len(), "record runs past end of file");
                Err(TdbError::corrupt(format!(
                    "record at offset {} with length {} runs past end of file",
                    offset, rec.rec_len
                )))
            }
            other => other,
        }
    }

    /// Read a free-list record.
    ///
    /// A record still tagged live here is what a process killed halfway
    /// through a delete leaves behind; it is retagged free in place.
    pub(crate) fn read_free_record(&mut self, offset: u32) -> Result<RecordHeader> {
        let mut rec = self.read_header(offset)?;

        if rec.magic != FREE_MAGIC && rec.magic != LIVE_MAGIC {
            error!(offset, magic = format_args!("0x{:08x}", rec.magic), "bad magic on free list");
            return Err(TdbError::corrupt(format!(
                "bad free-list magic 0x{:08x} at offset {}",
                rec.magic, offset
            )));
        }
        self.check_extent(offset, &rec)?;
        if rec.magic == LIVE_MAGIC {
            warn!(offset, "live record found on the free list, repairing");
            rec.magic = FREE_MAGIC;
            self.write_record(offset, &rec)?;
        }
        self.storage
            .ensure_capacity(rec.next as u64 + RecordHeader::SIZE as u64, false)?;
        Ok(rec)
    }

    pub(crate) fn write_record(&mut self, offset: u32, rec: &RecordHeader) -> Result<()> {
        let buf = rec.encode(self.endian);
        self.storage.write(offset, &buf)
    }

    /// Rewrite the tailer so it matches `rec`'s size. Needs the allocation lock.
    pub(crate) fn update_tailer(&mut self, offset: u32, rec: &RecordHeader) -> Result<()> {
        self.write_off(rec.tailer_offset(offset), rec.total_size())
    }

    pub(crate) fn read_key(&mut self, offset: u32, rec: &RecordHeader) -> Result<Vec<u8>> {
        self.storage
            .read_vec(RecordHeader::key_offset(offset), rec.key_len)
    }

    pub(crate) fn read_data(&mut self, offset: u32, rec: &RecordHeader) -> Result<Vec<u8>> {
        self.storage.read_vec(rec.data_offset(offset), rec.data_len)
    }

    /// Whether the record's owner, as reported by the installed probe, has exited
    pub(crate) fn owner_gone(&mut self, offset: u32, rec: &RecordHeader) -> Result<bool> {
        let Some(probe) = self.owner_probe.clone() else {
            return Ok(false);
        };
        let key = self.read_key(offset, rec)?;
        let data = self.read_data(offset, rec)?;
        Ok(probe
            .owner(&key, &data)
            .is_some_and(|pid| !process_exists(pid)))
    }

    // =========================================================================
    // Chain Locks
    // =========================================================================

    pub(crate) fn lock(&mut self, target: LockTarget, mode: LockMode) -> Result<()> {
        let fd = self.storage.raw_fd();
        self.locks.lock(fd, target, mode)
    }

    pub(crate) fn unlock(&mut self, target: LockTarget) -> Result<()> {
        let fd = self.storage.raw_fd();
        self.locks.unlock(fd, target)
    }

    /// Release on an error path: a failure is logged, never returned
    pub(crate) fn unlock_logged(&mut self, target: LockTarget) {
        if let Err(e) = self.unlock(target) {
            error!(?target, error = %e, "unlock failed");
        }
    }

    /// Run `f` holding `target`. The lock is released whatever `f` returns;
    /// an unlock failure only surfaces when `f` itself succeeded.
    pub(crate) fn with_lock<T>(
        &mut self,
        target: LockTarget,
        mode: LockMode,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.lock(target, mode)?;
        match f(self) {
            Ok(value) => {
                self.unlock(target)?;
                Ok(value)
            }
            Err(e) => {
                self.unlock_logged(target);
                Err(e)
            }
        }
    }

    /// Write-lock every chain, in bucket order. On failure the chains
    /// already taken are released again.
    pub(crate) fn lock_all(&mut self) -> Result<()> {
        if self.read_only {
            return Err(TdbError::LockFailed(
                "read-only databases take no locks".to_string(),
            ));
        }
        for bucket in 0..self.header.hash_size {
            if let Err(e) = self.lock(LockTarget::Bucket(bucket), LockMode::Write) {
                warn!(bucket, error = %e, "could not lock every chain");
                for held in 0..bucket {
                    self.unlock_logged(LockTarget::Bucket(held));
                }
                return Err(TdbError::NoLockOnSomeChains);
            }
        }
        Ok(())
    }

    pub(crate) fn unlock_all(&mut self) -> Result<()> {
        let mut first_err = None;
        for bucket in 0..self.header.hash_size {
            if let Err(e) = self.unlock(LockTarget::Bucket(bucket)) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    // =========================================================================
    // Record Locks
    // =========================================================================

    fn record_lock_fd(&self) -> Option<std::os::unix::io::RawFd> {
        if self.locks.is_enabled() {
            self.storage.raw_fd()
        } else {
            None
        }
    }

    /// Shared lock on a record a cursor is parked on; stops deletion under it
    pub(crate) fn lock_record(&mut self, offset: u32) -> Result<()> {
        match (offset, self.record_lock_fd()) {
            (0, _) | (_, None) => Ok(()),
            (_, Some(fd)) => {
                brlock(fd, offset, LockOp::Read, true, self.locks.policy()).map(|_| ())
            }
        }
    }

    /// Drop a record lock, unless another cursor of this handle still needs it.
    /// fcntl locks do not stack, so only the last holder may release.
    pub(crate) fn unlock_record(&mut self, offset: u32) -> Result<()> {
        if offset == 0 || self.cursors.holders(offset) != 1 {
            return Ok(());
        }
        match self.record_lock_fd() {
            Some(fd) => brlock(fd, offset, LockOp::Unlock, false, self.locks.policy()).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Try to take a record exclusively without waiting.
    ///
    /// Our own read locks never conflict with our own write lock, so the
    /// cursors of this handle are checked first.
    pub(crate) fn write_lock_record(&mut self, offset: u32) -> Result<bool> {
        if self.cursors.holders(offset) > 0 {
            return Ok(false);
        }
        match self.record_lock_fd() {
            Some(fd) => brlock(fd, offset, LockOp::Write, false, self.locks.policy()),
            None => Ok(true),
        }
    }

    pub(crate) fn write_unlock_record(&mut self, offset: u32) -> Result<()> {
        match self.record_lock_fd() {
            Some(fd) => brlock(fd, offset, LockOp::Unlock, false, self.locks.policy()).map(|_| ()),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Reopen
    // =========================================================================

    /// Swap in a fresh descriptor for the same file and re-take this
    /// handle's locks on it. Used after `fork`, where the child inherits the
    /// descriptor but none of the parent's byte-range locks.
    pub(crate) fn reopen(&mut self) -> Result<()> {
        let Some(path) = self.storage.path().map(PathBuf::from) else {
            return Ok(());
        };

        let file = OpenOptions::new()
            .read(true)
            .write(!self.read_only)
            .open(&path)
            .map_err(|e| {
                error!(path = %path.display(), error = %e, "reopen failed");
                TdbError::Io(e)
            })?;

        let id = FileId::of(&file.metadata()?);
        if Some(id) != self.file_id {
            error!(path = %path.display(), "file dev/inode has changed");
            return Err(TdbError::BadFormat(format!(
                "{} was replaced since it was opened",
                path.display()
            )));
        }

        // closing the old descriptor drops every lock this process holds on
        // the file, so everything is re-taken on the new one afterwards
        let fd = file.as_raw_fd();
        self.storage.replace_file(file)?;

        if self.locks.is_enabled() {
            if self.clear_if_first {
                brlock(fd, ACTIVE_LOCK, LockOp::Read, true, self.locks.policy())?;
            }
            self.locks.reacquire(fd)?;
            for offset in self.cursors.offsets() {
                brlock(fd, offset, LockOp::Read, true, self.locks.policy())?;
            }
        }
        debug!(path = %path.display(), "reopened");
        Ok(())
    }
}
