//! Engine Module
//!
//! The public database handle.
//!
//! ## Responsibilities
//! - Open/close lifecycle: create or validate the file, clear-if-first,
//!   duplicate-open refusal, reopen after fork
//! - The record API: fetch, store, delete, append, exists
//! - Caller-controlled locking of one chain or the whole database
//! - Remember the last error of each handle
//!
//! ## Concurrency Model
//!
//! Processes coordinate through byte-range locks in the file itself. Within
//! one process a handle may be shared between threads: its state sits
//! behind a mutex that each operation holds for its duration. `traverse`
//! releases that mutex while the callback runs, so callbacks may use the
//! same handle.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::chain::StoreMode;
use crate::config::Config;
use crate::context::DbContext;
use crate::error::{ErrorKind, Result, TdbError};
use crate::format::{default_hash, heap_start, Endian, Header, ACTIVE_LOCK, GLOBAL_LOCK, HEADER_SIZE};
use crate::freelist::FreeEntry;
use crate::inspect::{ChainEntry, LayoutReport};
use crate::liveness::OwnerProbe;
use crate::lock::{brlock, ChainLocks, LockMode, LockOp, LockTarget, WaitPolicy};
use crate::registry;
use crate::storage::{FileId, Storage};
use crate::traverse::Cursors;

/// An open database
///
/// Dropping the handle closes it; [`Database::close`] does the same and
/// reports problems.
pub struct Database {
    inner: Arc<Mutex<DbContext>>,
    id: u64,
}

impl Database {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open, and if needed create, the database described by `config`
    ///
    /// On startup:
    /// 1. Refuse a file this process already has open
    /// 2. Take the global lock so only one process initializes at a time
    /// 3. With clear-if-first, wipe the file if no other process uses it
    /// 4. Validate the header, or write a fresh one when creating
    /// 5. Announce use of the file through the active lock
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let context = if config.internal {
            Self::open_internal(&config)?
        } else {
            Self::open_file(&config)?
        };

        let (file, path) = (context.file_id, context.storage.path().map(Path::to_path_buf));
        let inner = Arc::new(Mutex::new(context));
        let id = registry::register(file, path.as_deref(), &inner)?;
        Ok(Self { inner, id })
    }

    /// Convenience for `Database::open(Config::for_path(path))`
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(Config::for_path(path))
    }

    /// A fresh memory-only database
    pub fn memory() -> Result<Self> {
        Self::open(Config::internal())
    }

    fn open_internal(config: &Config) -> Result<DbContext> {
        let header = Header::new(config.effective_hash_size());
        let endian = Endian::new(config.convert_endian);
        let storage = Storage::internal(new_database_image(&header, endian)?)?;
        trace!(hash_size = header.hash_size, "created internal database");

        Ok(DbContext {
            storage,
            big_endian: is_big_endian(endian),
            endian,
            locks: ChainLocks::new(header.hash_size, false, wait_policy(config))?,
            header,
            cursors: Cursors::new(),
            last_error: ErrorKind::Success,
            read_only: false,
            clear_if_first: false,
            hash_fn: config.hash_fn.unwrap_or(default_hash),
            owner_probe: None,
            file_id: None,
        })
    }

    fn open_file(config: &Config) -> Result<DbContext> {
        let path = config
            .path
            .as_deref()
            .ok_or_else(|| TdbError::Config("missing database path".to_string()))?;
        let read_only = config.read_only;
        let use_locks = !(config.no_lock || read_only);
        let clear_if_first = config.clear_if_first && !read_only;
        let policy = wait_policy(config);

        // Step 1: a second descriptor would share, and on close drop, the
        // first handle's locks, so refuse before opening anything
        if let Ok(meta) = fs::metadata(path) {
            if registry::is_open(FileId::of(&meta)) {
                debug!(path = %path.display(), "already open in this process");
                return Err(TdbError::AlreadyOpen(path.to_path_buf()));
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(config.create && !read_only)
            .truncate(config.truncate)
            .mode(config.mode)
            .open(path)
            .map_err(|e| {
                debug!(path = %path.display(), error = %e, "could not open database file");
                TdbError::Io(e)
            })?;

        // Step 2: one initializer at a time
        if use_locks {
            brlock(file.as_raw_fd(), GLOBAL_LOCK, LockOp::Write, true, &policy).map_err(|e| {
                error!(path = %path.display(), error = %e, "failed to get global lock");
                e
            })?;
        }

        let context = Self::initialize(file, path, config, use_locks, clear_if_first, policy)?;

        if let (true, Some(fd)) = (use_locks, context.storage.raw_fd()) {
            brlock(fd, GLOBAL_LOCK, LockOp::Unlock, false, context.locks.policy())?;
        }
        debug!(
            path = %path.display(),
            hash_size = context.header.hash_size,
            size = context.storage.len(),
            converting = context.endian.is_converting(),
            "opened database"
        );
        Ok(context)
    }

    /// Everything done under the global lock
    fn initialize(
        file: File,
        path: &Path,
        config: &Config,
        use_locks: bool,
        clear_if_first: bool,
        policy: WaitPolicy,
    ) -> Result<DbContext> {
        let fd = file.as_raw_fd();
        let read_only = config.read_only;
        let mut create = config.create && !read_only;

        // Step 3: first opener wipes; without locks every opener is first
        let first = if clear_if_first {
            !use_locks || brlock(fd, ACTIVE_LOCK, LockOp::Write, false, &policy)?
        } else {
            false
        };
        if first {
            debug!(path = %path.display(), "first opener, clearing database");
            file.set_len(0)?;
            create = true;
        }

        let mut storage = Storage::open_file(file, path, read_only, !config.no_mmap)?;

        // Step 4: header
        let probe = if storage.len() >= HEADER_SIZE {
            let mut buf = [0u8; HEADER_SIZE as usize];
            storage.read(0, &mut buf)?;
            Header::probe(&buf)
        } else {
            Err(TdbError::BadFormat("file shorter than a header".to_string()))
        };

        let (header, endian, big_endian) = match probe {
            Ok(p) => (p.header, Endian::new(p.convert), p.big_endian),
            Err(e) if create => {
                debug!(path = %path.display(), reason = %e, "initializing new database");
                let header = Header::new(config.effective_hash_size());
                let endian = Endian::new(config.convert_endian);
                storage.reset(&new_database_image(&header, endian)?)?;
                (header, endian, is_big_endian(endian))
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "not a valid database");
                return Err(e);
            }
        };

        if header.rwlocks != 0 {
            return Err(TdbError::BadFormat(
                "spinlock tables are not supported".to_string(),
            ));
        }
        if storage.len() < heap_start(header.hash_size) {
            return Err(TdbError::BadFormat(format!(
                "file ends inside the hash directory ({} bytes)",
                storage.len()
            )));
        }

        // Another thread may have opened the same file since the metadata
        // check. Dropping this descriptor then releases every fcntl lock
        // the process holds on the file, the other handle's included.
        let file_id = storage.file_id()?;
        if file_id.is_some_and(registry::is_open) {
            return Err(TdbError::AlreadyOpen(path.to_path_buf()));
        }

        // Step 5: tell later openers someone is active
        if first && use_locks {
            brlock(fd, ACTIVE_LOCK, LockOp::Unlock, false, &policy)?;
        }
        if clear_if_first && use_locks {
            brlock(fd, ACTIVE_LOCK, LockOp::Read, true, &policy)?;
        }

        Ok(DbContext {
            storage,
            header,
            endian,
            big_endian,
            locks: ChainLocks::new(header.hash_size, use_locks, policy)?,
            cursors: Cursors::new(),
            last_error: ErrorKind::Success,
            read_only,
            clear_if_first,
            hash_fn: config.hash_fn.unwrap_or(default_hash),
            owner_probe: None,
            file_id,
        })
    }

    /// Close the handle, releasing its mapping, descriptor and locks
    ///
    /// Closing the descriptor drops every byte-range lock this process
    /// holds on the file, cursor record locks included.
    pub fn close(self) -> Result<()> {
        registry::unregister(self.id);
        let ctx = self.inner.lock();
        debug!(path = ?ctx.storage.path(), "closed database");
        Ok(())
    }

    /// Re-open the descriptor after `fork`, keeping all handle state
    pub fn reopen(&self) -> Result<()> {
        self.run(|ctx| ctx.reopen())
    }

    // =========================================================================
    // Record Operations
    // =========================================================================

    /// The value stored under `key`, or `None`
    pub fn fetch(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let fetched = self.run(|ctx| ctx.fetch(key))?;
        if fetched.is_none() {
            self.inner.lock().last_error = ErrorKind::RecordNotFound;
        }
        Ok(fetched.map(Bytes::from))
    }

    /// Store `value` under `key` according to `mode`
    pub fn store(&self, key: &[u8], value: &[u8], mode: StoreMode) -> Result<()> {
        self.run(|ctx| ctx.store(key, value, mode))
    }

    /// Remove `key`; `RecordNotFound` if it is absent
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.run(|ctx| ctx.delete(key))
    }

    /// Append `extra` to the value under `key`, creating it if absent
    pub fn append(&self, key: &[u8], extra: &[u8]) -> Result<()> {
        self.run(|ctx| ctx.append(key, extra))
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        self.run(|ctx| ctx.exists(key))
    }

    /// First key of a `first_key`/`next_key` walk
    pub fn first_key(&self) -> Result<Option<Bytes>> {
        self.run(|ctx| ctx.first_key())
    }

    /// Key following `prev` in the walk started by [`first_key`](Self::first_key)
    pub fn next_key(&self, prev: &[u8]) -> Result<Option<Bytes>> {
        self.run(|ctx| ctx.next_key(prev))
    }

    // =========================================================================
    // Caller Locking
    // =========================================================================

    /// Write-lock the chain holding `key`, covering every operation on it
    pub fn lock_chain(&self, key: &[u8]) -> Result<()> {
        self.chain_lock(key, Some(LockMode::Write))
    }

    pub fn unlock_chain(&self, key: &[u8]) -> Result<()> {
        self.chain_lock(key, None)
    }

    /// Read-lock the chain holding `key`
    pub fn lock_chain_read(&self, key: &[u8]) -> Result<()> {
        self.chain_lock(key, Some(LockMode::Read))
    }

    pub fn unlock_chain_read(&self, key: &[u8]) -> Result<()> {
        self.chain_lock(key, None)
    }

    fn chain_lock(&self, key: &[u8], mode: Option<LockMode>) -> Result<()> {
        self.run(|ctx| {
            let target = LockTarget::Bucket(ctx.bucket_of(ctx.hash(key)));
            match mode {
                Some(mode) => ctx.lock(target, mode),
                None => ctx.unlock(target),
            }
        })
    }

    /// Write-lock every chain
    pub fn lock_all(&self) -> Result<()> {
        self.run(|ctx| ctx.lock_all())
    }

    pub fn unlock_all(&self) -> Result<()> {
        self.run(|ctx| ctx.unlock_all())
    }

    // =========================================================================
    // Errors
    // =========================================================================

    /// Kind of the most recent failure on this handle
    pub fn last_error(&self) -> ErrorKind {
        self.inner.lock().last_error
    }

    pub fn error_string(&self) -> &'static str {
        self.last_error().as_str()
    }

    // =========================================================================
    // Inspection & Accessors
    // =========================================================================

    /// Verify the file layout and account for every byte
    pub fn check(&self) -> Result<LayoutReport> {
        self.run(|ctx| ctx.check())
    }

    /// Raw records of one bucket's chain
    pub fn dump_chain(&self, bucket: u32) -> Result<Vec<ChainEntry>> {
        self.run(|ctx| ctx.dump_chain(bucket))
    }

    /// Every record on the free list
    pub fn freelist(&self) -> Result<Vec<FreeEntry>> {
        self.run(|ctx| ctx.freelist())
    }

    /// Treat records whose owner (as `probe` reports it) has exited as absent
    pub fn set_owner_probe(&self, probe: impl OwnerProbe + 'static) {
        self.inner.lock().owner_probe = Some(Arc::new(probe));
    }

    pub fn clear_owner_probe(&self) {
        self.inner.lock().owner_probe = None;
    }

    pub fn hash_size(&self) -> u32 {
        self.inner.lock().header.hash_size
    }

    /// Bucket `key` hashes to
    pub fn bucket_of(&self, key: &[u8]) -> u32 {
        let ctx = self.inner.lock();
        ctx.bucket_of(ctx.hash(key))
    }

    /// Stored fields are big-endian
    pub fn is_big_endian(&self) -> bool {
        self.inner.lock().big_endian
    }

    /// Stored fields are byte-swapped relative to this process
    pub fn is_converting(&self) -> bool {
        self.inner.lock().endian.is_converting()
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.lock().read_only
    }

    pub fn is_internal(&self) -> bool {
        self.inner.lock().storage.is_internal()
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.inner.lock().storage.path().map(Path::to_path_buf)
    }

    /// Bytes of the file this handle currently knows about
    pub fn file_size(&self) -> u32 {
        self.inner.lock().storage.len()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    pub(crate) fn context(&self) -> &Arc<Mutex<DbContext>> {
        &self.inner
    }

    /// Run one operation under the handle mutex, remembering its failure
    fn run<T>(&self, f: impl FnOnce(&mut DbContext) -> Result<T>) -> Result<T> {
        let mut ctx = self.inner.lock();
        let result = f(&mut ctx);
        if let Err(e) = &result {
            ctx.record_error(e);
        }
        result
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        registry::unregister(self.id);
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ctx = self.inner.lock();
        f.debug_struct("Database")
            .field("path", &ctx.storage.path())
            .field("hash_size", &ctx.header.hash_size)
            .field("size", &ctx.storage.len())
            .field("read_only", &ctx.read_only)
            .finish()
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Header, empty free list and empty hash directory
fn new_database_image(header: &Header, endian: Endian) -> Result<Vec<u8>> {
    let size = header.initial_size() as usize;
    let mut image = Vec::new();
    image
        .try_reserve_exact(size)
        .map_err(|_| TdbError::OutOfMemory(size))?;
    image.resize(size, 0);
    image[..HEADER_SIZE as usize].copy_from_slice(&header.encode(endian));
    Ok(image)
}

fn is_big_endian(endian: Endian) -> bool {
    cfg!(target_endian = "big") != endian.is_converting()
}

fn wait_policy(config: &Config) -> WaitPolicy {
    WaitPolicy {
        timeout: config.lock_timeout,
        cancel: config.cancel_token.clone(),
    }
}
