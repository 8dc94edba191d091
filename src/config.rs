//! Configuration for opening a database
//!
//! Centralized open parameters with sensible defaults: the database flags,
//! the OS-level open flags, and the lock wait policy.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TdbError};
use crate::format::{HashFn, DEFAULT_HASH_SIZE, MAX_HASH_SIZE};
use crate::lock::CancelToken;

/// Open parameters for a [`Database`](crate::Database)
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Location
    // -------------------------------------------------------------------------
    /// Path of the database file. `None` is only valid for internal databases.
    pub path: Option<PathBuf>,

    /// Number of hash buckets used when the file is created (0 = default).
    /// Ignored when opening an existing database: the stored size wins.
    pub hash_size: u32,

    // -------------------------------------------------------------------------
    // Database Flags
    // -------------------------------------------------------------------------
    /// Truncate and reinitialize the file if no other process has it open
    pub clear_if_first: bool,

    /// Memory-only database: no file, no mapping, no locks
    pub internal: bool,

    /// Skip all byte-range locking
    pub no_lock: bool,

    /// Use positioned file I/O instead of a shared mapping
    pub no_mmap: bool,

    /// Create new databases in the opposite byte order to this process
    pub convert_endian: bool,

    // -------------------------------------------------------------------------
    // OS Open Flags
    // -------------------------------------------------------------------------
    /// Open without write access (disables locking and clear-if-first)
    pub read_only: bool,

    /// Create the file, and initialize it when its header is not valid
    pub create: bool,

    /// Truncate the file on open
    pub truncate: bool,

    /// Permission bits for a newly created file
    pub mode: u32,

    // -------------------------------------------------------------------------
    // Lock Wait Policy
    // -------------------------------------------------------------------------
    /// Give up on a blocking lock after this long
    pub lock_timeout: Option<Duration>,

    /// Cancels a blocking lock wait when set
    pub cancel_token: Option<CancelToken>,

    // -------------------------------------------------------------------------
    // Hashing
    // -------------------------------------------------------------------------
    /// Key hash function; the gdbm-derived default when `None`
    pub hash_fn: Option<HashFn>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: None,
            hash_size: DEFAULT_HASH_SIZE,
            clear_if_first: false,
            internal: false,
            no_lock: false,
            no_mmap: false,
            convert_endian: false,
            read_only: false,
            create: true,
            truncate: false,
            mode: 0o600,
            lock_timeout: None,
            cancel_token: None,
            hash_fn: None,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Default config for a file-backed database at `path`
    pub fn for_path(path: impl AsRef<Path>) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    /// Default config for a memory-only database
    pub fn internal() -> Self {
        Self {
            internal: true,
            ..Self::default()
        }
    }

    /// Bucket count to use when creating a database
    pub fn effective_hash_size(&self) -> u32 {
        if self.hash_size == 0 {
            DEFAULT_HASH_SIZE
        } else {
            self.hash_size
        }
    }

    /// Check that the combination of options makes sense
    pub fn validate(&self) -> Result<()> {
        if !self.internal && self.path.is_none() {
            return Err(TdbError::Config(
                "a path is required unless the database is internal".to_string(),
            ));
        }
        if self.hash_size > MAX_HASH_SIZE {
            return Err(TdbError::Config(format!(
                "hash size {} exceeds the maximum of {}",
                self.hash_size, MAX_HASH_SIZE
            )));
        }
        if self.read_only && self.truncate {
            return Err(TdbError::Config(
                "cannot truncate a read-only database".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the database file path
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.path = Some(path.into());
        self
    }

    /// Set the bucket count for newly created databases (0 = default)
    pub fn hash_size(mut self, hash_size: u32) -> Self {
        self.config.hash_size = hash_size;
        self
    }

    /// Reinitialize the file when this is the first opener in the system
    pub fn clear_if_first(mut self, enabled: bool) -> Self {
        self.config.clear_if_first = enabled;
        self
    }

    /// Make this a memory-only database
    pub fn internal(mut self, enabled: bool) -> Self {
        self.config.internal = enabled;
        self
    }

    /// Disable byte-range locking
    pub fn no_lock(mut self, enabled: bool) -> Self {
        self.config.no_lock = enabled;
        self
    }

    /// Disable the shared mapping
    pub fn no_mmap(mut self, enabled: bool) -> Self {
        self.config.no_mmap = enabled;
        self
    }

    /// Create the database byte-swapped relative to this process
    pub fn convert_endian(mut self, enabled: bool) -> Self {
        self.config.convert_endian = enabled;
        self
    }

    /// Open read-only
    pub fn read_only(mut self, enabled: bool) -> Self {
        self.config.read_only = enabled;
        self
    }

    /// Create the file (and initialize an invalid header)
    pub fn create(mut self, enabled: bool) -> Self {
        self.config.create = enabled;
        self
    }

    /// Truncate the file on open
    pub fn truncate(mut self, enabled: bool) -> Self {
        self.config.truncate = enabled;
        self
    }

    /// Set the permission bits for a created file
    pub fn mode(mut self, mode: u32) -> Self {
        self.config.mode = mode;
        self
    }

    /// Bound every blocking lock wait
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = Some(timeout);
        self
    }

    /// Attach a token that cancels blocking lock waits
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.config.cancel_token = Some(token);
        self
    }

    /// Use a custom key hash function
    pub fn hash_fn(mut self, hash_fn: HashFn) -> Self {
        self.config.hash_fn = Some(hash_fn);
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
