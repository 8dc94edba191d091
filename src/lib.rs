//! # tdbkv
//!
//! A trivial embedded key/value database:
//! - One file per database, shared through a memory mapping
//! - Hash chains of variable-length records, first-fit free list with coalescing
//! - Many processes at once, coordinated by byte-range locks in the file
//! - Traversal that tolerates concurrent deletes
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Database (handle)                        │
//! │        fetch / store / delete / append / traverse           │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │  Mutex<DbContext>
//!          ┌────────────┼─────────────┬──────────────┐
//!          ▼            ▼             ▼              ▼
//!   ┌────────────┐ ┌──────────┐ ┌───────────┐ ┌─────────────┐
//!   │   chain    │ │ traverse │ │ freelist  │ │   inspect   │
//!   │ find/link  │ │ cursors  │ │ first-fit │ │ check/dump  │
//!   └─────┬──────┘ └────┬─────┘ └─────┬─────┘ └──────┬──────┘
//!         └─────────────┴──────┬──────┴──────────────┘
//!                  ┌───────────┴───────────┐
//!                  ▼                       ▼
//!          ┌──────────────┐        ┌──────────────┐
//!          │   storage    │        │     lock     │
//!          │ mmap / pread │        │ fcntl ranges │
//!          └──────────────┘        └──────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use tdbkv::{Config, Database, StoreMode};
//!
//! # fn main() -> tdbkv::Result<()> {
//! let db = Database::open(Config::for_path("/tmp/example.tdb"))?;
//! db.store(b"hello", b"world", StoreMode::Replace)?;
//! assert_eq!(db.fetch(b"hello")?.as_deref(), Some(&b"world"[..]));
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod format;
pub mod storage;
pub mod lock;
pub mod liveness;

mod context;
mod chain;
mod freelist;
mod traverse;
mod inspect;
mod registry;

pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{ErrorKind, Result, TdbError};
pub use config::{Config, ConfigBuilder};
pub use engine::Database;
pub use chain::StoreMode;
pub use traverse::{Keys, TraverseControl};
pub use inspect::{ChainEntry, Digest, LayoutReport};
pub use freelist::FreeEntry;
pub use format::{default_hash, HashFn};
pub use lock::CancelToken;
pub use liveness::{process_exists, OwnerProbe};
pub use registry::{open_count, reopen_all};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of tdbkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
