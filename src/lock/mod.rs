//! Lock Module
//!
//! Multi-process mutual exclusion with advisory byte-range locks.
//!
//! ## Lock Layout
//! ```text
//! offset 0                  global lock (serializes first opens)
//! offset 4                  active lock (clear-if-first detection)
//! FREELIST_TOP - 4          allocation lock (free list, growth)
//! FREELIST_TOP + 4*b        chain lock for bucket b
//! record offset             record lock (held by traversals)
//! ```
//!
//! Byte-range locks do not nest within one process, so chain and
//! allocation locks are reference counted per handle: only the outermost
//! acquire and release reach the operating system.

mod brlock;
mod table;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) use brlock::{brlock, LockOp};
pub use table::ChainLocks;

use crate::format::{FREELIST_TOP, OFFSET_SIZE};

/// Shared or exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

impl From<LockMode> for LockOp {
    fn from(mode: LockMode) -> Self {
        match mode {
            LockMode::Read => LockOp::Read,
            LockMode::Write => LockOp::Write,
        }
    }
}

/// What a chain-level lock protects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTarget {
    /// The free list and every size-changing operation
    Alloc,
    /// One hash chain
    Bucket(u32),
}

impl LockTarget {
    /// Byte locked in the file
    pub fn offset(&self) -> u32 {
        match self {
            LockTarget::Alloc => FREELIST_TOP - OFFSET_SIZE,
            LockTarget::Bucket(b) => FREELIST_TOP + OFFSET_SIZE * b,
        }
    }

    /// Index into the per-handle reference count table
    pub fn slot(&self) -> usize {
        match self {
            LockTarget::Alloc => 0,
            LockTarget::Bucket(b) => *b as usize + 1,
        }
    }
}

/// Cooperative cancellation of blocking lock waits
///
/// Setting the token (from another thread, or a signal handler through
/// [`CancelToken::cancel`]) makes a pending wait fail with
/// [`TdbError::LockTimeout`](crate::TdbError::LockTimeout).
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How long a blocking acquisition may wait
#[derive(Debug, Clone, Default)]
pub struct WaitPolicy {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

impl WaitPolicy {
    /// A bounded wait polls instead of sleeping in the kernel
    pub fn is_bounded(&self) -> bool {
        self.timeout.is_some() || self.cancel.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }
}
