//! Process-wide registry of open databases
//!
//! fcntl locks belong to the process, not the descriptor: a second handle
//! on the same file would share (and on close, silently drop) the first
//! handle's locks. The registry refuses such a second open, and lets a
//! forked child re-establish every handle with [`reopen_all`].

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::context::DbContext;
use crate::error::{Result, TdbError};
use crate::storage::FileId;

struct Entry {
    id: u64,
    file: Option<FileId>,
    context: Weak<Mutex<DbContext>>,
}

static OPEN: Mutex<Vec<Entry>> = parking_lot::const_mutex(Vec::new());
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Whether a handle on this file is already open in this process
pub(crate) fn is_open(file: FileId) -> bool {
    OPEN.lock()
        .iter()
        .any(|e| e.file == Some(file) && e.context.strong_count() > 0)
}

/// Add a handle; fails if the file is already open
pub(crate) fn register(
    file: Option<FileId>,
    path: Option<&Path>,
    context: &Arc<Mutex<DbContext>>,
) -> Result<u64> {
    let mut open = OPEN.lock();
    open.retain(|e| e.context.strong_count() > 0);

    // losing this race closes a second descriptor, see `Database::open`
    if let Some(file) = file {
        if open.iter().any(|e| e.file == Some(file)) {
            return Err(TdbError::AlreadyOpen(
                path.map(Path::to_path_buf).unwrap_or_default(),
            ));
        }
    }

    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    open.push(Entry {
        id,
        file,
        context: Arc::downgrade(context),
    });
    debug!(id, ?path, "registered database");
    Ok(id)
}

pub(crate) fn unregister(id: u64) {
    OPEN.lock().retain(|e| e.id != id);
}

/// Number of handles currently open in this process
pub fn open_count() -> usize {
    OPEN.lock()
        .iter()
        .filter(|e| e.context.strong_count() > 0)
        .count()
}

/// Reopen every handle of this process; call in the child after `fork`.
///
/// With `parent_longlived` set, handles stop holding the active lock: a
/// long-lived parent keeps holding it for the whole family, and skipping
/// it in children keeps the kernel's lock table small.
pub fn reopen_all(parent_longlived: bool) -> Result<()> {
    // collect first, so no handle's mutex is taken under the registry lock
    let contexts: Vec<(u64, Arc<Mutex<DbContext>>)> = OPEN
        .lock()
        .iter()
        .filter_map(|e| e.context.upgrade().map(|c| (e.id, c)))
        .collect();

    for (id, context) in contexts {
        let mut ctx = context.lock();
        if parent_longlived {
            ctx.clear_if_first = false;
        }
        if let Err(e) = ctx.reopen() {
            ctx.record_error(&e);
            debug!(id, error = %e, "reopen_all stopped");
            return Err(e);
        }
    }
    Ok(())
}
