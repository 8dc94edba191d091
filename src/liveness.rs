//! Owner liveness
//!
//! Some callers tag each record with the pid of the process that owns it
//! (lease tables, connection registries). Once that process is gone the
//! record is stale. An [`OwnerProbe`] extracts the pid from a record; the
//! engine then treats records whose owner no longer exists as absent, and
//! reclaims them when it holds the chain's write lock.

/// Extracts the owning process id from a stored record
pub trait OwnerProbe: Send + Sync {
    /// The owner's pid, or `None` when the record has no owner
    fn owner(&self, key: &[u8], value: &[u8]) -> Option<u32>;
}

impl<F> OwnerProbe for F
where
    F: Fn(&[u8], &[u8]) -> Option<u32> + Send + Sync,
{
    fn owner(&self, key: &[u8], value: &[u8]) -> Option<u32> {
        self(key, value)
    }
}

/// Whether a process with this pid currently exists
///
/// A process we may not signal still exists.
pub fn process_exists(pid: u32) -> bool {
    if pid == 0 {
        return true;
    }
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs the permission and existence checks only
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
