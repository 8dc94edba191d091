//! Single-byte fcntl locks

use std::io;
use std::os::unix::io::RawFd;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Result, TdbError};

use super::WaitPolicy;

/// First and last sleep between polls of a bounded wait
const POLL_MIN: Duration = Duration::from_millis(1);
const POLL_MAX: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockOp {
    Read,
    Write,
    Unlock,
}

impl LockOp {
    fn l_type(self) -> libc::c_short {
        match self {
            LockOp::Read => libc::F_RDLCK as libc::c_short,
            LockOp::Write => libc::F_WRLCK as libc::c_short,
            LockOp::Unlock => libc::F_UNLCK as libc::c_short,
        }
    }
}

/// Lock, or unlock, the byte at `offset`.
///
/// Returns `Ok(false)` only for a non-blocking attempt that would block.
///
/// Only a policy with a timeout or cancel token makes a blocking attempt
/// interruptible: it polls, and yields [`TdbError::LockTimeout`] once the
/// deadline passes or the token fires. Without either, the wait sleeps in
/// `F_SETLKW` and retries through `EINTR` until the lock is granted.
pub(crate) fn brlock(
    fd: RawFd,
    offset: u32,
    op: LockOp,
    blocking: bool,
    policy: &WaitPolicy,
) -> Result<bool> {
    if !blocking || op == LockOp::Unlock {
        return try_fcntl(fd, offset, op, false);
    }
    if policy.is_bounded() {
        return poll_until(fd, offset, op, policy);
    }
    try_fcntl(fd, offset, op, true).and_then(|granted| {
        if granted {
            Ok(true)
        } else {
            Err(lock_failed(offset, op, "blocking lock refused"))
        }
    })
}

fn try_fcntl(fd: RawFd, offset: u32, op: LockOp, wait: bool) -> Result<bool> {
    // SAFETY: flock is plain old data; all-zero is a valid value
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = op.l_type();
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = offset as libc::off_t;
    fl.l_len = 1;
    fl.l_pid = 0;

    let cmd = if wait { libc::F_SETLKW } else { libc::F_SETLK };

    loop {
        // SAFETY: fd is owned by the caller's open file, fl outlives the call
        let ret = unsafe { libc::fcntl(fd, cmd, &fl as *const libc::flock) };
        if ret != -1 {
            return Ok(true);
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            // unbounded waits have no token to consult; bounded waits poll
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) | Some(libc::EACCES) if !wait => return Ok(false),
            _ => {
                warn!(fd, offset, ?op, error = %err, "fcntl lock failed");
                return Err(lock_failed(offset, op, &err.to_string()));
            }
        }
    }
}

/// Bounded wait: poll with backoff so the deadline and token are honored
fn poll_until(fd: RawFd, offset: u32, op: LockOp, policy: &WaitPolicy) -> Result<bool> {
    let deadline = policy.timeout.map(|t| Instant::now() + t);
    let mut pause = POLL_MIN;

    loop {
        if try_fcntl(fd, offset, op, false)? {
            return Ok(true);
        }
        if policy.is_cancelled() || deadline.is_some_and(|d| Instant::now() >= d) {
            debug!(fd, offset, ?op, "lock wait timed out");
            return Err(TdbError::LockTimeout);
        }
        thread::sleep(pause);
        pause = (pause * 2).min(POLL_MAX);
    }
}

fn lock_failed(offset: u32, op: LockOp, why: &str) -> TdbError {
    TdbError::LockFailed(format!("{:?} lock at offset {}: {}", op, offset, why))
}
