//! Reference-counted chain and allocation locks

use std::os::unix::io::RawFd;

use tracing::error;

use crate::error::{Result, TdbError};

use super::{brlock, LockMode, LockOp, LockTarget, WaitPolicy};

#[derive(Debug, Clone, Copy, Default)]
struct LockSlot {
    count: u32,
    mode: Option<LockMode>,
}

/// Per-handle nesting table: slot 0 is the allocation lock, slot `b + 1`
/// is bucket `b`.
#[derive(Debug)]
pub struct ChainLocks {
    slots: Vec<LockSlot>,
    /// When false only the counts are kept (no-lock, read-only, internal)
    enabled: bool,
    policy: WaitPolicy,
}

impl ChainLocks {
    pub fn new(hash_size: u32, enabled: bool, policy: WaitPolicy) -> Result<Self> {
        let count = hash_size as usize + 1;
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(count)
            .map_err(|_| TdbError::OutOfMemory(count * std::mem::size_of::<LockSlot>()))?;
        slots.resize(count, LockSlot::default());
        Ok(Self {
            slots,
            enabled,
            policy,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn policy(&self) -> &WaitPolicy {
        &self.policy
    }

    /// Acquire `target`; only the outermost acquisition touches the file
    pub fn lock(&mut self, fd: Option<RawFd>, target: LockTarget, mode: LockMode) -> Result<()> {
        let slot = self.check(target)?;

        if self.slots[slot].count == 0 {
            if let (true, Some(fd)) = (self.enabled, fd) {
                brlock(fd, target.offset(), mode.into(), true, &self.policy).map_err(|e| {
                    error!(?target, ?mode, error = %e, "chain lock failed");
                    e
                })?;
            }
            self.slots[slot].mode = Some(mode);
        }
        self.slots[slot].count += 1;
        Ok(())
    }

    /// Release `target`; the last release drops the file lock
    pub fn unlock(&mut self, fd: Option<RawFd>, target: LockTarget) -> Result<()> {
        let slot = self.check(target)?;

        match self.slots[slot].count {
            0 => {
                error!(?target, "unlock of a lock that is not held");
                Err(TdbError::LockFailed(format!("{:?} is not locked", target)))
            }
            1 => {
                self.slots[slot] = LockSlot::default();
                if let (true, Some(fd)) = (self.enabled, fd) {
                    brlock(fd, target.offset(), LockOp::Unlock, false, &self.policy)?;
                }
                Ok(())
            }
            _ => {
                self.slots[slot].count -= 1;
                Ok(())
            }
        }
    }

    /// Nesting depth currently held on `target`
    pub fn count(&self, target: LockTarget) -> u32 {
        self.slots.get(target.slot()).map_or(0, |s| s.count)
    }

    /// Mode of the outermost acquisition, if held
    pub fn mode(&self, target: LockTarget) -> Option<LockMode> {
        self.slots.get(target.slot()).and_then(|s| s.mode)
    }

    /// Re-take every held lock on a new descriptor (after reopen)
    pub fn reacquire(&self, fd: RawFd) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        for (slot, entry) in self.slots.iter().enumerate() {
            if let (true, Some(mode)) = (entry.count > 0, entry.mode) {
                let target = if slot == 0 {
                    LockTarget::Alloc
                } else {
                    LockTarget::Bucket(slot as u32 - 1)
                };
                brlock(fd, target.offset(), mode.into(), true, &self.policy)?;
            }
        }
        Ok(())
    }

    fn check(&self, target: LockTarget) -> Result<usize> {
        let slot = target.slot();
        if slot >= self.slots.len() {
            error!(?target, buckets = self.slots.len() - 1, "invalid lock target");
            return Err(TdbError::LockFailed(format!("invalid lock target {:?}", target)));
        }
        Ok(slot)
    }
}
