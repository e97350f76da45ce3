//! Shard-wide lock used to carve out quiescent windows for state
//! transitions.
//!
//! The lock is used inverted: ordinary mutating operations (`add`/`delete`/
//! `deleteByQuery`/`commit`) take the *read* side so they can run
//! concurrently with each other, while `block_updates` takes the *write*
//! side to exclude all of them while a state transition or the tail of a
//! replay runs.

use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::ServiceUnavailable;

pub struct UpdateLocks {
    lock: RwLock<()>,
    timeout_ms: u64,
}

impl UpdateLocks {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            lock: RwLock::new(()),
            timeout_ms,
        }
    }

    fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    /// Acquire the lock for an ordinary mutating operation.
    pub fn acquire_update(&self) -> Result<RwLockReadGuard<'_, ()>, ServiceUnavailable> {
        match self.timeout() {
            None => Ok(self.lock.read()),
            Some(d) => self.lock.try_read_for(d).ok_or(ServiceUnavailable {
                timeout_ms: self.timeout_ms,
            }),
        }
    }

    /// Acquire the lock to carve out a quiescent window: no update operation
    /// may proceed until the returned guard is dropped.
    pub fn block_updates(&self) -> Result<RwLockWriteGuard<'_, ()>, ServiceUnavailable> {
        match self.timeout() {
            None => Ok(self.lock.write()),
            Some(d) => self.lock.try_write_for(d).ok_or(ServiceUnavailable {
                timeout_ms: self.timeout_ms,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_reads_do_not_block_each_other() {
        let locks = UpdateLocks::new(0);
        let g1 = locks.acquire_update().unwrap();
        let g2 = locks.acquire_update().unwrap();
        drop(g1);
        drop(g2);
    }

    #[test]
    fn block_updates_times_out_while_read_held() {
        let locks = UpdateLocks::new(50);
        let _guard = locks.acquire_update().unwrap();
        let err = locks.block_updates().unwrap_err();
        assert_eq!(err.timeout_ms, 50);
    }

    #[test]
    fn block_updates_succeeds_once_reads_released() {
        let locks = UpdateLocks::new(50);
        {
            let _guard = locks.acquire_update().unwrap();
        }
        assert!(locks.block_updates().is_ok());
    }
}
