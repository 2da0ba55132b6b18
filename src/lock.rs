//! The lock object handed out by a [`LockPool`].
//!
//! [`LockPool`]: crate::LockPool

use std::collections::HashMap;
use std::fmt;
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::lock_api::{
    RawRwLock as _, RawRwLockFair as _, RawRwLockRecursive as _, RawRwLockRecursiveTimed as _,
    RawRwLockTimed as _,
};
use parking_lot::{Mutex, RawRwLock};

use crate::err::OperationError;

/// Holds granted through a `RawKeyLock`, by thread.
#[derive(Debug, Default)]
struct Holders {
    readers: HashMap<ThreadId, usize>,
    writer: Option<ThreadId>,
}

/// What the calling thread already holds.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Own {
    Nothing,
    Read,
    Write,
}

/// A reader-writer lock without data, used as the lock object of a single key.
///
/// Besides the raw lock itself, a `RawKeyLock` records which threads hold it and in which mode.
/// A release is only performed on behalf of a thread that holds the lock in that mode, so one
/// thread can never release another thread's hold.
///
/// A thread that already holds a read lock may read-lock again, even while a writer is queued.
/// Nested write locks and upgrading a read lock to a write lock are not supported: blocking
/// attempts fail with an error and non-blocking or timed attempts report failure immediately.
///
/// Objects are created by a [`LockPool`] and are not meant to be used on their own.
///
/// [`LockPool`]: crate::LockPool
pub struct RawKeyLock {
    raw: RawRwLock,
    fair: bool,
    holders: Mutex<Holders>,
}

impl RawKeyLock {
    pub(crate) fn new(fair: bool) -> RawKeyLock {
        RawKeyLock {
            raw: <RawRwLock as parking_lot::lock_api::RawRwLock>::INIT,
            fair,
            holders: Mutex::new(Holders::default()),
        }
    }

    /// Returns `true` if releases hand the lock directly to the next waiter.
    pub fn is_fair(&self) -> bool {
        self.fair
    }

    /// Returns `true` if the lock is currently held in any mode.
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Returns the number of read holds currently recorded, across all threads.
    pub fn readers(&self) -> usize {
        self.holders.lock().readers.values().sum()
    }

    /// Returns `true` if a write hold is currently recorded.
    pub fn is_write_locked(&self) -> bool {
        self.holders.lock().writer.is_some()
    }

    /// Returns `true` if the calling thread holds this lock in any mode.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.own(thread::current().id()) != Own::Nothing
    }

    fn own(&self, me: ThreadId) -> Own {
        let holders = self.holders.lock();
        if holders.writer == Some(me) {
            Own::Write
        } else if holders.readers.contains_key(&me) {
            Own::Read
        } else {
            Own::Nothing
        }
    }

    fn record_read(&self, me: ThreadId) {
        *self.holders.lock().readers.entry(me).or_insert(0) += 1;
    }

    fn record_write(&self, me: ThreadId) {
        let mut holders = self.holders.lock();
        debug_assert!(holders.writer.is_none());
        holders.writer = Some(me);
    }

    pub(crate) fn lock_shared(&self) -> Result<(), OperationError> {
        let me = thread::current().id();
        match self.own(me) {
            // A queued writer must not block a thread that is already inside.
            Own::Read => self.raw.lock_shared_recursive(),
            Own::Nothing => self.raw.lock_shared(),
            Own::Write => {
                return Err(OperationError::new(
                    "read lock requested by the thread holding the write lock",
                ))
            }
        }
        self.record_read(me);
        Ok(())
    }

    pub(crate) fn lock_exclusive(&self) -> Result<(), OperationError> {
        let me = thread::current().id();
        match self.own(me) {
            Own::Nothing => {}
            Own::Read => {
                return Err(OperationError::new(
                    "write lock requested by a thread holding a read lock",
                ))
            }
            Own::Write => return Err(OperationError::new("write lock already held by this thread")),
        }
        self.raw.lock_exclusive();
        self.record_write(me);
        Ok(())
    }

    pub(crate) fn try_lock_shared(&self) -> bool {
        let me = thread::current().id();
        let acquired = match self.own(me) {
            Own::Read => self.raw.try_lock_shared_recursive(),
            Own::Nothing => self.raw.try_lock_shared(),
            Own::Write => false,
        };
        if acquired {
            self.record_read(me);
        }
        acquired
    }

    pub(crate) fn try_lock_exclusive(&self) -> bool {
        let me = thread::current().id();
        if self.own(me) != Own::Nothing || !self.raw.try_lock_exclusive() {
            return false;
        }
        self.record_write(me);
        true
    }

    pub(crate) fn try_lock_shared_for(&self, timeout: Duration) -> bool {
        let me = thread::current().id();
        let acquired = match self.own(me) {
            Own::Read => self.raw.try_lock_shared_recursive_for(timeout),
            Own::Nothing => self.raw.try_lock_shared_for(timeout),
            Own::Write => false,
        };
        if acquired {
            self.record_read(me);
        }
        acquired
    }

    pub(crate) fn try_lock_exclusive_for(&self, timeout: Duration) -> bool {
        let me = thread::current().id();
        if self.own(me) != Own::Nothing || !self.raw.try_lock_exclusive_for(timeout) {
            return false;
        }
        self.record_write(me);
        true
    }

    /// Releases one read hold of the calling thread.
    ///
    /// Fails without touching the raw lock if the calling thread holds no read lock.
    pub(crate) fn unlock_shared(&self) -> Result<(), OperationError> {
        let me = thread::current().id();
        {
            // Holds are recorded after the raw acquire, so a hold consumed here always has a
            // matching shared hold on the raw lock.
            let mut holders = self.holders.lock();
            let count = holders
                .readers
                .get_mut(&me)
                .ok_or_else(|| OperationError::new("no read lock held"))?;
            *count -= 1;
            if *count == 0 {
                holders.readers.remove(&me);
            }
        }

        // SAFETY: a shared hold of the calling thread was recorded and has just been consumed.
        unsafe {
            if self.fair {
                self.raw.unlock_shared_fair();
            } else {
                self.raw.unlock_shared();
            }
        }
        Ok(())
    }

    /// Releases the write hold of the calling thread.
    ///
    /// Fails without touching the raw lock if the calling thread does not hold the write lock.
    pub(crate) fn unlock_exclusive(&self) -> Result<(), OperationError> {
        let me = thread::current().id();
        {
            let mut holders = self.holders.lock();
            if holders.writer != Some(me) {
                return Err(OperationError::new("no write lock held"));
            }
            holders.writer = None;
        }

        // SAFETY: the exclusive hold of the calling thread was recorded and has just been
        // consumed.
        unsafe {
            if self.fair {
                self.raw.unlock_exclusive_fair();
            } else {
                self.raw.unlock_exclusive();
            }
        }
        Ok(())
    }
}

impl fmt::Debug for RawKeyLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawKeyLock")
            .field("fair", &self.fair)
            .field("readers", &self.readers())
            .field("writer", &self.is_write_locked())
            .finish()
    }
}
