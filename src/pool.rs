//! A reservoir of reusable lock objects.
//!
//! Keys come and go far more often than the number of keys locked at the same time changes, so
//! lock objects are recycled through a free list instead of being allocated for every new key.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::err::PoolError;
use crate::lock::RawKeyLock;

/// The smallest number of idle lock objects a pool keeps around.
pub const MIN_IDLE_FLOOR: usize = 8;

/// The smallest bounded idle capacity of a pool.
pub const MAX_IDLE_FLOOR: usize = 32;

/// Settings of a [`LockPool`].
///
/// # Examples
///
/// ```
/// use keylock::PoolConfig;
///
/// let config = PoolConfig::new().fair(true).min_idle(16).max_idle(64);
/// assert_eq!(config.min_idle_count(), 16);
/// assert_eq!(config.max_idle_count(), Some(64));
///
/// // Values below the floors are raised, negative idle capacities mean "unbounded".
/// let config = PoolConfig::new().min_idle(1).max_idle(2);
/// assert_eq!(config.min_idle_count(), 8);
/// assert_eq!(config.max_idle_count(), Some(32));
/// assert_eq!(PoolConfig::new().max_idle(-1).max_idle_count(), None);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    fair: bool,
    min_idle: usize,
    max_idle: Option<usize>,
    max_active: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            fair: false,
            min_idle: MIN_IDLE_FLOOR,
            max_idle: None,
            max_active: None,
        }
    }
}

impl PoolConfig {
    /// Creates the default configuration: unfair locks, [`MIN_IDLE_FLOOR`] idle objects and no
    /// capacity limits.
    pub fn new() -> PoolConfig {
        PoolConfig::default()
    }

    /// Sets the ordering policy of newly created lock objects.
    ///
    /// A fair lock hands itself directly to the longest waiting thread on release. An unfair lock
    /// lets a newly arriving thread barge in, which gives lower latency under contention.
    pub fn fair(mut self, fair: bool) -> PoolConfig {
        self.fair = fair;
        self
    }

    /// Sets the number of idle objects the pool keeps allocated, at least [`MIN_IDLE_FLOOR`].
    pub fn min_idle(mut self, min_idle: usize) -> PoolConfig {
        self.min_idle = min_idle.max(MIN_IDLE_FLOOR);
        self
    }

    /// Sets the cap on idle objects.
    ///
    /// A negative value removes the cap. A non-negative value is raised to at least
    /// [`MAX_IDLE_FLOOR`].
    pub fn max_idle(mut self, max_idle: isize) -> PoolConfig {
        self.max_idle = if max_idle < 0 {
            None
        } else {
            Some((max_idle as usize).max(MAX_IDLE_FLOOR))
        };
        self
    }

    /// Sets a ceiling on the number of objects borrowed at the same time.
    ///
    /// Once it is reached, [`LockPool::borrow`] fails with [`PoolError::Exhausted`]. There is no
    /// ceiling by default.
    pub fn max_active(mut self, max_active: usize) -> PoolConfig {
        self.max_active = Some(max_active);
        self
    }

    /// Returns the ordering policy of newly created lock objects.
    pub fn is_fair(&self) -> bool {
        self.fair
    }

    /// Returns the number of idle objects the pool keeps allocated.
    pub fn min_idle_count(&self) -> usize {
        self.min_idle
    }

    /// Returns the cap on idle objects, or `None` if unbounded.
    pub fn max_idle_count(&self) -> Option<usize> {
        self.max_idle
    }

    /// Returns the ceiling on borrowed objects, or `None` if unbounded.
    pub fn max_active_count(&self) -> Option<usize> {
        self.max_active
    }

    /// Number of objects kept warm: the idle floor, clipped by the idle cap.
    fn warm_count(&self) -> usize {
        match self.max_idle {
            Some(max) => self.min_idle.min(max),
            None => self.min_idle,
        }
    }
}

/// A snapshot of the bookkeeping counters of a [`LockPool`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Objects waiting in the free list.
    pub idle: usize,
    /// Objects borrowed and not yet given back.
    pub active: usize,
    /// Objects ever created by the pool.
    pub created: usize,
    /// Objects dropped on return because the free list was full or the pool was closed.
    pub discarded: usize,
}

/// A pool of reusable [`RawKeyLock`]s.
///
/// The number of borrowed objects is unbounded unless [`PoolConfig::max_active`] is set. The
/// number of idle objects is bounded by [`PoolConfig::max_idle`].
///
/// # Examples
///
/// ```
/// use keylock::{LockPool, PoolConfig};
///
/// let pool = LockPool::new(PoolConfig::new());
/// assert_eq!(pool.stats().idle, 8);
///
/// let lock = pool.borrow().unwrap();
/// assert_eq!(pool.stats().active, 1);
///
/// pool.give_back(lock);
/// assert_eq!(pool.stats().active, 0);
/// assert_eq!(pool.stats().created, 8);
/// ```
pub struct LockPool {
    config: PoolConfig,
    idle: Mutex<Vec<Arc<RawKeyLock>>>,
    active: AtomicUsize,
    created: AtomicUsize,
    discarded: AtomicUsize,
    closed: AtomicBool,
}

impl LockPool {
    /// Creates a pool and preallocates its idle objects.
    pub fn new(config: PoolConfig) -> LockPool {
        let pool = LockPool {
            config,
            idle: Mutex::new(Vec::with_capacity(config.warm_count())),
            active: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            discarded: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        };
        pool.ensure_min_idle();
        pool
    }

    /// Returns the configuration of this pool.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Returns `true` if this pool creates fair lock objects.
    pub fn is_fair(&self) -> bool {
        self.config.fair
    }

    /// Takes a lock object out of the pool, creating one if the free list is empty.
    ///
    /// # Errors
    ///
    /// Fails with [`PoolError::Closed`] after [`close`] and with [`PoolError::Exhausted`] if the
    /// active ceiling has been reached.
    ///
    /// [`close`]: LockPool::close
    pub fn borrow(&self) -> Result<Arc<RawKeyLock>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }

        match self.config.max_active {
            Some(max) => {
                self.active
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        if n < max {
                            Some(n + 1)
                        } else {
                            None
                        }
                    })
                    .map_err(|_| PoolError::Exhausted)?;
            }
            None => {
                self.active.fetch_add(1, Ordering::AcqRel);
            }
        }

        let reused = self.idle.lock().pop();
        let lock = match reused {
            Some(lock) => lock,
            None => self.create(),
        };
        tracing::trace!(fair = lock.is_fair(), "borrowed lock object");
        Ok(lock)
    }

    /// Puts a borrowed lock object back into the pool.
    ///
    /// The object is dropped instead if the free list is full or the pool is closed. The object
    /// must have been obtained from [`borrow`] on this pool and must not be locked.
    ///
    /// [`borrow`]: LockPool::borrow
    pub fn give_back(&self, lock: Arc<RawKeyLock>) {
        debug_assert!(!lock.is_locked(), "returning a lock object that is still held");
        debug_assert_eq!(lock.is_fair(), self.config.fair);

        let prev = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "returning more lock objects than were borrowed");

        let closed = {
            // `close` sets the flag before draining the free list under this mutex.
            let mut idle = self.idle.lock();
            let closed = self.is_closed();
            if !closed && self.config.max_idle.map_or(true, |max| idle.len() < max) {
                idle.push(lock);
                tracing::trace!(idle = idle.len(), "returned lock object");
                return;
            }
            closed
        };

        self.discarded.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(closed, "discarded returned lock object");
    }

    /// Tops the free list up to the configured idle floor.
    ///
    /// Does nothing once the pool is closed.
    pub fn ensure_min_idle(&self) {
        let warm = self.config.warm_count();
        let mut idle = self.idle.lock();
        if self.is_closed() {
            return;
        }
        let missing = warm.saturating_sub(idle.len());
        for _ in 0..missing {
            idle.push(self.create());
        }
        if missing > 0 {
            tracing::debug!(added = missing, idle = idle.len(), "prefilled lock pool");
        }
    }

    /// Closes the pool.
    ///
    /// Idle objects are dropped, further borrows fail and objects given back afterwards are
    /// discarded. Objects already borrowed stay usable.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = {
            let mut idle = self.idle.lock();
            let n = idle.len();
            idle.clear();
            n
        };
        tracing::debug!(dropped, "closed lock pool");
    }

    /// Returns `true` if [`close`] has been called.
    ///
    /// [`close`]: LockPool::close
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns a snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.lock().len(),
            active: self.active.load(Ordering::Acquire),
            created: self.created.load(Ordering::Acquire),
            discarded: self.discarded.load(Ordering::Acquire),
        }
    }

    fn create(&self) -> Arc<RawKeyLock> {
        self.created.fetch_add(1, Ordering::Relaxed);
        Arc::new(RawKeyLock::new(self.config.fair))
    }
}

impl Default for LockPool {
    fn default() -> LockPool {
        LockPool::new(PoolConfig::default())
    }
}

impl fmt::Debug for LockPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warm_count_is_clipped_by_idle_cap() {
        let config = PoolConfig::new().min_idle(100).max_idle(40);
        assert_eq!(config.warm_count(), 40);
        let pool = LockPool::new(config);
        assert_eq!(pool.stats().idle, 40);
        assert_eq!(pool.stats().created, 40);
    }

    #[test]
    fn ensure_min_idle_refills() {
        let pool = LockPool::default();
        let held: Vec<_> = (0..MIN_IDLE_FLOOR).map(|_| pool.borrow().unwrap()).collect();
        assert_eq!(pool.stats().idle, 0);

        pool.ensure_min_idle();
        assert_eq!(pool.stats().idle, MIN_IDLE_FLOOR);
        assert_eq!(pool.stats().created, 2 * MIN_IDLE_FLOOR);

        for lock in held {
            pool.give_back(lock);
        }
        assert_eq!(pool.stats().idle, 2 * MIN_IDLE_FLOOR);
    }

    #[test]
    fn failed_borrow_does_not_count_as_active() {
        let pool = LockPool::new(PoolConfig::new().max_active(1));
        let lock = pool.borrow().unwrap();
        assert_eq!(pool.borrow().unwrap_err(), PoolError::Exhausted);
        assert_eq!(pool.stats().active, 1);
        pool.give_back(lock);
        assert_eq!(pool.stats().active, 0);
    }
}
