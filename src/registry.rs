//! The keyed lock registry.
//!
//! Every key that is locked or waited for owns an entry in a map guarded by a single mutex. The
//! entry holds a lock object borrowed from a [`LockPool`] and the number of threads that hold or
//! wait for it. The mutex is only held to look up, create and remove entries; blocking on the
//! lock object itself always happens outside of it, so a contended key never holds up any other
//! key.
//!
//! An entry is removed and its lock object given back to the pool as soon as the reference count
//! drops to zero. Creation and removal both happen under the mutex, so a thread locking a key
//! either attaches to the existing entry or creates a fresh one, and never two at once.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::err::{LockError, OperationError};
use crate::guard::{KeyedReadGuard, KeyedWriteGuard};
use crate::lock::RawKeyLock;
use crate::pool::{LockPool, PoolConfig};

/// The lock state of one key.
struct LockEntry {
    lock: Arc<RawKeyLock>,
    /// Threads holding or waiting for `lock`.
    refs: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

impl Mode {
    fn acquire(self, lock: &RawKeyLock) -> Result<(), OperationError> {
        match self {
            Mode::Read => lock.lock_shared(),
            Mode::Write => lock.lock_exclusive(),
        }
    }

    fn try_acquire(self, lock: &RawKeyLock) -> bool {
        match self {
            Mode::Read => lock.try_lock_shared(),
            Mode::Write => lock.try_lock_exclusive(),
        }
    }

    fn try_acquire_for(self, lock: &RawKeyLock, timeout: Duration) -> bool {
        match self {
            Mode::Read => lock.try_lock_shared_for(timeout),
            Mode::Write => lock.try_lock_exclusive_for(timeout),
        }
    }

    fn release(self, lock: &RawKeyLock) -> Result<(), OperationError> {
        match self {
            Mode::Read => lock.unlock_shared(),
            Mode::Write => lock.unlock_exclusive(),
        }
    }
}

/// A reader-writer lock scoped to keys.
///
/// Each key behaves like an independent reader-writer lock: it may be held by any number of
/// readers or by a single writer. Different keys never block each other.
///
/// Keys are passed as `impl Into<Option<&K>>`, so both `&key` and `None` are accepted. Every
/// operation on a `None` key does nothing and succeeds, which lets call sites with an optional
/// key lock unconditionally.
///
/// Holds belong to the thread that acquired them. Locks must be released with the matching
/// `unlock_*` call from that same thread, typically on every exit path. [`read`] and [`write`]
/// return guards that do this on drop.
///
/// # Examples
///
/// ```
/// use keylock::KeyedRwLock;
/// use std::sync::Arc;
/// use std::thread;
///
/// let locks: Arc<KeyedRwLock<u64>> = Arc::new(KeyedRwLock::new());
///
/// let handles: Vec<_> = (0..4u64)
///     .map(|id| {
///         let locks = locks.clone();
///         thread::spawn(move || {
///             // Distinct keys, so these writers run in parallel.
///             let _guard = locks.write(&id).unwrap();
///         })
///     })
///     .collect();
///
/// for h in handles {
///     h.join().unwrap();
/// }
/// assert!(locks.is_empty());
/// ```
///
/// [`read`]: KeyedRwLock::read
/// [`write`]: KeyedRwLock::write
pub struct KeyedRwLock<K> {
    entries: Mutex<HashMap<K, LockEntry>>,
    pool: Arc<LockPool>,
}

impl<K> KeyedRwLock<K> {
    /// Creates a registry with unfair locks and a default pool.
    pub fn new() -> KeyedRwLock<K> {
        KeyedRwLock::with_config(PoolConfig::default())
    }

    /// Creates a registry whose locks hand themselves to the longest waiting thread on release.
    pub fn fair() -> KeyedRwLock<K> {
        KeyedRwLock::with_fairness(true)
    }

    /// Creates a registry with the given ordering policy and a default pool.
    pub fn with_fairness(fair: bool) -> KeyedRwLock<K> {
        KeyedRwLock::with_config(PoolConfig::new().fair(fair))
    }

    /// Creates a registry backed by a new pool with the given configuration.
    pub fn with_config(config: PoolConfig) -> KeyedRwLock<K> {
        KeyedRwLock::with_pool(Arc::new(LockPool::new(config)))
    }

    /// Creates a registry backed by an existing, possibly shared, pool.
    pub fn with_pool(pool: Arc<LockPool>) -> KeyedRwLock<K> {
        KeyedRwLock {
            entries: Mutex::new(HashMap::new()),
            pool,
        }
    }

    /// Creates a builder for configuring a registry.
    pub fn builder() -> Builder<K> {
        Builder::new()
    }

    /// Returns the pool this registry borrows lock objects from.
    pub fn pool(&self) -> &Arc<LockPool> {
        &self.pool
    }

    /// Returns the number of keys currently locked or waited for.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if no key is locked or waited for.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<K: Eq + Hash + Clone> KeyedRwLock<K> {
    /// Acquires a read lock on `key`, blocking until it is available.
    ///
    /// A thread that already reads `key` may lock it for reading again. The nested lock is
    /// granted even when a writer is waiting, and each lock needs its own unlock.
    ///
    /// # Errors
    ///
    /// Fails if no lock object can be borrowed for a key that is not locked yet. In that case
    /// nothing is locked and no trace of `key` is left in the registry.
    ///
    /// Fails with [`LockError::Operation`] if the calling thread holds the write lock on `key`.
    pub fn lock_reading<'a>(&self, key: impl Into<Option<&'a K>>) -> Result<(), LockError>
    where
        K: 'a,
    {
        match key.into() {
            Some(key) => self.lock(key, Mode::Read),
            None => Ok(()),
        }
    }

    /// Releases a read lock on `key` held by the calling thread.
    ///
    /// Unlocking a key that nobody locks is a no-op.
    ///
    /// # Errors
    ///
    /// Fails with [`LockError::Operation`] if the key is locked, but the calling thread holds no
    /// read lock on it. Locks held by other threads are left untouched.
    pub fn unlock_reading<'a>(&self, key: impl Into<Option<&'a K>>) -> Result<(), LockError>
    where
        K: 'a,
    {
        match key.into() {
            Some(key) => self.unlock(key, Mode::Read),
            None => Ok(()),
        }
    }

    /// Acquires the write lock on `key`, blocking until it is available.
    ///
    /// Write locks are not reentrant, and a read lock cannot be upgraded.
    ///
    /// # Errors
    ///
    /// Fails if no lock object can be borrowed for a key that is not locked yet. In that case
    /// nothing is locked and no trace of `key` is left in the registry.
    ///
    /// Fails with [`LockError::Operation`] if the calling thread already holds `key` in either
    /// mode, instead of deadlocking.
    pub fn lock_writing<'a>(&self, key: impl Into<Option<&'a K>>) -> Result<(), LockError>
    where
        K: 'a,
    {
        match key.into() {
            Some(key) => self.lock(key, Mode::Write),
            None => Ok(()),
        }
    }

    /// Releases the write lock on `key` held by the calling thread.
    ///
    /// Unlocking a key that nobody locks is a no-op.
    ///
    /// # Errors
    ///
    /// Fails with [`LockError::Operation`] if the key is locked, but the calling thread does not
    /// hold its write lock.
    pub fn unlock_writing<'a>(&self, key: impl Into<Option<&'a K>>) -> Result<(), LockError>
    where
        K: 'a,
    {
        match key.into() {
            Some(key) => self.unlock(key, Mode::Write),
            None => Ok(()),
        }
    }

    /// Attempts to acquire a read lock on `key` without blocking.
    ///
    /// Returns `Ok(true)` if the lock was acquired. A `None` key always succeeds.
    pub fn try_lock_reading<'a>(&self, key: impl Into<Option<&'a K>>) -> Result<bool, LockError>
    where
        K: 'a,
    {
        match key.into() {
            Some(key) => self.try_lock(key, Mode::Read),
            None => Ok(true),
        }
    }

    /// Attempts to acquire the write lock on `key` without blocking.
    ///
    /// Returns `Ok(true)` if the lock was acquired. A `None` key always succeeds. Returns
    /// `Ok(false)` if the calling thread already holds `key`.
    pub fn try_lock_writing<'a>(&self, key: impl Into<Option<&'a K>>) -> Result<bool, LockError>
    where
        K: 'a,
    {
        match key.into() {
            Some(key) => self.try_lock(key, Mode::Write),
            None => Ok(true),
        }
    }

    /// Acquires a read lock on `key`, waiting at most `timeout`.
    ///
    /// Returns `Ok(false)` if the timeout expired first. A waiter that gives up leaves no
    /// reference behind, so the key is reclaimed normally once its holders are done.
    pub fn lock_reading_for<'a>(
        &self,
        key: impl Into<Option<&'a K>>,
        timeout: Duration,
    ) -> Result<bool, LockError>
    where
        K: 'a,
    {
        match key.into() {
            Some(key) => self.lock_for(key, Mode::Read, timeout),
            None => Ok(true),
        }
    }

    /// Acquires the write lock on `key`, waiting at most `timeout`.
    ///
    /// Returns `Ok(false)` if the timeout expired first.
    pub fn lock_writing_for<'a>(
        &self,
        key: impl Into<Option<&'a K>>,
        timeout: Duration,
    ) -> Result<bool, LockError>
    where
        K: 'a,
    {
        match key.into() {
            Some(key) => self.lock_for(key, Mode::Write, timeout),
            None => Ok(true),
        }
    }

    /// Acquires a read lock on `key` and returns a guard that releases it when dropped.
    pub fn read(&self, key: &K) -> Result<KeyedReadGuard<'_, K>, LockError> {
        self.lock(key, Mode::Read)?;
        Ok(KeyedReadGuard::new(self, key.clone()))
    }

    /// Acquires the write lock on `key` and returns a guard that releases it when dropped.
    pub fn write(&self, key: &K) -> Result<KeyedWriteGuard<'_, K>, LockError> {
        self.lock(key, Mode::Write)?;
        Ok(KeyedWriteGuard::new(self, key.clone()))
    }

    /// Attempts to acquire a read guard on `key` without blocking.
    pub fn try_read(&self, key: &K) -> Result<Option<KeyedReadGuard<'_, K>>, LockError> {
        if self.try_lock(key, Mode::Read)? {
            Ok(Some(KeyedReadGuard::new(self, key.clone())))
        } else {
            Ok(None)
        }
    }

    /// Attempts to acquire a write guard on `key` without blocking.
    pub fn try_write(&self, key: &K) -> Result<Option<KeyedWriteGuard<'_, K>>, LockError> {
        if self.try_lock(key, Mode::Write)? {
            Ok(Some(KeyedWriteGuard::new(self, key.clone())))
        } else {
            Ok(None)
        }
    }

    fn lock(&self, key: &K, mode: Mode) -> Result<(), LockError> {
        let lock = self.attach(key)?;
        // Blocking happens here, outside of the registry mutex.
        if let Err(err) = mode.acquire(&lock) {
            drop(lock);
            tracing::warn!(?mode, %err, "refused nested keyed lock");
            self.detach(&mut self.entries.lock(), key);
            return Err(err.into());
        }
        Ok(())
    }

    fn try_lock(&self, key: &K, mode: Mode) -> Result<bool, LockError> {
        let lock = self.attach(key)?;
        if mode.try_acquire(&lock) {
            return Ok(true);
        }
        drop(lock);
        self.detach(&mut self.entries.lock(), key);
        Ok(false)
    }

    fn lock_for(&self, key: &K, mode: Mode, timeout: Duration) -> Result<bool, LockError> {
        let lock = self.attach(key)?;
        if mode.try_acquire_for(&lock, timeout) {
            return Ok(true);
        }
        drop(lock);
        tracing::trace!(?mode, ?timeout, "gave up waiting for keyed lock");
        self.detach(&mut self.entries.lock(), key);
        Ok(false)
    }

    fn unlock(&self, key: &K, mode: Mode) -> Result<(), LockError> {
        let mut entries = self.entries.lock();
        let released = match entries.get(key) {
            Some(entry) => mode.release(&entry.lock),
            None => return Ok(()),
        };
        if let Err(err) = released {
            tracing::warn!(?mode, "unlock of a keyed lock the calling thread does not hold in this mode");
            return Err(err.into());
        }
        self.detach(&mut entries, key);
        Ok(())
    }

    /// Registers one more user of `key`, creating its entry if needed.
    fn attach(&self, key: &K) -> Result<Arc<RawKeyLock>, LockError> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.refs += 1;
            return Ok(entry.lock.clone());
        }

        // Borrow before inserting, so a failed borrow leaves no entry behind.
        let lock = self.pool.borrow()?;
        entries.insert(
            key.clone(),
            LockEntry {
                lock: lock.clone(),
                refs: 1,
            },
        );
        tracing::trace!(live = entries.len(), "created keyed lock entry");
        Ok(lock)
    }

    /// Drops one user of `key` and reclaims the entry if it was the last.
    fn detach(&self, entries: &mut HashMap<K, LockEntry>, key: &K) {
        let unused = match entries.get_mut(key) {
            Some(entry) => {
                debug_assert!(entry.refs > 0);
                entry.refs -= 1;
                entry.refs == 0
            }
            None => return,
        };
        if unused {
            if let Some(entry) = entries.remove(key) {
                self.pool.give_back(entry.lock);
                tracing::trace!(live = entries.len(), "evicted keyed lock entry");
            }
        }
    }
}

impl<K> Default for KeyedRwLock<K> {
    fn default() -> KeyedRwLock<K> {
        KeyedRwLock::new()
    }
}

impl<K> fmt::Debug for KeyedRwLock<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedRwLock")
            .field("live", &self.len())
            .field("pool", &self.pool)
            .finish()
    }
}

/// Keyed lock registry factory, which can be used in order to configure the properties of a new
/// registry.
///
/// # Examples
///
/// ```
/// use keylock::KeyedRwLock;
///
/// let locks: KeyedRwLock<&str> = KeyedRwLock::builder()
///     .fair(true)
///     .min_idle(16)
///     .max_idle(-1)
///     .build();
/// assert!(locks.pool().is_fair());
/// ```
pub struct Builder<K> {
    config: PoolConfig,
    pool: Option<Arc<LockPool>>,
    _marker: PhantomData<fn() -> K>,
}

impl<K> Builder<K> {
    /// Generates the base configuration for a registry, from which configuration methods can be
    /// chained.
    pub fn new() -> Builder<K> {
        Builder {
            config: PoolConfig::default(),
            pool: None,
            _marker: PhantomData,
        }
    }

    /// Sets the ordering policy of the registry's locks. See [`PoolConfig::fair`].
    pub fn fair(mut self, fair: bool) -> Builder<K> {
        self.config = self.config.fair(fair);
        self
    }

    /// Sets the number of idle lock objects kept allocated. See [`PoolConfig::min_idle`].
    pub fn min_idle(mut self, min_idle: usize) -> Builder<K> {
        self.config = self.config.min_idle(min_idle);
        self
    }

    /// Sets the cap on idle lock objects, negative for none. See [`PoolConfig::max_idle`].
    pub fn max_idle(mut self, max_idle: isize) -> Builder<K> {
        self.config = self.config.max_idle(max_idle);
        self
    }

    /// Sets the ceiling on lock objects in use. See [`PoolConfig::max_active`].
    pub fn max_active(mut self, max_active: usize) -> Builder<K> {
        self.config = self.config.max_active(max_active);
        self
    }

    /// Uses an existing pool instead of creating one.
    ///
    /// The pool settings of this builder are ignored in that case.
    pub fn pool(mut self, pool: Arc<LockPool>) -> Builder<K> {
        self.pool = Some(pool);
        self
    }

    /// Creates the registry.
    pub fn build(self) -> KeyedRwLock<K> {
        match self.pool {
            Some(pool) => KeyedRwLock::with_pool(pool),
            None => KeyedRwLock::with_config(self.config),
        }
    }
}

impl<K> Default for Builder<K> {
    fn default() -> Builder<K> {
        Builder::new()
    }
}

impl<K> fmt::Debug for Builder<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(locks: &KeyedRwLock<u32>, key: u32) -> Option<usize> {
        locks.entries.lock().get(&key).map(|e| e.refs)
    }

    #[test]
    fn refs_count_every_holder() {
        let locks: KeyedRwLock<u32> = KeyedRwLock::new();
        locks.lock_reading(&1).unwrap();
        locks.lock_reading(&1).unwrap();
        assert_eq!(refs(&locks, 1), Some(2));

        locks.unlock_reading(&1).unwrap();
        assert_eq!(refs(&locks, 1), Some(1));
        locks.unlock_reading(&1).unwrap();
        assert_eq!(refs(&locks, 1), None);
    }

    #[test]
    fn failed_try_drops_its_reference() {
        let locks: KeyedRwLock<u32> = KeyedRwLock::new();
        locks.lock_writing(&7).unwrap();
        assert_eq!(locks.try_lock_reading(&7), Ok(false));
        assert_eq!(refs(&locks, 7), Some(1));
        locks.unlock_writing(&7).unwrap();
        assert_eq!(refs(&locks, 7), None);
    }

    #[test]
    fn unlock_in_wrong_mode_keeps_entry() {
        let locks: KeyedRwLock<u32> = KeyedRwLock::new();
        locks.lock_reading(&3).unwrap();
        assert!(matches!(locks.unlock_writing(&3), Err(LockError::Operation(_))));
        assert_eq!(refs(&locks, 3), Some(1));
        locks.unlock_reading(&3).unwrap();
        assert!(locks.is_empty());
    }

    #[test]
    fn refused_nested_lock_drops_its_reference() {
        let locks: KeyedRwLock<u32> = KeyedRwLock::new();
        locks.lock_writing(&5).unwrap();
        assert!(matches!(locks.lock_writing(&5), Err(LockError::Operation(_))));
        assert!(matches!(locks.lock_reading(&5), Err(LockError::Operation(_))));
        assert_eq!(refs(&locks, 5), Some(1));
        locks.unlock_writing(&5).unwrap();

        locks.lock_reading(&5).unwrap();
        assert!(matches!(locks.lock_writing(&5), Err(LockError::Operation(_))));
        assert_eq!(locks.lock_writing_for(&5, Duration::from_millis(10)), Ok(false));
        assert_eq!(refs(&locks, 5), Some(1));
        locks.unlock_reading(&5).unwrap();
        assert!(locks.is_empty());
    }

    #[test]
    fn evicted_lock_goes_back_to_the_pool() {
        let locks: KeyedRwLock<u32> = KeyedRwLock::new();
        let idle = locks.pool().stats().idle;
        locks.lock_writing(&1).unwrap();
        assert_eq!(locks.pool().stats().idle, idle - 1);
        locks.unlock_writing(&1).unwrap();
        assert_eq!(locks.pool().stats().idle, idle);
        assert_eq!(locks.pool().stats().active, 0);
    }
}
