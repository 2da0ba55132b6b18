//! Scoped acquisition of keyed locks.
//!
//! A guard releases its lock from the thread that acquired it, so guards cannot be sent to other
//! threads.

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

use crate::registry::KeyedRwLock;

/// Makes a guard `!Send`: holds are recorded per thread.
type NotSend = PhantomData<*const ()>;

/// A guard that releases a read lock of a [`KeyedRwLock`] when dropped.
///
/// Created by [`KeyedRwLock::read`] and [`KeyedRwLock::try_read`].
///
/// The guard cannot be moved to another thread:
///
/// ```compile_fail
/// use keylock::KeyedRwLock;
///
/// let locks: KeyedRwLock<u32> = KeyedRwLock::new();
/// let guard = locks.read(&1).unwrap();
/// crossbeam_utils::thread::scope(|s| {
///     s.spawn(move |_| drop(guard));
/// })
/// .unwrap();
/// ```
pub struct KeyedReadGuard<'a, K: Eq + Hash + Clone> {
    registry: &'a KeyedRwLock<K>,
    key: K,
    _marker: NotSend,
}

unsafe impl<K: Eq + Hash + Clone + Send + Sync> Sync for KeyedReadGuard<'_, K> {}

impl<'a, K: Eq + Hash + Clone> KeyedReadGuard<'a, K> {
    pub(crate) fn new(registry: &'a KeyedRwLock<K>, key: K) -> KeyedReadGuard<'a, K> {
        KeyedReadGuard {
            registry,
            key,
            _marker: PhantomData,
        }
    }

    /// Returns the key this guard holds a read lock on.
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash + Clone> Drop for KeyedReadGuard<'_, K> {
    fn drop(&mut self) {
        if let Err(err) = self.registry.unlock_reading(&self.key) {
            tracing::warn!(%err, "failed to release keyed read lock on drop");
        }
    }
}

impl<K: Eq + Hash + Clone + fmt::Debug> fmt::Debug for KeyedReadGuard<'_, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedReadGuard")
            .field("key", &self.key)
            .finish()
    }
}

/// A guard that releases the write lock of a [`KeyedRwLock`] when dropped.
///
/// Created by [`KeyedRwLock::write`] and [`KeyedRwLock::try_write`].
///
/// Like [`KeyedReadGuard`], it cannot be moved to another thread.
pub struct KeyedWriteGuard<'a, K: Eq + Hash + Clone> {
    registry: &'a KeyedRwLock<K>,
    key: K,
    _marker: NotSend,
}

unsafe impl<K: Eq + Hash + Clone + Send + Sync> Sync for KeyedWriteGuard<'_, K> {}

impl<'a, K: Eq + Hash + Clone> KeyedWriteGuard<'a, K> {
    pub(crate) fn new(registry: &'a KeyedRwLock<K>, key: K) -> KeyedWriteGuard<'a, K> {
        KeyedWriteGuard {
            registry,
            key,
            _marker: PhantomData,
        }
    }

    /// Returns the key this guard holds the write lock on.
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash + Clone> Drop for KeyedWriteGuard<'_, K> {
    fn drop(&mut self) {
        if let Err(err) = self.registry.unlock_writing(&self.key) {
            tracing::warn!(%err, "failed to release keyed write lock on drop");
        }
    }
}

impl<K: Eq + Hash + Clone + fmt::Debug> fmt::Debug for KeyedWriteGuard<'_, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedWriteGuard")
            .field("key", &self.key)
            .finish()
    }
}
