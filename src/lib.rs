//! Read/write locks scoped to arbitrary keys.
//!
//! Operations on different keys never contend, while operations on the same key obey the usual
//! reader-writer rules: any number of readers, or a single writer.
//!
//! ## Locking
//!
//! * [`KeyedRwLock`], the keyed lock registry.
//! * [`KeyedReadGuard`] and [`KeyedWriteGuard`], for scoped acquisition.
//!
//! ## Lock objects
//!
//! * [`LockPool`], a reservoir of reusable lock objects.
//! * [`PoolConfig`], fairness and capacity settings of a pool.
//!
//! # Examples
//!
//! ```
//! use keylock::KeyedRwLock;
//!
//! let locks: KeyedRwLock<String> = KeyedRwLock::new();
//! let id = String::from("order-1234");
//!
//! locks.lock_writing(&id).unwrap();
//! // Exclusive access to everything identified by `id`.
//! locks.unlock_writing(&id).unwrap();
//!
//! // Or with a guard that unlocks when dropped.
//! {
//!     let _guard = locks.read(&id).unwrap();
//! }
//! assert!(locks.is_empty());
//! ```

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

mod err;
mod guard;
mod lock;
mod pool;
mod registry;

pub use crate::err::{LockError, OperationError, PoolError};
pub use crate::guard::{KeyedReadGuard, KeyedWriteGuard};
pub use crate::lock::RawKeyLock;
pub use crate::pool::{LockPool, PoolConfig, PoolStats, MAX_IDLE_FLOOR, MIN_IDLE_FLOOR};
pub use crate::registry::{Builder, KeyedRwLock};
