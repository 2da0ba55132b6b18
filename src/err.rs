use std::error;
use std::fmt;

/// An error returned from [`LockPool::borrow`].
///
/// [`LockPool::borrow`]: crate::LockPool::borrow
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum PoolError {
    /// The configured ceiling on borrowed lock objects has been reached.
    Exhausted,

    /// The pool has been closed and hands out no more lock objects.
    Closed,
}

/// An error returned from the locking methods of [`KeyedRwLock`].
///
/// When a lock method fails, the lock is not held and the registry is left as it was before the
/// call.
///
/// [`KeyedRwLock`]: crate::KeyedRwLock
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum LockError {
    /// No lock object could be borrowed because the pool's active ceiling was reached.
    ///
    /// This is a capacity failure and the operation may be retried later.
    PoolExhausted,

    /// The pool backing the registry has been closed.
    IllegalPoolState,

    /// Any other failure of the requested operation.
    Operation(OperationError),
}

/// An unexpected failure of a lock operation.
///
/// The error carries a short description of what went wrong.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct OperationError(&'static str);

impl OperationError {
    pub(crate) const fn new(description: &'static str) -> OperationError {
        OperationError(description)
    }

    /// Returns the description of this error.
    pub fn description(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PoolError::Exhausted => f.write_str("lock pool exhausted"),
            PoolError::Closed => f.write_str("lock pool is closed"),
        }
    }
}

impl error::Error for PoolError {}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl error::Error for OperationError {}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            LockError::PoolExhausted => f.write_str("no lock object available: pool exhausted"),
            LockError::IllegalPoolState => f.write_str("lock pool is in an illegal state"),
            LockError::Operation(ref err) => write!(f, "lock operation failed: {}", err),
        }
    }
}

impl error::Error for LockError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            LockError::Operation(ref err) => Some(err),
            _ => None,
        }
    }
}

impl From<PoolError> for LockError {
    fn from(err: PoolError) -> LockError {
        match err {
            PoolError::Exhausted => LockError::PoolExhausted,
            PoolError::Closed => LockError::IllegalPoolState,
        }
    }
}

impl From<OperationError> for LockError {
    fn from(err: OperationError) -> LockError {
        LockError::Operation(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_map_to_distinct_kinds() {
        assert_eq!(LockError::from(PoolError::Exhausted), LockError::PoolExhausted);
        assert_eq!(LockError::from(PoolError::Closed), LockError::IllegalPoolState);
    }

    #[test]
    fn operation_error_is_the_source() {
        let err = LockError::from(OperationError::new("no write lock held"));
        assert_eq!(err.to_string(), "lock operation failed: no write lock held");
        assert!(error::Error::source(&err).is_some());
        assert!(error::Error::source(&LockError::PoolExhausted).is_none());
    }
}
