//! Defines the error types used throughout slotpool.
use std::fmt;

/// The primary error enum for all fallible operations in slotpool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The free list is empty and the pool declined to grow, either because
    /// growth is rate-limited or because the underlying memory request
    /// failed. The pool remains fully usable with its existing capacity.
    ///
    /// This error is non-fatal. Callers typically retry after a backoff, or
    /// free a slot and allocate again.
    Exhausted,
    /// Represents an error in the pool configuration, e.g. a block size too
    /// small to yield a single slot after alignment.
    Configuration(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Exhausted => {
                write!(f, "pool exhausted: no free slot and growth was refused")
            }
            PoolError::Configuration(e) => write!(f, "Configuration error: {}", e),
        }
    }
}

impl std::error::Error for PoolError {}
