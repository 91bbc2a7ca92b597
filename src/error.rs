//! Error types.
//!
//! Only allocation, I/O and admission failures cross the public boundary.
//! Lock contention, ghost races and second-tier misses are absorbed inside the
//! cache. Contract violations (freeing a reference with a live callback,
//! writing through a shared reference, ...) assert in debug builds and are
//! returned as errors in release builds.

use thiserror::Error;

/// Errors returned by cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// No memory for a new buffer of `size` bytes.
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory {
        /// Requested allocation size.
        size: u64,
    },

    /// The physical layer failed the request.
    #[error("physical i/o failed: {0}")]
    Io(#[source] std::io::Error),

    /// A second-tier device operation failed.
    #[error("secondary device error: {0}")]
    Device(#[source] std::io::Error),

    /// The reference's buffer was destroyed or queued for eviction.
    #[error("buffer no longer exists")]
    NotFound,

    /// The reference is already being evicted.
    #[error("eviction already in progress")]
    InProgress,

    /// The reference shares cached data and must be made writable first.
    #[error("reference is not writable")]
    NotWritable,

    /// The reference still has an eviction callback registered.
    #[error("reference has a registered eviction callback")]
    CallbackRegistered,

    /// The operation is not valid for the reference's current state.
    #[error("invalid reference state: {0}")]
    InvalidReference(&'static str),

    /// Frozen data was modified.
    #[error("frozen data of {0} was modified")]
    FrozenModified(crate::BlockId),

    /// The requested size exceeds the largest supported block.
    #[error("block size {size} exceeds maximum {max}")]
    BlockTooLarge {
        /// Requested size.
        size: u64,
        /// Configured maximum.
        max: u64,
    },

    /// The named second-tier device is not attached.
    #[error("unknown secondary device {0}")]
    UnknownDevice(u64),

    /// The cache has been shut down.
    #[error("cache is shut down")]
    ShutDown,

    /// A background thread could not be started.
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        /// Thread name.
        name: &'static str,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Admission-control outcome for [`BlockCache::tempreserve_space`].
///
/// [`BlockCache::tempreserve_space`]: crate::BlockCache::tempreserve_space
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReserveError {
    /// Memory is short right now; back off and retry later.
    #[error("memory is low, retry later")]
    RetryLater,

    /// Too much I/O is in flight; restart after a short wait.
    #[error("too much dirty data in flight, restart")]
    Restart,

    /// The reservation can never fit in the cache.
    #[error("reservation exceeds cache size")]
    OutOfSpace,
}

/// Result alias used across the crate.
pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Reports a contract violation: asserts in debug builds, returns an error in
/// release builds.
macro_rules! contract {
    ($cond:expr, $err:expr) => {
        if !$cond {
            debug_assert!($cond, "{}", $err);
            return Err($err);
        }
    };
}

pub(crate) use contract;
