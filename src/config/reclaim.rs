//! Configuration for the reclaim thread.

use core::time::Duration;

/// Background reclaim thread settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReclaimConfig {
    /// Start the thread at init. When disabled, callers drive reclaim with
    /// [`BlockCache::reclaim_now`](crate::BlockCache::reclaim_now).
    pub enabled: bool,
    /// Longest sleep between passes; an allocation that could not make room
    /// wakes the thread early.
    pub interval: Duration,
    /// How often inactive references to hole buffers are trimmed.
    pub trim_interval: Duration,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        ReclaimConfig {
            enabled: true,
            interval: Duration::from_secs(1),
            trim_interval: Duration::from_secs(60),
        }
    }
}
