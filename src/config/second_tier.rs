//! Configuration for the secondary-device tier.
//!
//! The feed thread copies buffers that are about to be evicted from memory to
//! the attached devices. Each pass writes at most `write_max` bytes (plus
//! `write_boost` until the cache has warmed up) and scans at most
//! `headroom` times that much of each eviction list looking for candidates.

use core::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Secondary-device tier settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SecondTierConfig {
    /// Start the feed thread at init. When disabled, callers drive feeding
    /// with [`BlockCache::feed_second_tier`](crate::BlockCache::feed_second_tier).
    pub feed_enabled: bool,
    /// Bytes written per feed pass.
    pub write_max: u64,
    /// Extra bytes per pass while the cache is still cold.
    pub write_boost: u64,
    /// Multiple of the write size scanned for candidates.
    pub headroom: u64,
    /// Normal interval between feed passes.
    pub feed_interval: Duration,
    /// Interval used when the previous pass wrote more than half of what it
    /// wanted.
    pub feed_min_interval: Duration,
    /// Skip buffers that were prefetched and never read on demand.
    pub no_prefetch: bool,
    /// Use the short interval after a productive pass.
    pub feed_again: bool,
    /// Refuse device reads while a write to that device is in flight.
    pub no_read_while_writing: bool,
}

impl Default for SecondTierConfig {
    fn default() -> Self {
        SecondTierConfig {
            feed_enabled: true,
            write_max: 8 * MIB,
            write_boost: 8 * MIB,
            headroom: 2,
            feed_interval: Duration::from_secs(1),
            feed_min_interval: Duration::from_millis(200),
            no_prefetch: true,
            feed_again: true,
            no_read_while_writing: true,
        }
    }
}
