//! Cache Metrics System
//!
//! The cache keeps a passive set of counters that monitoring can read at any
//! time. Counters are plain atomics bumped on the hot paths with relaxed
//! ordering; nothing in the replacement policy ever reads them back.
//!
//! Metrics are reported as a `BTreeMap<String, f64>` through the
//! [`CacheMetrics`] trait so that output ordering is deterministic, which keeps
//! logs and test comparisons stable.
//!
//! | Group | Counters |
//! |-------|----------|
//! | demand / prefetch | `hits`, `misses`, split by data and metadata |
//! | replacement | `recent_hits`, `frequent_hits`, ghost hits, `deleted`, `evicted_bytes` |
//! | contention | `mutex_miss`, `evict_skip` |
//! | index | `hash_elements`, `hash_elements_max` |
//! | admission | `memory_throttle_count` |
//! | second tier | `l2_*` |

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A single monotonically updated statistic.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Adds one.
    #[inline]
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds `n`.
    #[inline]
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Subtracts `n`, saturating at zero.
    #[inline]
    pub fn sub(&self, n: u64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(n))
            });
    }

    /// Raises the counter to `n` if it is lower.
    #[inline]
    pub fn raise_to(&self, n: u64) {
        self.0.fetch_max(n, Ordering::Relaxed);
    }

    /// Current value.
    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

macro_rules! arc_stats {
    ($($(#[$doc:meta])* $name:ident,)*) => {
        /// Live counters of one cache instance.
        #[derive(Debug, Default)]
        pub struct ArcStats {
            $($(#[$doc])* pub $name: Counter,)*
        }

        /// Point-in-time copy of [`ArcStats`].
        #[derive(Debug, Default, Clone, PartialEq, Eq)]
        pub struct ArcStatsSnapshot {
            $($(#[$doc])* pub $name: u64,)*
        }

        impl ArcStats {
            /// Reads every counter.
            pub fn snapshot(&self) -> ArcStatsSnapshot {
                ArcStatsSnapshot {
                    $($name: self.$name.get(),)*
                }
            }
        }

        impl ArcStatsSnapshot {
            /// Converts the snapshot to a sorted map for reporting.
            pub fn to_btreemap(&self) -> BTreeMap<String, f64> {
                let mut metrics = BTreeMap::new();
                $(metrics.insert(stringify!($name).to_string(), self.$name as f64);)*
                metrics
            }
        }
    };
}

arc_stats! {
    /// Reads satisfied from memory.
    hits,
    /// Reads that needed the second tier or the physical layer.
    misses,
    /// Demand reads of data blocks found in memory.
    demand_data_hits,
    /// Demand reads of data blocks not in memory.
    demand_data_misses,
    /// Demand reads of metadata blocks found in memory.
    demand_metadata_hits,
    /// Demand reads of metadata blocks not in memory.
    demand_metadata_misses,
    /// Prefetches of data blocks already in memory.
    prefetch_data_hits,
    /// Prefetches of data blocks not in memory.
    prefetch_data_misses,
    /// Prefetches of metadata blocks already in memory.
    prefetch_metadata_hits,
    /// Prefetches of metadata blocks not in memory.
    prefetch_metadata_misses,
    /// Hits on buffers in the Recent state.
    recent_hits,
    /// Hits on buffers in the Frequent state.
    frequent_hits,
    /// Misses that found a Recent-Ghost entry.
    recent_ghost_hits,
    /// Misses that found a Frequent-Ghost entry.
    frequent_ghost_hits,
    /// Buffers and ghosts destroyed outright.
    deleted,
    /// Bytes evicted from the live states.
    evicted_bytes,
    /// Eviction candidates skipped because their lock was busy.
    mutex_miss,
    /// Eviction candidates skipped because they were re-referenced.
    evict_skip,
    /// Physical read failures healed by a concurrent fetch.
    read_errors_healed,
    /// Physical read failures returned to the caller.
    read_errors,
    /// Entries currently in the identity index.
    hash_elements,
    /// High-water mark of `hash_elements`.
    hash_elements_max,
    /// Reservations throttled for memory.
    memory_throttle_count,
    /// Second-tier reads that returned verified data.
    l2_hits,
    /// Misses that found no usable second-tier copy.
    l2_misses,
    /// Feed passes over a device.
    l2_feeds,
    /// Reads refused because the device was being written.
    l2_rw_clash,
    /// Bytes read from second-tier devices.
    l2_read_bytes,
    /// Bytes written to second-tier devices.
    l2_write_bytes,
    /// Batched writes issued.
    l2_writes_sent,
    /// Batched writes completed.
    l2_writes_done,
    /// Batched writes that failed.
    l2_writes_error,
    /// Feed passes abandoned because memory was low.
    l2_abort_lowmem,
    /// Second-tier reads that failed checksum verification.
    l2_cksum_bad,
    /// Second-tier reads that failed at the device.
    l2_io_error,
    /// Records evicted from second-tier devices.
    l2_evicted,
    /// Records currently resident on second-tier devices.
    l2_records,
}

/// Trait that all cache implementations provide for metrics reporting
///
/// The trait uses BTreeMap to ensure deterministic ordering of metrics, which is essential
/// for reproducible benchmarks and consistent test results.
pub trait CacheMetrics {
    /// Returns all metrics as key-value pairs in deterministic order
    fn metrics(&self) -> BTreeMap<String, f64>;

    /// Algorithm name for identification
    fn algorithm_name(&self) -> &'static str;
}

/// Share of `part` in `total`, zero when nothing was counted.
pub(crate) fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}
