//! Configuration for the adaptive replacement cache itself.

use core::fmt;
use core::time::Duration;

use super::{ReclaimConfig, SecondTierConfig};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Buckets covered by one index lock.
const BUCKETS_PER_LOCK: usize = 512;
/// Fewest index locks, however small the table.
const MIN_INDEX_LOCKS: usize = 256;
/// Smallest index table.
const MIN_INDEX_BUCKETS: usize = 1 << 12;

/// Configuration for a [`BlockCache`](crate::BlockCache).
///
/// # Fields
///
/// - `max_size` / `min_size`: bounds for the adaptive target size. The target
///   starts at `max_size` and is shrunk under memory pressure but never below
///   `min_size`.
/// - `max_block_size`: the largest block the cache will hold. Also the size of
///   the shared zero buffers handed out for holes.
/// - `ghost_unit`: nominal byte weight of one ghost entry when ghost lists are
///   balanced against the target size.
/// - `min_access_interval`: two accesses closer together than this count as
///   one, so bursty re-reads do not promote a block to Frequent.
#[derive(Clone)]
pub struct ArcConfig {
    /// Memory the cache assumes the host has; used for index sizing,
    /// throttling and the defaults below.
    pub memory: u64,
    /// Upper bound of the target size (`c_max`).
    pub max_size: u64,
    /// Lower bound of the target size (`c_min`).
    pub min_size: u64,
    /// Largest block accepted.
    pub max_block_size: u64,
    /// Assumed average block size for index sizing.
    pub average_block_size: u64,
    /// Nominal size of a ghost entry.
    pub ghost_unit: u64,
    /// Minimum time between two accesses for the second one to promote.
    pub min_access_interval: Duration,
    /// The recency share never drops below `target >> p_min_shift` nor rises
    /// above `target - (target >> p_min_shift)`.
    pub p_min_shift: u32,
    /// An aggressive reclaim shrinks the target by `target >> shrink_shift`.
    pub shrink_shift: u32,
    /// How long growth stays frozen after the last pressure event.
    pub grow_retry: Duration,
    /// Index buckets, zero to derive from `memory`.
    pub index_buckets: usize,
    /// Index locks, zero to derive from the bucket count.
    pub index_locks: usize,
    /// Free memory above which writers are never throttled.
    pub write_limit_max: u64,
    /// Verify frozen data whenever a reference is released.
    pub debug_checksums: bool,
    /// Background reclaim thread.
    pub reclaim: ReclaimConfig,
    /// Secondary-device tier.
    pub second_tier: SecondTierConfig,
}

impl ArcConfig {
    /// Derives a configuration for a host with `memory` bytes.
    pub fn for_memory(memory: u64) -> Self {
        let max_block_size = 128 * KIB;
        let max_size = if memory < 4 * GIB {
            memory / 4 * 3
        } else {
            memory - GIB
        };
        // The cache must always be able to hold two of the largest blocks
        let min_size = max_size.min(64 * MIB).max(2 * max_block_size);
        let max_size = max_size.max(min_size);
        ArcConfig {
            memory,
            max_size,
            min_size,
            max_block_size,
            average_block_size: 64 * KIB,
            ghost_unit: 64 * KIB,
            min_access_interval: Duration::from_millis(62),
            p_min_shift: 4,
            shrink_shift: 5,
            grow_retry: Duration::from_secs(60),
            index_buckets: 0,
            index_locks: 0,
            write_limit_max: memory >> 3,
            debug_checksums: false,
            reclaim: ReclaimConfig::default(),
            second_tier: SecondTierConfig::default(),
        }
    }

    /// A configuration sized in blocks rather than bytes, with background
    /// threads disabled. Useful for tests and simulations.
    pub fn for_blocks(blocks: u64, block_size: u64) -> Self {
        let size = blocks * block_size;
        ArcConfig {
            memory: size * 4,
            max_size: size,
            min_size: block_size.min(size),
            max_block_size: block_size,
            average_block_size: block_size,
            ghost_unit: block_size,
            min_access_interval: Duration::ZERO,
            index_buckets: MIN_INDEX_BUCKETS,
            index_locks: 16,
            write_limit_max: size,
            reclaim: ReclaimConfig {
                enabled: false,
                ..ReclaimConfig::default()
            },
            second_tier: SecondTierConfig {
                feed_enabled: false,
                ..SecondTierConfig::default()
            },
            ..ArcConfig::for_memory(size * 4)
        }
    }

    /// Bucket and lock counts of the identity index, both powers of two.
    pub fn index_geometry(&self) -> (usize, usize) {
        let buckets = if self.index_buckets > 0 {
            self.index_buckets.next_power_of_two()
        } else {
            let avg = self.average_block_size.max(1);
            let mut buckets = MIN_INDEX_BUCKETS;
            while (buckets as u64).saturating_mul(avg) < self.memory {
                buckets <<= 1;
            }
            buckets
        };
        let locks = if self.index_locks > 0 {
            self.index_locks.next_power_of_two()
        } else {
            (buckets / BUCKETS_PER_LOCK)
                .max(MIN_INDEX_LOCKS)
                .next_power_of_two()
        };
        (buckets, locks)
    }

    /// Returns a copy with inconsistent bounds repaired.
    pub(crate) fn normalized(&self) -> Self {
        let mut c = self.clone();
        c.max_block_size = c.max_block_size.max(1);
        c.max_size = c.max_size.max(c.max_block_size);
        c.min_size = c.min_size.clamp(1, c.max_size);
        c.ghost_unit = c.ghost_unit.max(1);
        c.p_min_shift = c.p_min_shift.clamp(1, 63);
        c.shrink_shift = c.shrink_shift.clamp(1, 63);
        c
    }
}

impl Default for ArcConfig {
    fn default() -> Self {
        ArcConfig::for_memory(GIB)
    }
}

impl fmt::Debug for ArcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArcConfig")
            .field("memory", &self.memory)
            .field("max_size", &self.max_size)
            .field("min_size", &self.min_size)
            .field("max_block_size", &self.max_block_size)
            .field("ghost_unit", &self.ghost_unit)
            .field("min_access_interval", &self.min_access_interval)
            .field("p_min_shift", &self.p_min_shift)
            .field("shrink_shift", &self.shrink_shift)
            .field("index", &self.index_geometry())
            .field("reclaim", &self.reclaim)
            .field("second_tier", &self.second_tier)
            .finish_non_exhaustive()
    }
}
