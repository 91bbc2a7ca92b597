//! Adaptive Sizing Controller
//!
//! Two numbers steer the whole cache:
//!
//! - `c`, the target size, bounded by `[c_min, c_max]`. It grows while the
//!   cache fills and memory is plentiful, and shrinks under pressure.
//! - `p`, the share of `c` that recency (Recent plus anonymous data) may use.
//!   Frequent gets the rest.
//!
//! `p` moves on every ghost hit: a Recent-Ghost hit means Recent was too
//! small, so `p` grows; a Frequent-Ghost hit shrinks it. The step is the size
//! of the block, multiplied by the ratio of the two ghost lists when the list
//! that was hit is the smaller one, so a lopsided history converges quickly.
//!
//! ```text
//!   0        p_min                                  p_max        c
//!   ├──────────┼──────────────── p ───────────────────┼──────────┤
//!              └── c >> p_min_shift       c - (c >> p_min_shift) ┘
//! ```
//!
//! All fields are atomics updated with compare-and-swap loops; the controller
//! never takes a lock.

use core::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::state::StateKind;

/// Target size and recency share of one cache.
pub(crate) struct Targets {
    c: AtomicU64,
    p: AtomicU64,
    c_min: u64,
    c_max: AtomicU64,
    no_grow: AtomicBool,
    p_min_shift: u32,
    shrink_shift: u32,
}

impl Targets {
    /// Starts at the maximum size with an even split.
    pub(crate) fn new(c_min: u64, c_max: u64, p_min_shift: u32, shrink_shift: u32) -> Self {
        Targets {
            c: AtomicU64::new(c_max),
            p: AtomicU64::new(c_max / 2),
            c_min,
            c_max: AtomicU64::new(c_max),
            no_grow: AtomicBool::new(false),
            p_min_shift,
            shrink_shift,
        }
    }

    /// `c`
    pub(crate) fn target(&self) -> u64 {
        self.c.load(Ordering::Relaxed)
    }

    /// `p`
    pub(crate) fn recency_share(&self) -> u64 {
        self.p.load(Ordering::Relaxed)
    }

    pub(crate) fn min(&self) -> u64 {
        self.c_min
    }

    pub(crate) fn max(&self) -> u64 {
        self.c_max.load(Ordering::Relaxed)
    }

    pub(crate) fn no_grow(&self) -> bool {
        self.no_grow.load(Ordering::Relaxed)
    }

    pub(crate) fn set_no_grow(&self, no_grow: bool) {
        self.no_grow.store(no_grow, Ordering::Relaxed);
    }

    fn p_bounds(&self, c: u64) -> (u64, u64) {
        let p_min = c >> self.p_min_shift;
        (p_min, c - p_min)
    }

    /// Shifts `p` after a hit on the ghost state `hit`.
    ///
    /// `recent_ghost` and `frequent_ghost` are the current ghost list sizes.
    pub(crate) fn adapt(&self, bytes: u64, hit: StateKind, recent_ghost: u64, frequent_ghost: u64) {
        let c = self.target();
        let (p_min, p_max) = self.p_bounds(c);
        match hit {
            StateKind::RecentGhost => {
                let mult = if recent_ghost > 0 && recent_ghost < frequent_ghost {
                    frequent_ghost / recent_ghost
                } else {
                    1
                };
                let delta = bytes.saturating_mul(mult);
                let _ = self.p.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| {
                    Some(p.saturating_add(delta).min(p_max).max(p))
                });
            }
            StateKind::FrequentGhost => {
                let mult = if frequent_ghost > 0 && frequent_ghost < recent_ghost {
                    recent_ghost / frequent_ghost
                } else {
                    1
                };
                let delta = bytes.saturating_mul(mult);
                let _ = self.p.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| {
                    Some(p.saturating_sub(delta).max(p_min).min(p))
                });
            }
            StateKind::Recent | StateKind::Frequent => {
                debug_assert!(false, "adapt called for live state {hit:?}");
            }
        }
    }

    /// Grows `c` by `size` when the cache is within two blocks of its target
    /// and growth is not frozen.
    pub(crate) fn maybe_grow(&self, size: u64, cache_size: u64, max_block: u64) {
        if self.no_grow() {
            return;
        }
        let c_max = self.max();
        let _ = self.c.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
            if c >= c_max || cache_size <= c.saturating_sub(2 * max_block) {
                None
            } else {
                Some(c.saturating_add(size).min(c_max))
            }
        });
    }

    /// True when an allocation of `size` must first make room.
    pub(crate) fn must_evict(&self, cache_size: u64) -> bool {
        self.no_grow() || cache_size >= self.target()
    }

    /// Picks the state to evict from for an allocation of `size` bytes:
    /// Recent when Frequent is within its share and Recent has enough
    /// evictable data, Frequent otherwise.
    pub(crate) fn choose_victim(&self, frequent_size: u64, recent_evictable: u64, size: u64) -> StateKind {
        let frequent_target = self.target().saturating_sub(self.recency_share());
        if frequent_size <= frequent_target && recent_evictable >= size {
            StateKind::Recent
        } else {
            StateKind::Frequent
        }
    }

    /// Shrinks `c` by one shrink step, never below `c_min`, and pulls `c`
    /// down to the current size if the cache is already smaller. Returns the
    /// size of the step.
    pub(crate) fn shrink(&self, cache_size: u64) -> u64 {
        let c = self.target();
        if c <= self.c_min {
            return 0;
        }
        let to_free = c >> self.shrink_shift;
        let _ = self.p.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| {
            Some(p - (p >> self.shrink_shift))
        });
        let mut new_c = c.saturating_sub(to_free).max(self.c_min);
        if new_c > cache_size {
            new_c = cache_size.max(self.c_min);
        }
        self.c.store(new_c, Ordering::Relaxed);
        let _ = self.p.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| {
            (p > new_c).then_some(new_c / 2)
        });
        to_free
    }

    /// Makes room for a large write reservation by raising `c` towards four
    /// times the reservation.
    pub(crate) fn grow_for_reservation(&self, reserve: u64) {
        if self.no_grow() {
            return;
        }
        let c = self.target();
        if reserve > c / 4 {
            let want = reserve.saturating_mul(4).min(self.max());
            if want > c {
                self.c.store(want, Ordering::Relaxed);
            }
        }
    }
}

impl fmt::Debug for Targets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Targets")
            .field("c", &self.target())
            .field("p", &self.recency_share())
            .field("c_min", &self.c_min)
            .field("c_max", &self.max())
            .field("no_grow", &self.no_grow())
            .finish()
    }
}
