//! Eviction: freeing live buffers, trimming ghost history and bringing the
//! cache back under its target.
//!
//! The evictor walks a state's eviction list from the oldest end while holding
//! the list's scan lock. Everything it needs beyond that is only try-locked;
//! a busy buffer or bucket is skipped and counted in `mutex_miss`.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::arc::ArcCore;
use crate::buf::{ArcBuf, Ghost};
use crate::state::{StateKind, Step, Walk};

/// Outcome of trying to evict one buffer.
enum Evicted {
    /// Data freed; carries the byte count.
    Freed(u64),
    /// Re-referenced since it was listed; dropped from the list.
    Busy,
    /// A lock could not be taken; left in place.
    Contended,
}

impl ArcCore {
    /// Evicts at least `bytes` from the live state `kind`, oldest first.
    ///
    /// With `nowait` the call gives up immediately if another thread is
    /// already scanning the list. Returns the bytes freed.
    pub(crate) fn evict_bytes(&self, kind: StateKind, bytes: u64, nowait: bool) -> u64 {
        if bytes == 0 {
            return 0;
        }
        let state = self.live(kind);
        let scan = if nowait {
            match state.list.try_lock_scan() {
                Some(scan) => scan,
                None => return 0,
            }
        } else {
            state.list.lock_scan()
        };

        let mut evicted = 0;
        let mut skipped = 0u64;
        // The remove half, then whatever accumulated on the insert half
        for _ in 0..2 {
            state.list.collect_if_drained(&scan);
            state.list.walk(&scan, Walk::FromTail, false, |buf| {
                if evicted >= bytes {
                    return Step::Stop;
                }
                match self.evict_buf(buf) {
                    Evicted::Freed(n) => {
                        evicted += n;
                        Step::Unlink
                    }
                    Evicted::Busy => Step::Unlink,
                    Evicted::Contended => {
                        skipped += 1;
                        Step::Keep
                    }
                }
            });
            if evicted >= bytes || state.list.size() == 0 || skipped > 0 {
                break;
            }
        }
        drop(scan);

        if evicted > 0 {
            self.set_warm();
            self.stats.evicted_bytes.add(evicted);
        }
        trace!(state = kind.name(), wanted = bytes, evicted, skipped, "evict_bytes");
        evicted
    }

    fn evict_buf(&self, buf: &Arc<ArcBuf>) -> Evicted {
        let Some(mut st) = buf.state.try_lock() else {
            self.stats.mutex_miss.inc();
            return Evicted::Contended;
        };
        if buf.holds() == 0 {
            // Unhashed and released while still listed
            st.link = None;
            self.free_data(buf, &mut st);
            self.destroy(&mut st);
            return Evicted::Freed(buf.size);
        }
        let Some(mut bucket) = self.index.try_lock(&buf.id) else {
            self.stats.mutex_miss.inc();
            return Evicted::Contended;
        };
        if buf.active_holds() > 0 {
            st.link = None;
            self.stats.evict_skip.inc();
            return Evicted::Busy;
        }
        while let Some(core) = st.inactive.last() {
            if !self.try_queue(core) {
                self.stats.mutex_miss.inc();
                return Evicted::Contended;
            }
            st.inactive.pop();
        }
        st.link = None;
        self.free_data(buf, &mut st);
        self.kill_buf(buf, &mut st, &mut bucket, true);
        Evicted::Freed(buf.size)
    }

    /// Removes up to `count` hashed ghosts of `kind`, oldest first; `None`
    /// removes them all. Stale entries for ghosts that were already replaced
    /// are dropped along the way without counting.
    pub(crate) fn evict_ghosts(&self, kind: StateKind, count: Option<u64>) -> u64 {
        let state = self.ghost(kind);
        let scan = state.list.lock_scan();
        state.list.collect(&scan);
        let mut removed = 0;
        state.list.walk(&scan, Walk::FromTail, false, |ghost| {
            if count.is_some_and(|n| removed >= n) {
                return Step::Stop;
            }
            let Some(mut bucket) = self.index.try_lock(&ghost.id) else {
                self.stats.mutex_miss.inc();
                return Step::Keep;
            };
            if bucket.remove_ghost(ghost) {
                removed += 1;
                state.sub_size(1);
                self.stats.hash_elements.sub(1);
                self.stats.deleted.inc();
            }
            Step::Unlink
        });
        removed
    }

    /// Brings the cache back under its target: Recent first, down to its
    /// share, then Frequent, then the ghost lists.
    pub(crate) fn adjust(&self) {
        let c = self.targets.target();
        let p = self.targets.recency_share();
        let over = self.size().saturating_sub(c);
        let recent_over = (self.anon_size() + self.recent.size()).saturating_sub(p);
        let from_recent = over.min(recent_over);
        if from_recent > 0 {
            self.evict_bytes(StateKind::Recent, from_recent, false);
        }
        let over = self.size().saturating_sub(self.targets.target());
        if over > 0 {
            self.evict_bytes(StateKind::Frequent, over, false);
        }
        self.adjust_ghosts();
    }

    /// Keeps Recent plus its ghosts within the target, and both ghost lists
    /// together within the target, counting each ghost as one ghost unit.
    fn adjust_ghosts(&self) {
        let c = self.targets.target();
        let unit = self.config.ghost_unit;
        let recent_total = self
            .recent
            .size()
            .saturating_add(self.recent_ghost.list.size().saturating_mul(unit));
        if recent_total > c {
            let n = (recent_total - c).div_ceil(unit);
            self.evict_ghosts(StateKind::RecentGhost, Some(n));
        }
        let ghosts = (self.recent_ghost.list.size() + self.frequent_ghost.list.size()).saturating_mul(unit);
        if ghosts > c {
            let n = (ghosts - c).div_ceil(unit);
            self.evict_ghosts(StateKind::FrequentGhost, Some(n));
        }
    }

    /// Evicts every unreferenced buffer, or with `pool` set destroys every
    /// unreferenced buffer and ghost of that pool. Referenced buffers stay.
    pub(crate) fn flush(&self, pool: Option<u64>) {
        for kind in [StateKind::Recent, StateKind::Frequent] {
            let state = self.live(kind);
            let victims: Vec<Arc<ArcBuf>> = {
                let scan = state.list.lock_scan();
                state.list.collect(&scan);
                let mut victims = Vec::new();
                state.list.walk(&scan, Walk::FromTail, true, |buf| {
                    if pool.map_or(true, |p| buf.id.pool == p) {
                        victims.push(Arc::clone(buf));
                    }
                    Step::Keep
                });
                victims
            };
            for buf in victims {
                self.flush_buf(&buf, pool.is_none());
            }
        }

        match pool {
            None => {
                self.evict_ghosts(StateKind::RecentGhost, None);
                self.evict_ghosts(StateKind::FrequentGhost, None);
            }
            Some(pool) => {
                for kind in [StateKind::RecentGhost, StateKind::FrequentGhost] {
                    self.drop_pool_ghosts(kind, pool);
                }
                self.l2_evict_pool(pool);
            }
        }
        self.do_user_evicts();
        debug!(?pool, size = self.size(), "flushed");
    }

    fn flush_buf(&self, buf: &Arc<ArcBuf>, allow_ghost: bool) {
        let mut bucket = self.index.lock(&buf.id);
        let mut st = buf.state.lock();
        if st.link.is_none() {
            return;
        }
        if buf.holds() == 0 {
            self.remove_from_evictables(&mut st);
            self.free_data(buf, &mut st);
            self.destroy(&mut st);
            return;
        }
        if buf.active_holds() > 0 {
            return;
        }
        while let Some(core) = st.inactive.last() {
            if !self.try_queue(core) {
                return;
            }
            st.inactive.pop();
        }
        self.remove_from_evictables(&mut st);
        self.free_data(buf, &mut st);
        if !allow_ghost {
            if let Some(rec) = st.l2.take() {
                rec.invalidate();
            }
        }
        self.kill_buf(buf, &mut st, &mut bucket, allow_ghost);
    }

    fn drop_pool_ghosts(&self, kind: StateKind, pool: u64) {
        let state = self.ghost(kind);
        let doomed: Vec<Arc<Ghost>> = {
            let scan = state.list.lock_scan();
            state.list.collect(&scan);
            let mut doomed = Vec::new();
            state.list.walk(&scan, Walk::FromTail, false, |ghost| {
                if ghost.id.pool == pool {
                    doomed.push(Arc::clone(ghost));
                    Step::Unlink
                } else {
                    Step::Keep
                }
            });
            doomed
        };
        for ghost in doomed {
            if self.index.lock(&ghost.id).remove_ghost(&ghost) {
                state.sub_size(1);
                self.stats.hash_elements.sub(1);
                self.stats.deleted.inc();
            }
        }
    }
}
