//! The shared cache core.
//!
//! [`ArcCore`] is everything one cache instance owns: the index, the four
//! replacement states, the adaptive targets and the accounting. The public
//! [`BlockCache`](crate::BlockCache), every [`Reference`](crate::Reference)
//! and the background threads all point at it through an `Arc`.
//!
//! This file holds the buffer lifecycle: allocation of data blocks, hashing a
//! new buffer into the index, access and promotion, releasing holds, and the
//! conversion of an evicted buffer into a ghost. Eviction proper lives in
//! `evict.rs`, the reference protocol in `reference.rs`.
//!
//! # Lock order
//!
//! ```text
//!   reference ─▶ bucket ─▶ buffer ─▶ live list ─▶ ghost list ─▶ queue / stats
//! ```
//!
//! A list's scan lock comes before its update lock, and a second-tier device
//! lock before any list scan lock. Anything taken against this order is only
//! ever try-locked.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::trace;

use crate::adapt::Targets;
use crate::buf::{ArcBuf, BufState, Ghost};
use crate::config::ArcConfig;
use crate::error::{contract, CacheError, Result};
use crate::index::{IdentityIndex, Shard, Slot};
use crate::io::BlockIo;
use crate::l2::SecondTier;
use crate::metrics::ArcStats;
use crate::reclaim::{MemoryPressure, Reclaimer};
use crate::reference::RefCore;
use crate::state::{ArcState, StateKind};
use crate::throttle::Throttle;
use crate::BlockId;

pub(crate) struct ArcCore {
    pub(crate) config: ArcConfig,
    pub(crate) index: IdentityIndex,
    pub(crate) recent: ArcState<Arc<ArcBuf>>,
    pub(crate) frequent: ArcState<Arc<ArcBuf>>,
    pub(crate) recent_ghost: ArcState<Arc<Ghost>>,
    pub(crate) frequent_ghost: ArcState<Arc<Ghost>>,
    pub(crate) targets: Targets,
    /// Bytes of data owned by the cache, anonymous and resident.
    size: AtomicU64,
    /// Bytes owned by anonymous references.
    anon_size: AtomicU64,
    pub(crate) loaned: AtomicU64,
    pub(crate) io_pending: AtomicU64,
    pub(crate) io_writing: AtomicU64,
    pub(crate) throttle: Throttle,
    /// References whose buffer was evicted, waiting for their callback.
    pub(crate) evict_queue: Mutex<Vec<Arc<RefCore>>>,
    /// Zero buffers for data and metadata holes.
    holes: [Arc<ArcBuf>; 2],
    pub(crate) stats: ArcStats,
    pub(crate) io: Arc<dyn BlockIo>,
    pub(crate) pressure: Arc<dyn MemoryPressure>,
    pub(crate) reclaim: Reclaimer,
    pub(crate) l2: SecondTier,
    /// Set once the cache has had to evict; the second tier feeds more
    /// aggressively until then.
    warm: AtomicBool,
    pub(crate) shut_down: AtomicBool,
}

impl ArcCore {
    pub(crate) fn new(config: ArcConfig, io: Arc<dyn BlockIo>, pressure: Arc<dyn MemoryPressure>) -> Self {
        let config = config.normalized();
        let (buckets, locks) = config.index_geometry();
        let targets = Targets::new(
            config.min_size,
            config.max_size,
            config.p_min_shift,
            config.shrink_shift,
        );
        let holes = [
            Arc::new(ArcBuf::hole(false, config.max_block_size)),
            Arc::new(ArcBuf::hole(true, config.max_block_size)),
        ];
        ArcCore {
            index: IdentityIndex::new(buckets, locks),
            recent: ArcState::new(StateKind::Recent),
            frequent: ArcState::new(StateKind::Frequent),
            recent_ghost: ArcState::new(StateKind::RecentGhost),
            frequent_ghost: ArcState::new(StateKind::FrequentGhost),
            targets,
            size: AtomicU64::new(0),
            anon_size: AtomicU64::new(0),
            loaned: AtomicU64::new(0),
            io_pending: AtomicU64::new(0),
            io_writing: AtomicU64::new(0),
            throttle: Throttle::default(),
            evict_queue: Mutex::new(Vec::new()),
            holes,
            stats: ArcStats::default(),
            io,
            pressure,
            reclaim: Reclaimer::new(),
            l2: SecondTier::new(),
            warm: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            config,
        }
    }

    /// Live state for `kind`. Ghost kinds map to their live counterpart.
    pub(crate) fn live(&self, kind: StateKind) -> &ArcState<Arc<ArcBuf>> {
        match kind {
            StateKind::Recent | StateKind::RecentGhost => &self.recent,
            StateKind::Frequent | StateKind::FrequentGhost => &self.frequent,
        }
    }

    /// Ghost state for `kind`. Live kinds map to the state they demote into.
    pub(crate) fn ghost(&self, kind: StateKind) -> &ArcState<Arc<Ghost>> {
        match kind.ghost() {
            StateKind::FrequentGhost => &self.frequent_ghost,
            _ => &self.recent_ghost,
        }
    }

    pub(crate) fn hole(&self, meta: bool) -> &Arc<ArcBuf> {
        &self.holes[meta as usize]
    }

    pub(crate) fn holes(&self) -> &[Arc<ArcBuf>; 2] {
        &self.holes
    }

    pub(crate) fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub(crate) fn anon_size(&self) -> u64 {
        self.anon_size.load(Ordering::Relaxed)
    }

    pub(crate) fn add_anon(&self, n: u64) {
        self.anon_size.fetch_add(n, Ordering::Relaxed);
    }

    fn sub_anon(&self, n: u64) {
        let _ = self
            .anon_size
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(n)));
    }

    fn sub_size(&self, n: u64) {
        let _ = self
            .size
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(n)));
    }

    pub(crate) fn is_warm(&self) -> bool {
        self.warm.load(Ordering::Relaxed)
    }

    pub(crate) fn set_warm(&self) {
        self.warm.store(true, Ordering::Relaxed);
    }

    /// Makes room for `size` more bytes: grows the target if there is slack,
    /// otherwise evicts from whichever live state is over its share.
    fn make_room(&self, size: u64) {
        self.targets
            .maybe_grow(size, self.size(), self.config.max_block_size);
        if !self.targets.must_evict(self.size()) {
            return;
        }
        let victim = self
            .targets
            .choose_victim(self.frequent.size(), self.recent.evictable(), size);
        let evicted = self.evict_bytes(victim, size, true);
        if evicted < size || self.pressure.reclaim_needed() {
            self.reclaim.wake();
        }
    }

    /// Allocates a zeroed data block of `size` bytes, charged to anonymous
    /// data until it is handed to a buffer.
    pub(crate) fn alloc_block(&self, size: u64) -> Result<Vec<u8>> {
        contract!(
            size <= self.config.max_block_size,
            CacheError::BlockTooLarge { size, max: self.config.max_block_size }
        );
        self.make_room(size);
        let mut data = Vec::new();
        data.try_reserve_exact(size as usize)
            .map_err(|_| CacheError::OutOfMemory { size })?;
        data.resize(size as usize, 0);
        self.size.fetch_add(size, Ordering::Relaxed);
        self.add_anon(size);
        Ok(data)
    }

    /// Charges caller-supplied memory to anonymous data.
    pub(crate) fn adopt_block(&self, data: &[u8]) {
        let size = data.len() as u64;
        self.make_room(size);
        self.size.fetch_add(size, Ordering::Relaxed);
        self.add_anon(size);
    }

    /// Returns anonymous memory.
    pub(crate) fn free_block(&self, data: Vec<u8>) {
        let size = data.len() as u64;
        self.sub_size(size);
        self.sub_anon(size);
    }

    /// Wraps anonymous `data` in a new unhashed Recent buffer holding one
    /// hold for the caller.
    pub(crate) fn new_buf(&self, id: BlockId, meta: bool, data: Vec<u8>) -> Arc<ArcBuf> {
        let buf = Arc::new(ArcBuf::new(id, meta, data));
        self.sub_anon(buf.size);
        self.recent.add_size(buf.size);
        buf.hold();
        buf
    }

    /// Frees a buffer's data. The buffer must be off every list.
    pub(crate) fn free_data(&self, buf: &ArcBuf, st: &mut BufState) {
        if let Some(data) = st.data.take() {
            self.live(st.kind).sub_size(buf.size);
            self.sub_size(buf.size);
            drop(data);
        }
    }

    /// Final teardown of a buffer's bookkeeping; its data must be gone.
    pub(crate) fn destroy(&self, st: &mut BufState) {
        debug_assert!(st.link.is_none());
        debug_assert!(st.inactive.is_empty());
        if let Some(rec) = st.l2.take() {
            rec.invalidate();
        }
        st.checksum = None;
    }

    /// Puts an unreferenced buffer on its state's eviction list.
    pub(crate) fn add_to_evictables(&self, buf: &Arc<ArcBuf>, st: &mut BufState) {
        let state = self.live(st.kind);
        st.link = Some(state.list.insert(st.link, Arc::clone(buf), buf.size));
    }

    pub(crate) fn remove_from_evictables(&self, st: &mut BufState) {
        if let Some(link) = st.link.take() {
            self.live(st.kind).list.remove(link);
        }
    }

    /// Drops a hold while the buffer lock is held. The last active hold puts
    /// a hashed buffer on its eviction list; the very last hold of an
    /// unhashed buffer frees it.
    pub(crate) fn rele_locked(&self, buf: &Arc<ArcBuf>, st: &mut BufState) {
        let holds = buf.drop_hold();
        if buf.hole {
            return;
        }
        if buf.is_hashed() {
            if holds == 1 {
                self.add_to_evictables(buf, st);
            }
        } else if holds == 0 && st.link.is_none() && st.inactive.is_empty() {
            self.free_data(buf, st);
            self.destroy(st);
        }
    }

    pub(crate) fn rele(&self, buf: &Arc<ArcBuf>) {
        let mut st = buf.state.lock();
        self.rele_locked(buf, &mut st);
    }

    /// Records a demand access.
    ///
    /// A Recent buffer accessed again after the minimum interval moves to
    /// Frequent; accesses closer together than that count as one.
    pub(crate) fn access(&self, buf: &Arc<ArcBuf>, st: &mut BufState) {
        if buf.hole {
            return;
        }
        let now = Instant::now();
        match st.kind {
            StateKind::Recent => {
                let significant = st
                    .last_access
                    .map_or(true, |t| now.duration_since(t) >= self.config.min_access_interval);
                if significant {
                    if st.last_access.is_some() {
                        self.promote(buf, st);
                    }
                    st.last_access = Some(now);
                }
            }
            _ => st.last_access = Some(now),
        }
        st.prefetched = false;
    }

    /// Moves a buffer from Recent to Frequent.
    pub(crate) fn promote(&self, buf: &ArcBuf, st: &mut BufState) {
        if st.kind == StateKind::Frequent {
            return;
        }
        self.remove_from_evictables(st);
        if st.data.is_some() {
            self.recent.sub_size(buf.size);
            self.frequent.add_size(buf.size);
        }
        st.kind = StateKind::Frequent;
        trace!(id = ?buf.id, "promoted to frequent");
    }

    /// Hashes a new buffer into the index.
    ///
    /// If a live buffer with the same identity already exists it is returned
    /// with a hold and `buf` is left untouched. A ghost is replaced in place:
    /// the hit adapts the recency share, and with `promote` set the new
    /// buffer starts in Frequent unless the ghost was only ever prefetched.
    /// On success `buf` gains the index hold.
    pub(crate) fn hash_insert(&self, buf: &Arc<ArcBuf>, promote: bool) -> Option<Arc<ArcBuf>> {
        let mut bucket = self.index.lock(&buf.id);
        match bucket.get(&buf.id).cloned() {
            Some(Slot::Live(existing)) => {
                existing.hold();
                return Some(existing);
            }
            Some(Slot::Ghost(ghost)) => {
                bucket.insert(buf.id, Slot::Live(Arc::clone(buf)));
                let kind = ghost.kind();
                let state = self.ghost(kind);
                state.sub_size(1);
                match kind {
                    StateKind::FrequentGhost => self.stats.frequent_ghost_hits.inc(),
                    _ => self.stats.recent_ghost_hits.inc(),
                }
                self.targets.adapt(
                    buf.size,
                    kind,
                    self.recent_ghost.list.size(),
                    self.frequent_ghost.list.size(),
                );
                let mut st = buf.state.lock();
                if let Some(rec) = ghost.l2.as_ref().filter(|r| r.is_valid()) {
                    st.l2 = Some(Arc::clone(rec));
                }
                if promote && !ghost.prefetched {
                    self.promote(buf, &mut st);
                }
            }
            None => {
                bucket.insert(buf.id, Slot::Live(Arc::clone(buf)));
                self.stats.hash_elements.inc();
                self.stats.hash_elements_max.raise_to(self.stats.hash_elements.get());
            }
        }
        buf.set_hashed(true);
        buf.hold();
        None
    }

    /// Unhashes a buffer whose data has already been freed, leaving a ghost
    /// behind when it has a valid second-tier copy or (with `allow_ghost`)
    /// when it was ever accessed. Drops the index hold.
    pub(crate) fn kill_buf(&self, buf: &Arc<ArcBuf>, st: &mut BufState, bucket: &mut Shard, allow_ghost: bool) {
        debug_assert!(st.data.is_none());
        debug_assert!(st.inactive.is_empty());
        if !bucket.remove_live(buf) {
            return;
        }
        let state = self.ghost(st.kind);
        let l2 = st.l2.take().filter(|r| r.is_valid());
        let listed = l2.is_none();
        if l2.is_some() || (allow_ghost && st.last_access.is_some()) {
            let ghost = Arc::new(Ghost {
                id: buf.id,
                frequent: st.kind == StateKind::Frequent,
                prefetched: st.prefetched,
                l2,
            });
            bucket.insert(buf.id, Slot::Ghost(Arc::clone(&ghost)));
            state.add_size(1);
            if listed {
                state.list.insert(None, ghost, 1);
            }
        } else {
            self.stats.hash_elements.sub(1);
            self.stats.deleted.inc();
        }
        buf.set_hashed(false);
        buf.drop_hold();
        st.last_access = None;
        self.destroy(st);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryBlockIo;
    use crate::reclaim::NoPressure;

    fn core(blocks: u64) -> ArcCore {
        ArcCore::new(
            ArcConfig::for_blocks(blocks, 4),
            Arc::new(MemoryBlockIo::new()),
            Arc::new(NoPressure),
        )
    }

    fn hashed(core: &ArcCore, loc: u128) -> Arc<ArcBuf> {
        let data = core.alloc_block(4).unwrap();
        let buf = core.new_buf(BlockId::new(1, loc, 1), false, data);
        assert!(core.hash_insert(&buf, false).is_none());
        buf
    }

    #[test]
    fn test_alloc_accounts_anonymous() {
        let core = core(8);
        let block = core.alloc_block(4).unwrap();
        assert_eq!(core.size(), 4);
        assert_eq!(core.anon_size(), 4);
        core.free_block(block);
        assert_eq!(core.size(), 0);
        assert_eq!(core.anon_size(), 0);
    }

    #[cfg_attr(debug_assertions, should_panic)]
    #[test]
    fn test_alloc_rejects_oversized_block() {
        let core = core(8);
        assert!(matches!(
            core.alloc_block(5),
            Err(CacheError::BlockTooLarge { size: 5, max: 4 })
        ));
    }

    #[test]
    fn test_insert_and_release_makes_evictable() {
        let core = core(8);
        let buf = hashed(&core, 1);
        assert_eq!(buf.holds(), 2);
        assert_eq!(core.recent.size(), 4);
        assert_eq!(core.anon_size(), 0);
        assert_eq!(core.recent.evictable(), 0);

        core.rele(&buf);
        assert_eq!(core.recent.evictable(), 4);
        assert!(buf.state.lock().link.is_some());
    }

    #[test]
    fn test_duplicate_insert_returns_existing() {
        let core = core(8);
        let first = hashed(&core, 1);
        let data = core.alloc_block(4).unwrap();
        let second = core.new_buf(first.id, false, data);
        let existing = core.hash_insert(&second, false).expect("duplicate");
        assert!(Arc::ptr_eq(&existing, &first));
        assert_eq!(first.holds(), 3);

        // Releasing the loser frees its data right away
        core.rele(&second);
        assert_eq!(core.recent.size(), 4);
        assert_eq!(core.size(), 4);
    }

    #[test]
    fn test_second_access_promotes() {
        let core = core(8);
        let buf = hashed(&core, 1);
        let mut st = buf.state.lock();
        core.access(&buf, &mut st);
        assert_eq!(st.kind, StateKind::Recent);
        core.access(&buf, &mut st);
        assert_eq!(st.kind, StateKind::Frequent);
        drop(st);
        assert_eq!(core.recent.size(), 0);
        assert_eq!(core.frequent.size(), 4);
    }

    #[test]
    fn test_kill_leaves_ghost_only_when_accessed() {
        let core = core(8);
        let seen = hashed(&core, 1);
        let unseen = hashed(&core, 2);
        core.access(&seen, &mut seen.state.lock());

        for buf in [&seen, &unseen] {
            buf.drop_hold();
            let mut bucket = core.index.lock(&buf.id);
            let mut st = buf.state.lock();
            core.free_data(buf, &mut st);
            core.kill_buf(buf, &mut st, &mut bucket, true);
            assert!(!buf.is_hashed());
            assert_eq!(buf.holds(), 0);
        }

        assert!(matches!(core.index.peek(&seen.id), Some(Slot::Ghost(_))));
        assert!(core.index.peek(&unseen.id).is_none());
        assert_eq!(core.recent_ghost.size(), 1);
        assert_eq!(core.recent_ghost.list.size(), 1);
        assert_eq!(core.size(), 0);
    }

    #[test]
    fn test_ghost_hit_adapts_and_promotes() {
        let core = core(8);
        let buf = hashed(&core, 1);
        core.access(&buf, &mut buf.state.lock());
        buf.drop_hold();
        {
            let mut bucket = core.index.lock(&buf.id);
            let mut st = buf.state.lock();
            core.free_data(&buf, &mut st);
            core.kill_buf(&buf, &mut st, &mut bucket, true);
        }
        let p = core.targets.recency_share();

        let data = core.alloc_block(4).unwrap();
        let again = core.new_buf(buf.id, false, data);
        assert!(core.hash_insert(&again, true).is_none());
        assert_eq!(core.targets.recency_share(), p + 4);
        assert_eq!(again.state.lock().kind, StateKind::Frequent);
        assert_eq!(core.recent_ghost.size(), 0);
        assert_eq!(core.stats.recent_ghost_hits.get(), 1);
    }

    #[test]
    fn test_prefetched_ghost_hit_stays_recent() {
        let core = core(8);
        let id = BlockId::new(1, 5, 1);
        // As left behind by a prefetched buffer whose payload went to a
        // secondary device
        let ghost = Arc::new(Ghost {
            id,
            frequent: false,
            prefetched: true,
            l2: None,
        });
        core.index.lock(&id).insert(id, Slot::Ghost(ghost));
        core.recent_ghost.add_size(1);
        let p = core.targets.recency_share();

        let data = core.alloc_block(4).unwrap();
        let buf = core.new_buf(id, false, data);
        assert!(core.hash_insert(&buf, true).is_none());
        assert_eq!(buf.state.lock().kind, StateKind::Recent);
        assert_eq!(core.targets.recency_share(), p + 4);
        assert_eq!(core.recent_ghost.size(), 0);
    }
}
