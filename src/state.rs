//! Replacement states and their eviction lists.
//!
//! The cache tracks four states. Two are live and hold data, two are ghosts
//! that only remember identities:
//!
//! ```text
//!                 second significant access
//!   ┌──────────┐ ─────────────────────────▶ ┌────────────┐
//!   │  Recent  │                            │  Frequent  │
//!   └────┬─────┘                            └─────┬──────┘
//!        │ evicted                                │ evicted
//!        ▼                                        ▼
//!   ┌──────────────┐                        ┌────────────────┐
//!   │ Recent-Ghost │                        │ Frequent-Ghost │
//!   └──────────────┘                        └────────────────┘
//! ```
//!
//! Each state owns an [`EvictList`] holding whatever in that state can be
//! evicted right now. The list is split in two halves that share one slot
//! arena: producers prepend to the *insert* half, the evictor drains the
//! *remove* half from its tail, and when the remove half runs dry the insert
//! half is spliced onto it in O(1). Every splice bumps the list generation;
//! a link stamped with the current generation is known to sit on the insert
//! half, which is all the move-to-front fast path needs to know.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::list::{Chain, List, NodeId};

/// One of the four replacement states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StateKind {
    /// Seen once (or re-read within the minimum access interval).
    Recent,
    /// History of blocks evicted from [`StateKind::Recent`].
    RecentGhost,
    /// Accessed again after the minimum access interval.
    Frequent,
    /// History of blocks evicted from [`StateKind::Frequent`].
    FrequentGhost,
}

impl StateKind {
    /// True for the two payload-free history states.
    pub fn is_ghost(self) -> bool {
        matches!(self, StateKind::RecentGhost | StateKind::FrequentGhost)
    }

    /// The ghost state a live state demotes into.
    pub fn ghost(self) -> StateKind {
        match self {
            StateKind::Recent | StateKind::RecentGhost => StateKind::RecentGhost,
            StateKind::Frequent | StateKind::FrequentGhost => StateKind::FrequentGhost,
        }
    }

    /// Short lowercase name used in metric keys.
    pub fn name(self) -> &'static str {
        match self {
            StateKind::Recent => "recent",
            StateKind::RecentGhost => "recent_ghost",
            StateKind::Frequent => "frequent",
            StateKind::FrequentGhost => "frequent_ghost",
        }
    }
}

/// Position of an element on an [`EvictList`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ListLink {
    id: NodeId,
    generation: u64,
}

/// Direction of a list walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Walk {
    /// Oldest first.
    FromTail,
    /// Newest first.
    FromHead,
}

/// What a list walk does with the element it was handed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Step {
    Keep,
    Unlink,
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Half {
    Insert,
    Remove,
}

struct Sublists<T> {
    arena: List<T>,
    insert: Chain,
    remove: Chain,
    generation: u64,
}

impl<T> Sublists<T> {
    fn chain(&self, half: Half) -> &Chain {
        match half {
            Half::Insert => &self.insert,
            Half::Remove => &self.remove,
        }
    }

    fn weight(&self) -> u64 {
        self.insert.weight() + self.remove.weight()
    }

    fn start(&self, walk: Walk, all: bool) -> Option<(Half, NodeId)> {
        let order: &[Half] = match (walk, all) {
            (Walk::FromTail, true) => &[Half::Remove, Half::Insert],
            (Walk::FromHead, true) => &[Half::Insert, Half::Remove],
            (_, false) => &[Half::Remove],
        };
        order.iter().find_map(|&half| {
            let chain = self.chain(half);
            let id = match walk {
                Walk::FromTail => self.arena.last(chain),
                Walk::FromHead => self.arena.first(chain),
            }?;
            Some((half, id))
        })
    }

    fn advance(&self, half: Half, id: NodeId, walk: Walk, all: bool) -> Option<(Half, NodeId)> {
        let within = match walk {
            Walk::FromTail => self.arena.prev(id),
            Walk::FromHead => self.arena.next(id),
        };
        if let Some(next) = within {
            return Some((half, next));
        }
        if !all {
            return None;
        }
        let other = match (walk, half) {
            (Walk::FromTail, Half::Remove) => Half::Insert,
            (Walk::FromHead, Half::Insert) => Half::Remove,
            _ => return None,
        };
        let chain = self.chain(other);
        let id = match walk {
            Walk::FromTail => self.arena.last(chain),
            Walk::FromHead => self.arena.first(chain),
        }?;
        Some((other, id))
    }
}

/// Guard proving the holder is the only scanner of an [`EvictList`].
pub(crate) type ScanGuard<'a> = MutexGuard<'a, ()>;

/// Split insert/remove eviction list.
///
/// Lock order: the scan lock is taken before the update lock. Producers only
/// ever take the update lock.
pub(crate) struct EvictList<T> {
    scan: Mutex<()>,
    update: Mutex<Sublists<T>>,
    /// Mirror of the summed weight, readable without locking.
    size: AtomicU64,
}

impl<T> Default for EvictList<T> {
    fn default() -> Self {
        EvictList::new()
    }
}

impl<T> EvictList<T> {
    pub(crate) fn new() -> Self {
        EvictList {
            scan: Mutex::new(()),
            update: Mutex::new(Sublists {
                arena: List::new(),
                insert: Chain::new(),
                remove: Chain::new(),
                generation: 0,
            }),
            size: AtomicU64::new(0),
        }
    }

    /// Bytes (live states) or entries (ghost states) on the list.
    pub(crate) fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    /// Number of elements on both halves.
    pub(crate) fn len(&self) -> usize {
        let g = self.update.lock();
        g.insert.len() + g.remove.len()
    }

    #[cfg(test)]
    pub(crate) fn generation(&self) -> u64 {
        self.update.lock().generation
    }

    fn publish(&self, sub: &Sublists<T>) {
        self.size.store(sub.weight(), Ordering::Relaxed);
    }

    pub(crate) fn lock_scan(&self) -> ScanGuard<'_> {
        self.scan.lock()
    }

    pub(crate) fn try_lock_scan(&self) -> Option<ScanGuard<'_>> {
        self.scan.try_lock()
    }

    /// Makes `val` the newest element of the list.
    ///
    /// `link` is the element's current position, if any. A link on the insert
    /// half is moved to the front in place; a link on the remove half is
    /// unhooked and the element re-added. The value is only consumed when a
    /// new slot is needed.
    pub(crate) fn insert(&self, link: Option<ListLink>, val: T, weight: u64) -> ListLink {
        let mut g = self.update.lock();
        let sub = &mut *g;
        if let Some(link) = link {
            if link.generation == sub.generation {
                if sub.arena.move_to_front(&mut sub.insert, link.id) {
                    return link;
                }
            } else {
                sub.arena.remove(&mut sub.remove, link.id);
            }
        }
        let id = sub.arena.add(&mut sub.insert, val, weight);
        let generation = sub.generation;
        self.publish(sub);
        ListLink { id, generation }
    }

    /// Unlinks the element at `link`. Returns `None` if it was already gone.
    pub(crate) fn remove(&self, link: ListLink) -> Option<T> {
        let mut g = self.update.lock();
        let sub = &mut *g;
        let removed = if link.generation == sub.generation {
            sub.arena.remove(&mut sub.insert, link.id)
        } else {
            sub.arena.remove(&mut sub.remove, link.id)
        };
        self.publish(sub);
        removed.map(|(val, _)| val)
    }

    /// Splices the insert half onto the front of the remove half and starts
    /// a new generation.
    pub(crate) fn collect(&self, _scan: &ScanGuard<'_>) {
        let mut g = self.update.lock();
        let sub = &mut *g;
        sub.arena.splice_front(&mut sub.remove, &mut sub.insert);
        sub.generation += 1;
    }

    /// Splices only when the remove half has been drained.
    pub(crate) fn collect_if_drained(&self, scan: &ScanGuard<'_>) {
        if self.update.lock().remove.is_empty() {
            self.collect(scan);
        }
    }

    /// Walks the list handing every element to `f` under the update lock.
    ///
    /// With `all` unset only the remove half is visited. The update lock is
    /// released between elements so producers are never held off for a whole
    /// walk. If the element the walk would continue from disappears in the
    /// meantime the walk restarts at the end it began from; the total number
    /// of steps is bounded by the list length at the start.
    pub(crate) fn walk<F>(&self, _scan: &ScanGuard<'_>, walk: Walk, all: bool, mut f: F)
    where
        F: FnMut(&T) -> Step,
    {
        let budget = {
            let g = self.update.lock();
            if all {
                g.insert.len() + g.remove.len()
            } else {
                g.remove.len()
            }
        };
        let mut cursor = None;
        let mut restart = true;
        for _ in 0..budget {
            let mut g = self.update.lock();
            let sub = &mut *g;
            let pos = match cursor {
                Some((half, id)) if sub.arena.contains(id) => Some((half, id)),
                Some(_) => sub.start(walk, all),
                None if restart => sub.start(walk, all),
                None => None,
            };
            restart = false;
            let Some((half, id)) = pos else {
                break;
            };
            let step = match sub.arena.get(id) {
                Some(val) => f(val),
                None => break,
            };
            cursor = sub.advance(half, id, walk, all);
            match step {
                Step::Keep => {}
                Step::Unlink => {
                    match half {
                        Half::Insert => sub.arena.remove(&mut sub.insert, id),
                        Half::Remove => sub.arena.remove(&mut sub.remove, id),
                    };
                    self.publish(sub);
                }
                Step::Stop => break,
            }
        }
    }

    #[cfg(test)]
    /// Clones every element, newest first.
    pub(crate) fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        let g = self.update.lock();
        g.arena
            .iter(&g.insert)
            .chain(g.arena.iter(&g.remove))
            .cloned()
            .collect()
    }
}

impl<T> fmt::Debug for EvictList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvictList")
            .field("size", &self.size())
            .finish()
    }
}

/// A replacement state: its resident size and its eviction list.
pub(crate) struct ArcState<T> {
    pub(crate) kind: StateKind,
    /// Bytes held in this state (live) or number of ghosts (ghost states),
    /// whether or not they are currently evictable.
    size: AtomicU64,
    pub(crate) list: EvictList<T>,
}

impl<T> ArcState<T> {
    pub(crate) fn new(kind: StateKind) -> Self {
        ArcState {
            kind,
            size: AtomicU64::new(0),
            list: EvictList::new(),
        }
    }

    pub(crate) fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub(crate) fn add_size(&self, n: u64) {
        self.size.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn sub_size(&self, n: u64) {
        let _ = self
            .size
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(n))
            });
    }

    /// Bytes (or ghosts) that could be evicted right now.
    pub(crate) fn evictable(&self) -> u64 {
        self.list.size()
    }
}

impl<T> fmt::Debug for ArcState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArcState")
            .field("kind", &self.kind)
            .field("size", &self.size())
            .field("evictable", &self.evictable())
            .finish()
    }
}
