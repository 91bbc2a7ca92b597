//! Identity Index
//!
//! A sharded hash table from [`BlockId`] to either a live [`ArcBuf`] or a
//! [`Ghost`]. The identity is hashed once to pick a shard; each shard is a
//! `hashbrown` map behind its own mutex, so many logical buckets share one
//! lock and the lock count stays bounded however large the table grows.
//!
//! ```text
//!              hash(id) & mask
//!   BlockId ───────────────────▶ ┌─────────────────────────────┐
//!                                │ shard 0: Mutex<HashMap<..>> │
//!                                │ shard 1: Mutex<HashMap<..>> │
//!                                │   ...                       │
//!                                │ shard N-1                   │
//!                                └─────────────────────────────┘
//! ```
//!
//! The guard returned by [`IdentityIndex::lock`] is the "bucket lock" of the
//! cache's lock order: it is taken before any buffer lock, and code that
//! already holds a buffer lock may only ever try-lock a bucket.

use core::fmt;
use core::hash::BuildHasher;
use std::sync::Arc;

use hashbrown::{DefaultHashBuilder, HashMap};
use parking_lot::{Mutex, MutexGuard};

use crate::buf::{ArcBuf, Ghost};
use crate::l2::L2Record;
use crate::BlockId;

/// What the index holds for an identity.
#[derive(Clone, Debug)]
pub(crate) enum Slot {
    Live(Arc<ArcBuf>),
    Ghost(Arc<Ghost>),
}

/// Result of [`IdentityIndex::find`].
#[derive(Debug)]
pub(crate) enum Lookup {
    /// Live buffer, returned with an extra hold the caller must release.
    Live(Arc<ArcBuf>),
    /// Ghost entry; carries the second-tier copy if one is still valid.
    Ghost {
        ghost: Arc<Ghost>,
        l2: Option<Arc<L2Record>>,
    },
    Miss,
}

/// One lock's worth of buckets.
pub(crate) struct Shard {
    map: HashMap<BlockId, Slot>,
}

impl Shard {
    pub(crate) fn get(&self, id: &BlockId) -> Option<&Slot> {
        self.map.get(id)
    }

    /// Inserts or replaces in place. Returns the previous slot.
    pub(crate) fn insert(&mut self, id: BlockId, slot: Slot) -> Option<Slot> {
        self.map.insert(id, slot)
    }

    /// Removes the entry only if it is exactly `buf`.
    pub(crate) fn remove_live(&mut self, buf: &Arc<ArcBuf>) -> bool {
        match self.map.get(&buf.id) {
            Some(Slot::Live(cur)) if Arc::ptr_eq(cur, buf) => {
                self.map.remove(&buf.id);
                true
            }
            _ => false,
        }
    }

    /// Removes the entry only if it is exactly `ghost`.
    pub(crate) fn remove_ghost(&mut self, ghost: &Arc<Ghost>) -> bool {
        match self.map.get(&ghost.id) {
            Some(Slot::Ghost(cur)) if Arc::ptr_eq(cur, ghost) => {
                self.map.remove(&ghost.id);
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}

/// Guard over the shard owning an identity.
pub(crate) type Bucket<'a> = MutexGuard<'a, Shard>;

/// The sharded identity table.
pub(crate) struct IdentityIndex {
    shards: Box<[Mutex<Shard>]>,
    hash_builder: DefaultHashBuilder,
    mask: usize,
    buckets: usize,
}

impl IdentityIndex {
    /// Builds a table of `buckets` spread across `locks` shards. Both are
    /// rounded up to powers of two.
    pub(crate) fn new(buckets: usize, locks: usize) -> Self {
        let locks = locks.max(1).next_power_of_two();
        let buckets = buckets.max(locks).next_power_of_two();
        let hash_builder = DefaultHashBuilder::default();
        let per_shard = buckets / locks;
        let shards: Vec<_> = (0..locks)
            .map(|_| {
                Mutex::new(Shard {
                    map: HashMap::with_capacity_and_hasher(per_shard, hash_builder.clone()),
                })
            })
            .collect();
        IdentityIndex {
            shards: shards.into_boxed_slice(),
            hash_builder,
            mask: locks - 1,
            buckets,
        }
    }

    #[inline]
    fn shard_index(&self, id: &BlockId) -> usize {
        (self.hash_builder.hash_one(id) as usize) & self.mask
    }

    /// Locks the bucket owning `id`.
    pub(crate) fn lock(&self, id: &BlockId) -> Bucket<'_> {
        self.shards[self.shard_index(id)].lock()
    }

    /// Locks the bucket owning `id` if nobody else holds it.
    pub(crate) fn try_lock(&self, id: &BlockId) -> Option<Bucket<'_>> {
        self.shards[self.shard_index(id)].try_lock()
    }

    /// Looks `id` up. A live hit is returned with a hold taken under the
    /// bucket lock so it cannot be evicted before the caller gets to it.
    pub(crate) fn find(&self, id: &BlockId) -> Lookup {
        let bucket = self.lock(id);
        match bucket.get(id) {
            Some(Slot::Live(buf)) => {
                buf.hold();
                Lookup::Live(Arc::clone(buf))
            }
            Some(Slot::Ghost(ghost)) => Lookup::Ghost {
                ghost: Arc::clone(ghost),
                l2: ghost.l2.as_ref().filter(|r| r.is_valid()).cloned(),
            },
            None => Lookup::Miss,
        }
    }

    /// Reads the slot for `id` without taking any hold.
    pub(crate) fn peek(&self, id: &BlockId) -> Option<Slot> {
        self.lock(id).get(id).cloned()
    }

    /// Logical bucket count the table was sized for.
    pub(crate) fn buckets(&self) -> usize {
        self.buckets
    }

    pub(crate) fn locks(&self) -> usize {
        self.shards.len()
    }

    #[cfg(test)]
    /// Entries across all shards. Locks every shard in turn.
    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}

impl fmt::Debug for IdentityIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityIndex")
            .field("buckets", &self.buckets)
            .field("locks", &self.shards.len())
            .finish()
    }
}
