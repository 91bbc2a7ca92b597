//! Live buffers and ghost entries.
//!
//! An [`ArcBuf`] owns one block's data while it is cached. Its immutable parts
//! (identity, size, class) are plain fields; everything that changes is kept
//! behind one per-buffer mutex in [`BufState`]. The hold count and the hashed
//! flag are atomics so lookups under a bucket lock never need the buffer lock.
//!
//! A buffer's hold count includes one hold for being hashed. A buffer is
//! *referenced* when it has holds beyond that or any inactive references; only
//! unreferenced buffers sit on an eviction list.
//!
//! A [`Ghost`] is what is left after eviction: identity and a few flags, no
//! data. Ghosts are immutable once created.

use core::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::l2::L2Record;
use crate::reference::RefCore;
use crate::state::{ListLink, StateKind};
use crate::BlockId;

/// Content checksum of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Checksum(u32);

impl Checksum {
    pub(crate) fn of(data: &[u8]) -> Self {
        Checksum(crc32fast::hash(data))
    }
}

/// Mutable part of a buffer, guarded by the buffer lock.
pub(crate) struct BufState {
    /// Recent or Frequent; ghosts never have a `BufState`.
    pub(crate) kind: StateKind,
    /// `None` once the data has been freed or stolen.
    pub(crate) data: Option<Arc<Vec<u8>>>,
    /// `None` until the first demand access.
    pub(crate) last_access: Option<Instant>,
    pub(crate) prefetched: bool,
    /// Never copy to the second tier.
    pub(crate) no_l2: bool,
    pub(crate) checksum: Option<Checksum>,
    /// Copy of this block on a secondary device.
    pub(crate) l2: Option<Arc<L2Record>>,
    /// Position on the owning state's eviction list.
    pub(crate) link: Option<ListLink>,
    /// References that were inactivated and may come back.
    pub(crate) inactive: Vec<Arc<RefCore>>,
}

/// A cached block.
pub(crate) struct ArcBuf {
    pub(crate) id: BlockId,
    pub(crate) size: u64,
    pub(crate) meta: bool,
    /// Shared zero buffer handed out for holes; never hashed or evicted.
    pub(crate) hole: bool,
    holds: AtomicU64,
    hashed: AtomicBool,
    pub(crate) state: Mutex<BufState>,
}

impl ArcBuf {
    /// A new unhashed Recent buffer owning `data`.
    pub(crate) fn new(id: BlockId, meta: bool, data: Vec<u8>) -> Self {
        ArcBuf {
            id,
            size: data.len() as u64,
            meta,
            hole: false,
            holds: AtomicU64::new(0),
            hashed: AtomicBool::new(false),
            state: Mutex::new(BufState {
                kind: StateKind::Recent,
                data: Some(Arc::new(data)),
                last_access: None,
                prefetched: false,
                no_l2: false,
                checksum: None,
                l2: None,
                link: None,
                inactive: Vec::new(),
            }),
        }
    }

    /// A permanently held zero buffer of `size` bytes.
    pub(crate) fn hole(meta: bool, size: u64) -> Self {
        let mut buf = ArcBuf::new(BlockId::ANONYMOUS, meta, vec![0; size as usize]);
        buf.hole = true;
        buf.holds = AtomicU64::new(1);
        buf.state.get_mut().kind = StateKind::Frequent;
        buf
    }

    pub(crate) fn holds(&self) -> u64 {
        self.holds.load(Ordering::Acquire)
    }

    /// Takes a hold. Returns the new count.
    pub(crate) fn hold(&self) -> u64 {
        self.holds.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops a hold. Returns the new count. Callers go through
    /// `ArcCore::rele` so the buffer is queued or freed when it should be.
    pub(crate) fn drop_hold(&self) -> u64 {
        let prev = self.holds.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "hold count underflow on {:?}", self.id);
        prev.saturating_sub(1)
    }

    pub(crate) fn is_hashed(&self) -> bool {
        self.hashed.load(Ordering::Acquire)
    }

    /// Only changed under the bucket lock of `self.id`.
    pub(crate) fn set_hashed(&self, hashed: bool) {
        self.hashed.store(hashed, Ordering::Release);
    }

    /// Holds beyond the one owned by the index.
    pub(crate) fn active_holds(&self) -> u64 {
        self.holds().saturating_sub(self.is_hashed() as u64)
    }

    /// True when someone other than the index cares about this buffer.
    pub(crate) fn is_referenced(&self, st: &BufState) -> bool {
        !st.inactive.is_empty() || self.active_holds() > 0
    }
}

impl fmt::Debug for ArcBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArcBuf")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("meta", &self.meta)
            .field("holds", &self.holds())
            .field("hashed", &self.is_hashed())
            .finish_non_exhaustive()
    }
}

/// Payload-free record of an evicted buffer.
#[derive(Debug)]
pub(crate) struct Ghost {
    pub(crate) id: BlockId,
    /// Came from Frequent rather than Recent.
    pub(crate) frequent: bool,
    /// Was prefetched and never read on demand. Only second-tier ghosts can
    /// carry this; a hit on one does not promote.
    pub(crate) prefetched: bool,
    /// Payload still readable from a secondary device. Such ghosts live only
    /// in the index and on the device's record list, not on a ghost list.
    pub(crate) l2: Option<Arc<L2Record>>,
}

impl Ghost {
    pub(crate) fn kind(&self) -> StateKind {
        if self.frequent {
            StateKind::FrequentGhost
        } else {
            StateKind::RecentGhost
        }
    }
}
