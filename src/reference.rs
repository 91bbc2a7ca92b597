//! References: the caller-facing handles to cached data.
//!
//! A [`Reference`] is in exactly one of these situations:
//!
//! | Owner | Data | Meaning |
//! |-------|------|---------|
//! | anonymous | owned `Vec<u8>` | private, freely writable, not in the index |
//! | buffer | shared | reads the buffer's immutable data; holds the buffer |
//! | buffer | none | *inactive*: parked on the buffer, may be reactivated |
//! | queued | none | the buffer was evicted; the callback is pending |
//! | released | none | freed, or the callback already ran |
//!
//! Writing through a shared reference requires [`BlockCache::make_writable`]
//! first, which either steals the buffer's data (when nobody else can see it)
//! or copies it.
//!
//! Lock order: reference lock, then bucket lock, then buffer lock.
//!
//! [`BlockCache::make_writable`]: crate::BlockCache::make_writable

use core::fmt;
use std::mem;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::trace;

use crate::arc::ArcCore;
use crate::buf::{ArcBuf, BufState, Checksum};
use crate::error::{contract, CacheError, Result};
use crate::BlockId;

/// Receives eviction notices for inactivated references.
///
/// The handler runs on the reclaim thread, outside every cache lock, once the
/// buffer behind an inactive reference has been evicted. It must not assume
/// the reference can be reactivated.
pub trait EvictHandler: Send + Sync {
    /// Called with the context registered at inactivation.
    fn evicted(&self, context: u64);
}

impl<F> EvictHandler for F
where
    F: Fn(u64) + Send + Sync,
{
    fn evicted(&self, context: u64) {
        self(context)
    }
}

/// Registered eviction callback of an inactive reference.
#[derive(Clone)]
pub(crate) struct EvictCallback {
    handler: Arc<dyn EvictHandler>,
    context: u64,
}

impl EvictCallback {
    pub(crate) fn run(self) {
        self.handler.evicted(self.context);
    }
}

impl fmt::Debug for EvictCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvictCallback")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub(crate) enum Owner {
    Anonymous,
    Buffer(Arc<ArcBuf>),
    Queued,
    Released,
}

#[derive(Debug, Default)]
pub(crate) enum RefData {
    #[default]
    None,
    Shared(Arc<Vec<u8>>),
    Owned(Vec<u8>),
}

/// Accounting tag of a reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RefMode {
    Normal,
    OnLoan,
    WritePending,
    Writing,
}

#[derive(Debug)]
pub(crate) struct RefState {
    pub(crate) owner: Owner,
    pub(crate) data: RefData,
    pub(crate) size: u64,
    pub(crate) meta: bool,
    pub(crate) mode: RefMode,
    pub(crate) callback: Option<EvictCallback>,
    pub(crate) frozen: Option<Checksum>,
    /// Dropped by its holder while a write was in flight; the write
    /// completion releases it.
    pub(crate) orphaned: bool,
}

impl RefState {
    fn slice(&self) -> Option<&[u8]> {
        let size = self.size as usize;
        match &self.data {
            RefData::Shared(d) => d.get(..size),
            RefData::Owned(v) => v.get(..size),
            RefData::None => None,
        }
    }

    fn is_active(&self) -> bool {
        !matches!(self.data, RefData::None)
    }

    fn id(&self) -> BlockId {
        match &self.owner {
            Owner::Buffer(buf) => buf.id,
            _ => BlockId::ANONYMOUS,
        }
    }
}

/// Shared core of a reference; the index of inactive references and the
/// eviction queue point here.
#[derive(Debug)]
pub(crate) struct RefCore {
    pub(crate) state: RwLock<RefState>,
}

impl RefCore {
    fn new(state: RefState) -> Arc<Self> {
        Arc::new(RefCore {
            state: RwLock::new(state),
        })
    }
}

/// A handle to one block's worth of data.
///
/// Dropping an active reference releases it. Dropping an inactive one leaves
/// it to the reclaim thread, which runs its callback once the buffer is
/// evicted.
pub struct Reference {
    core: Arc<RefCore>,
    cache: Arc<ArcCore>,
}

impl Reference {
    pub(crate) fn new(core: Arc<RefCore>, cache: Arc<ArcCore>) -> Self {
        Reference { core, cache }
    }

    pub(crate) fn core(&self) -> &Arc<RefCore> {
        &self.core
    }

    /// Identity of the cached block, or the anonymous identity.
    pub fn id(&self) -> BlockId {
        self.core.state.read().id()
    }

    /// Size of the data in bytes.
    pub fn size(&self) -> u64 {
        self.core.state.read().size
    }

    /// True for metadata blocks.
    pub fn is_metadata(&self) -> bool {
        self.core.state.read().meta
    }

    /// True when the data is private to this reference.
    pub fn is_anonymous(&self) -> bool {
        matches!(self.core.state.read().owner, Owner::Anonymous)
    }

    /// True when this reference reads the shared zero block.
    pub fn is_hole(&self) -> bool {
        matches!(&self.core.state.read().owner, Owner::Buffer(b) if b.hole)
    }

    /// False once inactivated, evicted or freed.
    pub fn is_active(&self) -> bool {
        self.core.state.read().is_active()
    }

    /// Read access to the data; `None` when inactive.
    pub fn data(&self) -> Option<MappedRwLockReadGuard<'_, [u8]>> {
        RwLockReadGuard::try_map(self.core.state.read(), |s| s.slice()).ok()
    }

    /// Write access to anonymous data.
    pub fn data_mut(&self) -> Result<MappedRwLockWriteGuard<'_, [u8]>> {
        RwLockWriteGuard::try_map(self.core.state.write(), |s| match (&s.owner, &mut s.data) {
            (Owner::Anonymous, RefData::Owned(v)) => Some(&mut v[..]),
            _ => None,
        })
        .map_err(|_| CacheError::NotWritable)
    }

    /// Copies the data out.
    pub fn to_vec(&self) -> Option<Vec<u8>> {
        self.data().map(|d| d.to_vec())
    }
}

impl Drop for Reference {
    fn drop(&mut self) {
        let _ = self.cache.release_reference(&self.core, false);
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.core.state.read();
        f.debug_struct("Reference")
            .field("id", &s.id())
            .field("size", &s.size)
            .field("owner", &match s.owner {
                Owner::Anonymous => "anonymous",
                Owner::Buffer(ref b) if b.hole => "hole",
                Owner::Buffer(_) => "buffer",
                Owner::Queued => "queued",
                Owner::Released => "released",
            })
            .field("active", &s.is_active())
            .field("mode", &s.mode)
            .finish()
    }
}

impl ArcCore {
    /// New reference sharing `buf`'s data. Takes its own hold.
    pub(crate) fn share(self: &Arc<Self>, buf: &Arc<ArcBuf>, st: &BufState) -> Result<Reference> {
        let data = st.data.clone().ok_or(CacheError::NotFound)?;
        buf.hold();
        let core = RefCore::new(RefState {
            owner: Owner::Buffer(Arc::clone(buf)),
            data: RefData::Shared(data),
            size: buf.size,
            meta: buf.meta,
            mode: RefMode::Normal,
            callback: None,
            frozen: None,
            orphaned: false,
        });
        Ok(Reference::new(core, Arc::clone(self)))
    }

    /// Reference to the zero block of `size` bytes.
    pub(crate) fn hole_reference(self: &Arc<Self>, size: u64, meta: bool) -> Result<Reference> {
        let hole = Arc::clone(self.hole(meta));
        let st = hole.state.lock();
        let r = self.share(&hole, &st)?;
        r.core.state.write().size = size;
        Ok(r)
    }

    /// Private reference; `data` is adopted when given, otherwise `size`
    /// zeroed bytes are allocated.
    pub(crate) fn alloc_reference(
        self: &Arc<Self>,
        size: u64,
        meta: bool,
        data: Option<Vec<u8>>,
    ) -> Result<Reference> {
        let data = match data {
            Some(v) => {
                self.adopt_block(&v);
                v
            }
            None => self.alloc_block(size)?,
        };
        let core = RefCore::new(RefState {
            owner: Owner::Anonymous,
            size: data.len() as u64,
            data: RefData::Owned(data),
            meta,
            mode: RefMode::Normal,
            callback: None,
            frozen: None,
            orphaned: false,
        });
        Ok(Reference::new(core, Arc::clone(self)))
    }

    fn verify_frozen(&self, rs: &RefState) -> Result<()> {
        if !self.config.debug_checksums {
            return Ok(());
        }
        if let (Some(frozen), Some(data)) = (rs.frozen, rs.slice()) {
            contract!(Checksum::of(data) == frozen, CacheError::FrozenModified(rs.id()));
        }
        Ok(())
    }

    /// Makes the data private so it can be modified. Returns true when the
    /// data moved and any previously obtained slice is stale.
    pub(crate) fn make_writable(self: &Arc<Self>, r: &Reference, pending: bool) -> Result<bool> {
        let mut rs = r.core.state.write();
        contract!(rs.mode != RefMode::Writing, CacheError::InvalidReference("write in progress"));
        contract!(rs.is_active(), CacheError::InvalidReference("reference is inactive"));
        self.verify_frozen(&rs)?;
        rs.frozen = None;

        let changed = match rs.owner.clone() {
            Owner::Anonymous => false,
            Owner::Buffer(buf) if buf.hole => {
                let fresh = self.alloc_block(rs.size)?;
                rs.data = RefData::Owned(fresh);
                rs.owner = Owner::Anonymous;
                self.rele(&buf);
                true
            }
            Owner::Buffer(buf) => self.anonymize(&mut rs, &buf)?,
            Owner::Queued | Owner::Released => {
                contract!(false, CacheError::InvalidReference("reference was released"));
                false
            }
        };

        if pending && rs.mode != RefMode::WritePending {
            if rs.mode == RefMode::OnLoan {
                self.loaned.fetch_sub(rs.size, Ordering::Relaxed);
            }
            rs.mode = RefMode::WritePending;
            self.io_pending.fetch_add(rs.size, Ordering::Relaxed);
        }
        Ok(changed)
    }

    /// Detaches `rs` from `buf`, stealing the data when this reference is
    /// the buffer's only user and copying it otherwise.
    fn anonymize(&self, rs: &mut RefState, buf: &Arc<ArcBuf>) -> Result<bool> {
        {
            let mut bucket = self.index.lock(&buf.id);
            let mut st = buf.state.lock();
            if st.inactive.is_empty() && buf.active_holds() == 1 && st.data.is_some() {
                // Drop our share first so the buffer's data is uniquely owned
                rs.data = RefData::None;
                let shared = st.data.take().ok_or(CacheError::NotFound)?;
                self.remove_from_evictables(&mut st);
                self.live(st.kind).sub_size(buf.size);
                self.add_anon(buf.size);
                let (data, copied) = match Arc::try_unwrap(shared) {
                    Ok(v) => (v, false),
                    Err(still_shared) => ((*still_shared).clone(), true),
                };
                buf.drop_hold();
                if buf.is_hashed() {
                    self.kill_buf(buf, &mut st, &mut bucket, false);
                } else {
                    self.destroy(&mut st);
                }
                trace!(id = ?buf.id, copied, "stole buffer data");
                rs.data = RefData::Owned(data);
                rs.owner = Owner::Anonymous;
                return Ok(copied);
            }
        }

        let src = match &rs.data {
            RefData::Shared(d) => Arc::clone(d),
            _ => return Err(CacheError::InvalidReference("shared reference without data")),
        };
        let mut fresh = self.alloc_block(rs.size)?;
        let n = fresh.len().min(src.len());
        fresh[..n].copy_from_slice(&src[..n]);
        rs.data = RefData::Owned(fresh);
        rs.owner = Owner::Anonymous;
        self.rele(buf);
        Ok(true)
    }

    /// Parks an active shared reference on its buffer.
    pub(crate) fn inactivate(&self, r: &Reference, callback: EvictCallback) -> Result<()> {
        let mut rs = r.core.state.write();
        contract!(rs.is_active(), CacheError::InvalidReference("already inactive"));
        contract!(rs.callback.is_none(), CacheError::CallbackRegistered);
        let buf = match &rs.owner {
            Owner::Buffer(buf) => Arc::clone(buf),
            _ => {
                contract!(false, CacheError::InvalidReference("anonymous references cannot be inactivated"));
                return Ok(());
            }
        };
        self.verify_frozen(&rs)?;
        rs.data = RefData::None;
        rs.callback = Some(callback);

        let mut st = buf.state.lock();
        st.inactive.push(Arc::clone(&r.core));
        self.rele_locked(&buf, &mut st);
        Ok(())
    }

    /// Brings an inactive reference back. Fails with `NotFound` when the
    /// buffer was evicted in the meantime.
    pub(crate) fn reactivate(&self, r: &Reference) -> Result<()> {
        let mut rs = r.core.state.write();
        let buf = match &rs.owner {
            Owner::Buffer(buf) => Arc::clone(buf),
            Owner::Queued | Owner::Released => return Err(CacheError::NotFound),
            Owner::Anonymous => {
                contract!(false, CacheError::InvalidReference("anonymous references are never inactive"));
                return Ok(());
            }
        };
        contract!(!rs.is_active(), CacheError::InvalidReference("reference is active"));

        let mut st = buf.state.lock();
        let Some(pos) = st.inactive.iter().position(|c| Arc::ptr_eq(c, &r.core)) else {
            return Err(CacheError::NotFound);
        };
        let Some(data) = st.data.clone() else {
            return Err(CacheError::NotFound);
        };
        st.inactive.swap_remove(pos);
        buf.hold();
        rs.data = RefData::Shared(data);
        rs.callback = None;
        self.access(&buf, &mut st);
        self.stats.hits.inc();
        Ok(())
    }

    /// Gives up an inactive reference early. The buffer is destroyed if
    /// nothing else uses it.
    pub(crate) fn evict_reference(&self, r: &Reference) -> Result<()> {
        let mut rs = r.core.state.write();
        let buf = match &rs.owner {
            Owner::Released => return Err(CacheError::InProgress),
            Owner::Queued => {
                rs.callback = None;
                return Ok(());
            }
            Owner::Buffer(buf) => Arc::clone(buf),
            Owner::Anonymous => {
                contract!(false, CacheError::InvalidReference("anonymous references are never inactive"));
                return Ok(());
            }
        };
        contract!(!rs.is_active(), CacheError::InvalidReference("reference is active"));

        let mut bucket = self.index.lock(&buf.id);
        let mut st = buf.state.lock();
        st.inactive.retain(|c| !Arc::ptr_eq(c, &r.core));
        rs.owner = Owner::Released;
        rs.callback = None;
        if !buf.hole && buf.is_hashed() && !buf.is_referenced(&st) {
            self.remove_from_evictables(&mut st);
            self.free_data(buf.as_ref(), &mut st);
            self.kill_buf(&buf, &mut st, &mut bucket, false);
        }
        Ok(())
    }

    /// Releases a reference. `explicit` releases report contract violations;
    /// implicit ones (drop) skip inactive references silently.
    pub(crate) fn release_reference(&self, core: &Arc<RefCore>, explicit: bool) -> Result<()> {
        let mut rs = core.state.write();
        if matches!(rs.owner, Owner::Released) {
            return Ok(());
        }
        if rs.callback.is_some() {
            if explicit {
                contract!(false, CacheError::CallbackRegistered);
            }
            return Ok(());
        }
        if explicit {
            self.verify_frozen(&rs)?;
        }
        match rs.mode {
            RefMode::WritePending => {
                self.io_pending.fetch_sub(rs.size, Ordering::Relaxed);
            }
            RefMode::OnLoan => {
                self.loaned.fetch_sub(rs.size, Ordering::Relaxed);
            }
            RefMode::Writing => {
                contract!(!explicit, CacheError::InvalidReference("write in progress"));
                rs.orphaned = true;
                return Ok(());
            }
            RefMode::Normal => {}
        }
        rs.mode = RefMode::Normal;
        let owner = mem::replace(&mut rs.owner, Owner::Released);
        let data = mem::take(&mut rs.data);
        drop(rs);
        match owner {
            Owner::Anonymous => {
                if let RefData::Owned(v) = data {
                    self.free_block(v);
                }
            }
            Owner::Buffer(buf) => {
                drop(data);
                self.rele(&buf);
            }
            Owner::Queued | Owner::Released => {}
        }
        Ok(())
    }

    /// Private copy of any active reference.
    pub(crate) fn clone_reference(self: &Arc<Self>, r: &Reference) -> Result<Reference> {
        let (bytes, meta) = {
            let rs = r.core.state.read();
            let Some(src) = rs.slice() else {
                return Err(CacheError::InvalidReference("reference is inactive"));
            };
            (src.to_vec(), rs.meta)
        };
        self.alloc_reference(bytes.len() as u64, meta, Some(bytes))
    }

    /// Scratch buffer outside the replacement accounting.
    pub(crate) fn loan_buffer(self: &Arc<Self>, size: u64, meta: bool) -> Result<Reference> {
        let r = self.alloc_reference(size, meta, None)?;
        r.core.state.write().mode = RefMode::OnLoan;
        self.loaned.fetch_add(size, Ordering::Relaxed);
        Ok(r)
    }

    pub(crate) fn return_loan(&self, r: &Reference) -> Result<()> {
        let mut rs = r.core.state.write();
        contract!(rs.mode == RefMode::OnLoan, CacheError::InvalidReference("not on loan"));
        rs.mode = RefMode::Normal;
        self.loaned.fetch_sub(rs.size, Ordering::Relaxed);
        Ok(())
    }

    /// Another reference to the same data: a copy for anonymous data, a
    /// new share for cached data.
    pub(crate) fn loan_reference(self: &Arc<Self>, r: &Reference) -> Result<Reference> {
        let owner = r.core.state.read().owner.clone();
        let buf = match owner {
            Owner::Buffer(buf) => buf,
            Owner::Anonymous => return self.clone_reference(r),
            Owner::Queued | Owner::Released => return Err(CacheError::NotFound),
        };
        let st = buf.state.lock();
        let shared = self.share(&buf, &st)?;
        if buf.hole {
            shared.core.state.write().size = r.size();
        }
        Ok(shared)
    }

    /// Turns an anonymous reference into a reference to the zero block.
    pub(crate) fn make_hole(&self, r: &Reference) -> Result<()> {
        let mut rs = r.core.state.write();
        contract!(
            matches!(rs.owner, Owner::Anonymous) && matches!(rs.data, RefData::Owned(_)),
            CacheError::NotWritable
        );
        contract!(
            rs.size <= self.config.max_block_size,
            CacheError::BlockTooLarge { size: rs.size, max: self.config.max_block_size }
        );
        let hole = Arc::clone(self.hole(rs.meta));
        let zeros = hole.state.lock().data.clone().ok_or(CacheError::NotFound)?;
        if let RefData::Owned(v) = mem::replace(&mut rs.data, RefData::Shared(zeros)) {
            self.free_block(v);
        }
        hole.hold();
        rs.owner = Owner::Buffer(hole);
        rs.frozen = None;
        Ok(())
    }

    /// Records the data's checksum so later modification can be detected.
    pub(crate) fn freeze(&self, r: &Reference) -> Result<()> {
        let mut rs = r.core.state.write();
        let checksum = match &rs.owner {
            Owner::Buffer(buf) if !buf.hole => {
                let buf = Arc::clone(buf);
                let mut st = buf.state.lock();
                match st.checksum {
                    Some(c) => c,
                    None => {
                        let c = rs.slice().map(Checksum::of).ok_or(CacheError::NotFound)?;
                        st.checksum = Some(c);
                        c
                    }
                }
            }
            _ => rs
                .slice()
                .map(Checksum::of)
                .ok_or(CacheError::InvalidReference("reference is inactive"))?,
        };
        if let Some(prev) = rs.frozen {
            contract!(prev == checksum, CacheError::FrozenModified(rs.id()));
        }
        rs.frozen = Some(checksum);
        Ok(())
    }

    pub(crate) fn thaw(&self, r: &Reference) {
        r.core.state.write().frozen = None;
    }

    /// Moves queued references to the released state and runs their
    /// callbacks, outside every lock.
    pub(crate) fn do_user_evicts(&self) -> usize {
        let queued = mem::take(&mut *self.evict_queue.lock());
        let n = queued.len();
        for core in queued {
            let callback = {
                let mut rs = core.state.write();
                rs.owner = Owner::Released;
                rs.data = RefData::None;
                rs.callback.take()
            };
            if let Some(cb) = callback {
                cb.run();
            }
        }
        n
    }

    /// Marks an inactive reference as queued for its callback. Only tries
    /// the reference lock; returns false if it is busy.
    pub(crate) fn try_queue(&self, core: &Arc<RefCore>) -> bool {
        let Some(mut rs) = core.state.try_write() else {
            return false;
        };
        rs.owner = Owner::Queued;
        drop(rs);
        self.evict_queue.lock().push(Arc::clone(core));
        true
    }
}

/// Builds the callback record for [`ArcCore::inactivate`].
pub(crate) fn callback(handler: Arc<dyn EvictHandler>, context: u64) -> EvictCallback {
    EvictCallback { handler, context }
}
