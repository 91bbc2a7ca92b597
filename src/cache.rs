//! The public cache handle and its read and write paths.
//!
//! A read looks the identity up in the index. A live buffer is shared
//! directly. Anything else allocates a data block and fills it from the
//! second tier if a valid copy is recorded there, or from the physical layer
//! otherwise. The filled buffer is then hashed, which is where a ghost hit
//! adapts the recency share.
//!
//! ```text
//!   read(id)
//!     │
//!     ├── anonymous ──────────────────────────────▶ hole reference
//!     │
//!     ├── live ──▶ share + access ────────────────▶ Memory
//!     │
//!     └── ghost / absent ──▶ alloc ──┬─ L2 copy ok ──▶ insert ──▶ SecondTier
//!                                    └─ physical ────▶ insert ──▶ Primary
//! ```
//!
//! Writes go the other way: the anonymous data of a reference is handed to
//! the physical layer, and on completion becomes a cached buffer under the
//! identity the physical layer assigned.

use core::fmt;
use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::arc::ArcCore;
use crate::buf::ArcBuf;
use crate::config::ArcConfig;
use crate::error::{contract, CacheError, ReserveError, Result};
use crate::index::{Lookup, Slot};
use crate::io::{BlockIo, Priority, SecondaryDevice};
use crate::l2::{self, L2Record};
use crate::metrics::{ratio, ArcStatsSnapshot, CacheMetrics};
use crate::reclaim::{self, MemoryPressure, NoPressure, ReclaimHook};
use crate::reference::{self, EvictHandler, Owner, RefCore, RefData, RefMode, Reference};
use crate::state::StateKind;
use crate::BlockId;

/// Per-read flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadOptions {
    /// The block is metadata; only affects statistics and hole selection.
    pub metadata: bool,
    /// Speculative read-ahead: the block is brought in but no reference is
    /// returned and the read does not count as an access.
    pub prefetch: bool,
    /// Do not consult the second tier on a miss.
    pub skip_second_tier: bool,
    /// Never copy this block to the second tier.
    pub no_second_tier: bool,
    /// Scheduling class passed to the physical layer.
    pub priority: Priority,
}

impl Default for ReadOptions {
    fn default() -> Self {
        ReadOptions {
            metadata: false,
            prefetch: false,
            skip_second_tier: false,
            no_second_tier: false,
            priority: Priority::Sync,
        }
    }
}

impl ReadOptions {
    /// Options for a prefetch.
    pub fn prefetch() -> Self {
        ReadOptions {
            prefetch: true,
            priority: Priority::Prefetch,
            ..ReadOptions::default()
        }
    }
}

/// Where a read was satisfied from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadSource {
    /// The shared zero block.
    Hole,
    /// A live buffer.
    Memory,
    /// A verified copy on a secondary device.
    SecondTier,
    /// The physical layer.
    Primary,
}

/// Result of a read.
#[derive(Debug)]
pub struct ReadOutcome {
    /// Reference to the data; `None` for prefetches.
    pub reference: Option<Reference>,
    /// Where the data came from.
    pub source: ReadSource,
}

impl ReadOutcome {
    /// True when no I/O was needed.
    pub fn cached(&self) -> bool {
        matches!(self.source, ReadSource::Memory | ReadSource::Hole)
    }
}

/// Result of [`BlockCache::find`].
#[derive(Debug)]
pub enum Find {
    /// Live buffer; the reference shares its data.
    Hit(Reference),
    /// Only history is left.
    Ghost {
        /// The ghost state the block is in.
        state: StateKind,
        /// A valid second-tier copy exists.
        second_tier: bool,
    },
    /// Not known to the cache.
    Miss,
}

/// Where an identity currently lives, without touching it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Residency {
    /// Cached in a live state.
    Live(StateKind),
    /// Remembered in a ghost state.
    Ghost(StateKind),
    /// Not in the index.
    Absent,
}

/// Point-in-time sizes of a cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheSizes {
    /// Adaptive target (`c`).
    pub target: u64,
    /// Recency share of the target (`p`).
    pub recency_share: u64,
    /// Lower bound of the target.
    pub min: u64,
    /// Upper bound of the target.
    pub max: u64,
    /// All data bytes owned by the cache.
    pub size: u64,
    /// Bytes held by anonymous references.
    pub anonymous: u64,
    /// Bytes in Recent.
    pub recent: u64,
    /// Bytes in Frequent.
    pub frequent: u64,
    /// Evictable bytes in Recent.
    pub recent_evictable: u64,
    /// Evictable bytes in Frequent.
    pub frequent_evictable: u64,
    /// Ghosts in Recent-Ghost.
    pub recent_ghosts: u64,
    /// Ghosts in Frequent-Ghost.
    pub frequent_ghosts: u64,
    /// Bytes lent out as scratch buffers.
    pub loaned: u64,
    /// Bytes of anonymous data marked for writing.
    pub io_pending: u64,
    /// Bytes being written.
    pub io_writing: u64,
    /// Bytes reserved by writers.
    pub reserved: u64,
}

type ReadCallback = Box<dyn FnOnce(Result<ReadOutcome>) + Send>;
type WriteCallback = Box<dyn FnOnce(Result<BlockId>) + Send>;

/// One-shot slot a synchronous caller waits on.
struct Completion<T> {
    slot: Mutex<Option<T>>,
    cv: Condvar,
}

impl<T> Completion<T> {
    fn new() -> Arc<Self> {
        Arc::new(Completion {
            slot: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    fn complete(&self, value: T) {
        *self.slot.lock() = Some(value);
        self.cv.notify_all();
    }

    fn wait(&self) -> T {
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            self.cv.wait(&mut slot);
        }
    }
}

impl ArcCore {
    fn count_read(&self, meta: bool, prefetch: bool, hit: bool) {
        let s = &self.stats;
        let counter = match (prefetch, meta, hit) {
            (false, false, true) => &s.demand_data_hits,
            (false, false, false) => &s.demand_data_misses,
            (false, true, true) => &s.demand_metadata_hits,
            (false, true, false) => &s.demand_metadata_misses,
            (true, false, true) => &s.prefetch_data_hits,
            (true, false, false) => &s.prefetch_data_misses,
            (true, true, true) => &s.prefetch_metadata_hits,
            (true, true, false) => &s.prefetch_metadata_misses,
        };
        counter.inc();
        if hit {
            s.hits.inc();
        } else {
            s.misses.inc();
        }
    }

    /// Hands a held buffer to the reader and drops the caller's hold.
    fn deliver(self: &Arc<Self>, buf: &Arc<ArcBuf>, opts: ReadOptions, source: ReadSource) -> Result<ReadOutcome> {
        let mut st = buf.state.lock();
        if opts.no_second_tier {
            st.no_l2 = true;
        }
        let reference = if opts.prefetch {
            None
        } else {
            match self.share(buf, &st) {
                Ok(r) => {
                    self.access(buf, &mut st);
                    Some(r)
                }
                Err(e) => {
                    self.rele_locked(buf, &mut st);
                    return Err(e);
                }
            }
        };
        self.rele_locked(buf, &mut st);
        Ok(ReadOutcome { reference, source })
    }

    pub(crate) fn read(
        self: &Arc<Self>,
        id: BlockId,
        size: u64,
        opts: ReadOptions,
        done: ReadCallback,
    ) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(CacheError::ShutDown);
        }
        contract!(
            size > 0 && size <= self.config.max_block_size,
            CacheError::BlockTooLarge { size, max: self.config.max_block_size }
        );
        if id.is_anonymous() {
            let reference = if opts.prefetch {
                None
            } else {
                Some(self.hole_reference(size, opts.metadata)?)
            };
            done(Ok(ReadOutcome {
                reference,
                source: ReadSource::Hole,
            }));
            return Ok(());
        }
        match self.index.find(&id) {
            Lookup::Live(buf) => {
                self.count_read(buf.meta, opts.prefetch, true);
                {
                    let st = buf.state.lock();
                    match st.kind {
                        StateKind::Frequent => self.stats.frequent_hits.inc(),
                        _ => self.stats.recent_hits.inc(),
                    }
                }
                done(self.deliver(&buf, opts, ReadSource::Memory));
            }
            Lookup::Ghost { l2, .. } => self.miss(id, size, opts, l2, done),
            Lookup::Miss => self.miss(id, size, opts, None, done),
        }
        Ok(())
    }

    fn miss(
        self: &Arc<Self>,
        id: BlockId,
        size: u64,
        opts: ReadOptions,
        l2: Option<Arc<L2Record>>,
        done: ReadCallback,
    ) {
        self.count_read(opts.metadata, opts.prefetch, false);
        let data = match self.alloc_block(size) {
            Ok(data) => data,
            Err(e) => return done(Err(e)),
        };
        let data = match l2 {
            Some(rec) if !opts.skip_second_tier => match self.l2_read(&rec, data) {
                Ok(data) => {
                    return self.read_done(id, opts, data, Ok(()), ReadSource::SecondTier, done);
                }
                Err(data) => data,
            },
            _ => {
                if !opts.skip_second_tier && self.l2.has_devices() {
                    self.stats.l2_misses.inc();
                }
                data
            }
        };
        let cache = Arc::clone(self);
        self.io.read(
            &id,
            data,
            opts.priority,
            Box::new(move |data, result| {
                cache.read_done(id, opts, data, result, ReadSource::Primary, done);
            }),
        );
    }

    fn read_done(
        self: &Arc<Self>,
        id: BlockId,
        opts: ReadOptions,
        data: Vec<u8>,
        result: io::Result<()>,
        source: ReadSource,
        done: ReadCallback,
    ) {
        if let Err(e) = result {
            self.free_block(data);
            // Another reader may have brought the block in meanwhile
            if let Lookup::Live(buf) = self.index.find(&id) {
                self.stats.read_errors_healed.inc();
                debug!(%id, error = %e, "read error healed by concurrent fetch");
                return done(self.deliver(&buf, opts, ReadSource::Memory));
            }
            self.stats.read_errors.inc();
            warn!(%id, error = %e, "physical read failed");
            return done(Err(CacheError::Io(e)));
        }

        let buf = self.new_buf(id, opts.metadata, data);
        {
            let mut st = buf.state.lock();
            st.prefetched = opts.prefetch;
            st.no_l2 = opts.no_second_tier;
        }
        let buf = match self.hash_insert(&buf, true) {
            None => buf,
            Some(existing) => {
                self.rele(&buf);
                existing
            }
        };
        done(self.deliver(&buf, opts, source));
    }

    pub(crate) fn find(self: &Arc<Self>, id: &BlockId) -> Find {
        match self.index.find(id) {
            Lookup::Live(buf) => match self.deliver(&buf, ReadOptions::default(), ReadSource::Memory) {
                Ok(ReadOutcome {
                    reference: Some(r), ..
                }) => Find::Hit(r),
                _ => Find::Miss,
            },
            Lookup::Ghost { ghost, l2 } => Find::Ghost {
                state: ghost.kind(),
                second_tier: l2.is_some(),
            },
            Lookup::Miss => Find::Miss,
        }
    }

    pub(crate) fn probe(&self, id: &BlockId) -> Residency {
        match self.index.peek(id) {
            Some(Slot::Live(buf)) => Residency::Live(buf.state.lock().kind),
            Some(Slot::Ghost(ghost)) => Residency::Ghost(ghost.kind()),
            None => Residency::Absent,
        }
    }

    pub(crate) fn write(
        self: &Arc<Self>,
        id: BlockId,
        r: &Reference,
        priority: Priority,
        done: WriteCallback,
    ) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(CacheError::ShutDown);
        }
        let core = Arc::clone(r.core());
        let data = {
            let mut rs = core.state.write();
            contract!(
                matches!(rs.owner, Owner::Anonymous) && matches!(rs.data, RefData::Owned(_)),
                CacheError::NotWritable
            );
            contract!(rs.mode != RefMode::Writing, CacheError::InvalidReference("write in progress"));
            let RefData::Owned(data) = mem::take(&mut rs.data) else {
                return Err(CacheError::NotWritable);
            };
            match rs.mode {
                RefMode::WritePending => {
                    self.io_pending.fetch_sub(rs.size, Ordering::Relaxed);
                }
                RefMode::OnLoan => {
                    self.loaned.fetch_sub(rs.size, Ordering::Relaxed);
                }
                RefMode::Normal | RefMode::Writing => {}
            }
            rs.mode = RefMode::Writing;
            self.io_writing.fetch_add(rs.size, Ordering::Relaxed);
            data
        };
        let cache = Arc::clone(self);
        self.io.write(
            &id,
            data,
            priority,
            Box::new(move |data, result| cache.write_done(&core, data, result, done)),
        );
        Ok(())
    }

    fn write_done(
        self: &Arc<Self>,
        core: &Arc<RefCore>,
        data: Vec<u8>,
        result: io::Result<BlockId>,
        done: WriteCallback,
    ) {
        let (outcome, orphaned) = {
            let mut rs = core.state.write();
            self.io_writing.fetch_sub(rs.size, Ordering::Relaxed);
            rs.mode = RefMode::Normal;
            let outcome = match result {
                Err(e) => {
                    rs.data = RefData::Owned(data);
                    warn!(error = %e, "physical write failed");
                    Err(CacheError::Io(e))
                }
                Ok(id) if id.is_anonymous() => {
                    rs.data = RefData::Owned(data);
                    Ok(id)
                }
                Ok(id) => {
                    let buf = self.new_buf(id, rs.meta, data);
                    buf.state.lock().checksum = rs.frozen;
                    let buf = match self.hash_insert(&buf, false) {
                        None => buf,
                        Some(existing) => {
                            self.rele(&buf);
                            existing
                        }
                    };
                    let mut st = buf.state.lock();
                    match st.data.clone() {
                        Some(shared) => {
                            rs.data = RefData::Shared(shared);
                            rs.owner = Owner::Buffer(Arc::clone(&buf));
                            self.access(&buf, &mut st);
                            Ok(id)
                        }
                        None => {
                            self.rele_locked(&buf, &mut st);
                            Err(CacheError::NotFound)
                        }
                    }
                }
            };
            (outcome, mem::take(&mut rs.orphaned))
        };
        if orphaned {
            let _ = self.release_reference(core, false);
        }
        done(outcome);
    }
}

/// An adaptive replacement cache of immutable blocks.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use block_arc::config::ArcConfig;
/// use block_arc::io::MemoryBlockIo;
/// use block_arc::{BlockCache, BlockId, ReadOptions, ReadSource};
///
/// let io = Arc::new(MemoryBlockIo::new());
/// let id = BlockId::new(1, 42, 7);
/// io.insert(id, vec![5; 512]);
///
/// let cache = BlockCache::init(ArcConfig::for_blocks(16, 512), io).unwrap();
/// let first = cache.read(id, 512, ReadOptions::default()).unwrap();
/// assert_eq!(first.source, ReadSource::Primary);
///
/// let again = cache.read(id, 512, ReadOptions::default()).unwrap();
/// assert_eq!(again.source, ReadSource::Memory);
/// assert_eq!(again.reference.unwrap().to_vec(), Some(vec![5; 512]));
/// ```
pub struct BlockCache {
    core: Arc<ArcCore>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl BlockCache {
    /// Creates a cache over `io` with no host memory signal.
    pub fn init(config: ArcConfig, io: Arc<dyn BlockIo>) -> Result<Self> {
        BlockCache::with_pressure(config, io, Arc::new(NoPressure))
    }

    /// Creates a cache over `io` that consults `pressure` for host memory
    /// state, and starts the enabled background threads.
    pub fn with_pressure(
        config: ArcConfig,
        io: Arc<dyn BlockIo>,
        pressure: Arc<dyn MemoryPressure>,
    ) -> Result<Self> {
        let core = Arc::new(ArcCore::new(config, io, pressure));
        let cache = BlockCache {
            core: Arc::clone(&core),
            threads: Mutex::new(Vec::new()),
        };
        if core.config.reclaim.enabled {
            let handle = reclaim::spawn(Arc::clone(&core))?;
            cache.threads.lock().push(handle);
        }
        if core.config.second_tier.feed_enabled {
            let handle = l2::spawn(Arc::clone(&core))?;
            cache.threads.lock().push(handle);
        }
        info!(
            max = core.config.max_size,
            min = core.config.min_size,
            buckets = core.index.buckets(),
            locks = core.index.locks(),
            "block cache initialized"
        );
        Ok(cache)
    }

    /// Stops the background threads and evicts everything that is not
    /// referenced. Idempotent; also run on drop.
    pub fn shutdown(&self) {
        if self.core.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.core.reclaim.wake();
        self.core.l2.signal.notify();
        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                warn!("background thread panicked");
            }
        }
        self.core.flush(None);
        self.core.trim_hole_refs();
        info!("block cache shut down");
    }

    /// Reads block `id` of `size` bytes, blocking until it is available.
    pub fn read(&self, id: BlockId, size: u64, opts: ReadOptions) -> Result<ReadOutcome> {
        let completion = Completion::new();
        let slot = Arc::clone(&completion);
        self.core
            .read(id, size, opts, Box::new(move |r| slot.complete(r)))?;
        completion.wait()
    }

    /// Reads block `id`; `done` runs exactly once, possibly on another
    /// thread, unless this call itself returns an error.
    pub fn read_async<F>(&self, id: BlockId, size: u64, opts: ReadOptions, done: F) -> Result<()>
    where
        F: FnOnce(Result<ReadOutcome>) + Send + 'static,
    {
        self.core.read(id, size, opts, Box::new(done))
    }

    /// Issues a prefetch for `id`.
    pub fn prefetch(&self, id: BlockId, size: u64, metadata: bool) -> Result<()> {
        let opts = ReadOptions {
            metadata,
            ..ReadOptions::prefetch()
        };
        self.core.read(id, size, opts, Box::new(|_| {}))
    }

    /// Looks `id` up without any I/O.
    pub fn find(&self, id: &BlockId) -> Find {
        self.core.find(id)
    }

    /// Reports where `id` lives without taking a reference or counting an
    /// access.
    pub fn probe(&self, id: &BlockId) -> Residency {
        self.core.probe(id)
    }

    /// Writes the anonymous data of `reference` as block `id`, blocking until
    /// the physical layer acknowledges it. On success the reference shares
    /// the newly cached buffer; on failure it keeps its data.
    pub fn write(&self, id: BlockId, reference: &Reference, priority: Priority) -> Result<BlockId> {
        let completion = Completion::new();
        let slot = Arc::clone(&completion);
        self.core
            .write(id, reference, priority, Box::new(move |r| slot.complete(r)))?;
        completion.wait()
    }

    /// Starts a write; `done` receives the final identity.
    pub fn write_async<F>(&self, id: BlockId, reference: &Reference, priority: Priority, done: F) -> Result<()>
    where
        F: FnOnce(Result<BlockId>) + Send + 'static,
    {
        self.core.write(id, reference, priority, Box::new(done))
    }

    /// New private reference to `size` zeroed bytes.
    pub fn alloc_reference(&self, size: u64, metadata: bool) -> Result<Reference> {
        self.core.alloc_reference(size, metadata, None)
    }

    /// New private reference adopting `data`.
    pub fn alloc_reference_from(&self, data: Vec<u8>, metadata: bool) -> Result<Reference> {
        contract!(
            data.len() as u64 <= self.core.config.max_block_size,
            CacheError::BlockTooLarge {
                size: data.len() as u64,
                max: self.core.config.max_block_size
            }
        );
        self.core
            .alloc_reference(data.len() as u64, metadata, Some(data))
    }

    /// Makes `reference` privately writable. Returns true when the data
    /// moved, so any slice obtained earlier is stale.
    pub fn make_writable(&self, reference: &Reference) -> Result<bool> {
        self.core.make_writable(reference, false)
    }

    /// Like [`make_writable`](Self::make_writable), and marks the data as
    /// pending a write for accounting.
    pub fn make_writable_pending(&self, reference: &Reference) -> Result<bool> {
        self.core.make_writable(reference, true)
    }

    /// Parks a shared reference. `handler` is called with `context` if the
    /// buffer is evicted before the reference is reactivated.
    pub fn inactivate(&self, reference: &Reference, handler: Arc<dyn EvictHandler>, context: u64) -> Result<()> {
        self.core
            .inactivate(reference, reference::callback(handler, context))
    }

    /// Brings an inactive reference back; `NotFound` if it was evicted.
    pub fn reactivate(&self, reference: &Reference) -> Result<()> {
        self.core.reactivate(reference)
    }

    /// Gives up an inactive reference without waiting for eviction;
    /// `InProgress` if its callback is already running.
    pub fn evict_reference(&self, reference: &Reference) -> Result<()> {
        self.core.evict_reference(reference)
    }

    /// Releases a reference, reporting contract violations that a plain drop
    /// would ignore.
    pub fn free_reference(&self, reference: Reference) -> Result<()> {
        self.core.release_reference(reference.core(), true)
    }

    /// Private copy of an active reference.
    pub fn clone_reference(&self, reference: &Reference) -> Result<Reference> {
        self.core.clone_reference(reference)
    }

    /// Scratch buffer counted as loaned rather than cached.
    pub fn loan_buffer(&self, size: u64, metadata: bool) -> Result<Reference> {
        self.core.loan_buffer(size, metadata)
    }

    /// Ends a loan; the reference becomes an ordinary anonymous one.
    pub fn return_loan(&self, reference: &Reference) -> Result<()> {
        self.core.return_loan(reference)
    }

    /// Second reference to the same data.
    pub fn loan_reference(&self, reference: &Reference) -> Result<Reference> {
        self.core.loan_reference(reference)
    }

    /// Replaces the anonymous data of `reference` with the zero block.
    pub fn make_hole(&self, reference: &Reference) -> Result<()> {
        self.core.make_hole(reference)
    }

    /// Records a checksum of the data; with `debug_checksums` enabled,
    /// modification is detected when the reference is released.
    pub fn freeze(&self, reference: &Reference) -> Result<()> {
        self.core.freeze(reference)
    }

    /// Forgets the frozen checksum.
    pub fn thaw(&self, reference: &Reference) {
        self.core.thaw(reference)
    }

    /// Evicts everything unreferenced; with `pool` set, destroys everything
    /// unreferenced that belongs to the pool, history included.
    pub fn flush(&self, pool: Option<u64>) {
        debug!(?pool, "flushing cache");
        self.core.flush(pool)
    }

    /// Evicts at least `bytes` from the live state `state`. Returns the bytes
    /// freed.
    pub fn evict_bytes(&self, state: StateKind, bytes: u64) -> Result<u64> {
        contract!(!state.is_ghost(), CacheError::InvalidReference("not a live state"));
        Ok(self.core.evict_bytes(state, bytes, false))
    }

    /// Brings the cache under its target.
    pub fn adjust(&self) {
        self.core.adjust()
    }

    /// Reserves `reserve` bytes for a writer in generation `txg`.
    pub fn tempreserve_space(&self, reserve: u64, txg: u64) -> Result<(), ReserveError> {
        self.core.tempreserve_space(reserve, txg)
    }

    /// Returns a reservation.
    pub fn tempreserve_clear(&self, reserve: u64) {
        self.core.tempreserve_clear(reserve)
    }

    /// Registers a hook reaped under memory pressure.
    pub fn add_reclaim_hook(&self, hook: Arc<dyn ReclaimHook>) {
        self.core.reclaim.add_hook(hook)
    }

    /// Runs one reclaim pass on the calling thread.
    pub fn reclaim_now(&self) {
        self.core.reclaim_pass()
    }

    /// Attaches a secondary device for blocks of `pool`. Returns its id.
    pub fn add_secondary_device(&self, pool: u64, device: Arc<dyn SecondaryDevice>) -> u64 {
        self.core.add_device(pool, device)
    }

    /// Detaches a secondary device.
    pub fn remove_secondary_device(&self, id: u64) -> Result<()> {
        self.core.remove_device(id)
    }

    /// Runs one feed pass on the calling thread. Returns the bytes written.
    pub fn feed_second_tier(&self) -> u64 {
        self.core.feed_once().wrote
    }

    /// Copies every statistic.
    pub fn stats(&self) -> ArcStatsSnapshot {
        self.core.stats.snapshot()
    }

    /// Current sizes and targets.
    pub fn sizes(&self) -> CacheSizes {
        let c = &self.core;
        CacheSizes {
            target: c.targets.target(),
            recency_share: c.targets.recency_share(),
            min: c.targets.min(),
            max: c.targets.max(),
            size: c.size(),
            anonymous: c.anon_size(),
            recent: c.recent.size(),
            frequent: c.frequent.size(),
            recent_evictable: c.recent.evictable(),
            frequent_evictable: c.frequent.evictable(),
            recent_ghosts: c.recent_ghost.size(),
            frequent_ghosts: c.frequent_ghost.size(),
            loaned: c.loaned.load(Ordering::Relaxed),
            io_pending: c.io_pending.load(Ordering::Relaxed),
            io_writing: c.io_writing.load(Ordering::Relaxed),
            reserved: c.throttle.reserved(),
        }
    }

    /// The configuration in effect, after normalization.
    pub fn config(&self) -> &ArcConfig {
        &self.core.config
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCache")
            .field("sizes", &self.sizes())
            .field("index", &self.core.index)
            .field("second_tier", &self.core.l2)
            .finish()
    }
}

impl CacheMetrics for BlockCache {
    fn metrics(&self) -> BTreeMap<String, f64> {
        let stats = self.stats();
        let sizes = self.sizes();
        let mut metrics = stats.to_btreemap();
        metrics.insert(
            "hit_ratio".to_string(),
            ratio(stats.hits, stats.hits + stats.misses),
        );
        let size_metrics = [
            ("size", sizes.size),
            ("target", sizes.target),
            ("recency_share", sizes.recency_share),
            ("anonymous_size", sizes.anonymous),
            ("recent_size", sizes.recent),
            ("frequent_size", sizes.frequent),
            ("recent_ghost_count", sizes.recent_ghosts),
            ("frequent_ghost_count", sizes.frequent_ghosts),
            ("loaned_size", sizes.loaned),
        ];
        for (name, value) in size_metrics {
            metrics.insert(name.to_string(), value as f64);
        }
        metrics
    }

    fn algorithm_name(&self) -> &'static str {
        "ARC"
    }
}
