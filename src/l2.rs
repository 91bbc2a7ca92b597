//! Second tier: copies of cached buffers on secondary devices.
//!
//! Each attached device is written like a ring. A write hand advances through
//! the device; ahead of it, an eviction pass drops whatever records the next
//! write will overwrite. The feed pass picks buffers from the oldest end of
//! the eviction lists (they are the next to leave memory), copies them into
//! one contiguous batch and writes it at the hand.
//!
//! ```text
//!   start                      hand ──▶ evict                         end
//!   ├──────── newer records ────┤░░░░░░░░┤──────── older records ──────┤
//!                                 cleared
//!                                 ahead of
//!                                 the next write
//! ```
//!
//! A buffer that leaves memory while its second-tier copy is valid becomes a
//! ghost that keeps a pointer to the record; a later miss reads the record
//! instead of the physical layer. Every device read is checked against the
//! checksum taken at feed time. The tier is a volatile cache: records do not
//! survive a restart.

use core::fmt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::arc::ArcCore;
use crate::buf::Checksum;
use crate::error::{CacheError, Result};
use crate::index::Slot;
use crate::io::SecondaryDevice;
use crate::reclaim::Signal;
use crate::state::{StateKind, Step, Walk};
use crate::BlockId;

const WRITING: u8 = 0;
const VALID: u8 = 1;
const INVALID: u8 = 2;

/// Where one block's copy lives on a secondary device.
pub(crate) struct L2Record {
    pub(crate) id: BlockId,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) checksum: Checksum,
    device: Weak<L2Device>,
    state: AtomicU8,
}

impl L2Record {
    /// The copy is on the device and nothing has invalidated it.
    pub(crate) fn is_valid(&self) -> bool {
        self.state.load(Ordering::Acquire) == VALID
    }

    /// Being written or valid.
    fn is_live(&self) -> bool {
        self.state.load(Ordering::Acquire) != INVALID
    }

    pub(crate) fn invalidate(&self) {
        self.state.store(INVALID, Ordering::Release);
    }

    fn mark_written(&self) {
        let _ = self
            .state
            .compare_exchange(WRITING, VALID, Ordering::AcqRel, Ordering::Acquire);
    }
}

impl fmt::Debug for L2Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("L2Record")
            .field("id", &self.id)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("valid", &self.is_valid())
            .finish()
    }
}

struct DeviceState {
    hand: u64,
    evict: u64,
    start: u64,
    end: u64,
    /// Still on the first pass over the device.
    first: bool,
    /// Newest at the front.
    records: VecDeque<Arc<L2Record>>,
}

/// One attached secondary device.
pub(crate) struct L2Device {
    pub(crate) id: u64,
    pub(crate) pool: u64,
    device: Arc<dyn SecondaryDevice>,
    writing: AtomicBool,
    state: Mutex<DeviceState>,
}

impl fmt::Debug for L2Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("L2Device")
            .field("id", &self.id)
            .field("pool", &self.pool)
            .field("hand", &st.hand)
            .field("records", &st.records.len())
            .finish()
    }
}

/// Outcome of one feed pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct FeedPass {
    pub(crate) wanted: u64,
    pub(crate) wrote: u64,
}

/// The attached devices and the feed state.
pub(crate) struct SecondTier {
    devices: RwLock<Vec<Arc<L2Device>>>,
    next_device: AtomicUsize,
    next_id: AtomicU64,
    pub(crate) signal: Signal,
}

impl SecondTier {
    pub(crate) fn new() -> Self {
        SecondTier {
            devices: RwLock::new(Vec::new()),
            next_device: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            signal: Signal::default(),
        }
    }

    pub(crate) fn has_devices(&self) -> bool {
        !self.devices.read().is_empty()
    }

    /// Round-robin pick of the next device to feed.
    fn next(&self) -> Option<Arc<L2Device>> {
        let devices = self.devices.read();
        if devices.is_empty() {
            return None;
        }
        let i = self.next_device.fetch_add(1, Ordering::Relaxed) % devices.len();
        Some(Arc::clone(&devices[i]))
    }
}

impl fmt::Debug for SecondTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecondTier")
            .field("devices", &*self.devices.read())
            .finish()
    }
}

fn round_up(n: u64, align: u64) -> u64 {
    n.div_ceil(align) * align
}

impl ArcCore {
    /// Attaches `device` as a second tier for blocks of `pool`.
    pub(crate) fn add_device(&self, pool: u64, device: Arc<dyn SecondaryDevice>) -> u64 {
        let id = self.l2.next_id.fetch_add(1, Ordering::Relaxed);
        let align = device.alignment().max(1);
        let end = device.capacity() / align * align;
        let dev = Arc::new(L2Device {
            id,
            pool,
            device,
            writing: AtomicBool::new(false),
            state: Mutex::new(DeviceState {
                hand: 0,
                evict: 0,
                start: 0,
                end,
                first: true,
                records: VecDeque::new(),
            }),
        });
        self.l2.devices.write().push(dev);
        info!(device = id, pool, capacity = end, "secondary device attached");
        id
    }

    /// Detaches a device and forgets everything cached on it.
    pub(crate) fn remove_device(&self, id: u64) -> Result<()> {
        let dev = {
            let mut devices = self.l2.devices.write();
            let pos = devices
                .iter()
                .position(|d| d.id == id)
                .ok_or(CacheError::UnknownDevice(id))?;
            devices.remove(pos)
        };
        self.l2_evict(&dev, 0, true);
        info!(device = id, "secondary device removed");
        Ok(())
    }

    /// Drops every record belonging to `pool` from every device.
    pub(crate) fn l2_evict_pool(&self, pool: u64) {
        let devices: Vec<_> = self.l2.devices.read().iter().cloned().collect();
        for dev in devices {
            let mut st = dev.state.lock();
            let (doomed, kept): (VecDeque<_>, VecDeque<_>) =
                st.records.drain(..).partition(|r| r.id.pool == pool);
            st.records = kept;
            for rec in doomed {
                self.l2_drop_record(&rec);
            }
        }
    }

    /// Forgets one record: a ghost that only existed for it disappears, a
    /// live buffer just loses its pointer.
    fn l2_drop_record(&self, rec: &Arc<L2Record>) {
        rec.invalidate();
        self.stats.l2_records.sub(1);
        self.stats.l2_evicted.inc();
        let mut bucket = self.index.lock(&rec.id);
        match bucket.get(&rec.id).cloned() {
            Some(Slot::Ghost(ghost)) if ghost.l2.as_ref().is_some_and(|r| Arc::ptr_eq(r, rec)) => {
                bucket.remove_ghost(&ghost);
                self.ghost(ghost.kind()).sub_size(1);
                self.stats.hash_elements.sub(1);
                self.stats.deleted.inc();
            }
            Some(Slot::Live(buf)) => {
                let mut st = buf.state.lock();
                if st.l2.as_ref().is_some_and(|r| Arc::ptr_eq(r, rec)) {
                    st.l2 = None;
                }
            }
            _ => {}
        }
    }

    /// Clears the records the next write of `distance` bytes will overwrite,
    /// or all of them.
    fn l2_evict(&self, dev: &L2Device, distance: u64, all: bool) {
        let mut st = dev.state.lock();
        let target = if st.hand >= st.end.saturating_sub(2 * distance) {
            st.end
        } else {
            st.hand + distance
        };
        while let Some(rec) = st.records.back().cloned() {
            if !all && (rec.offset > target || rec.offset < st.hand) {
                break;
            }
            st.records.pop_back();
            self.l2_drop_record(&rec);
        }
        st.evict = target;
    }

    /// Bytes one feed pass writes.
    fn l2_write_size(&self) -> u64 {
        let cfg = &self.config.second_tier;
        if self.is_warm() {
            cfg.write_max
        } else {
            cfg.write_max.saturating_add(cfg.write_boost)
        }
    }

    /// Copies up to `target` bytes of eligible buffers to `dev` at its hand.
    fn l2_write_buffers(&self, dev: &Arc<L2Device>, target: u64) -> u64 {
        let cfg = &self.config.second_tier;
        let align = dev.device.alignment().max(1);
        let headroom = target.saturating_mul(cfg.headroom);
        let warm = self.is_warm();

        let mut st = dev.state.lock();
        let base = st.hand;
        let mut batch = Vec::new();
        let mut written = 0u64;
        for kind in [StateKind::Frequent, StateKind::Recent] {
            let state = self.live(kind);
            let direction = if warm || !st.first {
                Walk::FromTail
            } else {
                Walk::FromHead
            };
            let mut passed = 0u64;
            let mut full = false;
            let scan = state.list.lock_scan();
            state.list.walk(&scan, direction, true, |buf| {
                passed += buf.size;
                if passed > headroom {
                    return Step::Stop;
                }
                let Some(mut bs) = buf.state.try_lock() else {
                    return Step::Keep;
                };
                let eligible = buf.id.pool == dev.pool
                    && buf.is_hashed()
                    && !bs.no_l2
                    && !(cfg.no_prefetch && bs.prefetched)
                    && bs.l2.as_ref().map_or(true, |r| !r.is_live());
                if !eligible {
                    return Step::Keep;
                }
                let Some(data) = bs.data.clone() else {
                    return Step::Keep;
                };
                let asize = round_up(buf.size, align);
                if written + asize > target {
                    full = true;
                    return Step::Stop;
                }
                let checksum = *bs.checksum.get_or_insert_with(|| Checksum::of(&data));
                let rec = Arc::new(L2Record {
                    id: buf.id,
                    offset: base + written,
                    size: buf.size,
                    checksum,
                    device: Arc::downgrade(dev),
                    state: AtomicU8::new(WRITING),
                });
                bs.l2 = Some(Arc::clone(&rec));
                batch.push((rec, data));
                written += asize;
                Step::Keep
            });
            if full {
                break;
            }
        }
        if batch.is_empty() {
            return 0;
        }

        for (rec, _) in &batch {
            st.records.push_front(Arc::clone(rec));
        }
        st.hand += written;
        if st.hand >= st.end.saturating_sub(target) {
            st.hand = st.start;
            st.evict = st.start;
            st.first = false;
        }
        dev.writing.store(true, Ordering::Release);
        drop(st);

        let mut io = vec![0u8; written as usize];
        for (rec, data) in &batch {
            let at = (rec.offset - base) as usize;
            io[at..at + data.len()].copy_from_slice(data);
        }
        self.stats.l2_writes_sent.inc();
        self.stats.l2_records.add(batch.len() as u64);
        let result = dev.device.write_at(base, &io);
        dev.writing.store(false, Ordering::Release);
        match result {
            Ok(()) => {
                for (rec, _) in &batch {
                    rec.mark_written();
                }
                self.stats.l2_writes_done.inc();
                self.stats.l2_write_bytes.add(written);
                debug!(device = dev.id, offset = base, bytes = written, buffers = batch.len(), "fed second tier");
                written
            }
            Err(e) => {
                for (rec, _) in &batch {
                    rec.invalidate();
                }
                self.stats.l2_writes_error.inc();
                warn!(device = dev.id, offset = base, error = %e, "second-tier write failed");
                0
            }
        }
    }

    /// One feed pass over the next device.
    pub(crate) fn feed_once(&self) -> FeedPass {
        let Some(dev) = self.l2.next() else {
            return FeedPass::default();
        };
        if self.pressure.reclaim_needed() {
            self.stats.l2_abort_lowmem.inc();
            return FeedPass::default();
        }
        self.stats.l2_feeds.inc();
        let wanted = {
            let st = dev.state.lock();
            self.l2_write_size().min((st.end - st.start) / 2)
        };
        if wanted == 0 {
            return FeedPass::default();
        }
        self.l2_evict(&dev, wanted, false);
        let wrote = self.l2_write_buffers(&dev, wanted);
        FeedPass { wanted, wrote }
    }

    /// Reads a second-tier copy into `dest`. On any failure the destination
    /// is handed back so the caller can fall through to the physical layer.
    pub(crate) fn l2_read(&self, rec: &L2Record, mut dest: Vec<u8>) -> core::result::Result<Vec<u8>, Vec<u8>> {
        let Some(dev) = rec.device.upgrade() else {
            self.stats.l2_misses.inc();
            return Err(dest);
        };
        if !rec.is_valid() || rec.size != dest.len() as u64 {
            self.stats.l2_misses.inc();
            return Err(dest);
        }
        if self.config.second_tier.no_read_while_writing && dev.writing.load(Ordering::Acquire) {
            self.stats.l2_rw_clash.inc();
            self.stats.l2_misses.inc();
            return Err(dest);
        }
        if let Err(e) = dev.device.read_at(rec.offset, &mut dest) {
            self.stats.l2_io_error.inc();
            rec.invalidate();
            warn!(device = dev.id, id = ?rec.id, error = %e, "second-tier read failed");
            return Err(dest);
        }
        if Checksum::of(&dest) != rec.checksum {
            self.stats.l2_cksum_bad.inc();
            rec.invalidate();
            warn!(device = dev.id, id = ?rec.id, "second-tier checksum mismatch");
            return Err(dest);
        }
        self.stats.l2_hits.inc();
        self.stats.l2_read_bytes.add(rec.size);
        Ok(dest)
    }
}

/// Starts the feed thread.
pub(crate) fn spawn(core: Arc<ArcCore>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("arc-l2-feed".into())
        .spawn(move || {
            info!("second-tier feed thread started");
            let cfg = core.config.second_tier;
            let mut interval = cfg.feed_interval;
            loop {
                core.l2.signal.wait(interval);
                if core.shut_down.load(Ordering::Acquire) {
                    break;
                }
                let pass = core.feed_once();
                interval = if cfg.feed_again && pass.wrote > pass.wanted / 2 {
                    cfg.feed_min_interval
                } else {
                    cfg.feed_interval
                };
            }
            info!("second-tier feed thread stopped");
        })
        .map_err(|source| CacheError::Spawn {
            name: "arc-l2-feed",
            source,
        })
}
