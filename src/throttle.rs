//! Write admission.
//!
//! Before dirtying data a writer reserves space with
//! [`BlockCache::tempreserve_space`](crate::BlockCache::tempreserve_space).
//! A reservation is refused outright if it can never fit, deferred when the
//! host is short of memory, and turned back when too much dirty data is
//! already in flight relative to what the cache could free.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::arc::ArcCore;
use crate::error::ReserveError;

#[derive(Default)]
pub(crate) struct Throttle {
    /// Bytes currently reserved.
    reserved: AtomicU64,
    /// Generation of the last throttling decision and the load seen in it.
    last: Mutex<(u64, u64)>,
}

impl Throttle {
    pub(crate) fn reserved(&self) -> u64 {
        self.reserved.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttle")
            .field("reserved", &self.reserved())
            .finish()
    }
}

impl ArcCore {
    /// Checks whether `inflight` more bytes of dirty data may be created in
    /// generation `txg` without driving the host out of memory.
    fn memory_throttle(&self, reserve: u64, inflight: u64, txg: u64) -> Result<(), ReserveError> {
        let mut available = self.pressure.free_memory();
        if available >= self.config.write_limit_max {
            return Ok(());
        }
        {
            let mut last = self.throttle.last.lock();
            if txg > last.0 {
                *last = (txg, 0);
            }
            if self.pressure.reclaim_needed() {
                last.1 = last.1.saturating_add(reserve);
                self.stats.memory_throttle_count.inc();
                return Err(ReserveError::RetryLater);
            }
            last.1 = 0;
        }
        let size = self.size();
        if size > self.targets.min() {
            let evictable = self.recent.evictable() + self.frequent.evictable();
            available = available.saturating_add(evictable.min(size - self.targets.min()));
        }
        if inflight > available / 4 {
            self.stats.memory_throttle_count.inc();
            return Err(ReserveError::Restart);
        }
        Ok(())
    }

    /// Reserves `reserve` bytes for a writer in generation `txg`.
    pub(crate) fn tempreserve_space(&self, reserve: u64, txg: u64) -> Result<(), ReserveError> {
        self.targets.grow_for_reservation(reserve);
        let c = self.targets.target();
        if reserve > c {
            return Err(ReserveError::OutOfSpace);
        }

        let anon = self.anon_size();
        self.memory_throttle(reserve, anon, txg)?;

        let reserved = self.throttle.reserved();
        if reserved.saturating_add(reserve).saturating_add(anon) > c / 2 && anon > c / 4 {
            debug!(reserved, reserve, anon, target = c, "write reservation throttled");
            return Err(ReserveError::Restart);
        }
        self.throttle.reserved.fetch_add(reserve, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn tempreserve_clear(&self, reserve: u64) {
        let _ = self
            .throttle
            .reserved
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(reserve)));
    }
}
