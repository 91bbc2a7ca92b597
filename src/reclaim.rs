//! Memory pressure and the reclaim thread.
//!
//! The reclaim thread wakes once per interval (or early, when an allocation
//! could not make room) and runs one pass:
//!
//! 1. If the host reports memory pressure, freeze growth and reap. The first
//!    event reaps aggressively; while pressure persists the strategy
//!    alternates between conservative and aggressive. An aggressive reap
//!    shrinks the target.
//! 2. Otherwise, once `grow_retry` has passed since the last event, let the
//!    target grow again.
//! 3. Bring the cache under its target, run queued eviction callbacks, and
//!    every `trim_interval` release inactive references to hole buffers.
//!
//! How the host signals pressure is pluggable through [`MemoryPressure`].

use core::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use rand::Rng;
use tracing::{debug, info};

use crate::arc::ArcCore;
use crate::error::{CacheError, Result};

/// Host memory signal consulted by the reclaim thread, the allocation path,
/// the second-tier feed and write admission.
pub trait MemoryPressure: Send + Sync {
    /// True when the cache should give memory back.
    fn reclaim_needed(&self) -> bool;

    /// Bytes of free host memory, as best known.
    fn free_memory(&self) -> u64;
}

/// Never under pressure.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoPressure;

impl MemoryPressure for NoPressure {
    fn reclaim_needed(&self) -> bool {
        false
    }

    fn free_memory(&self) -> u64 {
        u64::MAX
    }
}

/// Pressure set by hand; for tests and for hosts that push their own signal.
#[derive(Debug)]
pub struct ManualPressure {
    needed: AtomicBool,
    free: AtomicU64,
}

impl ManualPressure {
    /// Starts without pressure and with unlimited free memory.
    pub fn new() -> Self {
        ManualPressure {
            needed: AtomicBool::new(false),
            free: AtomicU64::new(u64::MAX),
        }
    }

    /// Raises or clears the pressure signal.
    pub fn set_needed(&self, needed: bool) {
        self.needed.store(needed, Ordering::Relaxed);
    }

    /// Sets the free-memory figure.
    pub fn set_free(&self, free: u64) {
        self.free.store(free, Ordering::Relaxed);
    }
}

impl Default for ManualPressure {
    fn default() -> Self {
        ManualPressure::new()
    }
}

impl MemoryPressure for ManualPressure {
    fn reclaim_needed(&self) -> bool {
        self.needed.load(Ordering::Relaxed)
    }

    fn free_memory(&self) -> u64 {
        self.free.load(Ordering::Relaxed)
    }
}

/// Fallback for hosts without a usable memory signal: reports pressure on a
/// random one in `one_in` checks, so the cache keeps trimming itself a
/// little.
#[derive(Clone, Copy, Debug)]
pub struct SampledPressure {
    one_in: u32,
    free: u64,
}

impl SampledPressure {
    /// Pressure on average once every `one_in` checks; `free` is reported as
    /// the free memory.
    pub fn new(one_in: u32, free: u64) -> Self {
        SampledPressure {
            one_in: one_in.max(1),
            free,
        }
    }
}

impl Default for SampledPressure {
    fn default() -> Self {
        SampledPressure::new(100, u64::MAX)
    }
}

impl MemoryPressure for SampledPressure {
    fn reclaim_needed(&self) -> bool {
        rand::thread_rng().gen_ratio(1, self.one_in)
    }

    fn free_memory(&self) -> u64 {
        self.free
    }
}

/// How hard a reclaim pass works.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReclaimStrategy {
    /// Reap caches above the cache, keep the target.
    Conservative,
    /// Shrink the target as well.
    Aggressive,
}

impl ReclaimStrategy {
    fn toggle(self) -> Self {
        match self {
            ReclaimStrategy::Conservative => ReclaimStrategy::Aggressive,
            ReclaimStrategy::Aggressive => ReclaimStrategy::Conservative,
        }
    }
}

/// Consumer-side caches reaped under memory pressure.
pub trait ReclaimHook: Send + Sync {
    /// Gives memory back; called from the reclaim thread.
    fn reap(&self, strategy: ReclaimStrategy);
}

/// Wake flag and condition variable used to park a background thread.
#[derive(Debug, Default)]
pub(crate) struct Signal {
    pending: Mutex<bool>,
    cv: Condvar,
}

impl Signal {
    pub(crate) fn notify(&self) {
        *self.pending.lock() = true;
        self.cv.notify_all();
    }

    /// Sleeps for at most `timeout` unless already notified.
    pub(crate) fn wait(&self, timeout: Duration) {
        let mut pending = self.pending.lock();
        if !*pending {
            let _ = self.cv.wait_for(&mut pending, timeout);
        }
        *pending = false;
    }
}

struct ReclaimState {
    strategy: ReclaimStrategy,
    /// Growth stays frozen until then.
    grow_time: Option<Instant>,
    next_trim: Instant,
}

/// Reclaim bookkeeping embedded in the cache core.
pub(crate) struct Reclaimer {
    signal: Signal,
    state: Mutex<ReclaimState>,
    hooks: RwLock<Vec<Arc<dyn ReclaimHook>>>,
}

impl Reclaimer {
    pub(crate) fn new() -> Self {
        Reclaimer {
            signal: Signal::default(),
            state: Mutex::new(ReclaimState {
                strategy: ReclaimStrategy::Conservative,
                grow_time: None,
                next_trim: Instant::now(),
            }),
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn wake(&self) {
        self.signal.notify();
    }

    pub(crate) fn add_hook(&self, hook: Arc<dyn ReclaimHook>) {
        self.hooks.write().push(hook);
    }

    pub(crate) fn strategy(&self) -> ReclaimStrategy {
        self.state.lock().strategy
    }
}

impl fmt::Debug for Reclaimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reclaimer")
            .field("strategy", &self.strategy())
            .field("hooks", &self.hooks.read().len())
            .finish()
    }
}

impl ArcCore {
    /// One pass of the reclaim thread.
    pub(crate) fn reclaim_pass(&self) {
        let now = Instant::now();
        let pressure = self.pressure.reclaim_needed();
        let reap = {
            let mut rs = self.reclaim.state.lock();
            if pressure {
                if self.targets.no_grow() {
                    rs.strategy = rs.strategy.toggle();
                } else {
                    self.targets.set_no_grow(true);
                    rs.strategy = ReclaimStrategy::Aggressive;
                }
                rs.grow_time = Some(now + self.config.grow_retry);
                Some(rs.strategy)
            } else {
                if self.targets.no_grow() && rs.grow_time.map_or(true, |t| now >= t) {
                    self.targets.set_no_grow(false);
                    rs.grow_time = None;
                    debug!("memory pressure cleared, growth allowed");
                }
                None
            }
        };
        if let Some(strategy) = reap {
            self.reap_now(strategy);
            self.set_warm();
        }

        self.adjust();
        self.do_user_evicts();

        let trim = {
            let mut rs = self.reclaim.state.lock();
            if now >= rs.next_trim {
                rs.next_trim = now + self.config.reclaim.trim_interval;
                true
            } else {
                false
            }
        };
        if trim {
            self.trim_hole_refs();
        }
    }

    fn reap_now(&self, strategy: ReclaimStrategy) {
        if strategy == ReclaimStrategy::Aggressive {
            let freed = self.targets.shrink(self.size());
            debug!(freed, target = self.targets.target(), "shrinking cache target");
        }
        let hooks: Vec<_> = self.reclaim.hooks.read().iter().cloned().collect();
        for hook in hooks {
            hook.reap(strategy);
        }
    }

    /// Queues every inactive reference to a hole buffer; holes are never
    /// evicted so nothing else would ever release them.
    pub(crate) fn trim_hole_refs(&self) {
        for hole in self.holes() {
            let mut st = hole.state.lock();
            let inactive = std::mem::take(&mut st.inactive);
            for core in inactive {
                if !self.try_queue(&core) {
                    st.inactive.push(core);
                }
            }
        }
        self.do_user_evicts();
    }
}

/// Starts the reclaim thread.
pub(crate) fn spawn(core: Arc<ArcCore>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("arc-reclaim".into())
        .spawn(move || {
            info!("reclaim thread started");
            let interval = core.config.reclaim.interval;
            while !core.shut_down.load(Ordering::Acquire) {
                core.reclaim_pass();
                core.reclaim.signal.wait(interval);
            }
            info!("reclaim thread stopped");
        })
        .map_err(|source| CacheError::Spawn {
            name: "arc-reclaim",
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArcConfig;
    use crate::io::MemoryBlockIo;

    struct CountingHook(AtomicU64);

    impl ReclaimHook for CountingHook {
        fn reap(&self, _strategy: ReclaimStrategy) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn core(pressure: Arc<ManualPressure>) -> ArcCore {
        ArcCore::new(
            ArcConfig::for_blocks(1024, 64),
            Arc::new(MemoryBlockIo::new()),
            pressure,
        )
    }

    #[test]
    fn test_pressure_freezes_growth_and_alternates() {
        let pressure = Arc::new(ManualPressure::new());
        let core = core(Arc::clone(&pressure));
        let hook = Arc::new(CountingHook(AtomicU64::new(0)));
        core.reclaim.add_hook(hook.clone());
        let c = core.targets.target();

        pressure.set_needed(true);
        core.reclaim_pass();
        assert!(core.targets.no_grow());
        assert_eq!(core.reclaim.strategy(), ReclaimStrategy::Aggressive);
        assert!(core.targets.target() < c);
        assert!(core.is_warm());

        core.reclaim_pass();
        assert_eq!(core.reclaim.strategy(), ReclaimStrategy::Conservative);
        core.reclaim_pass();
        assert_eq!(core.reclaim.strategy(), ReclaimStrategy::Aggressive);
        assert_eq!(hook.0.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_growth_resumes_after_retry_interval() {
        let pressure = Arc::new(ManualPressure::new());
        let mut config = ArcConfig::for_blocks(1024, 64);
        config.grow_retry = Duration::ZERO;
        let core = ArcCore::new(config, Arc::new(MemoryBlockIo::new()), pressure.clone());

        pressure.set_needed(true);
        core.reclaim_pass();
        assert!(core.targets.no_grow());
        pressure.set_needed(false);
        core.reclaim_pass();
        assert!(!core.targets.no_grow());
    }

    #[test]
    fn test_signal_wakes_early() {
        let signal = Arc::new(Signal::default());
        signal.notify();
        let start = Instant::now();
        signal.wait(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_sampled_pressure_extremes() {
        assert!(SampledPressure::new(1, 0).reclaim_needed());
        assert_eq!(SampledPressure::default().free_memory(), u64::MAX);
    }
}
