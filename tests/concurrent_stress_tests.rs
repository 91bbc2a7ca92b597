//! Stress Tests for the Block Cache
//!
//! Many threads hammer one cache while the reclaim and feed threads run.
//! Every read is checked against the content the physical layer holds, and
//! the accounting is checked once the threads are done.

use block_arc::config::{ArcConfig, ReclaimConfig, SecondTierConfig};
use block_arc::io::{MemoryBlockIo, MemoryDevice, Priority};
use block_arc::{BlockCache, BlockId, CacheError, ReadOptions, StateKind};
use rand::{Rng, SeedableRng};
use scoped_threadpool::Pool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const NUM_THREADS: u32 = 8;
const OPS_PER_THREAD: usize = 2_000;
const BLOCK: u64 = 64;
const KEYS: u128 = 256;

fn id(n: u128) -> BlockId {
    BlockId::new(1, n, 7)
}

fn content(n: u128) -> Vec<u8> {
    vec![(n % 251) as u8; BLOCK as usize]
}

// RUST_LOG=block_arc=debug shows the reclaim and feed threads at work
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn threaded_config(blocks: u64) -> ArcConfig {
    init_tracing();
    ArcConfig {
        reclaim: ReclaimConfig {
            enabled: true,
            interval: Duration::from_millis(2),
            trim_interval: Duration::from_millis(20),
        },
        ..ArcConfig::for_blocks(blocks, BLOCK)
    }
}

fn store() -> Arc<MemoryBlockIo> {
    let io = Arc::new(MemoryBlockIo::new());
    for n in 0..KEYS {
        io.insert(id(n), content(n));
    }
    io
}

/// Every thread reads random blocks from a cache a quarter of the working
/// set, with the reclaim thread running.
#[test]
fn stress_readers_with_reclaim() {
    let io = store();
    let cache = BlockCache::init(threaded_config(64), io.clone()).unwrap();
    let mut pool = Pool::new(NUM_THREADS);

    pool.scoped(|scope| {
        for t in 0..NUM_THREADS {
            let cache = &cache;
            scope.execute(move || {
                let mut rng = rand::rngs::StdRng::seed_from_u64(u64::from(t));
                for _ in 0..OPS_PER_THREAD {
                    let n = rng.gen_range(0..KEYS);
                    let out = cache.read(id(n), BLOCK, ReadOptions::default()).unwrap();
                    let r = out.reference.unwrap();
                    assert_eq!(r.to_vec(), Some(content(n)));
                }
            });
        }
    });

    // The reclaim thread may hold a buffer for a moment; retry until settled
    let mut sizes = cache.sizes();
    for _ in 0..50 {
        cache.adjust();
        sizes = cache.sizes();
        if sizes.size <= sizes.target {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert!(sizes.size <= sizes.target, "{sizes:?}");
    assert_eq!(sizes.anonymous, 0);
    let stats = cache.stats();
    assert_eq!(
        stats.hits + stats.misses,
        u64::from(NUM_THREADS) * OPS_PER_THREAD as u64
    );
}

/// Readers share hot blocks while writers keep adding new ones.
#[test]
fn stress_readers_and_writers() {
    let io = store();
    let cache = BlockCache::init(threaded_config(128), io.clone()).unwrap();
    let written = AtomicU64::new(0);
    let mut pool = Pool::new(NUM_THREADS);

    pool.scoped(|scope| {
        for t in 0..NUM_THREADS {
            let cache = &cache;
            let written = &written;
            scope.execute(move || {
                let mut rng = rand::rngs::StdRng::seed_from_u64(100 + u64::from(t));
                for i in 0..OPS_PER_THREAD / 4 {
                    if t % 2 == 0 {
                        let r = cache.alloc_reference(BLOCK, false).unwrap();
                        r.data_mut().unwrap().fill(t as u8);
                        let target = BlockId::new(2, (u128::from(t) << 32) | (i as u128 + 1), 1);
                        let got = cache.write(target, &r, Priority::Async).unwrap();
                        assert_eq!(got, target);
                        drop(r);
                        let back = cache.read(target, BLOCK, ReadOptions::default()).unwrap();
                        assert_eq!(back.reference.unwrap().to_vec(), Some(vec![t as u8; BLOCK as usize]));
                        written.fetch_add(1, Ordering::Relaxed);
                    } else {
                        let n = rng.gen_range(0..16);
                        let r = cache
                            .read(id(n), BLOCK, ReadOptions::default())
                            .unwrap()
                            .reference
                            .unwrap();
                        let copy = cache.loan_reference(&r).unwrap();
                        assert_eq!(copy.to_vec(), Some(content(n)));
                    }
                }
            });
        }
    });

    assert_eq!(
        written.load(Ordering::Relaxed),
        u64::from(NUM_THREADS / 2) * (OPS_PER_THREAD / 4) as u64
    );
    let sizes = cache.sizes();
    assert_eq!(sizes.io_writing, 0);
    assert_eq!(sizes.anonymous, 0);
}

/// Completions arrive on their own threads while references are dropped
/// and made writable concurrently.
#[test]
fn stress_async_completions() {
    let io = Arc::new(MemoryBlockIo::new().asynchronous());
    for n in 0..32 {
        io.insert(id(n), content(n));
    }
    let cache = Arc::new(BlockCache::init(threaded_config(16), io).unwrap());
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..200u128 {
                    let n = (i * 7 + t) % 32;
                    let r = cache
                        .read(id(n), BLOCK, ReadOptions::default())
                        .unwrap()
                        .reference
                        .unwrap();
                    if i % 5 == 0 {
                        cache.make_writable(&r).unwrap();
                        r.data_mut().unwrap()[0] = 0xff;
                    } else {
                        assert_eq!(r.to_vec(), Some(content(n)));
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(cache.sizes().anonymous, 0);
}

/// Inactive references race with eviction: each one is either reactivated
/// or has its callback run, never both and never neither.
#[test]
fn stress_inactive_references() {
    let io = store();
    let cache = BlockCache::init(threaded_config(32), io).unwrap();
    let callbacks = Arc::new(AtomicU64::new(0));
    let reactivated = AtomicU64::new(0);
    let total = AtomicU64::new(0);
    let mut pool = Pool::new(4);

    pool.scoped(|scope| {
        for t in 0..4u32 {
            let cache = &cache;
            let callbacks = Arc::clone(&callbacks);
            let reactivated = &reactivated;
            let total = &total;
            scope.execute(move || {
                let mut parked = Vec::new();
                for i in 0..200u128 {
                    let n = (i + u128::from(t) * 50) % KEYS;
                    let r = cache
                        .read(id(n), BLOCK, ReadOptions::default())
                        .unwrap()
                        .reference
                        .unwrap();
                    let seen = Arc::clone(&callbacks);
                    cache
                        .inactivate(&r, Arc::new(move |_ctx: u64| { seen.fetch_add(1, Ordering::SeqCst); }), i as u64)
                        .unwrap();
                    total.fetch_add(1, Ordering::SeqCst);
                    parked.push(r);
                }
                for r in &parked {
                    match cache.reactivate(r) {
                        Ok(()) => {
                            reactivated.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(CacheError::NotFound) => {}
                        Err(e) => panic!("unexpected reactivate error: {e}"),
                    }
                }
            });
        }
    });

    // Let the reclaim thread drain whatever was queued
    for _ in 0..100 {
        cache.reclaim_now();
        if callbacks.load(Ordering::SeqCst) + reactivated.load(Ordering::SeqCst)
            == total.load(Ordering::SeqCst)
        {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(
        callbacks.load(Ordering::SeqCst) + reactivated.load(Ordering::SeqCst),
        total.load(Ordering::SeqCst)
    );
}

/// Readers against a cache whose feed thread copies to a second tier; every
/// read, from whichever tier, returns the right bytes.
#[test]
fn stress_with_second_tier_feed() {
    let io = store();
    let config = ArcConfig {
        second_tier: SecondTierConfig {
            feed_enabled: true,
            feed_interval: Duration::from_millis(2),
            feed_min_interval: Duration::from_millis(1),
            ..SecondTierConfig::default()
        },
        ..threaded_config(32)
    };
    let cache = BlockCache::init(config, io.clone()).unwrap();
    cache.add_secondary_device(1, Arc::new(MemoryDevice::new(256 * 1024, 64)));
    let mut pool = Pool::new(NUM_THREADS);

    pool.scoped(|scope| {
        for t in 0..NUM_THREADS {
            let cache = &cache;
            scope.execute(move || {
                let mut rng = rand::rngs::StdRng::seed_from_u64(1_000 + u64::from(t));
                for _ in 0..OPS_PER_THREAD / 2 {
                    let n = rng.gen_range(0..KEYS);
                    let out = cache.read(id(n), BLOCK, ReadOptions::default()).unwrap();
                    assert_eq!(out.reference.unwrap().to_vec(), Some(content(n)));
                }
            });
        }
    });

    let stats = cache.stats();
    assert_eq!(stats.l2_cksum_bad, 0);
    assert_eq!(stats.read_errors, 0);
    cache.evict_bytes(StateKind::Recent, u64::MAX).unwrap();
    cache.shutdown();
    assert_eq!(cache.sizes().size, 0);
}
