//! Correctness Tests for the Block Cache
//!
//! Small caches with one-byte blocks so every eviction is predictable. Each
//! test checks where a block ended up (live state, ghost state, gone) rather
//! than just whether a read succeeded.
//!
//! ## Test Strategy
//! - `ArcConfig::for_blocks` with the background threads off
//! - The in-memory physical layer, so reads and writes are counted
//! - Explicit residency checks with `probe` after each step

use block_arc::config::ArcConfig;
use block_arc::io::{MemoryBlockIo, Priority};
use block_arc::{
    BlockCache, BlockId, CacheError, Find, ReadOptions, ReadSource, Residency, StateKind,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const BLOCK: u64 = 1;

// ============================================================================
// HELPERS
// ============================================================================

fn id(n: u128) -> BlockId {
    BlockId::new(1, n, 1)
}

/// Cache of `blocks` blocks over a store holding blocks 1..=`stored`.
fn make_cache(blocks: u64, stored: u128) -> (BlockCache, Arc<MemoryBlockIo>) {
    make_cache_with(ArcConfig::for_blocks(blocks, BLOCK), stored)
}

fn make_cache_with(config: ArcConfig, stored: u128) -> (BlockCache, Arc<MemoryBlockIo>) {
    let io = Arc::new(MemoryBlockIo::new());
    for n in 1..=stored {
        io.insert(id(n), vec![n as u8; config.max_block_size as usize]);
    }
    let cache = BlockCache::init(config, io.clone()).unwrap();
    (cache, io)
}

/// Reads a block and drops the reference straight away.
fn touch(cache: &BlockCache, n: u128) -> ReadSource {
    cache
        .read(id(n), BLOCK, ReadOptions::default())
        .unwrap()
        .source
}

// ============================================================================
// REPLACEMENT
// ============================================================================

#[test]
fn test_four_block_scenario() {
    let (cache, _io) = make_cache(4, 5);
    let (a, e) = (1, 5);

    for n in 1..=4 {
        assert_eq!(touch(&cache, n), ReadSource::Primary);
    }
    assert_eq!(cache.sizes().size, 4);
    assert_eq!(cache.sizes().recency_share, 2);

    // E pushes the oldest block out into Recent-Ghost
    assert_eq!(touch(&cache, e), ReadSource::Primary);
    assert_eq!(cache.probe(&id(a)), Residency::Ghost(StateKind::RecentGhost));
    assert_eq!(cache.probe(&id(e)), Residency::Live(StateKind::Recent));

    match cache.find(&id(a)) {
        Find::Ghost { state, second_tier } => {
            assert_eq!(state, StateKind::RecentGhost);
            assert!(!second_tier);
        }
        other => panic!("expected a ghost for A, got {other:?}"),
    }

    // The ghost hit brings A straight into Frequent and favours recency
    let before = cache.sizes().recency_share;
    assert_eq!(touch(&cache, a), ReadSource::Primary);
    assert_eq!(cache.probe(&id(a)), Residency::Live(StateKind::Frequent));
    assert!(cache.sizes().recency_share > before);
    assert_eq!(cache.sizes().recency_share, 3);
    assert_eq!(cache.stats().recent_ghost_hits, 1);
}

#[test]
fn test_never_inserted_is_a_miss() {
    let (cache, _io) = make_cache(4, 1);
    assert!(matches!(cache.find(&id(42)), Find::Miss));
    assert_eq!(cache.probe(&id(42)), Residency::Absent);
}

#[test]
fn test_find_after_insert_returns_data() {
    let (cache, io) = make_cache(4, 2);
    touch(&cache, 2);
    match cache.find(&id(2)) {
        Find::Hit(r) => assert_eq!(r.to_vec(), Some(vec![2])),
        other => panic!("expected a hit, got {other:?}"),
    }
    assert_eq!(io.reads(), 1);
}

#[test]
fn test_second_access_promotes() {
    let (cache, _io) = make_cache(4, 1);
    touch(&cache, 1);
    assert_eq!(cache.probe(&id(1)), Residency::Live(StateKind::Recent));
    assert_eq!(touch(&cache, 1), ReadSource::Memory);
    assert_eq!(cache.probe(&id(1)), Residency::Live(StateKind::Frequent));

    // Further accesses never move it back
    for _ in 0..3 {
        touch(&cache, 1);
        assert_eq!(cache.probe(&id(1)), Residency::Live(StateKind::Frequent));
    }
}

#[test]
fn test_burst_within_interval_does_not_promote() {
    let config = ArcConfig {
        min_access_interval: Duration::from_secs(3600),
        ..ArcConfig::for_blocks(4, BLOCK)
    };
    let (cache, _io) = make_cache_with(config, 1);
    for _ in 0..5 {
        touch(&cache, 1);
    }
    assert_eq!(cache.probe(&id(1)), Residency::Live(StateKind::Recent));
}

#[test]
fn test_held_blocks_survive_eviction() {
    let (cache, _io) = make_cache(4, 8);
    let held = cache.read(id(1), BLOCK, ReadOptions::default()).unwrap();
    for n in 2..=8 {
        touch(&cache, n);
    }
    assert_eq!(cache.probe(&id(1)), Residency::Live(StateKind::Recent));
    assert_eq!(held.reference.unwrap().to_vec(), Some(vec![1]));
}

#[test]
fn test_evict_bytes_zero_and_all() {
    let (cache, _io) = make_cache(8, 4);
    for n in 1..=4 {
        touch(&cache, n);
    }
    assert_eq!(cache.evict_bytes(StateKind::Recent, 0).unwrap(), 0);
    assert_eq!(cache.sizes().recent, 4);

    assert_eq!(cache.evict_bytes(StateKind::Recent, u64::MAX).unwrap(), 4);
    assert_eq!(cache.sizes().recent, 0);
    assert_eq!(cache.sizes().recent_ghosts, 4);
}

#[test]
fn test_adjust_keeps_ghosts_bounded() {
    let (cache, _io) = make_cache(4, 64);
    for n in 1..=64 {
        touch(&cache, n);
    }
    cache.adjust();
    let sizes = cache.sizes();
    assert!(sizes.size <= sizes.target);
    assert!(sizes.recent + sizes.recent_ghosts <= sizes.target + 1);
    assert!(sizes.recent_ghosts + sizes.frequent_ghosts <= sizes.target + 1);
}

#[test]
fn test_flush_pool_forgets_history() {
    let (cache, io) = make_cache(4, 6);
    let other = BlockId::new(2, 1, 1);
    io.insert(other, vec![9]);
    for n in 1..=6 {
        touch(&cache, n);
    }
    cache.read(other, BLOCK, ReadOptions::default()).unwrap();

    cache.flush(Some(1));
    for n in 1..=6 {
        assert_eq!(cache.probe(&id(n)), Residency::Absent);
    }
    assert_eq!(cache.probe(&other), Residency::Live(StateKind::Recent));

    cache.flush(None);
    assert_eq!(cache.sizes().size, 0);
}

// ============================================================================
// WRITES
// ============================================================================

#[test]
fn test_write_then_read() {
    let config = ArcConfig::for_blocks(16, 8);
    let (cache, io) = make_cache_with(config, 0);
    let r = cache.alloc_reference(8, false).unwrap();
    r.data_mut().unwrap().copy_from_slice(b"blockarc");

    let written = cache.write(BlockId::new(1, 0, 0), &r, Priority::Sync).unwrap();
    assert!(!written.is_anonymous());
    assert_eq!(r.id(), written);
    assert!(!r.is_anonymous());
    drop(r);

    let out = cache.read(written, 8, ReadOptions::default()).unwrap();
    assert_eq!(out.source, ReadSource::Memory);
    assert_eq!(out.reference.unwrap().to_vec().unwrap(), b"blockarc");
    assert_eq!(io.reads(), 0);
    assert_eq!(io.get(&written).unwrap(), b"blockarc");
}

#[test]
fn test_failed_write_keeps_data() {
    let config = ArcConfig::for_blocks(16, 8);
    let (cache, io) = make_cache_with(config, 0);
    let r = cache.alloc_reference(8, false).unwrap();
    r.data_mut().unwrap().fill(7);

    io.fail_next_writes(1);
    let target = BlockId::new(1, 77, 3);
    assert!(matches!(
        cache.write(target, &r, Priority::Sync),
        Err(CacheError::Io(_))
    ));
    assert!(r.is_anonymous());
    assert_eq!(r.to_vec(), Some(vec![7; 8]));
    assert_eq!(cache.probe(&target), Residency::Absent);
    assert_eq!(cache.sizes().io_writing, 0);

    // A retry goes through
    assert_eq!(cache.write(target, &r, Priority::Sync).unwrap(), target);
}

#[test]
fn test_async_write_with_dropped_reference() {
    let config = ArcConfig::for_blocks(16, 8);
    let io = Arc::new(MemoryBlockIo::new().asynchronous());
    let cache = BlockCache::init(config, io).unwrap();

    let r = cache.alloc_reference(8, false).unwrap();
    let (tx, rx) = std::sync::mpsc::channel();
    cache
        .write_async(BlockId::new(1, 5, 5), &r, Priority::Async, move |res| {
            tx.send(res.map_err(|e| e.to_string())).unwrap();
        })
        .unwrap();
    drop(r);

    let written = rx.recv().unwrap().unwrap();
    assert_eq!(cache.probe(&written), Residency::Live(StateKind::Recent));
    let sizes = cache.sizes();
    assert_eq!(sizes.recent_evictable, 8);
    assert_eq!(sizes.anonymous, 0);
    assert_eq!(sizes.io_writing, 0);
}

#[test]
fn test_pending_write_accounting() {
    let config = ArcConfig::for_blocks(16, 8);
    let (cache, _io) = make_cache_with(config, 0);
    let r = cache.alloc_reference(8, false).unwrap();
    assert!(!cache.make_writable_pending(&r).unwrap());
    assert_eq!(cache.sizes().io_pending, 8);

    cache.write(BlockId::new(1, 9, 9), &r, Priority::Sync).unwrap();
    assert_eq!(cache.sizes().io_pending, 0);
    assert_eq!(cache.sizes().io_writing, 0);
}

// ============================================================================
// REFERENCE PROTOCOL
// ============================================================================

#[test]
fn test_make_writable_steals_sole_reference() {
    let (cache, _io) = make_cache(4, 1);
    let r = cache
        .read(id(1), BLOCK, ReadOptions::default())
        .unwrap()
        .reference
        .unwrap();
    assert!(!cache.make_writable(&r).unwrap());
    assert!(r.is_anonymous());
    assert_eq!(cache.probe(&id(1)), Residency::Absent);
    assert_eq!(cache.sizes().anonymous, 1);

    r.data_mut().unwrap()[0] = 200;
    assert_eq!(r.to_vec(), Some(vec![200]));
}

#[test]
fn test_make_writable_copies_shared_data() {
    let (cache, _io) = make_cache(4, 1);
    let r1 = cache
        .read(id(1), BLOCK, ReadOptions::default())
        .unwrap()
        .reference
        .unwrap();
    let r2 = cache.loan_reference(&r1).unwrap();

    assert!(cache.make_writable(&r1).unwrap());
    r1.data_mut().unwrap()[0] = 99;
    assert_eq!(r2.to_vec(), Some(vec![1]));
    assert_eq!(cache.probe(&id(1)), Residency::Live(StateKind::Recent));

    // Shared references cannot be written through
    assert!(r2.data_mut().is_err());
}

#[test]
fn test_inactive_reference_callback_and_reactivate() {
    let (cache, _io) = make_cache(4, 2);
    let evicted = Arc::new(AtomicU64::new(0));
    let r = cache
        .read(id(1), BLOCK, ReadOptions::default())
        .unwrap()
        .reference
        .unwrap();
    let seen = Arc::clone(&evicted);
    cache
        .inactivate(&r, Arc::new(move |ctx: u64| { seen.store(ctx, Ordering::SeqCst); }), 17)
        .unwrap();
    assert!(!r.is_active());
    cache.reactivate(&r).unwrap();
    assert_eq!(r.to_vec(), Some(vec![1]));

    let seen = Arc::clone(&evicted);
    cache
        .inactivate(&r, Arc::new(move |ctx: u64| { seen.store(ctx, Ordering::SeqCst); }), 23)
        .unwrap();
    assert_eq!(cache.evict_bytes(StateKind::Frequent, 1).unwrap(), 1);
    cache.reclaim_now();
    assert_eq!(evicted.load(Ordering::SeqCst), 23);
    assert!(matches!(cache.reactivate(&r), Err(CacheError::NotFound)));
}

#[test]
fn test_evict_reference_destroys_unused_buffer() {
    let (cache, _io) = make_cache(4, 1);
    let r = cache
        .read(id(1), BLOCK, ReadOptions::default())
        .unwrap()
        .reference
        .unwrap();
    cache.inactivate(&r, Arc::new(|_ctx: u64| {}), 0).unwrap();
    cache.evict_reference(&r).unwrap();
    assert_eq!(cache.probe(&id(1)), Residency::Absent);
    assert!(matches!(cache.evict_reference(&r), Err(CacheError::InProgress)));
}

#[cfg_attr(debug_assertions, should_panic)]
#[test]
fn test_free_with_callback_is_rejected() {
    let (cache, _io) = make_cache(4, 1);
    let r = cache
        .read(id(1), BLOCK, ReadOptions::default())
        .unwrap()
        .reference
        .unwrap();
    cache.inactivate(&r, Arc::new(|_ctx: u64| {}), 0).unwrap();
    assert!(matches!(
        cache.free_reference(r),
        Err(CacheError::CallbackRegistered)
    ));
}

#[test]
fn test_loan_and_return() {
    let config = ArcConfig::for_blocks(16, 8);
    let (cache, _io) = make_cache_with(config, 0);
    let r = cache.loan_buffer(8, false).unwrap();
    assert_eq!(cache.sizes().loaned, 8);
    cache.return_loan(&r).unwrap();
    assert_eq!(cache.sizes().loaned, 0);
    cache.free_reference(r).unwrap();
    assert_eq!(cache.sizes().anonymous, 0);
}

#[test]
fn test_make_hole_and_clone() {
    let config = ArcConfig::for_blocks(16, 8);
    let (cache, _io) = make_cache_with(config, 0);
    let r = cache.alloc_reference_from(vec![4; 8], true).unwrap();
    let copy = cache.clone_reference(&r).unwrap();
    cache.make_hole(&r).unwrap();

    assert!(r.is_hole());
    assert!(r.is_metadata());
    assert_eq!(r.to_vec(), Some(vec![0; 8]));
    assert_eq!(copy.to_vec(), Some(vec![4; 8]));
    assert_eq!(cache.sizes().anonymous, 8);
}

#[cfg_attr(debug_assertions, should_panic)]
#[test]
fn test_modifying_frozen_data_is_detected() {
    let config = ArcConfig {
        debug_checksums: true,
        ..ArcConfig::for_blocks(16, 8)
    };
    let (cache, _io) = make_cache_with(config, 0);
    let r = cache.alloc_reference(8, false).unwrap();
    cache.freeze(&r).unwrap();
    r.data_mut().unwrap()[3] = 1;
    assert!(matches!(
        cache.free_reference(r),
        Err(CacheError::FrozenModified(_))
    ));
}

#[test]
fn test_thaw_allows_modification() {
    let config = ArcConfig {
        debug_checksums: true,
        ..ArcConfig::for_blocks(16, 8)
    };
    let (cache, _io) = make_cache_with(config, 0);
    let r = cache.alloc_reference(8, false).unwrap();
    cache.freeze(&r).unwrap();
    cache.thaw(&r);
    r.data_mut().unwrap()[3] = 1;
    cache.free_reference(r).unwrap();
}

// ============================================================================
// ADMISSION
// ============================================================================

#[test]
fn test_tempreserve_round_trip() {
    let config = ArcConfig::for_blocks(64, 64);
    let (cache, _io) = make_cache_with(config, 0);
    assert!(cache.tempreserve_space(1 << 30, 1).is_err());
    cache.tempreserve_space(256, 1).unwrap();
    assert_eq!(cache.sizes().reserved, 256);
    cache.tempreserve_clear(256);
    assert_eq!(cache.sizes().reserved, 0);
}
