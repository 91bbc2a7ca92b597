use block_arc::config::ArcConfig;
use block_arc::io::{MemoryBlockIo, MemoryDevice, Priority};
use block_arc::{BlockCache, BlockId, ReadOptions, StateKind};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

const BLOCK: u64 = 4096;
const CACHE_BLOCKS: u64 = 1000;

fn id(n: u64) -> BlockId {
    BlockId::new(1, u128::from(n), 1)
}

// Cache of CACHE_BLOCKS blocks over a store of `stored` blocks
fn make_cache(stored: u64) -> (BlockCache, Arc<MemoryBlockIo>) {
    let io = Arc::new(MemoryBlockIo::new());
    for n in 0..stored {
        io.insert(id(n), vec![n as u8; BLOCK as usize]);
    }
    let cache = BlockCache::init(ArcConfig::for_blocks(CACHE_BLOCKS, BLOCK), io.clone()).unwrap();
    (cache, io)
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("Block Cache Operations");

    {
        let (cache, _io) = make_cache(CACHE_BLOCKS);
        for n in 0..CACHE_BLOCKS {
            cache.read(id(n), BLOCK, ReadOptions::default()).unwrap();
        }

        group.bench_function("read hit", |b| {
            b.iter(|| {
                for n in 0..100 {
                    black_box(cache.read(id(n % CACHE_BLOCKS), BLOCK, ReadOptions::default()).unwrap());
                }
            });
        });

        group.bench_function("probe", |b| {
            b.iter(|| {
                for n in 0..100 {
                    black_box(cache.probe(&id(n)));
                }
            });
        });
    }

    {
        // Working set twice the cache: every other read misses and evicts
        let (cache, _io) = make_cache(2 * CACHE_BLOCKS);
        let mut next = 0;
        group.bench_function("read miss with eviction", |b| {
            b.iter(|| {
                for _ in 0..100 {
                    next = (next + 1) % (2 * CACHE_BLOCKS);
                    black_box(cache.read(id(next), BLOCK, ReadOptions::default()).unwrap());
                }
            });
        });
    }

    {
        let (cache, _io) = make_cache(0);
        group.bench_function("alloc, write and release", |b| {
            b.iter(|| {
                let r = cache.alloc_reference(BLOCK, false).unwrap();
                black_box(cache.write(BlockId::new(2, 0, 0), &r, Priority::Sync).unwrap());
            });
        });
    }

    {
        let (cache, _io) = make_cache(256);
        cache.add_secondary_device(1, Arc::new(MemoryDevice::new(64 << 20, 512)));
        for n in 0..256 {
            cache.read(id(n), BLOCK, ReadOptions::default()).unwrap();
        }
        cache.feed_second_tier();
        cache.evict_bytes(StateKind::Recent, u64::MAX).unwrap();

        group.bench_function("second tier read", |b| {
            b.iter(|| {
                for n in 0..16 {
                    black_box(cache.read(id(n), BLOCK, ReadOptions::default()).unwrap());
                }
                cache.evict_bytes(StateKind::Frequent, u64::MAX).unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
