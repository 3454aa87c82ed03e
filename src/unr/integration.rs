#![cfg(all(test, not(loom)))]
//! Cross-module scenarios: whole-range alloc/free patterns, randomized
//! oracle checks against a dense mirror, and the process-wide gauges.

use crate::sync::Arc;
use crate::unr::pool::UnitPool;
use crate::unr::seq::Unr64;
use crate::unr::shared::UnrAllocator;
use crate::unr::stats;

/// splitmix64, seeded: stress runs are deterministic and replayable.
struct SplitMix64(u64);

impl SplitMix64 {
    fn new(seed: u64) -> Self {
        Self(seed)
    }

    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }
}

fn free(pool: &mut UnitPool, item: u64) {
    let mut spares = pool.obtain_spares();
    pool.free_locked(item, &mut spares);
    pool.return_spares(spares);
    pool.drain_deferred();
}

#[test]
fn test_even_odd_refill_in_order() {
    let _guard = crate::unr::TEST_MUTEX.read().unwrap();
    let alloc = UnrAllocator::new(0, 99);
    for expect in 0..100 {
        assert_eq!(alloc.allocate(), Some(expect));
    }
    for item in (0..100).step_by(2) {
        alloc.free(item);
    }
    assert_eq!(alloc.busy(), 50);

    // Refills come back lowest-first: exactly the evens, ascending.
    for expect in (0..100).step_by(2) {
        assert_eq!(alloc.allocate(), Some(expect));
    }
    assert_eq!(alloc.allocate(), None);
    assert_eq!(alloc.busy(), 100);

    for item in 0..100 {
        alloc.free(item);
    }
    assert_eq!(alloc.busy(), 0);
    alloc.destroy();
}

#[test]
fn test_random_ops_match_dense_oracle() {
    let _guard = crate::unr::TEST_MUTEX.read().unwrap();
    const UNITS: usize = 64;

    let mut pool = UnitPool::new(0, UNITS as u64 - 1);
    let mut mirror = [false; UNITS];
    let mut rng = SplitMix64::new(0x5eed);

    for _ in 0..2000 {
        let r = (rng.next() % UNITS as u64) as usize;
        if mirror[r] {
            free(&mut pool, r as u64);
            mirror[r] = false;
        } else if rng.next() % 2 == 0 {
            // The unit is free in the mirror, so a targeted claim succeeds.
            let mut spares = pool.obtain_spares();
            assert_eq!(pool.alloc_specific(r as u64, &mut spares), Some(r as u64));
            pool.return_spares(spares);
            pool.drain_deferred();
            mirror[r] = true;
        } else {
            let oracle = mirror.iter().position(|&b| !b).unwrap() as u64;
            assert_eq!(pool.alloc_lowest(), Some(oracle), "lowest-free mismatch");
            mirror[oracle as usize] = true;
        }
        pool.check_invariants();
        assert_eq!(pool.busy(), mirror.iter().filter(|&&b| b).count() as u64);
    }

    for (item, _) in mirror.iter().enumerate().filter(|(_, &b)| b) {
        free(&mut pool, item as u64);
    }
    assert_eq!(pool.busy(), 0);
    assert_eq!(pool.live_nodes(), 0, "an empty pool holds no run nodes");
    pool.drain_deferred();
    pool.destroy();
}

#[test]
fn test_heavy_fragmentation_stays_compact() {
    let _guard = crate::unr::TEST_MUTEX.read().unwrap();
    const UNITS: u64 = 512;

    let mut pool = UnitPool::new(0, UNITS - 1);
    for _ in 0..UNITS {
        pool.alloc_lowest();
    }
    for item in (0..UNITS).step_by(2) {
        free(&mut pool, item);
    }
    assert_eq!(pool.busy(), UNITS / 2);
    // 256 single-unit holes would be 512 plain runs; bitmap chunks keep it
    // to a handful of nodes.
    assert!(
        pool.live_nodes() <= 4,
        "fragmented range not compacted: {} nodes",
        pool.live_nodes()
    );

    for expect in (0..UNITS).step_by(2) {
        assert_eq!(pool.alloc_lowest(), Some(expect));
    }
    assert_eq!(pool.busy(), UNITS);
    for item in 0..UNITS {
        free(&mut pool, item);
    }
    assert_eq!(pool.live_nodes(), 0);
    pool.drain_deferred();
    pool.destroy();
}

#[test]
fn test_global_gauges_track_pools() {
    // Write guard: this test asserts on the process-wide gauges, so no
    // other pool test may run concurrently.
    let _guard = crate::unr::TEST_MUTEX.write().unwrap();

    let busy_base = stats::UNITS_BUSY.get();
    let live_base = stats::NODES_LIVE.get();
    let deferred_base = stats::NODES_DEFERRED.get();

    let mut pool = UnitPool::new(0, 19);
    for _ in 0..10 {
        pool.alloc_lowest();
    }
    assert_eq!(stats::UNITS_BUSY.get(), busy_base + 10);

    let mut spares = pool.obtain_spares();
    pool.free_locked(5, &mut spares);
    pool.return_spares(spares);
    assert_eq!(stats::UNITS_BUSY.get(), busy_base + 9);
    assert_eq!(stats::NODES_LIVE.get(), live_base + pool.live_nodes());

    // Refilling the gap merges nodes away; they move to the deferred gauge
    // until drained.
    pool.alloc_lowest();
    assert_eq!(stats::NODES_LIVE.get(), live_base);
    assert_eq!(stats::NODES_DEFERRED.get(), deferred_base + pool.deferred_nodes());
    pool.drain_deferred();
    assert_eq!(stats::NODES_DEFERRED.get(), deferred_base);

    for item in 0..10 {
        free(&mut pool, item);
    }
    assert_eq!(stats::UNITS_BUSY.get(), busy_base);
    pool.drain_deferred();
    pool.destroy();
}

#[test]
fn test_unr64_unique_across_threads() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 1000;

    let seq = Arc::new(Unr64::new(0));
    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let seq = Arc::clone(&seq);
        handles.push(std::thread::spawn(move || {
            (0..PER_THREAD).map(|_| seq.next()).collect::<Vec<_>>()
        }));
    }
    let mut units: Vec<u64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    units.sort_unstable();
    let expect: Vec<u64> = (0..(THREADS * PER_THREAD) as u64).collect();
    assert_eq!(units, expect, "concurrent counter skipped or repeated a unit");
}
