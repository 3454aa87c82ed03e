//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent and may transiently disagree with each other
//! (e.g. a node can appear in neither the live nor the deferred gauge for
//! an instant). This is acceptable for diagnostic display. Do NOT use
//! these values for allocation decisions; per-pool totals live in the
//! pool header and are exact under its lock.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw
/// value may transiently dip below zero. Readers should always use
/// `load()`/`get()`, which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize) as isize
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0) as usize
    }
}

// Units currently handed out, across every pool in the process.
crate::sync::static_atomic! {
    pub static UNITS_BUSY: Counter = Counter::new();
}
// Run-list nodes currently linked into a pool.
crate::sync::static_atomic! {
    pub static NODES_LIVE: Counter = Counter::new();
}
// Nodes logically released but still waiting on a deferred drain.
crate::sync::static_atomic! {
    pub static NODES_DEFERRED: Counter = Counter::new();
}
