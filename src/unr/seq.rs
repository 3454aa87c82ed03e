use crate::sync::atomic::{AtomicU64, Ordering};

/// Monotonic unit source for callers that never free.
///
/// With 64 bits of unit space, reuse is pointless: even at a billion
/// allocations per second the counter outlives any process. `next` is a
/// single atomic increment, so no lock and no run list are needed.
pub struct Unr64 {
    counter: AtomicU64,
}

impl Unr64 {
    /// Counter whose first handed-out unit is `start`.
    #[cfg(not(loom))]
    #[must_use]
    pub const fn new(start: u64) -> Self {
        Self {
            counter: AtomicU64::new(start),
        }
    }

    #[cfg(loom)]
    #[must_use]
    pub fn new(start: u64) -> Self {
        Self {
            counter: AtomicU64::new(start),
        }
    }

    /// Hand out the next unit. Wraps on overflow, which is unreachable in
    /// practice.
    #[inline]
    pub fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    /// The unit the next call to [`next`](Self::next) would return. Racy
    /// under concurrent use; diagnostic only.
    #[must_use]
    pub fn peek(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_from_start() {
        let seq = Unr64::new(7);
        assert_eq!(seq.peek(), 7);
        assert_eq!(seq.next(), 7);
        assert_eq!(seq.next(), 8);
        assert_eq!(seq.next(), 9);
        assert_eq!(seq.peek(), 10);
    }

    #[test]
    fn test_sequence_from_zero() {
        let seq = Unr64::new(0);
        for expect in 0..100 {
            assert_eq!(seq.next(), expect);
        }
    }
}
