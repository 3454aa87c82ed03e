use crate::sync::cell::UnsafeCell;
use crate::sync::{unsafe_cell_get_mut, Arc, Mutex, OnceLock};

use super::pool::{PoolStats, UnitPool};

/// Process-wide fallback lock, shared by every allocator built with
/// [`UnrAllocator::new`]. Created on first use.
fn default_lock() -> Arc<Mutex<()>> {
    static DEFAULT_LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    DEFAULT_LOCK
        .get_or_init(|| Arc::new(Mutex::new(())))
        .clone()
}

/// A [`UnitPool`] bundled with the mutex that serializes access to it.
///
/// The lock is external and shareable: several allocators can hand in the
/// same `Arc<Mutex<()>>` (say, one already guarding the subsystem that owns
/// them) and every operation on any of them is then serialized by that one
/// mutex. [`new`](Self::new) falls back to a process-wide default lock.
///
/// Spare node slots are obtained at the top of each critical section, so
/// the run-list mutation itself never allocates while the lock is held, and
/// the deferred slot list is drained on the way out.
pub struct UnrAllocator {
    lock: Arc<Mutex<()>>,
    state: UnsafeCell<UnitPool>,
}

// Safety: `state` is only touched while `lock` is held (or through `&mut
// self`/`self`), so the cell never sees concurrent access.
unsafe impl Send for UnrAllocator {}
unsafe impl Sync for UnrAllocator {}

impl UnrAllocator {
    /// Allocator over `[low, high]` guarded by the process-wide default
    /// lock. Panics on an invalid range, like [`UnitPool::new`].
    #[must_use]
    pub fn new(low: u64, high: u64) -> Self {
        Self::with_lock(low, high, default_lock())
    }

    /// Allocator over `[low, high]` guarded by a caller-supplied lock.
    #[must_use]
    pub fn with_lock(low: u64, high: u64, lock: Arc<Mutex<()>>) -> Self {
        Self {
            lock,
            state: UnsafeCell::new(UnitPool::new(low, high)),
        }
    }

    /// Allocate the lowest free unit, or `None` on exhaustion.
    pub fn allocate(&self) -> Option<u64> {
        let _guard = self.lock.lock().expect("unit pool lock poisoned");
        // Safety: lock held.
        let pool = unsafe_cell_get_mut!(self.state);
        let unit = pool.alloc_lowest();
        pool.drain_deferred();
        unit
    }

    /// Claim `item` specifically; `None` if out of range or taken.
    pub fn allocate_specific(&self, item: u64) -> Option<u64> {
        let _guard = self.lock.lock().expect("unit pool lock poisoned");
        // Safety: lock held.
        let pool = unsafe_cell_get_mut!(self.state);
        let mut spares = pool.obtain_spares();
        let unit = pool.alloc_specific(item, &mut spares);
        pool.return_spares(spares);
        pool.drain_deferred();
        unit
    }

    /// Return `item` to the pool. Panics if it was not allocated.
    pub fn free(&self, item: u64) {
        let _guard = self.lock.lock().expect("unit pool lock poisoned");
        // Safety: lock held.
        let pool = unsafe_cell_get_mut!(self.state);
        let mut spares = pool.obtain_spares();
        pool.free_locked(item, &mut spares);
        pool.return_spares(spares);
        pool.drain_deferred();
    }

    /// Drain any deferred slots. The normal operations already do this on
    /// their way out; exposed for callers poking at the pool directly via
    /// [`with_pool`](Self::with_pool).
    pub fn clean(&self) {
        let _guard = self.lock.lock().expect("unit pool lock poisoned");
        // Safety: lock held.
        unsafe_cell_get_mut!(self.state).drain_deferred();
    }

    /// Units currently allocated.
    #[must_use]
    pub fn busy(&self) -> u64 {
        let _guard = self.lock.lock().expect("unit pool lock poisoned");
        // Safety: lock held.
        unsafe_cell_get_mut!(self.state).busy()
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let _guard = self.lock.lock().expect("unit pool lock poisoned");
        // Safety: lock held.
        unsafe_cell_get_mut!(self.state).stats()
    }

    /// Handle to the mutex guarding this allocator, for hosts that embed
    /// the pool inside a wider critical section of their own.
    #[must_use]
    pub fn lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.lock)
    }

    /// Run `f` against the pool under the lock.
    pub fn with_pool<R>(&self, f: impl FnOnce(&mut UnitPool) -> R) -> R {
        let _guard = self.lock.lock().expect("unit pool lock poisoned");
        // Safety: lock held.
        f(unsafe_cell_get_mut!(self.state))
    }

    /// Tear the allocator down. Panics if any unit is still allocated.
    pub fn destroy(self) {
        // Exclusive ownership; no lock needed.
        self.state.into_inner().destroy();
    }
}

impl std::fmt::Debug for UnrAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let _guard = self.lock.lock().expect("unit pool lock poisoned");
        // Safety: lock held.
        let pool: &mut UnitPool = unsafe_cell_get_mut!(self.state);
        write!(f, "UnrAllocator({pool:?})")
    }
}
