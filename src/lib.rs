pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod unr;

// allocators
pub use unr::pool::{PoolStats, Spares, UnitPool, BITMAP_BITS};
pub use unr::seq::Unr64;
pub use unr::shared::UnrAllocator;
