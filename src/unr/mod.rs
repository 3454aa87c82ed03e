pub(crate) mod integration;
pub(crate) mod node;
pub(crate) mod pool;
pub(crate) mod seq;
pub(crate) mod shared;
pub(crate) mod stats;

// Serializes tests that assert on the process-wide gauges: those take the
// write half, everything else takes read.
#[cfg(all(test, not(loom)))]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
