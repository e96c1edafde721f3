//! Process-wide count of live pools.

use core::sync::atomic::{AtomicUsize, Ordering};

static LIVE_POOLS: AtomicUsize = AtomicUsize::new(0);

/// Returns the number of pools that have been constructed and not yet torn
/// down.
#[must_use]
pub fn live_pool_count() -> usize {
    LIVE_POOLS.load(Ordering::Acquire)
}

/// Membership token held by every pool.
///
/// Registering increments the live-pool count; dropping the token decrements
/// it again.
#[derive(Debug)]
pub(crate) struct LivePool(());

impl LivePool {
    pub(crate) fn register() -> Self {
        LIVE_POOLS.fetch_add(1, Ordering::AcqRel);
        Self(())
    }
}

impl Drop for LivePool {
    fn drop(&mut self) {
        let prev = LIVE_POOLS.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "live-pool count underflow");
    }
}
