//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent, and cross-counter snapshots may be transiently
//! inconsistent under contention. This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw
/// value may transiently dip below zero. Readers should always use `get()`,
/// which clamps negative values to zero.
pub(crate) struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub(crate) const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub(crate) fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub(crate) fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }
}

// Total address space currently held from the OS by all resource instances
crate::sync::static_atomic! {
    pub static TOTAL_RESERVED: Counter = Counter::new();
}
// Live pool blocks across all instances
crate::sync::static_atomic! {
    pub static POOL_BLOCKS_LIVE: Counter = Counter::new();
}
// Live large-block allocations across all instances
crate::sync::static_atomic! {
    pub static LARGE_BLOCKS_LIVE: Counter = Counter::new();
}

/// Point-in-time view of the process-wide resource gauges.
#[derive(Clone, Copy, Debug)]
pub struct ResourceStats {
    pub total_reserved: usize,
    pub pool_blocks_live: usize,
    pub large_blocks_live: usize,
}

/// Snapshot of the diagnostic counters. Eventually consistent.
#[must_use]
pub fn snapshot() -> ResourceStats {
    ResourceStats {
        total_reserved: TOTAL_RESERVED.get(),
        pool_blocks_live: POOL_BLOCKS_LIVE.get(),
        large_blocks_live: LARGE_BLOCKS_LIVE.get(),
    }
}
