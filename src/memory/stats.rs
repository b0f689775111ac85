//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., bytes-in-use may briefly disagree with blocks-in-use).
//! This is acceptable for diagnostic display. Do NOT use these values for
//! allocation decisions; `SegmentedArena::stats()` takes the segment locks
//! and is the consistent view.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
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
        std::cmp::min(val, isize::MAX as usize).cast_signed()
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
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

// Bytes of backing region currently acquired from the host
crate::sync::static_atomic! {
    pub static REGION_BYTES: Counter = Counter::new();
}

// Live allocation payload bytes across every arena in the process
crate::sync::static_atomic! {
    pub static BYTES_IN_USE: Counter = Counter::new();
}
// Live allocated blocks across every arena in the process
crate::sync::static_atomic! {
    pub static BLOCKS_IN_USE: Counter = Counter::new();
}

// Bounded waits that expired without a block becoming available
crate::sync::static_atomic! {
    pub static WAIT_TIMEOUTS: Counter = Counter::new();
}
