#[cfg(not(target_pointer_width = "64"))]
compile_error!("segalloc supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocator façade
pub use memory::arena::{
    AllocError, ArenaConfig, ArenaStats, GlobalArena, SegmentedArena, DEFAULT_CAPACITY,
    DEFAULT_LARGE_THRESHOLD, DEFAULT_MIN_SPLIT_SIZE, DEFAULT_SEGMENT_COUNT,
    DEFAULT_SMALL_SHARE_PERCENT, DEFAULT_WAIT_TIMEOUT,
};

// per-segment observability
pub use memory::segment::SegmentStats;
