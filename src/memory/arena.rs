//! The allocator façade: region partitioning, request routing, and the
//! process-wide singleton.
//!
//! A [`SegmentedArena`] owns one backing region carved into `N` segments:
//! `N − 1` equally-sized small segments sharing a fixed slice of the capacity
//! and one large segment holding the remainder. Small requests rotate across
//! the small segments round-robin; requests above the large threshold go to
//! the large segment. A request that misses its first segment falls back to
//! bounded waits on the candidate segments and fails with
//! [`AllocError::Exhausted`] once every deadline has passed.

use super::block::{self, HEADER_SIZE};
use super::region::{PlatformRegionOps, RegionOps};
use super::segment::{Segment, SegmentStats};
use super::stats;
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::{Arc, Mutex};
use std::fmt;
use std::io;
use std::ptr::NonNull;
use std::time::Duration;

/// Default total backing capacity in bytes (100 MiB).
pub const DEFAULT_CAPACITY: usize = 100 * 1024 * 1024;
/// Default number of segments: `N − 1` small plus one large.
pub const DEFAULT_SEGMENT_COUNT: usize = 5;
/// Default share of the capacity distributed across the small segments.
pub const DEFAULT_SMALL_SHARE_PERCENT: usize = 20;
/// Default smallest residual payload worth carving into a separate block.
pub const DEFAULT_MIN_SPLIT_SIZE: usize = 32;
/// Requests above this many bytes bypass the small segments by default.
pub const DEFAULT_LARGE_THRESHOLD: usize = 4 * 1024 * 1024;
/// Default bound on a single per-segment condition-variable wait.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(100);

/// Allocation failure. All surfaces are outcome-shaped; nothing is thrown
/// and nothing is recovered internally beyond the retry loop inside the
/// bounded wait.
#[derive(Debug)]
pub enum AllocError {
    /// The configuration cannot describe a working arena.
    InitializationFailed(String),
    /// The host refused the one-shot backing-region acquisition.
    RegionAcquisitionFailed(io::Error),
    /// The request cannot fit the backing region even when it is empty.
    Oversize { requested: usize, capacity: usize },
    /// Every candidate segment timed out without a fitting block.
    Exhausted { requested: usize },
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::InitializationFailed(msg) => {
                write!(f, "arena initialization failed: {msg}")
            }
            AllocError::RegionAcquisitionFailed(e) => {
                write!(f, "backing region acquisition failed: {e}")
            }
            AllocError::Oversize {
                requested,
                capacity,
            } => write!(
                f,
                "request of {requested} bytes exceeds the backing capacity of {capacity} bytes"
            ),
            AllocError::Exhausted { requested } => write!(
                f,
                "no segment could satisfy {requested} bytes within the deadline"
            ),
        }
    }
}

impl std::error::Error for AllocError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AllocError::RegionAcquisitionFailed(e) => Some(e),
            AllocError::InitializationFailed(_)
            | AllocError::Oversize { .. }
            | AllocError::Exhausted { .. } => None,
        }
    }
}

/// Configuration for [`SegmentedArena`]. All fields have sensible defaults.
/// Set at construction time via [`SegmentedArena::with_config`].
#[derive(Clone, Debug)]
pub struct ArenaConfig {
    /// Total backing capacity in bytes. Default: 100 MiB. Truncated to the
    /// header alignment so the segments tile the region exactly.
    pub capacity: usize,

    /// Number of segments, at least 2: all but the last are small segments,
    /// the last is the large segment. Default: 5.
    pub segment_count: usize,

    /// Percentage of `capacity` split evenly across the small segments;
    /// the large segment receives everything else. Default: 20.
    pub small_share_percent: usize,

    /// Minimum residual payload below which splitting is suppressed and the
    /// whole block is handed out. Default: 32.
    pub min_split_size: usize,

    /// Requests with `size > large_threshold` are routed to the large
    /// segment only. Default: 4 MiB.
    pub large_threshold: usize,

    /// Bound on each per-segment condition-variable wait. A small request
    /// that misses everywhere waits at most
    /// `(segment_count − 1) * wait_timeout` in total. Default: 100 ms.
    pub wait_timeout: Duration,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            segment_count: DEFAULT_SEGMENT_COUNT,
            small_share_percent: DEFAULT_SMALL_SHARE_PERCENT,
            min_split_size: DEFAULT_MIN_SPLIT_SIZE,
            large_threshold: DEFAULT_LARGE_THRESHOLD,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

/// Per-segment byte sizes derived from a validated config.
struct Partition {
    capacity: usize,
    small_size: usize,
    large_size: usize,
}

impl Partition {
    fn plan(config: &ArenaConfig) -> Result<Self, AllocError> {
        if config.segment_count < 2 {
            return Err(AllocError::InitializationFailed(format!(
                "segment_count must be at least 2 (one small, one large), got {}",
                config.segment_count
            )));
        }
        if config.small_share_percent == 0 || config.small_share_percent >= 100 {
            return Err(AllocError::InitializationFailed(format!(
                "small_share_percent must be within 1..=99, got {}",
                config.small_share_percent
            )));
        }
        if config.min_split_size == 0 {
            return Err(AllocError::InitializationFailed(
                "min_split_size must be positive: a split tail always carries payload".to_string(),
            ));
        }

        // Truncate everything to the header alignment so each segment starts
        // aligned and the partition tiles the region exactly.
        let capacity = config.capacity & !(block::HEADER_ALIGN - 1);
        let small_count = config.segment_count - 1;
        let small_total =
            ((capacity as u128 * config.small_share_percent as u128) / 100) as usize;
        let small_size = (small_total / small_count) & !(block::HEADER_ALIGN - 1);
        let large_size = capacity - small_size * small_count;

        // Every segment must hold at least a header plus a minimal payload.
        if small_size < 2 * HEADER_SIZE || large_size < 2 * HEADER_SIZE {
            return Err(AllocError::InitializationFailed(format!(
                "capacity {} is too small for {} segments",
                config.capacity, config.segment_count
            )));
        }

        Ok(Self {
            capacity,
            small_size,
            large_size,
        })
    }
}

/// A fixed-capacity allocator over one pre-reserved backing region.
///
/// Construction acquires the region and partitions it; [`Drop`] returns the
/// region to the host, invalidating every outstanding block at once (callers
/// must quiesce first).
pub struct SegmentedArena {
    base: NonNull<u8>,
    capacity: usize,
    segments: Box<[Segment]>,
    rr_cursor: AtomicUsize,
    config: ArenaConfig,
}

// Safety: the arena owns the backing region; segment state is lock-guarded
// and the remaining fields are immutable after construction.
unsafe impl Send for SegmentedArena {}
// Safety: same as Send.
unsafe impl Sync for SegmentedArena {}

impl SegmentedArena {
    /// Build an arena with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::RegionAcquisitionFailed` if the host refuses the
    /// backing region.
    pub fn new() -> Result<Self, AllocError> {
        Self::with_config(ArenaConfig::default())
    }

    /// Build an arena with the given configuration.
    ///
    /// Only what was actually acquired is unwound on failure: config
    /// validation precedes the region acquisition, which is the single
    /// fallible resource step.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::InitializationFailed` for configurations that
    /// cannot describe a working arena, or
    /// `AllocError::RegionAcquisitionFailed` if the host refuses the region.
    pub fn with_config(config: ArenaConfig) -> Result<Self, AllocError> {
        let plan = Partition::plan(&config)?;

        // Safety: plan.capacity is positive and the pointer is released in
        // Drop with the same size.
        let base = unsafe { PlatformRegionOps::acquire(plan.capacity) }
            .map_err(AllocError::RegionAcquisitionFailed)?;

        // Walk a cursor over the region: small segments first, the large
        // segment takes the remainder so integer truncation cannot leave a
        // gap.
        let mut segments = Vec::with_capacity(config.segment_count);
        let mut cursor = base.as_ptr();
        for id in 0..config.segment_count {
            let size = if id < config.segment_count - 1 {
                plan.small_size
            } else {
                plan.large_size
            };
            // Safety: the cursor stays inside the freshly acquired region;
            // the ranges are pairwise disjoint by construction.
            unsafe {
                segments.push(Segment::new(
                    NonNull::new_unchecked(cursor),
                    size,
                    id as u32,
                ));
                cursor = cursor.add(size);
            }
        }
        debug_assert_eq!(cursor as usize, base.as_ptr() as usize + plan.capacity);

        stats::REGION_BYTES.add(plan.capacity);

        Ok(Self {
            base,
            capacity: plan.capacity,
            segments: segments.into_boxed_slice(),
            rr_cursor: AtomicUsize::new(0),
            config,
        })
    }

    /// Effective backing capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Allocate `size` bytes out of the arena.
    ///
    /// The payload is rounded up to the header alignment, so every header in
    /// the region stays naturally aligned; no stronger alignment is
    /// guaranteed. Zero-size requests are forbidden (debug assertion).
    ///
    /// Routing: a round-robin-chosen small segment is probed first. On a
    /// miss, requests up to the large threshold wait on each small segment
    /// in turn, larger requests wait on the large segment only; every wait
    /// is bounded by the configured timeout.
    ///
    /// # Errors
    ///
    /// `AllocError::Oversize` when the request cannot fit an empty region,
    /// `AllocError::Exhausted` when every candidate wait timed out.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(size > 0, "allocation size must be positive");
        let oversize = || AllocError::Oversize {
            requested: size,
            capacity: self.capacity,
        };
        let payload = size
            .max(1)
            .checked_next_multiple_of(block::HEADER_ALIGN)
            .ok_or_else(oversize)?;
        let footprint = payload.checked_add(HEADER_SIZE).ok_or_else(oversize)?;
        let min_split = self.config.min_split_size;
        let small_count = self.segments.len() - 1;

        // Spread first probes across the small segments; the cursor is the
        // only cross-segment shared state on the fast path.
        let first = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % small_count;
        if let Some(ptr) = self.segments[first].try_allocate(payload, min_split) {
            self.note_allocated(payload);
            return Ok(ptr);
        }

        // Impossible requests fail without sleeping.
        if footprint > self.capacity {
            return Err(AllocError::Oversize {
                requested: size,
                capacity: self.capacity,
            });
        }

        if size <= self.config.large_threshold {
            for segment in &self.segments[..small_count] {
                if let Some(ptr) =
                    segment.allocate_or_wait(payload, min_split, self.config.wait_timeout)
                {
                    self.note_allocated(payload);
                    return Ok(ptr);
                }
            }
        } else if let Some(ptr) = self.segments[small_count].allocate_or_wait(
            payload,
            min_split,
            self.config.wait_timeout,
        ) {
            self.note_allocated(payload);
            return Ok(ptr);
        }

        Err(AllocError::Exhausted { requested: size })
    }

    /// Release a block back to its segment. `ptr` may be null, in which case
    /// nothing happens.
    ///
    /// The owning segment is read straight from the block header (that is
    /// why the id is header-resident: no range search under no lock), the
    /// block is coalesced with free physical neighbors, and the segment's
    /// waiters are woken.
    ///
    /// # Safety
    /// A non-null `ptr` must have been returned by [`allocate`] on this
    /// arena and not yet released. Double release and foreign pointers are
    /// undefined behavior; they are not detected.
    ///
    /// [`allocate`]: Self::allocate
    pub unsafe fn release(&self, ptr: *mut u8) {
        let Some(payload_ptr) = NonNull::new(ptr) else {
            return;
        };
        debug_assert!(self.contains(payload_ptr.as_ptr()));

        // Safety: upheld by caller.
        let header = unsafe { block::header_from_payload(payload_ptr) };
        // Safety: the header of a live allocated block is stable until the
        // owning segment's release below.
        let (segment_id, payload) =
            unsafe { ((*header.as_ptr()).segment_id as usize, (*header.as_ptr()).size) };
        debug_assert!(segment_id < self.segments.len());

        // Safety: upheld by caller.
        unsafe { self.segments[segment_id].release(header) };
        stats::BYTES_IN_USE.sub(payload);
        stats::BLOCKS_IN_USE.sub(1);
    }

    /// Consistent per-segment snapshot; each segment is visited under its
    /// own lock.
    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            capacity: self.capacity,
            segments: self.segments.iter().map(Segment::stats).collect(),
        }
    }

    /// Assert the structural invariants of every segment. Test/debug builds
    /// only.
    #[cfg(any(test, debug_assertions))]
    pub(crate) fn check_consistency(&self) {
        for segment in &self.segments {
            segment.check_consistency();
        }
    }

    fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.capacity
    }

    fn note_allocated(&self, payload: usize) {
        stats::BYTES_IN_USE.add(payload);
        stats::BLOCKS_IN_USE.add(1);
    }
}

impl Drop for SegmentedArena {
    fn drop(&mut self) {
        // Teardown invalidates all outstanding blocks simultaneously; the
        // caller must have quiesced. Segment locks and condition variables
        // are plain fields and die with the struct.
        // Safety: the region was acquired in with_config with this size.
        unsafe {
            drop(PlatformRegionOps::release(self.base, self.capacity));
        }
        stats::REGION_BYTES.sub(self.capacity);
    }
}

/// Point-in-time view of a whole arena.
#[derive(Clone, Debug)]
pub struct ArenaStats {
    /// Effective backing capacity in bytes.
    pub capacity: usize,
    /// One entry per segment, small segments first, large segment last.
    pub segments: Vec<SegmentStats>,
}

// ---------------------------------------------------------------------------
// Global singleton
// ---------------------------------------------------------------------------

crate::sync::static_mutex! {
    static GLOBAL_ARENA: Mutex<Option<Arc<SegmentedArena>>> = Mutex::new(None);
}

/// Process-wide arena with lazy one-shot initialization.
///
/// The slot mutex guards only initialization state; it is released before
/// any segment work happens, so it is never held together with a segment
/// lock. [`teardown`](Self::teardown) empties the slot, and the next
/// [`allocate`](Self::allocate) re-initializes from scratch. The same holds
/// after an initialization failure, which leaves the slot empty for retry.
pub struct GlobalArena;

impl GlobalArena {
    fn ensure_initialized() -> Result<Arc<SegmentedArena>, AllocError> {
        let mut slot = GLOBAL_ARENA.lock().unwrap();
        if let Some(arena) = slot.as_ref() {
            return Ok(Arc::clone(arena));
        }
        let arena = Arc::new(SegmentedArena::new()?);
        *slot = Some(Arc::clone(&arena));
        Ok(arena)
    }

    /// Allocate `size` bytes from the global arena, initializing it on first
    /// use.
    ///
    /// # Errors
    ///
    /// Returns any [`AllocError`] from initialization or allocation.
    ///
    /// # Panics
    ///
    /// Panics if the global slot lock is poisoned.
    pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
        Self::ensure_initialized()?.allocate(size)
    }

    /// Release a block previously allocated from the global arena. Null is a
    /// no-op; so is a release after [`teardown`](Self::teardown) emptied the
    /// slot (there are no valid pointers then anyway).
    ///
    /// # Safety
    /// Same contract as [`SegmentedArena::release`].
    ///
    /// # Panics
    ///
    /// Panics if the global slot lock is poisoned.
    pub unsafe fn release(ptr: *mut u8) {
        let arena = GLOBAL_ARENA.lock().unwrap().as_ref().map(Arc::clone);
        if let Some(arena) = arena {
            // Safety: upheld by caller.
            unsafe { arena.release(ptr) };
        }
    }

    /// Drop the global arena and return its region to the host. Callers must
    /// have released or abandoned every outstanding block; the next
    /// [`allocate`](Self::allocate) behaves like a first call.
    ///
    /// # Panics
    ///
    /// Panics if the global slot lock is poisoned.
    pub fn teardown() {
        let arena = GLOBAL_ARENA.lock().unwrap().take();
        drop(arena);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::ptr;
    use std::time::Instant;

    fn small_config() -> ArenaConfig {
        ArenaConfig {
            capacity: 8192,
            segment_count: 2,
            wait_timeout: Duration::from_millis(50),
            ..ArenaConfig::default()
        }
    }

    #[test]
    fn test_partition_tiles_capacity() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let arena = SegmentedArena::with_config(ArenaConfig {
            capacity: 16384,
            segment_count: 3,
            ..ArenaConfig::default()
        })
        .unwrap();

        let stats = arena.stats();
        assert_eq!(stats.segments.len(), 3);
        // 20% of 16384 split across two small segments, truncated to the
        // header alignment; the large segment takes the remainder.
        assert_eq!(stats.segments[0].capacity, 1632);
        assert_eq!(stats.segments[1].capacity, 1632);
        assert_eq!(stats.segments[2].capacity, 16384 - 2 * 1632);
        assert_eq!(
            stats.segments.iter().map(|s| s.capacity).sum::<usize>(),
            arena.capacity()
        );
        arena.check_consistency();
    }

    #[test]
    fn test_rejects_degenerate_configs() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let too_few = SegmentedArena::with_config(ArenaConfig {
            segment_count: 1,
            ..ArenaConfig::default()
        });
        assert!(matches!(too_few, Err(AllocError::InitializationFailed(_))));

        let bad_share = SegmentedArena::with_config(ArenaConfig {
            small_share_percent: 100,
            ..ArenaConfig::default()
        });
        assert!(matches!(bad_share, Err(AllocError::InitializationFailed(_))));

        let too_small = SegmentedArena::with_config(ArenaConfig {
            capacity: 256,
            ..ArenaConfig::default()
        });
        assert!(matches!(too_small, Err(AllocError::InitializationFailed(_))));
    }

    #[test]
    fn test_allocate_release_round_trip_restores_structure() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let arena = SegmentedArena::with_config(small_config()).unwrap();
        let before = arena.stats();

        let first = arena.allocate(128).unwrap();
        // Safety: released exactly once.
        unsafe { arena.release(first.as_ptr()) };

        let again = arena.allocate(128).unwrap();
        assert_eq!(first, again, "best fit should reuse the same block");
        // Safety: released exactly once.
        unsafe { arena.release(again.as_ptr()) };

        let after = arena.stats();
        assert_eq!(before.segments, after.segments);
        arena.check_consistency();
    }

    #[test]
    fn test_round_robin_spreads_small_requests() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let arena = SegmentedArena::with_config(ArenaConfig {
            capacity: 16384,
            segment_count: 3,
            ..ArenaConfig::default()
        })
        .unwrap();

        let a = arena.allocate(64).unwrap();
        let b = arena.allocate(64).unwrap();
        let _ = (a, b);

        let stats = arena.stats();
        let spanning = 1632 - HEADER_SIZE;
        assert_eq!(stats.segments[0].free_bytes, spanning - 64 - HEADER_SIZE);
        assert_eq!(stats.segments[1].free_bytes, spanning - 64 - HEADER_SIZE);
        // The large segment was never consulted.
        assert_eq!(
            stats.segments[2].free_bytes,
            stats.segments[2].capacity - HEADER_SIZE
        );
    }

    #[test]
    fn test_large_requests_go_to_the_large_segment() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let arena = SegmentedArena::with_config(ArenaConfig {
            capacity: 16384,
            segment_count: 3,
            large_threshold: 1024,
            ..ArenaConfig::default()
        })
        .unwrap();

        let ptr = arena.allocate(2048).unwrap();
        let _ = ptr;

        let stats = arena.stats();
        // Small segments untouched (the round-robin probe mutates nothing on
        // a miss).
        assert_eq!(
            stats.segments[0].free_bytes,
            stats.segments[0].capacity - HEADER_SIZE
        );
        assert_eq!(
            stats.segments[1].free_bytes,
            stats.segments[1].capacity - HEADER_SIZE
        );
        assert_eq!(
            stats.segments[2].free_bytes,
            stats.segments[2].capacity - 2 * HEADER_SIZE - 2048
        );
        arena.check_consistency();
    }

    #[test]
    fn test_oversize_request_fails_without_waiting() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let arena = SegmentedArena::with_config(small_config()).unwrap();

        let started = Instant::now();
        let result = arena.allocate(arena.capacity() + 1);
        assert!(matches!(result, Err(AllocError::Oversize { .. })));
        assert!(
            started.elapsed() < Duration::from_millis(40),
            "oversize must not sleep"
        );
    }

    #[test]
    fn test_exhaustion_reports_after_deadline() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let arena = SegmentedArena::with_config(small_config()).unwrap();

        // The sole small segment spans 1632 bytes (1600 payload); a 1600-byte
        // request has a 1632-byte footprint and can never fit it.
        let started = Instant::now();
        let result = arena.allocate(1600);
        assert!(matches!(result, Err(AllocError::Exhausted { .. })));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_release_null_is_a_noop() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let arena = SegmentedArena::with_config(small_config()).unwrap();
        let before = arena.stats();
        // Safety: null is explicitly allowed.
        unsafe { arena.release(ptr::null_mut()) };
        assert_eq!(before.segments, arena.stats().segments);
    }

    #[test]
    fn test_error_display() {
        let oversize = AllocError::Oversize {
            requested: 200,
            capacity: 100,
        };
        assert!(oversize.to_string().contains("exceeds the backing capacity"));

        let exhausted = AllocError::Exhausted { requested: 64 };
        assert!(exhausted.to_string().contains("within the deadline"));

        let init = AllocError::InitializationFailed("nope".to_string());
        assert!(init.to_string().contains("nope"));
    }

    #[test]
    fn test_global_lazy_init_teardown_reinit() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        GlobalArena::teardown(); // clean slate regardless of test order

        let first = GlobalArena::allocate(128).expect("first use initializes");
        // Safety: released exactly once.
        unsafe { GlobalArena::release(first.as_ptr()) };

        GlobalArena::teardown();

        // Teardown cleared the slot; the next allocate re-initializes.
        let second = GlobalArena::allocate(128).expect("re-initializes after teardown");
        // Safety: released exactly once.
        unsafe { GlobalArena::release(second.as_ptr()) };
        GlobalArena::teardown();
    }

    #[test]
    fn test_global_release_after_teardown_is_noop() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        GlobalArena::teardown();
        // Safety: null is explicitly allowed.
        unsafe { GlobalArena::release(ptr::null_mut()) };
    }
}
