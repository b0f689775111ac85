//! A contiguous sub-range of the backing region with its own free list,
//! lock, and condition variable.
//!
//! All free-list mutation inside one segment is totally ordered by the
//! segment's mutex; releasers broadcast the condition variable so that
//! waiters re-run best-fit. At most one segment lock is ever held by a
//! thread (the façade releases one segment before consulting the next),
//! so lock ordering is trivial.

use super::block::{self, BlockHeader, FreeList, HEADER_SIZE};
use super::stats;
use crate::sync::{Condvar, Mutex};
#[cfg(any(test, debug_assertions))]
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;
use std::time::Duration;
#[cfg(not(loom))]
use std::time::Instant;

pub(crate) struct Segment {
    start: NonNull<u8>,
    size: usize,
    id: u32,
    free: Mutex<FreeList>,
    available: Condvar,
}

// Safety: the segment exclusively owns `start..start + size`; every access to
// that memory goes through the `free` mutex.
unsafe impl Send for Segment {}
// Safety: same as Send; the raw base pointer is never handed out unguarded.
unsafe impl Sync for Segment {}

impl Segment {
    /// Carve a segment over `start..start + size` and write its initial
    /// free block spanning the whole range.
    ///
    /// # Safety
    /// The range must be writable memory owned by the caller, naturally
    /// aligned for `BlockHeader`, larger than one header, and disjoint from
    /// every other segment.
    pub(crate) unsafe fn new(start: NonNull<u8>, size: usize, id: u32) -> Self {
        debug_assert!(size > HEADER_SIZE);
        debug_assert!((start.as_ptr() as usize).is_multiple_of(block::HEADER_ALIGN));
        let mut list = FreeList::new();
        // Safety: upheld by caller.
        unsafe { list.init_spanning_block(start, size - HEADER_SIZE, id) };
        Self {
            start,
            size,
            id,
            free: Mutex::new(list),
            available: Condvar::new(),
        }
    }

    /// Single best-fit attempt. Returns the payload pointer on a hit.
    ///
    /// # Panics
    ///
    /// Panics if the segment lock is poisoned.
    pub(crate) fn try_allocate(&self, payload: usize, min_split: usize) -> Option<NonNull<u8>> {
        let mut list = self.free.lock().unwrap();
        // Safety: lock held; best_fit returns a member of this list.
        let block = unsafe { list.best_fit(payload + HEADER_SIZE) }?;
        // Safety: as above.
        Some(unsafe { Self::take(self.id, &mut list, block, payload, min_split) })
    }

    /// Best-fit with a bounded wait: on a miss, sleep on the segment's
    /// condition variable until a release broadcasts or the monotonic
    /// deadline passes, retesting after every wakeup (spurious or not).
    ///
    /// # Panics
    ///
    /// Panics if the segment lock is poisoned.
    pub(crate) fn allocate_or_wait(
        &self,
        payload: usize,
        min_split: usize,
        timeout: Duration,
    ) -> Option<NonNull<u8>> {
        let mut list = self.free.lock().unwrap();

        // loom does not model condition variables (see sync.rs); degrade to
        // a single attempt so model state spaces stay bounded.
        #[cfg(loom)]
        {
            let _ = timeout;
            // Safety: lock held across the test and the take.
            unsafe {
                let block = list.best_fit(payload + HEADER_SIZE)?;
                Some(Self::take(self.id, &mut list, block, payload, min_split))
            }
        }

        #[cfg(not(loom))]
        {
            let deadline = Instant::now() + timeout;
            loop {
                // Safety: lock held across the test and the take.
                if let Some(block) = unsafe { list.best_fit(payload + HEADER_SIZE) } {
                    // Safety: as above.
                    return Some(unsafe {
                        Self::take(self.id, &mut list, block, payload, min_split)
                    });
                }
                let now = Instant::now();
                if now >= deadline {
                    stats::WAIT_TIMEOUTS.add(1);
                    return None;
                }
                list = self.available.wait_timeout(list, deadline - now).unwrap().0;
            }
        }
    }

    /// Split-or-take under the lock, restamping the owner id before the block
    /// is handed out (splits inherit the id from the block they are carved
    /// from, so the stamp propagates).
    ///
    /// # Safety
    /// Lock held; `block` is a member of `list` with `size >= payload`.
    unsafe fn take(
        id: u32,
        list: &mut FreeList,
        block: NonNull<BlockHeader>,
        payload: usize,
        min_split: usize,
    ) -> NonNull<u8> {
        // Safety: upheld by caller.
        unsafe {
            (*block.as_ptr()).segment_id = id;
            list.take(block, payload, min_split)
        }
    }

    /// Return a block to this segment: mark it free, coalesce with free
    /// physical neighbors, and wake every waiter.
    ///
    /// # Safety
    /// `block` must head an allocated block previously carved from this
    /// segment and not yet released.
    ///
    /// # Panics
    ///
    /// Panics if the segment lock is poisoned.
    pub(crate) unsafe fn release(&self, block: NonNull<BlockHeader>) {
        let mut list = self.free.lock().unwrap();
        debug_assert!(self.contains(block.as_ptr().cast()));
        // Safety: upheld by caller; lock held.
        unsafe { list.give_back(block) };
        // Broadcast while still holding the lock; waiters re-run best-fit
        // once they reacquire it.
        self.available.notify_all();
    }

    fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let base = self.start.as_ptr() as usize;
        addr >= base && addr < base + self.size
    }

    /// Snapshot of the free list, taken under the lock.
    ///
    /// # Panics
    ///
    /// Panics if the segment lock is poisoned.
    pub(crate) fn stats(&self) -> SegmentStats {
        let list = self.free.lock().unwrap();
        let mut snapshot = SegmentStats {
            capacity: self.size,
            free_blocks: 0,
            free_bytes: 0,
            largest_free: 0,
        };
        // Safety: lock held for the whole iteration.
        for block in unsafe { list.iter() } {
            // Safety: list members are valid headers while the lock is held.
            let size = unsafe { (*block.as_ptr()).size };
            snapshot.free_blocks += 1;
            snapshot.free_bytes += size;
            snapshot.largest_free = snapshot.largest_free.max(size);
        }
        snapshot
    }

    /// Walk the physical block sequence and the free list and assert the
    /// structural invariants: exact tiling of the segment range, owner-id
    /// containment, complete coalescing (no two adjacent free blocks), and
    /// exactly-once free-list membership.
    #[cfg(any(test, debug_assertions))]
    pub(crate) fn check_consistency(&self) {
        let list = self.free.lock().unwrap();
        let base = self.start.as_ptr() as usize;

        // Every block starts on a HEADER_ALIGN boundary, so offsets divided
        // by the alignment index a bitset of list members.
        let mut listed = FixedBitSet::with_capacity(self.size / block::HEADER_ALIGN);
        let mut listed_count = 0usize;
        // Safety: lock held for the whole iteration.
        for b in unsafe { list.iter() } {
            let offset = b.as_ptr() as usize - base;
            let slot = offset / block::HEADER_ALIGN;
            // Safety: list members are valid headers while the lock is held.
            assert!(
                unsafe { (*b.as_ptr()).free },
                "allocated block on the free list at offset {offset}"
            );
            assert!(!listed.contains(slot), "block linked twice at offset {offset}");
            listed.insert(slot);
            listed_count += 1;
        }

        let end = base + self.size;
        let mut cursor = base;
        let mut prev_free = false;
        let mut free_seen = 0usize;
        while cursor < end {
            let header = cursor as *const BlockHeader;
            // Safety: tiling walk; every header reached is within the segment
            // and was written by this crate.
            let (size, free, segment_id) =
                unsafe { ((*header).size, (*header).free, (*header).segment_id) };
            assert!(size >= 1, "zero-size block at offset {}", cursor - base);
            assert_eq!(segment_id, self.id, "block stamped with a foreign segment id");
            assert!(
                cursor + HEADER_SIZE + size <= end,
                "block at offset {} overruns its segment",
                cursor - base
            );
            if free {
                assert!(!prev_free, "adjacent free blocks left uncoalesced");
                assert!(
                    listed.contains((cursor - base) / block::HEADER_ALIGN),
                    "free block at offset {} missing from the free list",
                    cursor - base
                );
                free_seen += 1;
            }
            prev_free = free;
            cursor += HEADER_SIZE + size;
        }
        assert_eq!(cursor, end, "physical blocks do not tile the segment");
        assert_eq!(
            free_seen, listed_count,
            "free list length disagrees with the physical walk"
        );
    }
}

/// Point-in-time view of one segment's free list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentStats {
    /// Total bytes spanned by the segment (headers included).
    pub capacity: usize,
    /// Blocks currently on the free list.
    pub free_blocks: usize,
    /// Sum of free payload bytes.
    pub free_bytes: usize,
    /// Largest single free payload.
    pub largest_free: usize,
}
