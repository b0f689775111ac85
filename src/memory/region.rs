//! One-shot acquisition of the backing region.
//!
//! The allocator talks to the host exactly twice over its lifetime: once to
//! acquire the whole backing region read-write, and once to return it. There
//! is no growth, no partial commit, no decommit. Everything between those two
//! calls is carved out of the region by the segment free lists.

use std::io;
use std::ptr::NonNull;

/// Abstract interface for the host memory primitive.
pub(crate) trait RegionOps {
    /// Acquire `size` contiguous read-write bytes from the host.
    /// Returns a pointer to the start of the region.
    unsafe fn acquire(size: usize) -> Result<NonNull<u8>, io::Error>;

    /// Return a region previously obtained from [`acquire`](RegionOps::acquire)
    /// (after which pointers into it are invalid).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), io::Error>;
}

pub(crate) struct PlatformRegionOps;

#[cfg(all(unix, not(any(loom, miri))))]
impl RegionOps for PlatformRegionOps {
    unsafe fn acquire(size: usize) -> Result<NonNull<u8>, io::Error> {
        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        match NonNull::new(ptr.cast::<u8>()) {
            Some(p) => Ok(p),
            None => Err(io::Error::other("mmap returned null")),
        }
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), io::Error> {
        // Safety: FFI call to munmap.
        if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(all(target_os = "windows", not(any(loom, miri))))]
impl RegionOps for PlatformRegionOps {
    unsafe fn acquire(size: usize) -> Result<NonNull<u8>, io::Error> {
        // Reserve and commit in one step: the region is used in full from the
        // first allocation and never decommitted.
        // Safety: FFI call to VirtualAlloc.
        let ptr = unsafe {
            libc::VirtualAlloc(
                std::ptr::null_mut(),
                size,
                libc::MEM_RESERVE | libc::MEM_COMMIT,
                libc::PAGE_READWRITE,
            )
        };

        match NonNull::new(ptr.cast::<u8>()) {
            Some(p) => Ok(p),
            None => Err(io::Error::last_os_error()),
        }
    }

    unsafe fn release(ptr: NonNull<u8>, _size: usize) -> Result<(), io::Error> {
        // VirtualFree with MEM_RELEASE must have size 0 and the base address
        // of the region.
        // Safety: FFI call to VirtualFree.
        if unsafe { libc::VirtualFree(ptr.as_ptr().cast::<libc::c_void>(), 0, libc::MEM_RELEASE) }
            == 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed RegionOps (no real mmap/VirtualAlloc)
//
// Under `cfg(loom)` we cannot issue real VM syscalls — loom runs inside a
// single OS process with its own scheduler. Instead we back the "region"
// with a plain heap allocation (via `std::alloc::alloc_zeroed` / `dealloc`).
//
// This is sufficient for testing the *synchronization* logic of the segments
// (loom) and detecting undefined behaviour in the unsafe free-list code
// (Miri); the real host primitive is tested by the platform implementation
// in normal builds.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl RegionOps for PlatformRegionOps {
    unsafe fn acquire(size: usize) -> Result<NonNull<u8>, io::Error> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-size region",
            ));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(io::Error::other)?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            io::Error::new(io::ErrorKind::OutOfMemory, "alloc returned null")
        })
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), io::Error> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(io::Error::other)?;
        // Safety: ptr was allocated with the same layout via `acquire`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_write_release() {
        let size = 64 * 1024;
        // Safety: Test code.
        unsafe {
            let ptr = PlatformRegionOps::acquire(size).expect("Acquire failed");

            // The whole region must be writable immediately.
            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 42;
            slice[size - 1] = 24;
            assert_eq!(slice[0], 42);
            assert_eq!(slice[size - 1], 24);

            PlatformRegionOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_acquire_zero_size() {
        // mmap with 0 size fails with EINVAL; we expect an error either way.
        // Safety: Test code.
        let result = unsafe { PlatformRegionOps::acquire(0) };
        assert!(result.is_err(), "Acquiring 0 bytes should fail");
    }

    #[test]
    fn test_regions_are_disjoint() {
        let size = 16 * 1024;
        // Safety: Test code.
        unsafe {
            let a = PlatformRegionOps::acquire(size).expect("Acquire a failed");
            let b = PlatformRegionOps::acquire(size).expect("Acquire b failed");

            let (a_addr, b_addr) = (a.as_ptr() as usize, b.as_ptr() as usize);
            assert!(
                a_addr + size <= b_addr || b_addr + size <= a_addr,
                "regions overlap: {a_addr:#x} and {b_addr:#x}"
            );

            PlatformRegionOps::release(a, size).expect("Release a failed");
            PlatformRegionOps::release(b, size).expect("Release b failed");
        }
    }
}
