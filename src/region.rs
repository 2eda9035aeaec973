//! Region - one contiguous reservation of OS memory
//!
//! Design: Pages come straight from the OS (mmap / VirtualAlloc), so every
//! region starts page aligned and zeroed. A region has no allocation
//! semantics of its own; arenas and heaps carve it up.

use core::ptr::NonNull;

use crate::error::{AllocationError, Result};

/// Alignment guaranteed for `Region::start`
pub const PAGE_ALIGN: usize = 4096;

/// `n` kibibytes
#[inline]
pub const fn kib(n: usize) -> usize {
    n * 1024
}

/// `n` mebibytes
#[inline]
pub const fn mib(n: usize) -> usize {
    n * 1024 * 1024
}

/// `n` gibibytes
#[inline]
pub const fn gib(n: usize) -> usize {
    n * 1024 * 1024 * 1024
}

/// Align value upward to next multiple of alignment (power of two)
#[inline(always)]
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value.wrapping_add(align).wrapping_sub(1)) & !align.wrapping_sub(1)
}

/// Checked variant of [`align_up`]
#[inline]
pub(crate) fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}

/// Owned OS memory: `[start, start + capacity)`
///
/// Released exactly once, on drop.
pub struct Region {
    start: NonNull<u8>,
    capacity: usize,
}

impl Region {
    /// Reserve `capacity` bytes, terminating the process on failure
    #[track_caller]
    pub fn allocate(capacity: usize) -> Self {
        crate::error::or_fatal(Self::try_allocate(capacity))
    }

    /// Reserve `capacity` bytes from the OS
    pub fn try_allocate(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(AllocationError::ZeroCapacity);
        }

        let start = os::reserve(capacity).ok_or(AllocationError::RegionUnavailable { capacity })?;

        tracing::debug!(
            event = "region_allocate",
            capacity,
            start = ?start.as_ptr(),
            "Region reserved"
        );

        Ok(Self { start, capacity })
    }

    /// Release the memory now (equivalent to dropping the region)
    pub fn free(self) {
        drop(self);
    }

    #[inline]
    pub fn start(&self) -> NonNull<u8> {
        self.start
    }

    /// One past the last byte
    #[inline]
    pub fn end(&self) -> *mut u8 {
        self.start.as_ptr().wrapping_add(self.capacity)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `ptr` lies inside `[start, end)`
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let start = self.start.as_ptr() as usize;
        addr >= start && addr < start + self.capacity
    }

    /// Byte offset of `ptr` from the region start, if it lies inside
    #[inline]
    pub fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        self.contains(ptr)
            .then(|| ptr as usize - self.start.as_ptr() as usize)
    }

    /// Pointer at `offset` bytes from the start. `offset` may equal capacity.
    #[inline]
    pub(crate) fn at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= self.capacity, "offset outside region");
        // SAFETY: offset is within (or one past) the reservation, never null
        unsafe { NonNull::new_unchecked(self.start.as_ptr().add(offset)) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        tracing::debug!(
            event = "region_free",
            capacity = self.capacity,
            start = ?self.start.as_ptr(),
            "Region released"
        );
        // SAFETY: start/capacity describe exactly one live reservation
        unsafe { os::release(self.start, self.capacity) };
    }
}

impl core::fmt::Debug for Region {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Region")
            .field("start", &self.start.as_ptr())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(unix)]
mod os {
    use core::ptr::{self, NonNull};

    pub(super) fn reserve(capacity: usize) -> Option<NonNull<u8>> {
        use libc::{mmap, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};

        let addr = unsafe {
            mmap(
                ptr::null_mut(),
                capacity,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if addr == MAP_FAILED {
            return None;
        }
        NonNull::new(addr as *mut u8)
    }

    pub(super) unsafe fn release(start: NonNull<u8>, capacity: usize) {
        libc::munmap(start.as_ptr() as *mut libc::c_void, capacity);
    }
}

#[cfg(windows)]
mod os {
    use core::ptr::{self, NonNull};
    use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
    use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE};

    pub(super) fn reserve(capacity: usize) -> Option<NonNull<u8>> {
        let addr = unsafe {
            VirtualAlloc(ptr::null_mut(), capacity, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE)
        };
        NonNull::new(addr as *mut u8)
    }

    pub(super) unsafe fn release(start: NonNull<u8>, _capacity: usize) {
        // Size must be zero with MEM_RELEASE
        VirtualFree(start.as_ptr() as *mut _, 0, MEM_RELEASE);
    }
}

#[cfg(not(any(unix, windows)))]
mod os {
    use super::PAGE_ALIGN;
    use core::ptr::NonNull;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    pub(super) fn reserve(capacity: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(capacity, PAGE_ALIGN).ok()?;
        NonNull::new(unsafe { alloc_zeroed(layout) })
    }

    pub(super) unsafe fn release(start: NonNull<u8>, capacity: usize) {
        let layout = Layout::from_size_align_unchecked(capacity, PAGE_ALIGN);
        dealloc(start.as_ptr(), layout);
    }
}
