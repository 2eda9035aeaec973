//! Arena allocator - bump allocation over one region
//!
//! Design: A single monotonically increasing offset. Allocation is an add and
//! a bounds check; the only way to give memory back is to move the offset
//! down again (pop, checkpoint restore, or a full reset).
//!
//! ```text
//!   start                      offset                         capacity
//!     ├──────┬──┬───────┬────────┼─────────────────────────────────┤
//!     │  A1  │▒▒│  A2   │   A3   │            free                 │
//!     └──────┴──┴───────┴────────┴─────────────────────────────────┘
//!             ▲ alignment padding (never reclaimed individually)
//! ```

use core::cell::Cell;
use core::marker::PhantomPinned;
use core::mem;
use core::ptr::{self, NonNull};

use crate::context::{self, Allocator, AllocatorKind};
use crate::error::{or_fatal, AllocationError, Result};
use crate::region::{checked_align_up, Region};


/// Saved arena offset, see [`ArenaAllocator::checkpoint`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Checkpoint(usize);

impl Checkpoint {
    #[inline]
    pub fn offset(self) -> usize {
        self.0
    }
}

/// Linear allocator for transient, reset-in-bulk allocations
///
/// All methods take `&self`; the offset lives in a `Cell`, so the arena can be
/// shared with the allocation context while still being used directly. Not
/// thread-safe: keep one arena per thread.
pub struct ArenaAllocator {
    region: Region,
    offset: Cell<usize>,
    _pinned: PhantomPinned,
}

impl ArenaAllocator {
    /// Create an arena over a fresh region, terminating on failure
    #[track_caller]
    pub fn new(capacity: usize) -> Self {
        or_fatal(Self::try_new(capacity))
    }

    pub fn try_new(capacity: usize) -> Result<Self> {
        let region = Region::try_allocate(capacity)?;
        tracing::debug!(event = "arena_create", capacity, "Arena allocator created");
        Ok(Self {
            region,
            offset: Cell::new(0),
            _pinned: PhantomPinned,
        })
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset.get()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.offset()
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Bump `size` bytes at the current offset
    #[track_caller]
    pub fn push(&self, size: usize) -> NonNull<u8> {
        or_fatal(self.try_push(size))
    }

    pub fn try_push(&self, size: usize) -> Result<NonNull<u8>> {
        self.bump_from(self.offset(), size)
    }

    /// Align the top to `alignment`, then bump `size` bytes
    #[track_caller]
    pub fn push_aligned(&self, size: usize, alignment: usize) -> NonNull<u8> {
        or_fatal(self.try_push_aligned(size, alignment))
    }

    pub fn try_push_aligned(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        if !alignment.is_power_of_two() {
            return Err(AllocationError::InvalidAlignment(alignment));
        }

        let base = self.region.start().as_ptr() as usize;
        let top = base + self.offset();
        let aligned = checked_align_up(top, alignment).ok_or(AllocationError::SizeOverflow)?;

        self.bump_from(aligned - base, size)
    }

    #[track_caller]
    pub fn push_zero(&self, size: usize) -> NonNull<u8> {
        or_fatal(self.try_push_zero(size))
    }

    pub fn try_push_zero(&self, size: usize) -> Result<NonNull<u8>> {
        let ptr = self.try_push(size)?;
        // SAFETY: [ptr, ptr + size) was just reserved inside the region
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(ptr)
    }

    #[track_caller]
    pub fn push_aligned_zero(&self, size: usize, alignment: usize) -> NonNull<u8> {
        or_fatal(self.try_push_aligned_zero(size, alignment))
    }

    pub fn try_push_aligned_zero(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        let ptr = self.try_push_aligned(size, alignment)?;
        // SAFETY: [ptr, ptr + size) was just reserved inside the region
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(ptr)
    }

    /// Undo the most recent `size` bytes of allocation
    #[track_caller]
    pub fn pop(&self, size: usize) {
        or_fatal(self.try_pop(size))
    }

    pub fn try_pop(&self, size: usize) -> Result<()> {
        let offset = self.offset();
        if size > offset {
            return Err(AllocationError::InvalidPop { size, offset });
        }
        self.offset.set(offset - size);
        tracing::trace!(event = "arena_pop", size, offset = offset - size, "Arena popped");
        Ok(())
    }

    /// Invalidate every allocation at once
    pub fn reset(&self) {
        tracing::trace!(event = "arena_reset", released = self.offset(), "Arena reset");
        self.offset.set(0);
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.offset())
    }

    /// Roll the offset back to `checkpoint`
    #[track_caller]
    pub fn restore(&self, checkpoint: Checkpoint) {
        or_fatal(self.try_restore(checkpoint))
    }

    pub fn try_restore(&self, checkpoint: Checkpoint) -> Result<()> {
        let offset = self.offset();
        if checkpoint.0 > offset {
            return Err(AllocationError::InvalidRestore { saved: checkpoint.0, offset });
        }
        self.offset.set(checkpoint.0);
        tracing::trace!(event = "arena_restore", offset = checkpoint.0, "Arena restored");
        Ok(())
    }

    /// Run `f` with scratch allocations that are discarded when it returns
    pub fn scoped<R>(&self, f: impl FnOnce(&Self) -> R) -> R {
        let checkpoint = self.checkpoint();
        let result = f(self);
        // A reset inside `f` already released more than the checkpoint covers
        if checkpoint.0 <= self.offset() {
            self.offset.set(checkpoint.0);
        }
        result
    }

    /// One uninitialized `T`, aligned for `T`
    #[track_caller]
    pub fn push_struct<T>(&self) -> NonNull<T> {
        self.push_aligned(mem::size_of::<T>(), mem::align_of::<T>()).cast()
    }

    #[track_caller]
    pub fn push_struct_zero<T>(&self) -> NonNull<T> {
        self.push_aligned_zero(mem::size_of::<T>(), mem::align_of::<T>()).cast()
    }

    /// `count` uninitialized `T`s, aligned for `T`
    #[track_caller]
    pub fn push_array<T>(&self, count: usize) -> NonNull<T> {
        or_fatal(self.try_push_array(count, false))
    }

    #[track_caller]
    pub fn push_array_zero<T>(&self, count: usize) -> NonNull<T> {
        or_fatal(self.try_push_array(count, true))
    }

    pub fn try_push_array<T>(&self, count: usize, zeroed: bool) -> Result<NonNull<T>> {
        let size = mem::size_of::<T>()
            .checked_mul(count)
            .ok_or(AllocationError::SizeOverflow)?;
        let ptr = if zeroed {
            self.try_push_aligned_zero(size, mem::align_of::<T>())?
        } else {
            self.try_push_aligned(size, mem::align_of::<T>())?
        };
        Ok(ptr.cast())
    }

    /// Commit `size` bytes starting at `start` (which may be past the current
    /// offset because of alignment padding)
    fn bump_from(&self, start: usize, size: usize) -> Result<NonNull<u8>> {
        let capacity = self.capacity();
        let end = start.checked_add(size).ok_or(AllocationError::SizeOverflow)?;

        if end > capacity {
            return Err(AllocationError::OutOfMemory {
                requested: end - self.offset(),
                available: self.remaining(),
            });
        }

        self.offset.set(end);
        let ptr = self.region.at(start);

        tracing::trace!(
            event = "arena_push",
            size,
            address = ?ptr.as_ptr(),
            offset = end,
            "Arena allocated"
        );
        Ok(ptr)
    }
}

impl Allocator for ArenaAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Arena
    }

    fn try_alloc(&self, size: usize) -> Result<NonNull<u8>> {
        self.try_push(size)
    }

    fn try_alloc_zero(&self, size: usize) -> Result<NonNull<u8>> {
        self.try_push_zero(size)
    }

    fn try_alloc_aligned(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        self.try_push_aligned(size, alignment)
    }

    fn try_alloc_aligned_zero(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        self.try_push_aligned_zero(size, alignment)
    }

    fn try_free_all(&self) -> Result<()> {
        self.reset();
        Ok(())
    }
}

impl Drop for ArenaAllocator {
    fn drop(&mut self) {
        context::release(&*self);
        tracing::debug!(event = "arena_destroy", capacity = self.capacity(), "Arena allocator destroyed");
    }
}

impl core::fmt::Debug for ArenaAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ArenaAllocator")
            .field("region", &self.region)
            .field("offset", &self.offset())
            .finish()
    }
}
