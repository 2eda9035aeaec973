//! Block descriptor - the only place heap memory is reinterpreted
//!
//! Every heap block is a multiple of `GRANULE` bytes and starts on a granule
//! boundary. Its first 16 bytes hold one of two records depending on state:
//!
//! ```text
//!   FREE                                ALLOCATED
//!   ┌──────────────┬──────────────┐     ┌──────────────┬──────────────┬─────────────┐
//!   │ block_size   │ next (free)  │     │ block_size   │ tag          │ payload ... │
//!   └──────────────┴──────────────┘     └──────────────┴──────────────┴─────────────┘
//!   0              8              16    0              8              16
//! ```
//!
//! `block_size` always sits at offset 0 and includes the record itself, so the
//! size can be read without knowing the state. The tag is a canary derived
//! from the block address and the heap generation; it is cleared when the
//! block is freed, and every header of an older generation stops validating
//! once the generation moves on.

use core::mem;
use core::ptr::NonNull;

/// Size and alignment unit of every heap block
pub const GRANULE: usize = 16;

/// Bytes in front of every payload
pub const HEADER_SIZE: usize = mem::size_of::<AllocationHeader>();

const LIVE_MAGIC: usize = 0xA110_C8ED;
const GENERATION_MIX: usize = 0x9E37_79B9;

#[repr(C, align(16))]
struct AllocationHeader {
    block_size: usize,
    tag: usize,
}

#[repr(C, align(16))]
struct FreeListNode {
    block_size: usize,
    next: Option<Block>,
}

const _: () = assert!(mem::size_of::<AllocationHeader>() == GRANULE);
const _: () = assert!(mem::size_of::<FreeListNode>() == GRANULE);

/// Round `size` up to the granule, `None` on overflow
#[inline]
pub fn granule_round(size: usize) -> Option<usize> {
    crate::region::checked_align_up(size, GRANULE)
}

/// Handle to a block inside a heap region
///
/// Invariant: points at `GRANULE`-aligned, writable memory with at least
/// `GRANULE` bytes available, owned by the heap that created it. Blocks never
/// escape the heap module, so they cannot outlive their region.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Block(NonNull<u8>);

impl Block {
    /// # Safety
    /// `ptr` must satisfy the `Block` invariant for as long as the handle is used.
    #[inline]
    pub unsafe fn new(ptr: NonNull<u8>) -> Self {
        debug_assert_eq!(ptr.as_ptr() as usize % GRANULE, 0, "unaligned block");
        Self(ptr)
    }

    /// Block owning the payload at `payload`.
    ///
    /// # Safety
    /// `payload - HEADER_SIZE` must satisfy the `Block` invariant.
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        Self::new(NonNull::new_unchecked(payload.as_ptr().sub(HEADER_SIZE)))
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Address one past the block, given its size
    #[inline]
    pub fn end(self, size: usize) -> usize {
        self.addr() + size
    }

    /// Block `bytes` further on.
    ///
    /// # Safety
    /// The result must satisfy the `Block` invariant.
    #[inline]
    pub unsafe fn offset(self, bytes: usize) -> Self {
        Self::new(NonNull::new_unchecked(self.0.as_ptr().add(bytes)))
    }

    #[inline]
    pub fn payload(self) -> NonNull<u8> {
        // SAFETY: the block holds at least its header, payload starts right after
        unsafe { NonNull::new_unchecked(self.0.as_ptr().add(HEADER_SIZE)) }
    }

    /// Total block size, valid in both states
    #[inline]
    pub fn size(self) -> usize {
        // SAFETY: Block invariant; block_size is at offset 0 in both records
        unsafe { (*self.0.as_ptr().cast::<FreeListNode>()).block_size }
    }

    #[inline]
    pub fn set_size(self, size: usize) {
        debug_assert!(size >= GRANULE && size % GRANULE == 0, "bad block size {size}");
        unsafe { (*self.0.as_ptr().cast::<FreeListNode>()).block_size = size }
    }

    // ----- free view -----

    /// Overwrite this block with a free-list node
    #[inline]
    pub fn write_free(self, size: usize, next: Option<Block>) {
        debug_assert!(size >= GRANULE && size % GRANULE == 0, "bad block size {size}");
        unsafe {
            self.0
                .as_ptr()
                .cast::<FreeListNode>()
                .write(FreeListNode { block_size: size, next })
        }
    }

    #[inline]
    pub fn next(self) -> Option<Block> {
        unsafe { (*self.0.as_ptr().cast::<FreeListNode>()).next }
    }

    #[inline]
    pub fn set_next(self, next: Option<Block>) {
        unsafe { (*self.0.as_ptr().cast::<FreeListNode>()).next = next }
    }

    // ----- allocated view -----

    /// Overwrite this block with a live allocation header of `generation`
    #[inline]
    pub fn write_header(self, size: usize, generation: usize) {
        debug_assert!(size >= GRANULE && size % GRANULE == 0, "bad block size {size}");
        let header = AllocationHeader {
            block_size: size,
            tag: self.live_tag(generation),
        };
        unsafe { self.0.as_ptr().cast::<AllocationHeader>().write(header) }
    }

    /// Whether the canary marks this block as a live allocation of `generation`
    #[inline]
    pub fn is_live(self, generation: usize) -> bool {
        unsafe { (*self.0.as_ptr().cast::<AllocationHeader>()).tag == self.live_tag(generation) }
    }

    #[inline]
    pub fn clear_tag(self) {
        unsafe { (*self.0.as_ptr().cast::<AllocationHeader>()).tag = 0 }
    }

    #[inline]
    fn live_tag(self, generation: usize) -> usize {
        LIVE_MAGIC ^ self.addr().rotate_left(17) ^ generation.wrapping_mul(GENERATION_MIX)
    }
}

impl core::fmt::Debug for Block {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Block({:p})", self.0.as_ptr())
    }
}
