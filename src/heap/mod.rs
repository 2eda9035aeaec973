//! Heap allocator - general purpose free-list allocation over one region
//!
//! Design: The region is tessellated into blocks. Free blocks form a singly
//! linked list stored inside the free memory itself, kept in ascending address
//! order so list neighbours are also the coalescing candidates. Live blocks
//! carry a 16-byte header in front of the payload.
//!
//! ```text
//!   head ─────────────┐                      ┌──────────────────────┐
//!                     ▼                      │                      ▼
//!   ┌────────┬────────────────┬────────┬─────┴──────┬────────┬──────────────┐
//!   │ H│ A1  │  free (next ───┼────────┼──► free)   │ H│ A2  │    free      │
//!   └────────┴────────────────┴────────┴────────────┴────────┴──────────────┘
//! ```
//!
//! Allocation: first-fit or best-fit search, split the surplus into a new
//! free node. Free: address-ordered insert, then merge with both neighbours.
//! Realloc: grow into the following free block when possible, otherwise move.

use core::cell::Cell;
use core::marker::PhantomPinned;
use core::ptr::{self, NonNull};

use serde::{Deserialize, Serialize};

use crate::context::{self, Allocator, AllocatorKind};
use crate::error::{or_fatal, AllocationError, Result};
use crate::region::{align_up, Region};

mod block;


use block::{granule_round, Block};
pub use block::{GRANULE, HEADER_SIZE};

/// Free-block search strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStrategy {
    /// First block (in address order) that is large enough
    #[default]
    FirstFit,
    /// Smallest block that is large enough; ties go to the lowest address
    BestFit,
}

/// Whether a block is on the free list or holds a live allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Allocated,
}

/// One block of the heap, as seen by introspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Offset of the block start from the region start
    pub offset: usize,
    /// Block size including its header or free-list node
    pub size: usize,
    pub state: BlockState,
}

/// Snapshot of heap occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub capacity: usize,
    pub used: usize,
    pub free_blocks: usize,
    pub largest_free_block: usize,
    pub live_allocations: usize,
}

/// A free block chosen for an allocation
struct Fit {
    prev: Option<Block>,
    node: Block,
    /// Bytes skipped in front of the allocation to honour alignment
    lead: usize,
}

/// Free-list allocator for long-lived, individually freed allocations
///
/// All methods take `&self`; bookkeeping lives in `Cell`s. Not thread-safe:
/// keep one heap per thread or serialize access externally.
pub struct HeapAllocator {
    region: Region,
    used: Cell<usize>,
    head: Cell<Option<Block>>,
    strategy: Cell<FitStrategy>,
    live: Cell<usize>,
    /// Bumped by `free_all`; headers of older generations no longer validate
    generation: Cell<usize>,
    _pinned: PhantomPinned,
}

impl HeapAllocator {
    /// Create a first-fit heap, terminating on failure
    #[track_caller]
    pub fn new(capacity: usize) -> Self {
        or_fatal(Self::try_new(capacity, FitStrategy::FirstFit))
    }

    #[track_caller]
    pub fn with_strategy(capacity: usize, strategy: FitStrategy) -> Self {
        or_fatal(Self::try_new(capacity, strategy))
    }

    /// Create a heap; `capacity` is rounded up to the block granule
    pub fn try_new(capacity: usize, strategy: FitStrategy) -> Result<Self> {
        if capacity == 0 {
            return Err(AllocationError::ZeroCapacity);
        }
        let capacity = granule_round(capacity).ok_or(AllocationError::SizeOverflow)?;
        let region = Region::try_allocate(capacity)?;

        let heap = Self {
            region,
            used: Cell::new(0),
            head: Cell::new(None),
            strategy: Cell::new(strategy),
            live: Cell::new(0),
            generation: Cell::new(0),
            _pinned: PhantomPinned,
        };
        heap.reset_free_list();

        tracing::debug!(
            event = "heap_create",
            capacity,
            strategy = ?strategy,
            "Heap allocator created"
        );
        Ok(heap)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    /// Bytes held by live blocks, headers included
    #[inline]
    pub fn used(&self) -> usize {
        self.used.get()
    }

    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.capacity() - self.used()
    }

    #[inline]
    pub fn live_allocations(&self) -> usize {
        self.live.get()
    }

    pub fn strategy(&self) -> FitStrategy {
        self.strategy.get()
    }

    pub fn set_strategy(&self, strategy: FitStrategy) {
        self.strategy.set(strategy);
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    // ===== Allocation =====

    pub fn try_alloc(&self, size: usize) -> Result<NonNull<u8>> {
        self.try_alloc_aligned(size, GRANULE)
    }

    pub fn try_alloc_zero(&self, size: usize) -> Result<NonNull<u8>> {
        self.try_alloc_aligned_zero(size, GRANULE)
    }

    #[track_caller]
    pub fn alloc(&self, size: usize) -> NonNull<u8> {
        or_fatal(self.try_alloc_aligned(size, GRANULE))
    }

    #[track_caller]
    pub fn alloc_zero(&self, size: usize) -> NonNull<u8> {
        or_fatal(self.try_alloc_aligned_zero(size, GRANULE))
    }

    /// Allocate with the payload aligned to `alignment` (at least 16)
    #[track_caller]
    pub fn alloc_aligned(&self, size: usize, alignment: usize) -> NonNull<u8> {
        or_fatal(self.try_alloc_aligned(size, alignment))
    }

    #[track_caller]
    pub fn alloc_aligned_zero(&self, size: usize, alignment: usize) -> NonNull<u8> {
        or_fatal(self.try_alloc_aligned_zero(size, alignment))
    }

    pub fn try_alloc_aligned_zero(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        let ptr = self.try_alloc_aligned(size, alignment)?;
        // SAFETY: the payload holds at least `size` bytes
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(ptr)
    }

    pub fn try_alloc_aligned(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        if !alignment.is_power_of_two() {
            return Err(AllocationError::InvalidAlignment(alignment));
        }
        let alignment = alignment.max(GRANULE);
        let body = Self::block_size_for(size)?;

        let fit = self.find_fit(body, alignment).ok_or(AllocationError::OutOfMemory {
            requested: body,
            available: self.free_bytes(),
        })?;

        let block = self.carve(fit, body);
        self.used.set(self.used() + body);
        self.live.set(self.live.get() + 1);

        let payload = block.payload();
        tracing::trace!(
            event = "heap_alloc",
            size,
            block_size = body,
            address = ?payload.as_ptr(),
            "Heap allocated"
        );
        Ok(payload)
    }

    /// Header plus payload rounded to the granule
    fn block_size_for(size: usize) -> Result<usize> {
        granule_round(size)
            .and_then(|payload| payload.checked_add(HEADER_SIZE))
            .ok_or(AllocationError::SizeOverflow)
    }

    /// Gap between `node` and the header of a payload aligned to `alignment`
    fn lead_for(node: Block, alignment: usize) -> usize {
        let payload = align_up(node.addr() + HEADER_SIZE, alignment);
        payload - HEADER_SIZE - node.addr()
    }

    fn find_fit(&self, body: usize, alignment: usize) -> Option<Fit> {
        let strategy = self.strategy();
        let mut best: Option<(Fit, usize)> = None;
        let mut prev = None;
        let mut cursor = self.head.get();

        while let Some(node) = cursor {
            let lead = Self::lead_for(node, alignment);
            let size = node.size();

            if let Some(needed) = lead.checked_add(body).filter(|&needed| size >= needed) {
                let slack = size - needed;
                let fit = Fit { prev, node, lead };
                match strategy {
                    FitStrategy::FirstFit => return Some(fit),
                    FitStrategy::BestFit => {
                        if best.as_ref().map_or(true, |(_, best_slack)| slack < *best_slack) {
                            if slack == 0 {
                                return Some(fit);
                            }
                            best = Some((fit, slack));
                        }
                    }
                }
            }

            prev = cursor;
            cursor = node.next();
        }

        best.map(|(fit, _)| fit)
    }

    /// Split `fit.node` into [lead free] [allocated body] [tail free] and
    /// return the allocated block with its header written
    fn carve(&self, fit: Fit, body: usize) -> Block {
        let Fit { prev, node, lead } = fit;
        let node_size = node.size();
        let after = node.next();
        let remainder = node_size - lead - body;

        // The node survives as the lead fragment when alignment skips bytes
        let before = if lead > 0 { Some(node) } else { prev };

        // SAFETY: lead + body + remainder == node_size, all inside the node
        let allocated = unsafe { node.offset(lead) };
        if remainder > 0 {
            let tail = unsafe { node.offset(lead + body) };
            tail.write_free(remainder, after);
            self.link(before, Some(tail));
        } else {
            self.link(before, after);
        }
        if lead > 0 {
            node.set_size(lead);
        }

        allocated.write_header(body, self.generation.get());
        allocated
    }

    // ===== Free =====

    /// Release one allocation; null is a no-op
    #[track_caller]
    pub fn free(&self, ptr: *mut u8) {
        or_fatal(self.try_free(ptr))
    }

    pub fn try_free(&self, ptr: *mut u8) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let block = self.live_block(ptr, |address| AllocationError::DoubleFree { address })?;
        let size = block.size();
        self.release_block(block);

        tracing::trace!(event = "heap_free", block_size = size, address = ?ptr, "Heap freed");
        Ok(())
    }

    /// Return a validated live block to the free list
    fn release_block(&self, block: Block) {
        let size = block.size();
        block.clear_tag();

        let prev = self.last_free_before(block.addr());
        let next = match prev {
            Some(node) => node.next(),
            None => self.head.get(),
        };
        block.write_free(size, next);
        self.link(prev, Some(block));

        self.used.set(self.used() - size);
        self.live.set(self.live.get() - 1);
        self.coalesce(prev, block);
    }

    /// Merge `node` with its list neighbours when they touch in memory
    fn coalesce(&self, prev: Option<Block>, node: Block) {
        if let Some(next) = node.next() {
            if node.end(node.size()) == next.addr() {
                node.set_size(node.size() + next.size());
                node.set_next(next.next());
            }
        }
        if let Some(prev) = prev {
            if prev.end(prev.size()) == node.addr() {
                prev.set_size(prev.size() + node.size());
                prev.set_next(node.next());
            }
        }
    }

    /// Drop every allocation and restore the single free block
    pub fn free_all(&self) {
        tracing::trace!(
            event = "heap_free_all",
            released = self.used(),
            live = self.live_allocations(),
            "Heap reset"
        );
        self.generation.set(self.generation.get().wrapping_add(1));
        self.reset_free_list();
    }

    fn reset_free_list(&self) {
        // SAFETY: the region start is page aligned and at least one granule long
        let first = unsafe { Block::new(self.region.start()) };
        first.write_free(self.capacity(), None);
        self.head.set(Some(first));
        self.used.set(0);
        self.live.set(0);
    }

    // ===== Realloc =====

    /// Resize an allocation, preserving `min(old, new)` payload bytes.
    /// A null `ptr` behaves like `alloc`.
    #[track_caller]
    pub fn realloc(&self, ptr: *mut u8, size: usize) -> NonNull<u8> {
        or_fatal(self.try_realloc(ptr, size))
    }

    pub fn try_realloc(&self, ptr: *mut u8, size: usize) -> Result<NonNull<u8>> {
        self.try_realloc_aligned(ptr, size, GRANULE)
    }

    /// Resize an allocation keeping its payload aligned to `alignment`.
    ///
    /// Resizes in place only when `ptr` already meets `alignment`; otherwise
    /// the data moves to a freshly aligned block.
    #[track_caller]
    pub fn realloc_aligned(&self, ptr: *mut u8, size: usize, alignment: usize) -> NonNull<u8> {
        or_fatal(self.try_realloc_aligned(ptr, size, alignment))
    }

    pub fn try_realloc_aligned(&self, ptr: *mut u8, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        if !alignment.is_power_of_two() {
            return Err(AllocationError::InvalidAlignment(alignment));
        }
        let Some(payload) = NonNull::new(ptr) else {
            return self.try_alloc_aligned(size, alignment);
        };
        let block = self.live_block(ptr, |address| AllocationError::UseAfterFree { address })?;
        let body = Self::block_size_for(size)?;
        let old = block.size();

        if payload.as_ptr() as usize % alignment == 0 {
            if body <= old {
                if body < old {
                    self.shrink_block(block, body);
                }
                return Ok(payload);
            }
            if self.grow_block(block, body) {
                return Ok(payload);
            }
        }

        // Move: the old block stays live until the copy is done
        let moved = self.try_alloc_aligned(size, alignment)?;
        let keep = (old - HEADER_SIZE).min(size);
        // SAFETY: distinct live blocks, each holds at least `keep` bytes
        unsafe { ptr::copy_nonoverlapping(payload.as_ptr(), moved.as_ptr(), keep) };
        self.release_block(block);

        tracing::debug!(
            event = "heap_realloc_move",
            from = ?payload.as_ptr(),
            to = ?moved.as_ptr(),
            size,
            alignment,
            "Reallocation moved"
        );
        Ok(moved)
    }

    /// Extend the allocation at `ptr` into the free block right after it.
    ///
    /// Returns `Ok(true)` when the payload now holds `size` bytes without
    /// moving, `Ok(false)` when the following memory is not free or too small.
    pub fn try_grow_in_place(&self, ptr: *mut u8, size: usize) -> Result<bool> {
        if ptr.is_null() {
            return Ok(false);
        }
        let block = self.live_block(ptr, |address| AllocationError::UseAfterFree { address })?;
        let body = Self::block_size_for(size)?;
        if body <= block.size() {
            return Ok(true);
        }
        Ok(self.grow_block(block, body))
    }

    fn grow_block(&self, block: Block, body: usize) -> bool {
        let old = block.size();
        let neighbour = block.end(old);

        let mut prev = None;
        let mut cursor = self.head.get();
        while let Some(node) = cursor {
            if node.addr() >= neighbour {
                break;
            }
            prev = cursor;
            cursor = node.next();
        }

        let Some(node) = cursor.filter(|node| node.addr() == neighbour) else {
            return false;
        };
        let combined = old + node.size();
        if combined < body {
            return false;
        }

        let after = node.next();
        let remainder = combined - body;
        if remainder > 0 {
            // SAFETY: body < combined, so the tail lies inside the old free node
            let tail = unsafe { block.offset(body) };
            tail.write_free(remainder, after);
            self.link(prev, Some(tail));
        } else {
            self.link(prev, after);
        }

        block.set_size(body);
        self.used.set(self.used() + body - old);

        tracing::debug!(
            event = "heap_grow_in_place",
            address = ?block.payload().as_ptr(),
            from = old,
            to = body,
            "Reallocation grew in place"
        );
        true
    }

    fn shrink_block(&self, block: Block, body: usize) {
        let old = block.size();
        // SAFETY: body < old, the tail is inside the block
        let tail = unsafe { block.offset(body) };
        block.set_size(body);

        let prev = self.last_free_before(tail.addr());
        let next = match prev {
            Some(node) => node.next(),
            None => self.head.get(),
        };
        tail.write_free(old - body, next);
        self.link(prev, Some(tail));
        self.used.set(self.used() - (old - body));
        self.coalesce(prev, tail);

        tracing::trace!(event = "heap_shrink", from = old, to = body, "Reallocation shrank in place");
    }

    // ===== Free-list plumbing =====

    /// Point `prev` (or the head when `None`) at `node`
    #[inline]
    fn link(&self, prev: Option<Block>, node: Option<Block>) {
        match prev {
            Some(prev) => prev.set_next(node),
            None => self.head.set(node),
        }
    }

    /// Last free node whose address is below `addr`
    fn last_free_before(&self, addr: usize) -> Option<Block> {
        let mut prev = None;
        let mut cursor = self.head.get();
        while let Some(node) = cursor {
            if node.addr() >= addr {
                break;
            }
            prev = cursor;
            cursor = node.next();
        }
        prev
    }

    /// Free node whose span covers `addr`
    fn free_block_containing(&self, addr: usize) -> Option<Block> {
        let node = self.last_free_before(addr + 1)?;
        (addr < node.end(node.size())).then_some(node)
    }

    /// Validate a client pointer and return its live block.
    /// `stale` builds the error for pointers into freed memory.
    fn live_block(&self, ptr: *mut u8, stale: impl FnOnce(usize) -> AllocationError) -> Result<Block> {
        let address = ptr as usize;
        let invalid = AllocationError::InvalidPointer { address };

        // A zero-size payload at the very end of the region points one past it
        let offset = address.wrapping_sub(self.region.start().as_ptr() as usize);
        if offset < HEADER_SIZE || offset > self.capacity() || offset % GRANULE != 0 {
            return Err(invalid);
        }
        let header_addr = address - HEADER_SIZE;

        if self.free_block_containing(header_addr).is_some() {
            return Err(stale(address));
        }

        // SAFETY: granule aligned, the header lies inside the region
        let block = unsafe { Block::from_payload(self.region.at(offset)) };
        if !block.is_live(self.generation.get()) {
            return Err(invalid);
        }
        let size = block.size();
        if size < GRANULE || size % GRANULE != 0 || offset - HEADER_SIZE + size > self.capacity() {
            return Err(AllocationError::Corrupted(format!(
                "live block at {:#x} has size {}",
                header_addr, size
            )));
        }
        Ok(block)
    }

    // ===== Introspection =====

    /// Usable payload bytes of a live allocation
    pub fn payload_size(&self, ptr: *mut u8) -> Result<usize> {
        let block = self.live_block(ptr, |address| AllocationError::UseAfterFree { address })?;
        Ok(block.size() - HEADER_SIZE)
    }

    /// Free blocks in list (address) order
    pub fn free_blocks(&self) -> Vec<BlockInfo> {
        let base = self.region.start().as_ptr() as usize;
        let mut blocks = Vec::new();
        let mut cursor = self.head.get();
        while let Some(node) = cursor {
            blocks.push(BlockInfo {
                offset: node.addr() - base,
                size: node.size(),
                state: BlockState::Free,
            });
            cursor = node.next();
        }
        blocks
    }

    pub fn stats(&self) -> HeapStats {
        let free = self.free_blocks();
        HeapStats {
            capacity: self.capacity(),
            used: self.used(),
            free_blocks: free.len(),
            largest_free_block: free.iter().map(|b| b.size).max().unwrap_or(0),
            live_allocations: self.live_allocations(),
        }
    }

    /// Every block in address order. Panics if the heap is corrupted.
    pub fn blocks(&self) -> Vec<BlockInfo> {
        or_fatal(self.walk())
    }

    /// Verify the tessellation, list order, coalescing and accounting
    pub fn check_integrity(&self) -> Result<()> {
        let blocks = self.walk()?;
        let corrupted = |reason: String| Err(AllocationError::Corrupted(reason));

        let mut free = 0;
        let mut live = 0;
        for pair in blocks.windows(2) {
            if pair[0].state == BlockState::Free && pair[1].state == BlockState::Free {
                return corrupted(format!("adjacent free blocks at offset {}", pair[0].offset));
            }
        }
        for block in &blocks {
            match block.state {
                BlockState::Free => free += block.size,
                BlockState::Allocated => live += 1,
            }
        }

        if self.used() + free != self.capacity() {
            return corrupted(format!(
                "used {} + free {} != capacity {}",
                self.used(),
                free,
                self.capacity()
            ));
        }
        if live != self.live_allocations() {
            return corrupted(format!(
                "{} live blocks found, {} recorded",
                live,
                self.live_allocations()
            ));
        }
        Ok(())
    }

    /// Walk the region block by block, cross-checking the free list
    fn walk(&self) -> Result<Vec<BlockInfo>> {
        let capacity = self.capacity();
        let mut blocks = Vec::new();
        let mut offset = 0;
        let mut next_free = self.head.get();

        while offset < capacity {
            // SAFETY: offset stays granule aligned and below capacity
            let block = unsafe { Block::new(self.region.at(offset)) };
            let size = block.size();
            let state = if next_free == Some(block) {
                next_free = block.next();
                BlockState::Free
            } else if block.is_live(self.generation.get()) {
                BlockState::Allocated
            } else {
                return Err(AllocationError::Corrupted(format!(
                    "block at offset {} is neither free nor live",
                    offset
                )));
            };

            if size < GRANULE || size % GRANULE != 0 || offset + size > capacity {
                return Err(AllocationError::Corrupted(format!(
                    "block at offset {} has size {}",
                    offset, size
                )));
            }

            blocks.push(BlockInfo { offset, size, state });
            offset += size;
        }

        if let Some(stray) = next_free {
            return Err(AllocationError::Corrupted(format!(
                "free node {:?} not reached in address order",
                stray
            )));
        }
        Ok(blocks)
    }

    /// One-line map of the heap, e.g. `128/1024 |A64|A64|F896|`
    pub fn dump(&self) -> String {
        let mut out = format!("{}/{} |", self.used(), self.capacity());
        match self.walk() {
            Ok(blocks) => {
                for block in blocks {
                    let tag = match block.state {
                        BlockState::Free => 'F',
                        BlockState::Allocated => 'A',
                    };
                    out.push_str(&format!("{}{}|", tag, block.size));
                }
            }
            Err(error) => out.push_str(&format!("<{}>", error)),
        }
        out
    }
}

impl Allocator for HeapAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Heap
    }

    fn try_alloc(&self, size: usize) -> Result<NonNull<u8>> {
        HeapAllocator::try_alloc(self, size)
    }

    fn try_alloc_zero(&self, size: usize) -> Result<NonNull<u8>> {
        HeapAllocator::try_alloc_zero(self, size)
    }

    fn try_alloc_aligned(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        HeapAllocator::try_alloc_aligned(self, size, alignment)
    }

    fn try_alloc_aligned_zero(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        HeapAllocator::try_alloc_aligned_zero(self, size, alignment)
    }

    fn try_realloc(&self, ptr: *mut u8, size: usize) -> Result<NonNull<u8>> {
        HeapAllocator::try_realloc(self, ptr, size)
    }

    fn try_realloc_aligned(&self, ptr: *mut u8, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        HeapAllocator::try_realloc_aligned(self, ptr, size, alignment)
    }

    fn try_free(&self, ptr: *mut u8) -> Result<()> {
        HeapAllocator::try_free(self, ptr)
    }

    fn try_free_all(&self) -> Result<()> {
        self.free_all();
        Ok(())
    }
}

impl Drop for HeapAllocator {
    fn drop(&mut self) {
        context::release(&*self);
        tracing::debug!(
            event = "heap_destroy",
            capacity = self.capacity(),
            leaked = self.live_allocations(),
            "Heap allocator destroyed"
        );
    }
}

impl core::fmt::Debug for HeapAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HeapAllocator")
            .field("region", &self.region)
            .field("used", &self.used())
            .field("strategy", &self.strategy())
            .field("live", &self.live_allocations())
            .finish()
    }
}
