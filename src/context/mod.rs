//! Allocation context - generic dispatch to the active allocator
//!
//! Design: Each thread has its own context. Activating an allocator installs
//! it as the target of the generic entry points (`alloc`, `alloc_zero`,
//! `realloc`, `free`, `free_all` and the `_aligned` variants); the
//! allocator's `Allocator` vtable is the
//! dispatch table. With nothing active every entry point fails with
//! `InvalidContext`, and an allocator that is dropped while active clears the
//! context on the way out.
//!
//! Code that knows which allocator it wants can skip the context entirely and
//! take `&impl Allocator` (or call the arena/heap directly).

use core::cell::RefCell;
use core::marker::PhantomData;
use core::mem;
use core::pin::Pin;
use core::ptr::NonNull;

use crate::error::{or_fatal, AllocationError, Result};


/// Which allocator family sits behind a context or a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocatorKind {
    Arena,
    Heap,
}

impl AllocatorKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Arena => "arena",
            Self::Heap => "heap",
        }
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for crate::arena::ArenaAllocator {}
    impl Sealed for crate::heap::HeapAllocator {}
}

/// The allocation interface shared by arenas and heaps
///
/// Operations an allocator cannot perform (per-allocation free on an arena,
/// for instance) return [`AllocationError::Unsupported`]. Sealed: only the
/// allocators in this crate deregister themselves from the context on drop.
pub trait Allocator: sealed::Sealed {
    fn kind(&self) -> AllocatorKind;

    fn try_alloc(&self, size: usize) -> Result<NonNull<u8>>;

    fn try_alloc_zero(&self, size: usize) -> Result<NonNull<u8>>;

    fn try_alloc_aligned(&self, size: usize, alignment: usize) -> Result<NonNull<u8>>;

    fn try_alloc_aligned_zero(&self, size: usize, alignment: usize) -> Result<NonNull<u8>>;

    /// Resize an allocation; a null `ptr` behaves like `try_alloc`
    fn try_realloc(&self, _ptr: *mut u8, _size: usize) -> Result<NonNull<u8>> {
        Err(self.unsupported("realloc"))
    }

    /// Resize an allocation, keeping the payload aligned to `alignment`
    fn try_realloc_aligned(&self, _ptr: *mut u8, _size: usize, _alignment: usize) -> Result<NonNull<u8>> {
        Err(self.unsupported("realloc"))
    }

    /// Release one allocation; a null `ptr` is a no-op
    fn try_free(&self, _ptr: *mut u8) -> Result<()> {
        Err(self.unsupported("free"))
    }

    /// Release every allocation at once
    fn try_free_all(&self) -> Result<()>;

    fn unsupported(&self, operation: &'static str) -> AllocationError {
        AllocationError::Unsupported {
            operation,
            allocator: self.kind().name(),
        }
    }
}

type Target = NonNull<dyn Allocator>;

#[derive(Default)]
struct ContextState {
    active: Option<Target>,
    /// Targets shadowed by live `ContextGuard`s, innermost last
    saved: Vec<Option<Target>>,
}

thread_local! {
    static CONTEXT: RefCell<ContextState> = RefCell::new(ContextState::default());
}

fn target_of<A: Allocator + 'static>(allocator: &A) -> Target {
    let object: &(dyn Allocator + 'static) = allocator;
    NonNull::from(object)
}

#[inline]
fn same_allocator(target: Target, address: *const ()) -> bool {
    target.as_ptr() as *const () == address
}

/// Make `allocator` the target of the generic entry points on this thread
///
/// The pin guarantees the allocator stays put until it is dropped, and
/// dropping it deactivates the context.
pub fn activate<A: Allocator + 'static>(allocator: Pin<&A>) {
    let allocator = allocator.get_ref();
    let target = target_of(allocator);
    CONTEXT.with(|ctx| ctx.borrow_mut().active = Some(target));
    tracing::trace!(
        event = "context_activate",
        allocator = allocator.kind().name(),
        "Allocation context activated"
    );
}

/// Rebind every entry point to the failing stubs
pub fn deactivate() {
    CONTEXT.with(|ctx| ctx.borrow_mut().active = None);
    tracing::trace!(event = "context_deactivate", "Allocation context cleared");
}

pub fn is_active() -> bool {
    CONTEXT.with(|ctx| ctx.borrow().active.is_some())
}

pub fn active_kind() -> Option<AllocatorKind> {
    with_active(|allocator| Ok(allocator.kind())).ok()
}

/// Activate `allocator` until the returned guard drops, then restore
/// whatever was active before
pub fn activate_scoped<'a, A: Allocator + 'static>(allocator: Pin<&'a A>) -> ContextGuard<'a> {
    let target = target_of(allocator.get_ref());
    let depth = CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        let previous = mem::replace(&mut ctx.active, Some(target));
        ctx.saved.push(previous);
        ctx.saved.len() - 1
    });
    tracing::trace!(
        event = "context_push",
        allocator = allocator.kind().name(),
        depth,
        "Scoped allocation context activated"
    );
    ContextGuard {
        depth,
        _allocator: PhantomData,
    }
}

/// Restores the previously active allocator on drop
#[must_use = "the previous allocator is restored when the guard drops"]
pub struct ContextGuard<'a> {
    depth: usize,
    _allocator: PhantomData<&'a ()>,
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        CONTEXT.with(|ctx| {
            let mut ctx = ctx.borrow_mut();
            if self.depth < ctx.saved.len() {
                let previous = ctx.saved[self.depth];
                ctx.saved.truncate(self.depth);
                ctx.active = previous;
            }
        });
        tracing::trace!(event = "context_pop", depth = self.depth, "Scoped allocation context restored");
    }
}

/// Forget every reference the context holds to `allocator`.
///
/// Called from the allocators' `Drop`.
pub(crate) fn release<A: Allocator>(allocator: &A) {
    let address = allocator as *const A as *const ();
    // The thread-local may already be gone during thread teardown
    let _ = CONTEXT.try_with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        if ctx.active.is_some_and(|target| same_allocator(target, address)) {
            ctx.active = None;
            tracing::debug!(
                event = "context_release",
                allocator = allocator.kind().name(),
                "Active allocator destroyed, context cleared"
            );
        }
        for saved in ctx.saved.iter_mut() {
            if saved.is_some_and(|target| same_allocator(target, address)) {
                *saved = None;
            }
        }
    });
}

fn with_active<R>(f: impl FnOnce(&dyn Allocator) -> Result<R>) -> Result<R> {
    let target = CONTEXT
        .with(|ctx| ctx.borrow().active)
        .ok_or(AllocationError::InvalidContext)?;
    // SAFETY: targets are only installed from pinned allocators, which remove
    // themselves from the context before their memory is released. Allocators
    // are !Send, so the target cannot be dropped on another thread.
    let allocator = unsafe { target.as_ref() };
    f(allocator)
}

pub fn try_alloc(size: usize) -> Result<NonNull<u8>> {
    with_active(|allocator| allocator.try_alloc(size))
}

pub fn try_alloc_zero(size: usize) -> Result<NonNull<u8>> {
    with_active(|allocator| allocator.try_alloc_zero(size))
}

pub fn try_alloc_aligned(size: usize, alignment: usize) -> Result<NonNull<u8>> {
    with_active(|allocator| allocator.try_alloc_aligned(size, alignment))
}

pub fn try_alloc_aligned_zero(size: usize, alignment: usize) -> Result<NonNull<u8>> {
    with_active(|allocator| allocator.try_alloc_aligned_zero(size, alignment))
}

pub fn try_realloc(ptr: *mut u8, size: usize) -> Result<NonNull<u8>> {
    with_active(|allocator| allocator.try_realloc(ptr, size))
}

pub fn try_realloc_aligned(ptr: *mut u8, size: usize, alignment: usize) -> Result<NonNull<u8>> {
    with_active(|allocator| allocator.try_realloc_aligned(ptr, size, alignment))
}

pub fn try_free(ptr: *mut u8) -> Result<()> {
    with_active(|allocator| allocator.try_free(ptr))
}

pub fn try_free_all() -> Result<()> {
    with_active(|allocator| allocator.try_free_all())
}

#[track_caller]
pub fn alloc(size: usize) -> NonNull<u8> {
    or_fatal(try_alloc(size))
}

#[track_caller]
pub fn alloc_zero(size: usize) -> NonNull<u8> {
    or_fatal(try_alloc_zero(size))
}

#[track_caller]
pub fn alloc_aligned(size: usize, alignment: usize) -> NonNull<u8> {
    or_fatal(try_alloc_aligned(size, alignment))
}

#[track_caller]
pub fn alloc_aligned_zero(size: usize, alignment: usize) -> NonNull<u8> {
    or_fatal(try_alloc_aligned_zero(size, alignment))
}

#[track_caller]
pub fn realloc(ptr: *mut u8, size: usize) -> NonNull<u8> {
    or_fatal(try_realloc(ptr, size))
}

#[track_caller]
pub fn realloc_aligned(ptr: *mut u8, size: usize, alignment: usize) -> NonNull<u8> {
    or_fatal(try_realloc_aligned(ptr, size, alignment))
}

#[track_caller]
pub fn free(ptr: *mut u8) {
    or_fatal(try_free(ptr))
}

#[track_caller]
pub fn free_all() {
    or_fatal(try_free_all())
}

fn try_alloc_typed<T>(count: usize, zeroed: bool) -> Result<NonNull<T>> {
    let size = mem::size_of::<T>()
        .checked_mul(count)
        .ok_or(AllocationError::SizeOverflow)?;
    let ptr = if zeroed {
        try_alloc_aligned_zero(size, mem::align_of::<T>())?
    } else {
        try_alloc_aligned(size, mem::align_of::<T>())?
    };
    Ok(ptr.cast())
}

/// One uninitialized `T` from the active allocator
#[track_caller]
pub fn alloc_struct<T>() -> NonNull<T> {
    or_fatal(try_alloc_typed(1, false))
}

#[track_caller]
pub fn alloc_struct_zero<T>() -> NonNull<T> {
    or_fatal(try_alloc_typed(1, true))
}

/// `count` uninitialized `T`s from the active allocator
#[track_caller]
pub fn alloc_array<T>(count: usize) -> NonNull<T> {
    or_fatal(try_alloc_typed(count, false))
}

#[track_caller]
pub fn alloc_array_zero<T>(count: usize) -> NonNull<T> {
    or_fatal(try_alloc_typed(count, true))
}
