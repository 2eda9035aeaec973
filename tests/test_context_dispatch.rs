use std::pin::pin;

use typheus_memory::context::{self, activate, activate_scoped, deactivate};
use typheus_memory::{
    AllocationError, Allocator, AllocatorKind, ArenaAllocator, FitStrategy, HeapAllocator, MemoryConfig,
};

/// A loader that only knows about the ambient context
fn load_mesh(vertex_count: usize) -> Result<*mut [f32; 3], AllocationError> {
    let vertices = context::try_alloc(vertex_count * std::mem::size_of::<[f32; 3]>())?;
    Ok(vertices.as_ptr().cast())
}

/// The same loader with the allocator injected
fn load_mesh_with(allocator: &dyn Allocator, vertex_count: usize) -> Result<*mut [f32; 3], AllocationError> {
    let vertices = allocator.try_alloc_aligned(
        vertex_count * std::mem::size_of::<[f32; 3]>(),
        std::mem::align_of::<[f32; 3]>(),
    )?;
    Ok(vertices.as_ptr().cast())
}

#[test]
fn test_loader_without_context_fails() {
    assert_eq!(load_mesh(8), Err(AllocationError::InvalidContext));
}

#[test]
fn test_frame_scratch_over_persistent_heap() {
    let config = MemoryConfig::default();
    let heap = pin!(config.build_heap().unwrap());
    let scratch = pin!(config.build_scratch().unwrap());

    activate(heap.as_ref());
    let persistent = load_mesh(100).unwrap();

    for _frame in 0..3 {
        let _guard = activate_scoped(scratch.as_ref());
        load_mesh(1000).unwrap();
        assert_eq!(context::active_kind(), Some(AllocatorKind::Arena));
        context::free_all();
    }

    assert_eq!(context::active_kind(), Some(AllocatorKind::Heap));
    assert_eq!(scratch.offset(), 0);
    assert_eq!(heap.live_allocations(), 1);

    context::free(persistent.cast());
    assert_eq!(heap.used(), 0);
    deactivate();
}

#[test]
fn test_injected_allocators() {
    let heap = HeapAllocator::with_strategy(4096, FitStrategy::BestFit);
    let arena = ArenaAllocator::new(4096);

    for allocator in [&heap as &dyn Allocator, &arena as &dyn Allocator] {
        let vertices = load_mesh_with(allocator, 16).unwrap();
        assert_eq!(vertices as usize % std::mem::align_of::<[f32; 3]>(), 0);
        allocator.try_free_all().unwrap();
    }

    assert!(!context::is_active());
    assert_eq!(heap.live_allocations(), 0);
    assert_eq!(arena.offset(), 0);
}

#[test]
fn test_heap_destroyed_while_active() {
    {
        let heap = Box::pin(HeapAllocator::new(4096));
        activate(heap.as_ref());
        load_mesh(4).unwrap();
    }
    assert!(!context::is_active());
    assert_eq!(load_mesh(4), Err(AllocationError::InvalidContext));
}

#[test]
#[should_panic(expected = "not supported by the arena allocator")]
fn test_arena_free_through_context_is_fatal() {
    let arena = pin!(ArenaAllocator::new(4096));
    activate(arena.as_ref());
    let ptr = context::alloc(16);
    context::free(ptr.as_ptr());
}
