use proptest::prelude::*;
use typheus_memory::{AllocationError, BlockState, FitStrategy, HeapAllocator};

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    Free(usize),
    Realloc(usize, usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..300).prop_map(Op::Alloc),
        2 => any::<usize>().prop_map(Op::Free),
        2 => (any::<usize>(), 0usize..400).prop_map(|(i, size)| Op::Realloc(i, size)),
    ]
}

fn strategy() -> impl Strategy<Value = FitStrategy> {
    prop_oneof![Just(FitStrategy::FirstFit), Just(FitStrategy::BestFit)]
}

struct Live {
    ptr: *mut u8,
    size: usize,
    fill: u8,
}

fn fill(live: &Live) {
    unsafe { std::ptr::write_bytes(live.ptr, live.fill, live.size) };
}

fn intact(ptr: *mut u8, len: usize, fill: u8) -> bool {
    unsafe { std::slice::from_raw_parts(ptr, len) }
        .iter()
        .all(|&b| b == fill)
}

fn assert_consistent(heap: &HeapAllocator, live: &[Live]) {
    heap.check_integrity().expect("integrity");

    let free: usize = heap.free_blocks().iter().map(|b| b.size).sum();
    assert_eq!(heap.used() + free, heap.capacity(), "capacity conservation");
    assert_eq!(heap.live_allocations(), live.len());

    let mut ranges: Vec<(usize, usize)> = live
        .iter()
        .map(|l| (l.ptr as usize, l.ptr as usize + l.size))
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "overlapping allocations {:?}", pair);
    }

    for l in live {
        assert!(intact(l.ptr, l.size, l.fill), "payload clobbered");
    }
}

proptest! {
    #[test]
    fn random_operations_keep_heap_consistent(
        strategy in strategy(),
        ops in prop::collection::vec(op(), 1..120),
    ) {
        let heap = HeapAllocator::with_strategy(8192, strategy);
        let mut live: Vec<Live> = Vec::new();
        let mut next_fill = 1u8;

        for op in ops {
            match op {
                Op::Alloc(size) => match heap.try_alloc(size) {
                    Ok(ptr) => {
                        let entry = Live { ptr: ptr.as_ptr(), size, fill: next_fill };
                        next_fill = next_fill.wrapping_add(1).max(1);
                        fill(&entry);
                        live.push(entry);
                    }
                    Err(err) => prop_assert!(err.is_exhaustion()),
                },
                Op::Free(index) if !live.is_empty() => {
                    let entry = live.swap_remove(index % live.len());
                    prop_assert_eq!(heap.try_free(entry.ptr), Ok(()));
                }
                Op::Realloc(index, size) if !live.is_empty() => {
                    let index = index % live.len();
                    match heap.try_realloc(live[index].ptr, size) {
                        Ok(ptr) => {
                            let kept = live[index].size.min(size);
                            prop_assert!(intact(ptr.as_ptr(), kept, live[index].fill));
                            live[index].ptr = ptr.as_ptr();
                            live[index].size = size;
                            fill(&live[index]);
                        }
                        Err(err) => prop_assert!(err.is_exhaustion()),
                    }
                }
                _ => {}
            }
            assert_consistent(&heap, &live);
        }

        for entry in live.drain(..) {
            heap.free(entry.ptr);
        }
        prop_assert_eq!(heap.used(), 0);
        prop_assert_eq!(heap.free_blocks().len(), 1);
    }

    #[test]
    fn alloc_then_free_restores_fresh_heap(size in 0usize..4000, strategy in strategy()) {
        let heap = HeapAllocator::with_strategy(4096, strategy);
        let ptr = heap.alloc(size);
        heap.free(ptr.as_ptr());

        let blocks = heap.blocks();
        prop_assert_eq!(blocks.len(), 1);
        prop_assert_eq!(blocks[0].size, heap.capacity());
        prop_assert_eq!(blocks[0].state, BlockState::Free);
        prop_assert_eq!(heap.used(), 0);
    }

    #[test]
    fn aligned_payloads_honour_alignment(
        shift in 4u32..12,
        sizes in prop::collection::vec(1usize..200, 1..20),
    ) {
        let alignment = 1usize << shift;
        let heap = HeapAllocator::new(64 * 1024);
        for size in sizes {
            let ptr = heap.alloc_aligned(size, alignment);
            prop_assert_eq!(ptr.as_ptr() as usize % alignment, 0);
            prop_assert!(heap.payload_size(ptr.as_ptr()).unwrap() >= size);
        }
        heap.check_integrity().unwrap();
    }

    #[test]
    fn freed_pointers_are_rejected(sizes in prop::collection::vec(0usize..128, 1..16)) {
        let heap = HeapAllocator::new(8192);
        let ptrs: Vec<_> = sizes.iter().map(|&size| heap.alloc(size)).collect();
        for ptr in &ptrs {
            heap.free(ptr.as_ptr());
        }
        for ptr in &ptrs {
            let address = ptr.as_ptr() as usize;
            prop_assert_eq!(heap.try_free(ptr.as_ptr()), Err(AllocationError::DoubleFree { address }));
            prop_assert_eq!(
                heap.try_realloc(ptr.as_ptr(), 8),
                Err(AllocationError::UseAfterFree { address })
            );
        }
    }
}
