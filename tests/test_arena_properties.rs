use proptest::prelude::*;
use typheus_memory::ArenaAllocator;

const CAPACITY: usize = 64 * 1024;

proptest! {
    #[test]
    fn pushes_are_increasing_and_disjoint(sizes in prop::collection::vec(0usize..512, 1..64)) {
        let arena = ArenaAllocator::new(CAPACITY);
        let mut previous_end = arena.region().start().as_ptr() as usize;

        for size in sizes {
            let start = arena.push(size).as_ptr() as usize;
            prop_assert!(start >= previous_end);
            prop_assert_eq!(start + size - arena.region().start().as_ptr() as usize, arena.offset());
            previous_end = start + size;
        }
    }

    #[test]
    fn reset_returns_first_address(x in 0usize..CAPACITY, y in 0usize..CAPACITY) {
        let fresh = ArenaAllocator::new(CAPACITY);
        let first = fresh.push(x);

        fresh.reset();
        prop_assert_eq!(fresh.push(y), first);
        prop_assert_eq!(first, fresh.region().start());
    }

    #[test]
    fn aligned_push_honours_alignment(
        steps in prop::collection::vec((0usize..100, 0u32..12), 1..40),
    ) {
        let arena = ArenaAllocator::new(CAPACITY * 2);
        for (size, shift) in steps {
            let alignment = 1usize << shift;
            let ptr = arena.push_aligned(size, alignment);
            prop_assert_eq!(ptr.as_ptr() as usize % alignment, 0);
        }
    }

    #[test]
    fn checkpoints_nest(outer in 1usize..1000, inner in 1usize..1000) {
        let arena = ArenaAllocator::new(CAPACITY);
        arena.push(outer);
        let saved = arena.checkpoint();
        arena.push(inner);
        let nested = arena.checkpoint();
        arena.push(inner);

        arena.restore(nested);
        prop_assert_eq!(arena.offset(), outer + inner);
        arena.restore(saved);
        prop_assert_eq!(arena.offset(), outer);
        prop_assert!(arena.try_restore(nested).is_err());
    }

    #[test]
    fn exhaustion_never_moves_offset(fill in 0usize..CAPACITY, extra in 1usize..CAPACITY) {
        let arena = ArenaAllocator::new(CAPACITY);
        arena.push(fill);
        let request = CAPACITY - fill + extra;

        let err = arena.try_push(request).unwrap_err();
        prop_assert!(err.is_exhaustion());
        prop_assert_eq!(arena.offset(), fill);
    }
}
