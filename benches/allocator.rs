use std::pin::pin;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use typheus_memory::{context, kib, mib, ArenaAllocator, FitStrategy, HeapAllocator};

fn bench_arena_push(c: &mut Criterion) {
    let arena = ArenaAllocator::new(mib(16));

    c.bench_function("arena_push_16bytes", |b| {
        b.iter(|| {
            if arena.remaining() < 16 {
                arena.reset();
            }
            black_box(arena.push(black_box(16)))
        });
    });

    c.bench_function("arena_push_aligned_64", |b| {
        b.iter(|| {
            if arena.remaining() < 256 {
                arena.reset();
            }
            black_box(arena.push_aligned(black_box(24), 64))
        });
    });
}

fn bench_heap_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap_alloc_free");

    for size in [16, 256, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let heap = HeapAllocator::new(mib(1));
            b.iter(|| {
                let ptr = heap.alloc(black_box(size));
                heap.free(ptr.as_ptr());
            });
        });
    }

    group.finish();
}

/// Alloc/free churn over a fragmented heap, per search strategy
fn bench_fragmented_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap_fragmented_search");

    for strategy in [FitStrategy::FirstFit, FitStrategy::BestFit] {
        group.bench_function(format!("{:?}", strategy), |b| {
            let heap = HeapAllocator::with_strategy(mib(4), strategy);
            let ptrs: Vec<_> = (0..2000).map(|i| heap.alloc(16 + (i % 7) * 48)).collect();
            for ptr in ptrs.iter().step_by(2) {
                heap.free(ptr.as_ptr());
            }

            b.iter(|| {
                let ptr = heap.alloc(black_box(200));
                heap.free(ptr.as_ptr());
            });
        });
    }

    group.finish();
}

fn bench_realloc_growth(c: &mut Criterion) {
    c.bench_function("heap_realloc_doubling", |b| {
        let heap = HeapAllocator::new(mib(4));
        b.iter(|| {
            let mut ptr = heap.alloc(16);
            let mut size = 16;
            while size < kib(64) {
                size *= 2;
                ptr = heap.realloc(ptr.as_ptr(), size);
            }
            heap.free(ptr.as_ptr());
        });
    });
}

fn bench_context_dispatch(c: &mut Criterion) {
    let heap = pin!(HeapAllocator::new(mib(1)));
    context::activate(heap.as_ref());

    c.bench_function("context_alloc_free_64", |b| {
        b.iter(|| {
            let ptr = context::alloc(black_box(64));
            context::free(ptr.as_ptr());
        });
    });

    context::deactivate();
}

criterion_group!(
    benches,
    bench_arena_push,
    bench_heap_alloc_free,
    bench_fragmented_search,
    bench_realloc_growth,
    bench_context_dispatch
);
criterion_main!(benches);
