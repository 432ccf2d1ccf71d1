//! Basic benchmarks for the `local_ref_table` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::iter;
use std::sync::Arc;
use std::time::Instant;

use criterion::{Criterion, criterion_group, criterion_main};
use local_ref_table::{LocalRefTable, ObjectRef, SegmentState, SmallTableAllocator};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const TEST_OBJECT: ObjectRef = match ObjectRef::new(0x1000) {
    Some(obj) => obj,
    None => panic!("test object address is valid"),
};

fn new_table(allocator: &Arc<SmallTableAllocator>, verification: bool) -> LocalRefTable {
    LocalRefTable::builder()
        .allocator(Arc::clone(allocator))
        .verification(verification)
        .build()
        .unwrap()
}

fn entrypoint(c: &mut Criterion) {
    let allocator = Arc::new(SmallTableAllocator::new());

    let mut group = c.benchmark_group("lrt_basic");

    group.bench_function("build_empty", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();

            for _ in 0..iters {
                drop(black_box(new_table(&allocator, false)));
            }

            start.elapsed()
        });
    });

    for (name, verification) in [("unchecked", false), ("checked", true)] {
        group.bench_function(format!("add_remove_top_{name}"), |b| {
            b.iter_custom(|iters| {
                let mut table = new_table(&allocator, verification);
                let cookie = SegmentState::FIRST_SEGMENT;

                let start = Instant::now();

                for _ in 0..iters {
                    let handle = table.add(cookie, black_box(TEST_OBJECT)).unwrap();
                    black_box(table.remove(cookie, handle));
                }

                start.elapsed()
            });
        });

        group.bench_function(format!("fill_hole_{name}"), |b| {
            b.iter_custom(|iters| {
                let mut table = new_table(&allocator, verification);
                let cookie = SegmentState::FIRST_SEGMENT;

                // Keep one reference above, so removals leave a hole for the next addition.
                let mut handle = table.add(cookie, TEST_OBJECT).unwrap();
                _ = table.add(cookie, TEST_OBJECT).unwrap();

                let start = Instant::now();

                for _ in 0..iters {
                    table.remove(cookie, handle);
                    handle = table.add(cookie, black_box(TEST_OBJECT)).unwrap();
                }

                start.elapsed()
            });
        });
    }

    group.bench_function("try_get", |b| {
        b.iter_custom(|iters| {
            let mut table = new_table(&allocator, false);
            let handle = table
                .add(SegmentState::FIRST_SEGMENT, TEST_OBJECT)
                .unwrap();

            let start = Instant::now();

            for _ in 0..iters {
                _ = black_box(table.try_get(black_box(handle)));
            }

            start.elapsed()
        });
    });

    group.bench_function("pop_segment_of_64", |b| {
        b.iter_custom(|iters| {
            let mut tables = iter::repeat_with(|| new_table(&allocator, false))
                .take(usize::try_from(iters).unwrap())
                .collect::<Vec<_>>();

            for table in &mut tables {
                for _ in 0..64 {
                    _ = table.add(SegmentState::FIRST_SEGMENT, TEST_OBJECT).unwrap();
                }
            }

            let start = Instant::now();

            for table in &mut tables {
                table.set_segment_state(black_box(SegmentState::FIRST_SEGMENT));
                _ = black_box(table.add(SegmentState::FIRST_SEGMENT, TEST_OBJECT));
            }

            start.elapsed()
        });
    });

    group.bench_function("visit_roots_1000", |b| {
        b.iter_custom(|iters| {
            let mut table = new_table(&allocator, false);
            for _ in 0..1000 {
                _ = table.add(SegmentState::FIRST_SEGMENT, TEST_OBJECT).unwrap();
            }

            let start = Instant::now();

            for _ in 0..iters {
                table.visit_roots(&mut |root: &mut ObjectRef| {
                    black_box(root);
                });
            }

            start.elapsed()
        });
    });

    group.finish();
}
