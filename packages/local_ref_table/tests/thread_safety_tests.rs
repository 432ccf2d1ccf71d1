//! Thread safety integration tests for `local_ref_table`.
//!
//! Tables are owned by one thread at a time, while one allocator is shared by the tables of
//! all threads.

use std::sync::Arc;
use std::thread;

use local_ref_table::{LocalRefTable, ObjectRef, SegmentState, SmallTableAllocator};

fn obj(n: u64) -> ObjectRef {
    ObjectRef::new(0x20_0000 + n * 8).unwrap()
}

#[test]
fn table_can_be_moved_between_threads() {
    let allocator = Arc::new(SmallTableAllocator::new());
    let mut table = LocalRefTable::builder()
        .allocator(allocator)
        .build()
        .unwrap();

    let handle = table.add(SegmentState::FIRST_SEGMENT, obj(1)).unwrap();

    let table = thread::spawn(move || {
        assert_eq!(table.try_get(handle), Ok(obj(1)));
        table
    })
    .join()
    .unwrap();

    assert_eq!(table.try_get(handle), Ok(obj(1)));
}

#[test]
fn allocator_shared_by_concurrent_threads() {
    let allocator = Arc::new(SmallTableAllocator::new());

    thread::scope(|s| {
        for thread_index in 0..8_u64 {
            let allocator = Arc::clone(&allocator);

            s.spawn(move || {
                for round in 0..20_u64 {
                    let mut table = LocalRefTable::builder()
                        .allocator(Arc::clone(&allocator))
                        .verification(round % 2 == 0)
                        .build()
                        .unwrap();

                    let cookie = SegmentState::FIRST_SEGMENT;
                    let handles = (0..300)
                        .map(|i| {
                            let obj = obj(thread_index * 10_000 + round * 1000 + i);
                            (table.add(cookie, obj).unwrap(), obj)
                        })
                        .collect::<Vec<_>>();

                    for (handle, obj) in &handles {
                        assert_eq!(table.try_get(*handle), Ok(*obj));
                    }
                }
            });
        }
    });

    assert_eq!(allocator.mapped_page_count(), 1);
}
