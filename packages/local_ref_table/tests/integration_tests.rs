//! Integration tests for `local_ref_table` through its public API.
//!
//! These tests drive the table the way a runtime does: each simulated native frame records the
//! segment state on entry, adds and removes references, and restores the state on return.

use std::collections::HashMap;
use std::sync::Arc;

use local_ref_table::{
    ENTRIES_PER_CHECKED_REFERENCE, Error, InvalidReference, LocalRef, LocalRefTable, ObjectRef,
    RefKind, SMALL_TABLE_ENTRIES, SegmentState, SmallTableAllocator,
};

fn obj(n: u64) -> ObjectRef {
    ObjectRef::new(0x10_0000 + n * 8).unwrap()
}

fn new_table(allocator: &Arc<SmallTableAllocator>, verification: bool) -> LocalRefTable {
    LocalRefTable::builder()
        .allocator(Arc::clone(allocator))
        .verification(verification)
        .build()
        .unwrap()
}

/// Calls into "native code" recursively, each level adding references to its own frame.
fn native_frame(
    table: &mut LocalRefTable,
    depth: u64,
    live: &mut Vec<(LocalRef, ObjectRef)>,
) {
    let frame = table.segment_state();
    let live_on_entry = live.len();

    let handles = (0..10)
        .map(|i| {
            let obj = obj(depth * 100 + i);
            let handle = table.add(frame, obj).unwrap();
            live.push((handle, obj));
            handle
        })
        .collect::<Vec<_>>();

    // Delete every other reference, as native code does with references it no longer needs.
    for handle in handles.iter().step_by(2) {
        assert!(table.remove(frame, *handle));
    }
    live.retain(|(handle, _)| table.validate_reference(*handle).is_ok());

    if depth != 0 {
        native_frame(table, depth - 1, live);
    }

    for (handle, obj) in live.iter() {
        assert_eq!(table.try_get(*handle), Ok(*obj));
    }

    table.set_segment_state(frame);

    for (handle, _) in live.drain(live_on_entry..) {
        assert!(table.validate_reference(handle).is_err());
    }
}

#[test]
fn nested_native_frames() {
    let allocator = Arc::new(SmallTableAllocator::new());

    for verification in [false, true] {
        let mut table = new_table(&allocator, verification);
        let mut live = Vec::new();

        native_frame(&mut table, 20, &mut live);

        assert!(live.is_empty());
        table.assert_empty();
    }
}

#[test]
fn stale_handle_detected_only_with_verification() {
    let allocator = Arc::new(SmallTableAllocator::new());
    let cookie = SegmentState::FIRST_SEGMENT;

    // With verification, the reused group gets a new serial number.
    let mut table = new_table(&allocator, true);
    let _below = table.add(cookie, obj(0)).unwrap();
    let stale = table.add(cookie, obj(1)).unwrap();
    let _above = table.add(cookie, obj(2)).unwrap();
    assert!(table.remove(cookie, stale));
    let fresh = table.add(cookie, obj(3)).unwrap();

    assert_ne!(stale, fresh);
    assert!(matches!(
        table.try_get(stale),
        Err(InvalidReference::BadSerialNumber { .. })
    ));
    assert_eq!(table.try_get(fresh), Ok(obj(3)));

    // Without verification, the hole is reused at the same address.
    let mut table = new_table(&allocator, false);
    let _below = table.add(cookie, obj(0)).unwrap();
    let stale = table.add(cookie, obj(1)).unwrap();
    let _above = table.add(cookie, obj(2)).unwrap();
    assert!(table.remove(cookie, stale));
    let fresh = table.add(cookie, obj(3)).unwrap();

    assert_eq!(stale, fresh);
}

#[test]
fn handles_survive_raw_roundtrip() {
    let allocator = Arc::new(SmallTableAllocator::new());
    let mut table = new_table(&allocator, true);

    let handle = table.add(SegmentState::FIRST_SEGMENT, obj(42)).unwrap();
    assert_eq!(handle.kind(), RefKind::Local);

    let raw = handle.as_raw();
    let restored = LocalRef::from_raw(raw).unwrap();

    assert_eq!(restored, handle);
    assert_eq!(table.try_get(restored), Ok(obj(42)));
}

#[test]
fn handles_of_other_tables_are_rejected() {
    let allocator = Arc::new(SmallTableAllocator::new());
    let mut table1 = new_table(&allocator, false);
    let mut table2 = new_table(&allocator, false);

    let handle1 = table1.add(SegmentState::FIRST_SEGMENT, obj(1)).unwrap();
    let handle2 = table2.add(SegmentState::FIRST_SEGMENT, obj(2)).unwrap();

    assert!(matches!(
        table1.validate_reference(handle2),
        Err(InvalidReference::OutsideTable { .. })
    ));
    assert!(!table1.remove(SegmentState::FIRST_SEGMENT, handle2));
    assert!(!table2.remove(SegmentState::FIRST_SEGMENT, handle1));

    assert_eq!(table1.try_get(handle1), Ok(obj(1)));
    assert_eq!(table2.try_get(handle2), Ok(obj(2)));
}

#[test]
fn garbage_collection_relocates_all_roots() {
    let allocator = Arc::new(SmallTableAllocator::new());
    let mut table = new_table(&allocator, false);
    let cookie = SegmentState::FIRST_SEGMENT;

    let mut handles = Vec::new();
    for i in 0..500 {
        handles.push((table.add(cookie, obj(i)).unwrap(), i));

        if i % 100 == 0 {
            table.set_verification_enabled(!table.is_verification_enabled());
        }
    }

    // Remove some references to leave holes of both kinds.
    for (handle, _) in handles.iter().step_by(7) {
        assert!(table.remove(cookie, *handle));
    }
    handles.retain(|(handle, _)| table.validate_reference(*handle).is_ok());

    // Move every object to a new location, like a copying collector.
    let mut forwarding = HashMap::new();
    let mut next_free = 0x8000_0000;
    table.visit_roots(&mut |root: &mut ObjectRef| {
        let new_location = *forwarding.entry(*root).or_insert_with(|| {
            next_free += 8;
            ObjectRef::new(next_free).unwrap()
        });
        *root = new_location;
    });

    assert_eq!(forwarding.len(), handles.len());

    for (handle, i) in &handles {
        assert_eq!(table.try_get(*handle), Ok(forwarding[&obj(*i)]));
    }
}

#[test]
fn overflow_reports_contents() {
    let allocator = Arc::new(SmallTableAllocator::new());
    let mut table = LocalRefTable::builder()
        .allocator(allocator)
        .max_entries(SMALL_TABLE_ENTRIES)
        .build()
        .unwrap();

    for _ in 0..SMALL_TABLE_ENTRIES {
        _ = table.add(SegmentState::FIRST_SEGMENT, obj(7)).unwrap();
    }

    let error = table.add(SegmentState::FIRST_SEGMENT, obj(7)).unwrap_err();
    let message = error.to_string();

    assert!(matches!(error, Error::Overflow { .. }));
    assert!(message.contains("local reference table overflow (max=64)"));
    assert!(message.contains(&format!("64 of {}", obj(7))));
    assert!(message.contains("cannot resize over the maximum permitted size"));
}

#[test]
fn capacity_counts_references_in_current_mode() {
    let allocator = Arc::new(SmallTableAllocator::new());
    let mut table = new_table(&allocator, true);
    let cookie = SegmentState::FIRST_SEGMENT;

    for i in 0..10 {
        _ = table.add(cookie, obj(i)).unwrap();
    }

    assert_eq!(table.capacity(), 10);
    assert_eq!(
        table.segment_state().top_index(),
        10 * ENTRIES_PER_CHECKED_REFERENCE
    );

    table.set_verification_enabled(false);
    assert_eq!(table.capacity(), 40);
}

#[test]
fn allocator_recycles_pages_of_dropped_tables() {
    let allocator = Arc::new(SmallTableAllocator::new());

    let tables = (0..100)
        .map(|_| new_table(&allocator, false))
        .collect::<Vec<_>>();

    assert!(allocator.mapped_page_count() > 1);

    drop(tables);

    assert_eq!(allocator.mapped_page_count(), 1);
    assert_eq!(allocator.free_block_count(SMALL_TABLE_ENTRIES), 0);
}

#[test]
fn ensure_free_capacity_then_add_never_fails() {
    let allocator = Arc::new(SmallTableAllocator::new());
    let mut table = new_table(&allocator, false);
    let cookie = SegmentState::FIRST_SEGMENT;

    table.ensure_free_capacity(5000).unwrap();
    let max_entries = table.max_entries();

    for i in 0..5000 {
        _ = table.add(cookie, obj(i)).unwrap();
    }

    assert_eq!(table.max_entries(), max_entries);
    assert_eq!(table.capacity(), 5000);

    table.set_segment_state(cookie);
    table.trim();
    table.assert_empty();

    // Trimmed storage is reused transparently.
    let handle = table.add(cookie, obj(1)).unwrap();
    assert_eq!(table.try_get(handle), Ok(obj(1)));
}
