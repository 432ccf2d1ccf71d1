#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Per-thread tables of indirect local references, through which native code refers to objects
//! managed by a garbage collector.
//!
//! Native code never holds a raw pointer to a managed object. Instead, the runtime stores the
//! object reference in a [`LocalRefTable`] slot and hands out an opaque [`LocalRef`] handle.
//! The collector finds every live reference through
//! [`visit_roots()`][LocalRefTable::visit_roots] and can relocate objects without native code
//! noticing.
//!
//! # Key Features
//!
//! - **Stack-like segments**: Each native frame records the [`SegmentState`] on entry and
//!   restores it on return, dropping all references the frame created in one step.
//! - **Hole reuse**: References removed in the middle of a segment leave holes that later
//!   additions to the same segment fill, without ever touching enclosing segments.
//! - **Stable handles**: The table grows by adding chunks, never by moving existing slots.
//! - **Verification mode**: Optionally, each reference carries a serial number so that stale
//!   handles to reused slots are rejected instead of silently resolving to another object.
//! - **Cheap small tables**: The first chunks of every table come from a shared
//!   [`SmallTableAllocator`] that packs many tables into each memory page, so threads that
//!   hold few references cost little memory.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use local_ref_table::{LocalRefTable, ObjectRef, SmallTableAllocator};
//!
//! let allocator = Arc::new(SmallTableAllocator::new());
//! let mut table = LocalRefTable::builder().allocator(allocator).build().unwrap();
//!
//! // Entering a native frame.
//! let frame = table.segment_state();
//!
//! let a = table.add(frame, ObjectRef::new(0x1000).unwrap()).unwrap();
//! let b = table.add(frame, ObjectRef::new(0x2000).unwrap()).unwrap();
//! assert!(table.remove(frame, a));
//!
//! // The collector moves every object it finds.
//! table.visit_roots(&mut |root: &mut ObjectRef| {
//!     *root = ObjectRef::new(root.addr() + 0x10_0000).unwrap();
//! });
//! assert_eq!(table.try_get(b), Ok(ObjectRef::new(0x10_2000).unwrap()));
//!
//! // Returning from the native frame.
//! table.set_segment_state(frame);
//! assert_eq!(table.capacity(), 0);
//! ```

mod allocator;
mod builder;
mod dump;
mod error;
mod handle;
mod pal;
mod slot;
mod table;

pub use allocator::SmallTableAllocator;
pub use builder::LocalRefTableBuilder;
pub(crate) use error::Result;
pub use error::{Error, InvalidReference};
pub use handle::{LocalRef, ObjectRef, RefKind, RootVisitor};
pub use slot::ENTRIES_PER_CHECKED_REFERENCE;
pub use table::{LocalRefTable, SegmentState};

/// Number of slots in the first chunk of every table, which is also the smallest block the
/// [`SmallTableAllocator`] hands out.
pub const SMALL_TABLE_ENTRIES: usize = 64;

/// Size in bytes of the first chunk of every table.
pub const SMALL_TABLE_BYTES: usize = SMALL_TABLE_ENTRIES * slot::SLOT_SIZE;

/// Hard upper limit for the number of slots in one table, corresponding to 128 MiB of slots.
pub const MAX_TABLE_ENTRIES: usize = (128 * 1024 * 1024) / slot::SLOT_SIZE;

const _: () = assert!(SMALL_TABLE_ENTRIES.is_power_of_two());
const _: () = assert!(MAX_TABLE_ENTRIES.is_power_of_two());
