#![allow(
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing,
    reason = "slot indices are bounded by max_entries, which never exceeds MAX_TABLE_ENTRIES"
)]

use std::cmp;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::{error, trace, warn};

use crate::dump::format_dump;
use crate::pal::MappedRegion;
use crate::slot::{FREE_LIST_END, SLOT_SIZE, Slot};
use crate::{
    ENTRIES_PER_CHECKED_REFERENCE, Error, InvalidReference, LocalRef, LocalRefTableBuilder,
    ObjectRef, RefKind, Result, RootVisitor, SMALL_TABLE_ENTRIES, SmallTableAllocator,
};

/// Bit of the free list head recording whether verification mode is enabled.
const FLAG_VERIFICATION: u32 = 1 << 0;

/// The first free index is stored above a padding bit, so it has the same value range as the
/// next-free field of a slot.
const FIRST_FREE_SHIFT: u32 = 2;

/// Free list head of a table with an empty free list and verification disabled. This is the
/// only state in which the small table fast path of [`LocalRefTable::add()`] applies.
const EMPTY_FREE_LIST_AND_VERIFICATION_DISABLED: u32 = FREE_LIST_END << FIRST_FREE_SHIFT;

const CHECKED: u32 = ENTRIES_PER_CHECKED_REFERENCE;

const _: () = assert!(CHECKED.is_power_of_two());
const _: () = assert!(SMALL_TABLE_ENTRIES % CHECKED as usize == 0);

/// Segment cookie of a [`LocalRefTable`]: the top index at some point in time.
///
/// Read the current state with [`LocalRefTable::segment_state()`] when entering a native frame
/// and pass it to every [`add()`][LocalRefTable::add] and [`remove()`][LocalRefTable::remove]
/// of that frame. Restore it with [`LocalRefTable::set_segment_state()`] when the frame returns,
/// which invalidates every reference added by the frame at once.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct SegmentState {
    top_index: u32,
}

impl SegmentState {
    /// The segment state of an empty table.
    pub const FIRST_SEGMENT: Self = Self { top_index: 0 };

    /// Index one past the highest slot in use when the state was taken.
    #[must_use]
    pub const fn top_index(self) -> u32 {
        self.top_index
    }
}

/// Per-thread table of local references, handing out [`LocalRef`] handles that native code
/// holds instead of raw pointers to managed objects.
///
/// Slots live in a list of chunks of geometrically growing size: the small initial chunks come
/// from a shared [`SmallTableAllocator`], larger ones are mapped directly. Chunks never move,
/// so handles (which embed the slot address) stay stable as the table grows.
///
/// Removed slots below the top index are kept in a free list threaded through the slots
/// themselves. Removing the top-most slot instead lowers the top index past any holes below
/// it. Popping a segment lowers the top index in one step, leaving freed slots above it on the
/// free list until the next operation prunes them.
///
/// With verification enabled, every reference takes a group of
/// [`ENTRIES_PER_CHECKED_REFERENCE`] slots: a header holding a serial number and three slots
/// used in rotation, so a stale handle to a reused group can be detected.
///
/// The table is owned by one thread at a time ([`Send`] but not [`Sync`]).
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use local_ref_table::{LocalRefTable, ObjectRef, SmallTableAllocator};
///
/// let allocator = Arc::new(SmallTableAllocator::new());
/// let mut table = LocalRefTable::builder().allocator(allocator).build().unwrap();
///
/// let frame = table.segment_state();
/// let obj = ObjectRef::new(0x1000).unwrap();
///
/// let handle = table.add(frame, obj).unwrap();
/// assert_eq!(table.try_get(handle), Ok(obj));
///
/// // Returning from the native frame drops all its references.
/// table.set_segment_state(frame);
/// assert!(table.validate_reference(handle).is_err());
/// ```
pub struct LocalRefTable {
    segment_state: SegmentState,

    /// Number of slots in all chunks combined. Always a power of two.
    max_entries: usize,

    /// Hard limit for `max_entries`. Always a power of two.
    max_table_entries: usize,

    /// First free index in the upper bits plus the verification flag.
    free_entries_list: u32,

    /// The only chunk while the table has not grown. Moved to the front of `tables` when the
    /// second chunk is allocated.
    small_table: Option<NonNull<Slot>>,

    /// Chunk `i` holds `table_size(i)` slots.
    tables: Vec<NonNull<Slot>>,

    /// Mappings of the chunks too large for the small table allocator, in table order after
    /// the small tables.
    table_maps: Vec<MappedRegion>,

    allocator: Arc<SmallTableAllocator>,
}

// SAFETY: The table exclusively owns its chunks and the chunk pointers are only dereferenced
// through the table, so moving the table moves ownership of all of its memory.
unsafe impl Send for LocalRefTable {}

impl LocalRefTable {
    /// Starts configuring a new table.
    pub fn builder() -> LocalRefTableBuilder {
        LocalRefTableBuilder::new()
    }

    pub(crate) fn new_inner(
        allocator: Arc<SmallTableAllocator>,
        verification: bool,
        min_capacity: usize,
        max_table_entries: usize,
    ) -> Result<Self> {
        debug_assert!(max_table_entries.is_power_of_two());
        debug_assert!(max_table_entries >= SMALL_TABLE_ENTRIES);

        let min_entries = if verification {
            min_capacity.saturating_mul(CHECKED as usize)
        } else {
            min_capacity
        };

        if min_entries > max_table_entries {
            return Err(Error::CapacityExceeded {
                requested: min_entries,
                available: max_table_entries,
                used: 0,
            });
        }

        let small_table = allocator.allocate(SMALL_TABLE_ENTRIES)?;

        debug_assert_eq!(
            small_table.as_ptr().addr() % (CHECKED as usize * SLOT_SIZE),
            0,
            "small table is not aligned for slot groups"
        );

        let mut table = Self {
            segment_state: SegmentState::FIRST_SEGMENT,
            max_entries: SMALL_TABLE_ENTRIES,
            max_table_entries,
            free_entries_list: encode_free_list(FREE_LIST_END, verification),
            small_table: Some(small_table),
            tables: Vec::new(),
            table_maps: Vec::new(),
            allocator,
        };

        if min_entries > SMALL_TABLE_ENTRIES {
            // Dropping the table on failure returns the small table to the allocator.
            table.resize(min_entries)?;
        }

        trace!(
            verification,
            max_entries = table.max_entries,
            "initialized local reference table"
        );

        Ok(table)
    }

    /// The kind of handles this table issues.
    #[must_use]
    pub fn kind(&self) -> RefKind {
        RefKind::Local
    }

    /// Whether references added from now on are created in verification mode.
    #[must_use]
    pub fn is_verification_enabled(&self) -> bool {
        self.free_entries_list & FLAG_VERIFICATION != 0
    }

    /// Switches verification mode for future additions.
    ///
    /// Existing references keep the mode they were created in until they are removed. A slot
    /// freed in one mode is only reused by an addition in the same mode.
    pub fn set_verification_enabled(&mut self, enabled: bool) {
        self.free_entries_list = encode_free_list(self.first_free_index(), enabled);

        trace!(enabled, "local reference table verification mode changed");
    }

    /// The current segment state, to be restored when the current native frame returns.
    #[must_use]
    pub fn segment_state(&self) -> SegmentState {
        self.segment_state
    }

    /// Restores a segment state previously obtained from [`segment_state()`][Self::segment_state].
    ///
    /// Every reference added after the state was taken becomes invalid. Slots above the new top
    /// index that are still on the free list are pruned lazily by later operations.
    pub fn set_segment_state(&mut self, state: SegmentState) {
        trace!(
            from = self.segment_state.top_index,
            to = state.top_index,
            "setting segment state"
        );

        self.segment_state = state;
    }

    /// Number of references the table holds in the current verification mode, including holes
    /// left by removals. With verification enabled, every reference counts as one even though
    /// it takes several slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        let top_index = self.top_index_usize();

        if self.is_verification_enabled() {
            top_index.div_ceil(CHECKED as usize)
        } else {
            top_index
        }
    }

    /// Number of slots the table has allocated storage for. Never decreases.
    #[must_use]
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Number of references that can be added without growing the table, ignoring holes that
    /// could be reused.
    #[must_use]
    pub fn free_capacity(&self) -> usize {
        let free_entries = self.max_entries - self.top_index_usize();

        if self.is_verification_enabled() {
            free_entries / CHECKED as usize
        } else {
            free_entries
        }
    }

    /// Panics if the table holds any references, including holes.
    ///
    /// # Panics
    ///
    /// Panics if [`capacity()`][Self::capacity] is not zero.
    pub fn assert_empty(&self) {
        assert_eq!(
            self.capacity(),
            0,
            "internal error: non-empty local reference table"
        );
    }

    /// Adds a reference to the table in the segment that started at `previous_state`.
    ///
    /// Holes below `previous_state` are never reused, as they belong to an enclosing segment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Overflow`] if the table is full at its maximum size or
    /// [`Error::Resize`] if it needed to grow and could not. The table is unchanged in both
    /// cases, except for pruning and padding that does not affect any valid reference.
    pub fn add(&mut self, previous_state: SegmentState, obj: ObjectRef) -> Result<LocalRef> {
        debug_assert!(previous_state.top_index <= self.segment_state.top_index);

        let mut top_index = self.segment_state.top_index;

        if let Some(small_table) = self.small_table {
            debug_assert_eq!(self.max_entries, SMALL_TABLE_ENTRIES);

            if self.free_entries_list == EMPTY_FREE_LIST_AND_VERIFICATION_DISABLED {
                if top_index as usize != SMALL_TABLE_ENTRIES {
                    self.segment_state.top_index = top_index + 1;

                    // SAFETY: The top index is below the small table size.
                    let slot = unsafe { small_table.add(top_index as usize) };
                    return Ok(self.store(slot, obj));
                }
            } else if !self.is_verification_enabled() {
                let mut first_free_index = self.first_free_index();
                debug_assert_ne!(first_free_index, FREE_LIST_END);

                if first_free_index >= top_index {
                    self.prune_popped_free_entries();
                    first_free_index = self.first_free_index();
                }

                if first_free_index != FREE_LIST_END
                    && first_free_index >= previous_state.top_index
                    && !self.slot(group_start(first_free_index)).is_serial_number()
                {
                    let next_free = self.slot(first_free_index).next_free();
                    self.free_entries_list = encode_free_list(next_free, false);

                    let slot = self.slot_ptr(first_free_index);
                    return Ok(self.store(slot, obj));
                }

                if top_index as usize != SMALL_TABLE_ENTRIES {
                    self.segment_state.top_index = top_index + 1;

                    // SAFETY: The top index is below the small table size.
                    let slot = unsafe { small_table.add(top_index as usize) };
                    return Ok(self.store(slot, obj));
                }
            }
        }

        let verification = self.is_verification_enabled();

        let mut first_free_index = self.first_free_index();
        if first_free_index != FREE_LIST_END && first_free_index >= top_index {
            self.prune_popped_free_entries();
            first_free_index = self.first_free_index();
        }

        if first_free_index != FREE_LIST_END && first_free_index >= previous_state.top_index {
            debug_assert!(first_free_index < top_index, "popped entries were pruned above");

            let header_index = group_start(first_free_index);

            // Reuse the hole only if it was created in the current mode.
            if self.slot(header_index).is_serial_number() == verification {
                let next_free = self.slot(first_free_index).next_free();
                self.set_first_free_index(next_free);

                let index = if verification {
                    debug_assert_ne!(header_index, first_free_index);
                    header_index + self.increment_serial_number(header_index)
                } else {
                    first_free_index
                };

                let slot = self.slot_ptr(index);
                return Ok(self.store_traced(slot, obj, "reused hole"));
            }
        }

        if verification && top_index % CHECKED != 0 {
            // Slots in a partial group cannot hold checked references. Turn them into holes
            // that only an addition with verification disabled will reuse.
            while top_index % CHECKED != 0 {
                self.slot_mut(top_index).set_next_free(first_free_index);
                first_free_index = top_index;
                top_index += 1;
            }

            self.set_first_free_index(first_free_index);
            self.segment_state.top_index = top_index;
        }

        if top_index as usize == self.max_entries {
            if self.max_entries == self.max_table_entries {
                return Err(Error::Overflow {
                    max_entries: self.max_entries,
                    dump: self.dump(),
                });
            }

            if let Err(e) = self.resize(self.max_entries * 2) {
                return Err(Error::Resize {
                    max_entries: self.max_entries,
                    dump: self.dump(),
                    source: Box::new(e),
                });
            }
        }

        if verification {
            // The segment may start mid-group if verification was enabled after it was
            // pushed. Padding above has aligned the top regardless.
            debug_assert_eq!(top_index % CHECKED, 0);

            let serial_number = self.increment_serial_number(top_index);
            self.segment_state.top_index = top_index + CHECKED;

            let slot = self.slot_ptr(top_index + serial_number);
            return Ok(self.store_traced(slot, obj, "appended checked"));
        }

        self.segment_state.top_index = top_index + 1;

        let slot = self.slot_ptr(top_index);
        Ok(self.store_traced(slot, obj, "appended"))
    }

    /// Stores the reference without logging, for the small table fast paths.
    fn store(&self, mut slot: NonNull<Slot>, obj: ObjectRef) -> LocalRef {
        // SAFETY: The slot belongs to one of our chunks and we hold `&mut self` in all callers,
        // so nothing else is accessing it.
        unsafe { slot.as_mut() }.set_reference(obj);

        LocalRef::from_slot(slot)
    }

    fn store_traced(&self, slot: NonNull<Slot>, obj: ObjectRef, path: &'static str) -> LocalRef {
        let handle = self.store(slot, obj);

        trace!(
            path,
            %obj,
            top_index = self.segment_state.top_index,
            "added local reference"
        );

        handle
    }

    /// Removes a reference from the segment that started at `previous_state`.
    ///
    /// Returns `false` without changing the table if the handle is not a local reference of
    /// this table, belongs to an enclosing segment or is not currently valid (for example
    /// because it was already removed).
    ///
    /// Removing the top-most reference also reclaims any holes directly below it, as long as
    /// they were created in the current verification mode. Holes left by the other mode stay
    /// on the free list until an addition in that mode reuses them or their segment is popped.
    pub fn remove(&mut self, previous_state: SegmentState, handle: LocalRef) -> bool {
        let kind = handle.kind();
        if kind != RefKind::Local {
            warn!(%kind, "attempt to remove non-local reference from local reference table");
            return false;
        }

        debug_assert!(previous_state.top_index <= self.segment_state.top_index);

        let top_index = self.segment_state.top_index;
        let bottom_index = previous_state.top_index;

        let Some(entry_index) = self.entry_index(handle) else {
            warn!(?handle, "attempt to remove reference outside the table");
            return false;
        };

        if entry_index < bottom_index {
            warn!(
                entry_index,
                bottom_index, top_index, "attempt to remove index outside index area"
            );
            return false;
        }

        match self.validate_reference(handle) {
            Ok(()) => {}
            Err(e @ InvalidReference::Deleted { .. }) => {
                error!(%e, "attempt to remove already deleted local reference");
                return false;
            }
            Err(e) => {
                warn!(%e, "attempt to remove invalid local reference");
                return false;
            }
        }

        debug_assert!(entry_index < top_index);

        let first_free_index = self.first_free_index();
        if first_free_index != FREE_LIST_END && first_free_index >= top_index {
            self.prune_popped_free_entries();
        }

        let header_index = group_start(entry_index);
        let (prune_end, is_top_entry) = if self.slot(header_index).is_serial_number() {
            debug_assert_eq!(
                entry_index - header_index,
                self.slot(header_index).serial_number()
            );

            (header_index, header_index + CHECKED == top_index)
        } else {
            (entry_index, entry_index + 1 == top_index)
        };

        if !is_top_entry {
            let first_free_index = self.first_free_index();
            self.slot_mut(entry_index).set_next_free(first_free_index);
            self.set_first_free_index(entry_index);

            trace!(entry_index, "removed local reference, left hole");
            return true;
        }

        self.slot_mut(entry_index).set_dead();

        let (prune_start, prune_count) = if self.is_verification_enabled() {
            let mut prune_start = prune_end;

            while prune_start % CHECKED == 0
                && prune_start >= bottom_index + CHECKED
                && self.is_checked_hole(prune_start - CHECKED)
            {
                prune_start -= CHECKED;
            }

            (prune_start, (prune_end - prune_start) / CHECKED)
        } else {
            let mut prune_start = prune_end;

            while prune_start > bottom_index && self.is_unchecked_hole(prune_start - 1) {
                prune_start -= 1;
            }

            (prune_start, prune_end - prune_start)
        };

        if prune_count != 0 {
            self.unlink_pruned_holes(prune_start, prune_count);
        }

        self.segment_state.top_index = prune_start;

        trace!(
            entry_index,
            prune_count,
            top_index = prune_start,
            "removed top local reference"
        );

        true
    }

    /// Whether the slot is a hole created with verification disabled.
    fn is_unchecked_hole(&self, index: u32) -> bool {
        self.slot(index).is_free() && !self.slot(group_start(index)).is_serial_number()
    }

    /// Whether the group starting at `header_index` is a hole created with verification enabled.
    fn is_checked_hole(&self, header_index: u32) -> bool {
        let header = self.slot(header_index);
        if !header.is_serial_number() {
            return false;
        }

        let serial_number = header.serial_number();
        debug_assert!(is_valid_serial_number(serial_number));

        self.slot(header_index + serial_number).is_free()
    }

    /// Takes the `prune_count` holes at or above `prune_start` off the free list.
    fn unlink_pruned_holes(&mut self, prune_start: u32, prune_count: u32) {
        let mut remaining = prune_count;

        // Pruned holes at the head of the list.
        let mut free_index = self.first_free_index();
        while remaining != 0 && free_index >= prune_start {
            debug_assert_ne!(free_index, FREE_LIST_END);

            let pruned = free_index;
            free_index = self.slot(pruned).next_free();
            self.slot_mut(pruned).set_dead();
            remaining -= 1;
        }

        self.set_first_free_index(free_index);

        // Pruned holes further down the list, each after an entry we keep.
        while remaining != 0 {
            debug_assert_ne!(free_index, FREE_LIST_END);
            debug_assert!(free_index < prune_start);

            while self.slot(free_index).next_free() < prune_start {
                free_index = self.slot(free_index).next_free();
            }

            let pruned = self.slot(free_index).next_free();
            let next_free = self.slot(pruned).next_free();
            self.slot_mut(free_index).set_next_free(next_free);
            self.slot_mut(pruned).set_dead();
            remaining -= 1;
        }

        debug_assert!(free_index == FREE_LIST_END || free_index < prune_start);
    }

    /// Checks whether a handle refers to a live reference in this table.
    ///
    /// This never modifies the table.
    ///
    /// # Errors
    ///
    /// Returns the first problem found with the handle.
    pub fn validate_reference(&self, handle: LocalRef) -> std::result::Result<(), InvalidReference> {
        let kind = handle.kind();
        if kind != RefKind::Local {
            return Err(InvalidReference::WrongKind { kind });
        }

        let index = self
            .entry_index(handle)
            .ok_or(InvalidReference::OutsideTable {
                raw: handle.as_raw(),
            })?;

        let top_index = self.segment_state.top_index;
        if index >= top_index {
            return Err(InvalidReference::Popped { index, top_index });
        }

        let header = self.slot(group_start(index));
        if header.is_serial_number() {
            let expected = header.serial_number();
            let serial = index - group_start(index);

            if serial != expected || serial == 0 {
                return Err(InvalidReference::BadSerialNumber {
                    index,
                    serial,
                    expected,
                });
            }
        }

        let slot = self.slot(index);

        if slot.is_free() {
            return Err(InvalidReference::Deleted { index });
        }

        if slot.is_null() {
            // Should never happen, may indicate memory corruption.
            return Err(InvalidReference::Null { index });
        }

        Ok(())
    }

    /// Resolves a handle to the referenced object.
    ///
    /// This is a single mask-and-load. Debug builds validate the handle unless verification
    /// mode is enabled (in which case the caller is expected to validate).
    ///
    /// # Safety
    ///
    /// The handle must be valid for this table, as checked by
    /// [`validate_reference()`][Self::validate_reference].
    #[must_use]
    pub unsafe fn get(&self, handle: LocalRef) -> ObjectRef {
        self.debug_validate(handle);

        // SAFETY: The caller guarantees the handle points to a live slot of this table.
        unsafe { &*handle.slot_ptr() }.reference()
    }

    /// Resolves a handle to the referenced object after validating it.
    ///
    /// # Errors
    ///
    /// Returns why the handle is not valid for this table.
    pub fn try_get(&self, handle: LocalRef) -> std::result::Result<ObjectRef, InvalidReference> {
        self.validate_reference(handle)?;

        // SAFETY: Validated above.
        Ok(unsafe { self.get(handle) })
    }

    /// Replaces the object a handle refers to, keeping the handle valid.
    ///
    /// # Safety
    ///
    /// The handle must be valid for this table, as checked by
    /// [`validate_reference()`][Self::validate_reference].
    pub unsafe fn update(&mut self, handle: LocalRef, obj: ObjectRef) {
        self.debug_validate(handle);

        // SAFETY: The caller guarantees the handle points to a live slot of this table and we
        // hold `&mut self`, so nothing else is accessing it.
        unsafe { &mut *handle.slot_ptr() }.set_reference(obj);
    }

    /// Replaces the object a handle refers to after validating the handle.
    ///
    /// # Errors
    ///
    /// Returns why the handle is not valid for this table.
    pub fn try_update(
        &mut self,
        handle: LocalRef,
        obj: ObjectRef,
    ) -> std::result::Result<(), InvalidReference> {
        self.validate_reference(handle)?;

        // SAFETY: Validated above.
        unsafe {
            self.update(handle, obj);
        }

        Ok(())
    }

    #[cfg_attr(test, mutants::skip)] // Only active in debug builds, checks caller obligations.
    fn debug_validate(&self, handle: LocalRef) {
        if cfg!(debug_assertions) && !self.is_verification_enabled() {
            if let Err(e) = self.validate_reference(handle) {
                panic!("invalid local reference {handle:?}: {e}");
            }
        }
    }

    /// Grows the table so that at least `free_capacity` more references can be added without
    /// failure, not counting holes that could be reused.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExceeded`] if the request cannot be satisfied within the maximum
    /// table size, or the allocation error if growing failed.
    pub fn ensure_free_capacity(&mut self, free_capacity: usize) -> Result<()> {
        debug_assert!(free_capacity >= 1);

        let top_index = self.top_index_usize();
        debug_assert!(top_index <= self.max_entries);

        let required = if self.is_verification_enabled() {
            // The next checked addition first pads the top index to a group boundary.
            let padding = top_index.next_multiple_of(CHECKED as usize) - top_index;
            free_capacity
                .saturating_mul(CHECKED as usize)
                .saturating_add(padding)
        } else {
            free_capacity
        };

        if required <= self.max_entries - top_index {
            return Ok(());
        }

        let available = self.max_table_entries - top_index;
        if required > available {
            return Err(Error::CapacityExceeded {
                requested: required,
                available,
                used: top_index,
            });
        }

        self.resize(top_index + required).inspect_err(|e| {
            warn!(
                free_capacity,
                %e,
                dump = %self.dump(),
                "unable to reserve space in local reference table"
            );
        })
    }

    /// Grows the table to at least `new_size` slots.
    ///
    /// Chunks allocated before a failure are kept, so capacity may still have grown.
    fn resize(&mut self, new_size: usize) -> Result<()> {
        debug_assert!(new_size > self.max_entries);
        debug_assert!(new_size <= self.max_table_entries);

        let required_size = new_size.next_power_of_two();
        let required_tables = num_tables_for_size(required_size);
        let max_small_tables = self.max_small_tables();

        let mut num_tables = if self.small_table.is_some() {
            1
        } else {
            self.tables.len()
        };
        debug_assert_eq!(num_tables, num_tables_for_size(self.max_entries));

        while num_tables != required_tables {
            let new_table_size = table_size(num_tables);

            let new_table = if num_tables < max_small_tables {
                self.allocator.allocate(new_table_size)?
            } else {
                let map = MappedRegion::new(
                    self.allocator.memory(),
                    new_table_size * SLOT_SIZE,
                    "local reference table",
                )?;
                let begin = map.begin().cast::<Slot>();
                self.table_maps.push(map);
                begin
            };

            self.tables.push(new_table);

            // Only move the small table once the table has actually grown.
            if let Some(small_table) = self.small_table.take() {
                self.tables.insert(0, small_table);
            }

            debug_assert_eq!(self.max_entries, new_table_size);
            self.max_entries = 2 * new_table_size;
            num_tables += 1;

            trace!(
                max_entries = self.max_entries,
                "local reference table grew"
            );
        }

        debug_assert_eq!(self.tables.len(), required_tables);

        Ok(())
    }

    /// Returns the memory of unused slots at the end of directly mapped chunks to the
    /// operating system. Capacity is unchanged; released pages read as zero when reused.
    ///
    /// Chunks from the small table allocator are never released.
    pub fn trim(&mut self) {
        if self.table_maps.is_empty() {
            return;
        }

        debug_assert_eq!(
            self.tables.len(),
            self.table_maps.len() + self.max_small_tables()
        );

        // Popped holes may live in the memory we release, so take them off the list first.
        let first_free_index = self.first_free_index();
        if first_free_index != FREE_LIST_END && first_free_index >= self.segment_state.top_index {
            self.prune_popped_free_entries();
        }

        let top_index = self.top_index_usize();
        let max_small_tables = self.max_small_tables();

        // The small tables together hold as many slots as the first mapped table.
        let small_tables_capacity = table_size(max_small_tables);

        let mut map_index = 0;

        if top_index > small_tables_capacity {
            let top_table_size = 1_usize << top_index.ilog2();
            let top_table_index = num_tables_for_size(top_table_size);
            let start_index = top_index - top_table_size;

            map_index = top_table_index - max_small_tables;

            if start_index != 0 {
                let map = &self.table_maps[map_index];
                map_index += 1;

                let release_start =
                    (start_index * SLOT_SIZE).next_multiple_of(self.allocator.page_size());
                map.release_pages(release_start, map.len() - release_start);
            }
        }

        for map in self.table_maps.get(map_index..).unwrap_or_default() {
            map.release_all_pages();
        }

        trace!(top_index, "trimmed local reference table");
    }

    /// Visits every live reference in slot order, skipping holes and serial number headers.
    ///
    /// The visitor may relocate a reference by overwriting it; the new value is stored back
    /// into the slot.
    pub fn visit_roots(&mut self, visitor: &mut impl RootVisitor) {
        self.for_each_live_entry(|_, mut entry| {
            // SAFETY: Live entries are slots of our chunks and we hold `&mut self`.
            let entry = unsafe { entry.as_mut() };

            let mut root = entry.reference();
            visitor.visit_root(&mut root);
            entry.set_reference(root);
        });
    }

    /// A human-readable listing of the references currently in the table.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut entries = Vec::new();

        self.for_each_live_entry(|index, entry| {
            // SAFETY: Live entries are slots of our chunks.
            entries.push((index, unsafe { entry.as_ref() }.reference()));
        });

        format_dump(&entries)
    }

    /// Calls `f` with the index of every slot below the top index that holds a reference,
    /// and the slot itself.
    fn for_each_live_entry(&self, mut f: impl FnMut(usize, NonNull<Slot>)) {
        let mut remaining = self.top_index_usize();
        let mut first_index = 0;

        for (table, size) in self.chunks() {
            if remaining == 0 {
                break;
            }

            let count = cmp::min(remaining, size);

            // SAFETY: The chunk holds `size` slots, of which we visit the first `count`.
            unsafe {
                live_entries_in_chunk(table, first_index, count, &mut f);
            }

            first_index += count;
            remaining -= count;
        }
    }

    /// Index of the slot a handle points to, if it points into one of our chunks.
    ///
    /// The index may be above the top index.
    fn entry_index(&self, handle: LocalRef) -> Option<u32> {
        let addr = handle.slot_addr();
        if addr % SLOT_SIZE != 0 {
            return None;
        }

        self.chunks()
            .enumerate()
            .find_map(|(table_index, (table, size))| {
                let begin = table.as_ptr().addr();
                let offset = addr.checked_sub(begin)? / SLOT_SIZE;

                if offset >= size {
                    return None;
                }

                let table_start = if table_index == 0 { 0 } else { size };

                u32::try_from(table_start + offset).ok()
            })
    }

    /// The chunks and their sizes in slots, in index order.
    fn chunks(&self) -> impl Iterator<Item = (NonNull<Slot>, usize)> {
        self.small_table
            .map(|table| (table, SMALL_TABLE_ENTRIES))
            .into_iter()
            .chain(
                self.tables
                    .iter()
                    .enumerate()
                    .map(|(i, table)| (*table, table_size(i))),
            )
    }

    fn slot_ptr(&self, index: u32) -> NonNull<Slot> {
        let index = index as usize;
        debug_assert!(index < self.max_entries, "slot index {index} out of bounds");

        let (table, offset) = match self.small_table {
            Some(small_table) => (small_table, index),
            None if index < SMALL_TABLE_ENTRIES => (self.tables[0], index),
            None => {
                let table_start = 1_usize << index.ilog2();
                (
                    self.tables[num_tables_for_size(table_start)],
                    index - table_start,
                )
            }
        };

        // SAFETY: Chunk `i` starting at `table_start` holds `table_start` slots (or
        // SMALL_TABLE_ENTRIES for the first), so the offset is in bounds.
        unsafe { table.add(offset) }
    }

    fn slot(&self, index: u32) -> &Slot {
        // SAFETY: The slot belongs to one of our chunks. Chunk memory is zero-initialized and
        // every bit pattern is a valid `Slot`.
        unsafe { self.slot_ptr(index).as_ref() }
    }

    fn slot_mut(&mut self, index: u32) -> &mut Slot {
        // SAFETY: The slot belongs to one of our chunks and we hold `&mut self`.
        unsafe { self.slot_ptr(index).as_mut() }
    }

    fn first_free_index(&self) -> u32 {
        self.free_entries_list >> FIRST_FREE_SHIFT
    }

    fn set_first_free_index(&mut self, index: u32) {
        self.free_entries_list = encode_free_list(index, self.is_verification_enabled());
    }

    /// Drops free list entries at or above the top index, which belong to popped segments.
    fn prune_popped_free_entries(&mut self) {
        let top_index = self.segment_state.top_index;

        let mut free_index = self.first_free_index();
        debug_assert_ne!(free_index, FREE_LIST_END);
        debug_assert!(free_index >= top_index);

        loop {
            free_index = self.slot(free_index).next_free();

            if free_index == FREE_LIST_END || free_index < top_index {
                break;
            }
        }

        self.set_first_free_index(free_index);

        trace!(top_index, first_free = free_index, "pruned popped free entries");
    }

    /// Advances the serial number in the group header to the next value in `1..=3`.
    fn increment_serial_number(&mut self, header_index: u32) -> u32 {
        debug_assert_eq!(header_index % CHECKED, 0);

        let header = self.slot_mut(header_index);

        // The old value can be 0 if the group was never used, or any bits left behind by a
        // reference or hole written while verification was disabled.
        let old = header.serial_number_unchecked() % CHECKED;
        let new = if old + 1 == CHECKED { 1 } else { old + 1 };
        debug_assert!(is_valid_serial_number(new));

        header.set_serial_number(new);
        new
    }

    fn max_small_tables(&self) -> usize {
        num_tables_for_size(self.allocator.page_size() / SLOT_SIZE)
    }

    fn top_index_usize(&self) -> usize {
        self.segment_state.top_index as usize
    }
}

impl Drop for LocalRefTable {
    fn drop(&mut self) {
        if let Some(small_table) = self.small_table.take() {
            debug_assert!(self.tables.is_empty());

            // SAFETY: Allocated from this allocator with this size and no longer reachable.
            unsafe {
                self.allocator.deallocate(small_table, SMALL_TABLE_ENTRIES);
            }
        } else {
            let num_small_tables = cmp::min(self.tables.len(), self.max_small_tables());

            for (i, table) in self.tables.iter().take(num_small_tables).enumerate() {
                // SAFETY: Chunks below `max_small_tables()` were allocated from this allocator
                // with this size and are no longer reachable.
                unsafe {
                    self.allocator.deallocate(*table, table_size(i));
                }
            }
        }

        // The remaining chunks are unmapped when `table_maps` is dropped.
    }
}

impl fmt::Debug for LocalRefTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRefTable")
            .field("segment_state", &self.segment_state)
            .field("max_entries", &self.max_entries)
            .field("max_table_entries", &self.max_table_entries)
            .field("first_free_index", &self.first_free_index())
            .field("verification", &self.is_verification_enabled())
            .field("tables", &self.chunks().count())
            .field("table_maps", &self.table_maps.len())
            .finish_non_exhaustive()
    }
}

/// Calls `f` with every slot holding a reference among the first `count` slots of a chunk
/// whose first slot has table index `first_index`.
///
/// # Safety
///
/// The chunk must hold at least `count` slots.
unsafe fn live_entries_in_chunk(
    table: NonNull<Slot>,
    first_index: usize,
    count: usize,
    f: &mut impl FnMut(usize, NonNull<Slot>),
) {
    let mut i = 0;

    while i != count {
        // SAFETY: `i < count`, which the caller guarantees is in bounds.
        let slot = unsafe { table.add(i).as_ref() };

        let entry_offset = if i % CHECKED as usize == 0 && slot.is_serial_number() {
            let offset = i + slot.serial_number() as usize;
            i += CHECKED as usize;
            debug_assert!(i <= count);
            offset
        } else {
            let offset = i;
            i += 1;
            offset
        };

        // SAFETY: The entry is within the current slot group, which ends at or before `count`.
        let entry = unsafe { table.add(entry_offset) };

        // SAFETY: As above.
        let state = unsafe { entry.as_ref() };
        debug_assert!(!state.is_serial_number());

        if !state.is_free() {
            f(first_index + entry_offset, entry);
        }
    }
}

/// Number of slots in chunk `table_index`: two chunks of the small size, then doubling.
fn table_size(table_index: usize) -> usize {
    SMALL_TABLE_ENTRIES << table_index.saturating_sub(1)
}

/// Number of chunks that together hold `size` slots. The `size` must be a power of two.
fn num_tables_for_size(size: usize) -> usize {
    debug_assert!(size >= SMALL_TABLE_ENTRIES);
    debug_assert!(size.is_power_of_two());

    1 + (size / SMALL_TABLE_ENTRIES).ilog2() as usize
}

fn group_start(index: u32) -> u32 {
    index & !(CHECKED - 1)
}

fn is_valid_serial_number(serial_number: u32) -> bool {
    serial_number != 0 && serial_number < CHECKED
}

fn encode_free_list(first_free_index: u32, verification: bool) -> u32 {
    (first_free_index << FIRST_FREE_SHIFT) | if verification { FLAG_VERIFICATION } else { 0 }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::cognitive_complexity,
    clippy::cast_possible_truncation,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use static_assertions::{assert_impl_all, assert_not_impl_any};
    use tracing::subscriber::with_default;
    use tracing::{Event, Metadata, Subscriber, span};

    use super::*;
    use crate::pal::{BuildTargetMemory, Memory, MemoryFacade, MockMemory};

    assert_impl_all!(LocalRefTable: Send, fmt::Debug);
    assert_not_impl_any!(LocalRefTable: Sync);
    assert_impl_all!(SegmentState: Send, Sync, Copy);

    fn obj(n: u64) -> ObjectRef {
        ObjectRef::new(0x1_0000 + n * 8).unwrap()
    }

    fn table_with(
        allocator: &Arc<SmallTableAllocator>,
        verification: bool,
        min_capacity: usize,
    ) -> LocalRefTable {
        LocalRefTable::builder()
            .allocator(Arc::clone(allocator))
            .verification(verification)
            .min_capacity(min_capacity)
            .build()
            .unwrap()
    }

    fn new_table(verification: bool) -> LocalRefTable {
        table_with(&Arc::new(SmallTableAllocator::new()), verification, 20)
    }

    fn slot_is_null(handle: LocalRef) -> bool {
        unsafe { &*handle.slot_ptr() }.is_null()
    }

    #[test]
    fn basic_add_remove_scenario() {
        for verification in [false, true] {
            let mut table = new_table(verification);
            let cookie = SegmentState::FIRST_SEGMENT;

            let iref0 = table.add(cookie, obj(0)).unwrap();
            let iref1 = table.add(cookie, obj(1)).unwrap();
            let iref2 = table.add(cookie, obj(2)).unwrap();
            assert_eq!(table.capacity(), 3);

            assert_eq!(table.try_get(iref0), Ok(obj(0)));
            assert_eq!(table.try_get(iref1), Ok(obj(1)));
            assert_eq!(table.try_get(iref2), Ok(obj(2)));

            // Middle entry leaves a hole.
            assert!(table.remove(cookie, iref1));
            assert_eq!(table.capacity(), 3);
            assert!(table.validate_reference(iref1).is_err());

            // Top entry takes the hole below it along.
            assert!(table.remove(cookie, iref2));
            assert_eq!(table.capacity(), 1);

            assert!(table.remove(cookie, iref0));
            assert_eq!(table.capacity(), 0);
            table.assert_empty();
        }
    }

    #[test]
    fn trailing_holes_collapse_through_top() {
        for verification in [false, true] {
            let mut table = new_table(verification);
            let cookie = SegmentState::FIRST_SEGMENT;

            let a = table.add(cookie, obj(0)).unwrap();
            let b = table.add(cookie, obj(1)).unwrap();
            let c = table.add(cookie, obj(2)).unwrap();
            let d = table.add(cookie, obj(3)).unwrap();

            assert!(table.remove(cookie, b));
            assert!(table.remove(cookie, c));
            assert_eq!(table.capacity(), 4);

            assert!(table.remove(cookie, d));
            assert_eq!(table.capacity(), 1);
            assert_eq!(table.try_get(a), Ok(obj(0)));

            // The pruned holes are no longer on the free list, so the next addition appends.
            let e = table.add(cookie, obj(4)).unwrap();
            assert_eq!(table.capacity(), 2);
            assert_eq!(table.try_get(e), Ok(obj(4)));
        }
    }

    #[test]
    fn popping_segment_invalidates_its_references() {
        for verification in [false, true] {
            let mut table = new_table(verification);
            let cookie0 = SegmentState::FIRST_SEGMENT;

            let outer = table.add(cookie0, obj(0)).unwrap();

            let cookie1 = table.segment_state();
            let inner1 = table.add(cookie1, obj(1)).unwrap();
            let inner2 = table.add(cookie1, obj(2)).unwrap();
            assert!(table.remove(cookie1, inner1));

            table.set_segment_state(cookie1);

            assert!(matches!(
                table.validate_reference(inner1),
                Err(InvalidReference::Popped { .. })
            ));
            assert!(matches!(
                table.validate_reference(inner2),
                Err(InvalidReference::Popped { .. })
            ));
            assert_eq!(table.try_get(outer), Ok(obj(0)));
            assert_eq!(table.capacity(), 1);
        }
    }

    #[test]
    fn remove_from_enclosing_segment_is_rejected() {
        let mut table = new_table(false);

        let outer = table.add(SegmentState::FIRST_SEGMENT, obj(0)).unwrap();
        let cookie1 = table.segment_state();

        assert!(!table.remove(cookie1, outer));
        assert_eq!(table.try_get(outer), Ok(obj(0)));
    }

    fn holes_scenarios(verification: bool, min_capacity: usize) {
        let allocator = Arc::new(SmallTableAllocator::new());
        let cookie0 = SegmentState::FIRST_SEGMENT;

        // Segment with holes, push new segment, add reference.
        {
            let mut table = table_with(&allocator, verification, min_capacity);
            assert!(table.dump().contains("(empty)"));

            _ = table.add(cookie0, obj(0)).unwrap();
            let iref1 = table.add(cookie0, obj(1)).unwrap();
            _ = table.add(cookie0, obj(2)).unwrap();

            assert!(table.remove(cookie0, iref1));

            let cookie1 = table.segment_state();
            _ = table.add(cookie1, obj(3)).unwrap();

            // Must not have filled the hole of the previous segment.
            assert_eq!(table.capacity(), 4);
            assert!(table.validate_reference(iref1).is_err());
            assert!(table.dump().contains("Summary (3 distinct)"));
        }

        // Segment with holes, pop segment, add reference.
        {
            let mut table = table_with(&allocator, verification, min_capacity);

            _ = table.add(cookie0, obj(0)).unwrap();

            let cookie1 = table.segment_state();
            _ = table.add(cookie1, obj(1)).unwrap();
            let iref2 = table.add(cookie1, obj(2)).unwrap();
            _ = table.add(cookie1, obj(3)).unwrap();

            assert!(table.remove(cookie1, iref2));

            table.set_segment_state(cookie1);
            _ = table.add(cookie1, obj(4)).unwrap();

            assert_eq!(table.capacity(), 2);
            assert!(table.validate_reference(iref2).is_err());
            assert!(table.dump().contains("Summary (2 distinct)"));
        }

        // Segment with holes, push new segment, pop segment, add reference.
        {
            let mut table = table_with(&allocator, verification, min_capacity);

            _ = table.add(cookie0, obj(0)).unwrap();

            let cookie1 = table.segment_state();
            let iref1 = table.add(cookie1, obj(1)).unwrap();
            _ = table.add(cookie1, obj(2)).unwrap();

            assert!(table.remove(cookie1, iref1));

            let cookie2 = table.segment_state();
            _ = table.add(cookie2, obj(3)).unwrap();

            table.set_segment_state(cookie2);
            _ = table.add(cookie1, obj(4)).unwrap();

            assert_eq!(table.capacity(), 3);
            if verification {
                assert!(matches!(
                    table.validate_reference(iref1),
                    Err(InvalidReference::BadSerialNumber { .. })
                ));
            }
            assert!(table.dump().contains("Summary (3 distinct)"));
        }

        // Empty segment, push new segment, create a hole, pop segment, add reference.
        {
            let mut table = table_with(&allocator, verification, min_capacity);

            _ = table.add(cookie0, obj(0)).unwrap();

            let cookie1 = table.segment_state();
            let iref1 = table.add(cookie1, obj(1)).unwrap();
            assert!(table.remove(cookie1, iref1));

            _ = table.add(cookie1, obj(1)).unwrap();
            let iref3 = table.add(cookie1, obj(2)).unwrap();
            _ = table.add(cookie1, obj(3)).unwrap();

            assert!(table.remove(cookie1, iref3));

            table.set_segment_state(cookie1);
            _ = table.add(cookie1, obj(4)).unwrap();

            assert_eq!(table.capacity(), 2);
            assert!(table.validate_reference(iref3).is_err());
            assert!(table.dump().contains("Summary (2 distinct)"));
        }

        // Base segment, push new segment, create a hole, pop segment, push new segment, add
        // reference.
        {
            let mut table = table_with(&allocator, verification, min_capacity);

            _ = table.add(cookie0, obj(0)).unwrap();

            let cookie1 = table.segment_state();
            _ = table.add(cookie1, obj(1)).unwrap();
            let iref2 = table.add(cookie1, obj(1)).unwrap();
            let iref3 = table.add(cookie1, obj(2)).unwrap();

            assert!(table.remove(cookie1, iref2));

            table.set_segment_state(cookie1);
            _ = table.add(table.segment_state(), obj(3)).unwrap();

            assert_eq!(table.capacity(), 2);
            assert!(table.validate_reference(iref3).is_err());
            assert!(table.dump().contains("Summary (2 distinct)"));
        }
    }

    #[test]
    fn holes_unchecked() {
        holes_scenarios(false, 20);
        holes_scenarios(false, SMALL_TABLE_ENTRIES);
        holes_scenarios(false, 2 * SMALL_TABLE_ENTRIES);
    }

    #[test]
    fn holes_checked() {
        holes_scenarios(true, 20);
        holes_scenarios(true, SMALL_TABLE_ENTRIES);
        holes_scenarios(true, 2 * SMALL_TABLE_ENTRIES);
    }

    #[test]
    fn grows_past_initial_capacity() {
        for verification in [false, true] {
            for min_capacity in [20, SMALL_TABLE_ENTRIES] {
                let mut table =
                    table_with(&Arc::new(SmallTableAllocator::new()), verification, min_capacity);

                for _ in 0..=min_capacity {
                    _ = table.add(SegmentState::FIRST_SEGMENT, obj(0)).unwrap();
                }

                assert_eq!(table.capacity(), min_capacity + 1);
            }
        }
    }

    fn add_remove_scenario(
        allocator: &Arc<SmallTableAllocator>,
        verification: bool,
        min_capacity: usize,
        fill_count: usize,
    ) {
        let mut table = table_with(allocator, verification, min_capacity);
        let cookie0 = SegmentState::FIRST_SEGMENT;

        let filler = obj(100);
        for i in 0..fill_count {
            let iref = table.add(cookie0, filler).unwrap();
            assert_eq!(table.capacity(), i + 1);
            assert_eq!(table.try_get(iref), Ok(filler));
        }

        let (obj0, obj0x, obj1, obj1x) = (obj(0), obj(1), obj(2), obj(3));
        let (obj2, obj2x, obj3, obj3x) = (obj(4), obj(5), obj(6), obj(7));

        macro_rules! add_ref {
            ($cookie:expr, $obj:expr, $expected_capacity:expr) => {{
                let iref = table.add($cookie, $obj).unwrap();
                assert_eq!(table.capacity(), fill_count + $expected_capacity);
                assert_eq!(table.try_get(iref), Ok($obj));
                iref
            }};
        }

        macro_rules! remove_ref {
            ($cookie:expr, $iref:expr, $expected_capacity:expr) => {{
                assert!(table.remove($cookie, $iref));
                assert_eq!(table.capacity(), fill_count + $expected_capacity);
            }};
        }

        macro_rules! pop_segment {
            ($cookie:expr, $expected_capacity:expr) => {{
                table.set_segment_state($cookie);
                assert_eq!(table.capacity(), fill_count + $expected_capacity);
            }};
        }

        let cookie1 = table.segment_state();
        let mut iref0 = add_ref!(cookie1, obj0, 1);
        let mut iref1 = add_ref!(cookie1, obj1, 2);
        remove_ref!(cookie1, iref1, 1); // Remove top entry.
        assert!(!table.remove(cookie1, iref1));
        iref1 = add_ref!(cookie1, obj1x, 2);
        remove_ref!(cookie1, iref0, 2); // Create hole.
        let obsolete_iref0 = iref0;
        assert!(!table.remove(cookie1, iref0));
        iref0 = add_ref!(cookie1, obj0x, 2); // Reuse hole.
        if verification {
            assert!(!table.remove(cookie1, obsolete_iref0));
        }

        // Addition to the second segment without a hole in the first segment, and removal
        // from the wrong segment.
        let mut cookie2 = table.segment_state();
        assert!(!table.remove(cookie2, iref0));
        let mut iref2 = add_ref!(cookie2, obj2, 3);
        pop_segment!(cookie2, 2);
        assert!(!table.remove(cookie1, iref2));

        // Addition to the second segment with a hole in the first.
        iref2 = add_ref!(cookie2, obj2x, 3);
        remove_ref!(cookie1, iref1, 3); // Create hole.
        cookie2 = table.segment_state();
        let mut iref3 = add_ref!(cookie2, obj3, 4);
        pop_segment!(cookie2, 3);
        remove_ref!(cookie1, iref2, 1); // Remove top entry, prune previous entry.
        _ = add_ref!(cookie1, obj1, 2);

        cookie2 = table.segment_state();
        iref2 = add_ref!(cookie2, obj2, 3);
        _ = add_ref!(cookie2, obj3, 4);
        remove_ref!(cookie2, iref2, 4); // Create hole in second segment.
        pop_segment!(cookie2, 2); // Pop the second segment with hole.
        iref2 = add_ref!(cookie1, obj2x, 3); // Prune free list, use new entry.
        remove_ref!(cookie1, iref2, 2);

        remove_ref!(cookie1, iref0, 2); // Create hole.
        cookie2 = table.segment_state();
        iref2 = add_ref!(cookie2, obj2, 3);
        _ = add_ref!(cookie2, obj3x, 4);
        remove_ref!(cookie2, iref2, 4); // Create hole in second segment.
        pop_segment!(cookie2, 2); // Pop the second segment with hole.
        iref0 = add_ref!(cookie1, obj0, 2); // Prune free list, use remaining entry.

        remove_ref!(cookie1, iref0, 2); // Create hole.
        cookie2 = table.segment_state();
        iref2 = add_ref!(cookie2, obj2x, 3);
        iref3 = add_ref!(cookie2, obj3, 4);
        remove_ref!(cookie2, iref2, 4); // Create hole in second segment.
        remove_ref!(cookie2, iref3, 2); // Remove top entry, prune previous entry, keep hole above.
        pop_segment!(cookie2, 2); // Pop the empty second segment.
        _ = add_ref!(cookie1, obj0x, 2); // Reuse hole.
    }

    #[test]
    fn add_remove_unchecked() {
        let allocator = Arc::new(SmallTableAllocator::new());

        add_remove_scenario(&allocator, false, 20, 0);
        add_remove_scenario(&allocator, false, SMALL_TABLE_ENTRIES, 0);
        add_remove_scenario(&allocator, false, 2 * SMALL_TABLE_ENTRIES, 0);

        // Crossing the end of the small table at every step of the scenario.
        for fill_count in SMALL_TABLE_ENTRIES - 4..SMALL_TABLE_ENTRIES {
            add_remove_scenario(&allocator, false, SMALL_TABLE_ENTRIES, fill_count);
        }
    }

    #[test]
    fn add_remove_checked() {
        let allocator = Arc::new(SmallTableAllocator::new());

        add_remove_scenario(&allocator, true, 20, 0);
        add_remove_scenario(&allocator, true, SMALL_TABLE_ENTRIES, 0);
        add_remove_scenario(&allocator, true, 2 * SMALL_TABLE_ENTRIES, 0);

        for fill_count in SMALL_TABLE_ENTRIES - 4..SMALL_TABLE_ENTRIES {
            add_remove_scenario(&allocator, true, SMALL_TABLE_ENTRIES, fill_count);
        }
    }

    fn add_remove_mixed_scenario(start_verification: bool) {
        const MAX_UNIQUE_REFS: usize = 16;

        let allocator = Arc::new(SmallTableAllocator::new());
        let cookie0 = SegmentState::FIRST_SEGMENT;
        let objs = (0..MAX_UNIQUE_REFS as u64).map(obj).collect::<Vec<_>>();

        for split in 1..MAX_UNIQUE_REFS - 1 {
            for total in split + 1..MAX_UNIQUE_REFS {
                for deleted_at_start in 0..split - 1 {
                    let mut table =
                        table_with(&allocator, start_verification, SMALL_TABLE_ENTRIES);
                    let mut irefs = Vec::with_capacity(total);

                    for (i, obj) in objs.iter().enumerate().take(split) {
                        irefs.push(table.add(cookie0, *obj).unwrap());
                        assert_eq!(table.capacity(), i + 1);
                    }

                    for iref in irefs.iter().take(deleted_at_start) {
                        assert!(table.remove(cookie0, *iref));
                        assert!(!table.remove(cookie0, *iref));
                        assert_eq!(table.capacity(), split);
                    }

                    table.set_verification_enabled(!start_verification);

                    // Capacity is counted in the new mode, so we track the top index instead.
                    let split_top_index = table.segment_state().top_index();
                    let mut last_top_index = split_top_index;

                    for obj in &objs[split..total] {
                        let iref = table.add(cookie0, *obj).unwrap();
                        assert_eq!(table.try_get(iref), Ok(*obj));
                        irefs.push(iref);

                        // Holes from the other mode are never reused.
                        assert!(last_top_index < table.segment_state().top_index());
                        last_top_index = table.segment_state().top_index();
                    }

                    for i in split..total {
                        assert!(table.remove(cookie0, irefs[i]));
                        assert!(!table.remove(cookie0, irefs[i]));

                        let top_index = table.segment_state().top_index();
                        if i + 1 != total {
                            assert!(last_top_index <= top_index);
                        } else {
                            assert!(last_top_index > top_index);
                            assert!(split_top_index <= top_index);
                        }
                    }

                    // References from before the switch still resolve.
                    for (iref, obj) in irefs.iter().zip(&objs).take(split).skip(deleted_at_start)
                    {
                        assert_eq!(table.try_get(*iref), Ok(*obj));
                    }
                }
            }
        }
    }

    #[test]
    fn add_remove_mixed_starting_unchecked() {
        add_remove_mixed_scenario(false);
    }

    #[test]
    fn add_remove_mixed_starting_checked() {
        add_remove_mixed_scenario(true);
    }

    #[test]
    fn stale_reference_rejected_with_verification() {
        let mut table = new_table(true);
        let cookie = SegmentState::FIRST_SEGMENT;

        let first = table.add(cookie, obj(0)).unwrap();
        assert!(table.remove(cookie, first));

        let second = table.add(cookie, obj(1)).unwrap();

        assert_eq!(
            table.validate_reference(first),
            Err(InvalidReference::BadSerialNumber {
                index: 1,
                serial: 1,
                expected: 2
            })
        );
        assert!(!table.remove(cookie, first));
        assert_eq!(table.try_get(second), Ok(obj(1)));
    }

    #[test]
    fn serial_numbers_rotate_through_group() {
        let mut table = new_table(true);
        let cookie = SegmentState::FIRST_SEGMENT;

        // Keep a second reference above so the first group is reused through the free list.
        let _anchor_below = table.add(cookie, obj(0)).unwrap();
        let mut current = table.add(cookie, obj(1)).unwrap();
        let _anchor_above = table.add(cookie, obj(2)).unwrap();

        let mut seen = Vec::new();
        for i in 0..6 {
            seen.push(current.slot_addr());
            assert!(table.remove(cookie, current));
            current = table.add(cookie, obj(10 + i)).unwrap();
            assert_eq!(table.capacity(), 3);
        }

        // Slots 1, 2, 3 of the group are used in turn.
        assert_eq!(seen[0], seen[3]);
        assert_ne!(seen[0], seen[1]);
        assert_ne!(seen[1], seen[2]);
        assert_eq!(seen[1] - seen[0], SLOT_SIZE);
    }

    #[test]
    fn non_local_kind_is_rejected() {
        let mut table = new_table(false);
        let cookie = SegmentState::FIRST_SEGMENT;

        let handle = table.add(cookie, obj(0)).unwrap();

        for kind in [RefKind::Transition, RefKind::Global, RefKind::WeakGlobal] {
            let foreign = LocalRef::from_raw(handle.slot_addr() | kind as usize).unwrap();

            assert_eq!(
                table.validate_reference(foreign),
                Err(InvalidReference::WrongKind { kind })
            );
            assert!(!table.remove(cookie, foreign));
        }

        assert_eq!(table.try_get(handle), Ok(obj(0)));
        assert_eq!(table.kind(), RefKind::Local);
    }

    #[test]
    fn foreign_handle_is_outside_table() {
        let mut table = new_table(false);
        let cookie = SegmentState::FIRST_SEGMENT;

        _ = table.add(cookie, obj(0)).unwrap();

        let foreign = LocalRef::from_raw(0x1001).unwrap();

        assert_eq!(
            table.validate_reference(foreign),
            Err(InvalidReference::OutsideTable { raw: 0x1001 })
        );
        assert!(!table.remove(cookie, foreign));

        // Misaligned within our own table.
        let misaligned = LocalRef::from_raw(table.slot_ptr(0).as_ptr().addr() + 4 + 1).unwrap();
        assert!(matches!(
            table.validate_reference(misaligned),
            Err(InvalidReference::OutsideTable { .. })
        ));
    }

    #[test]
    fn double_remove_is_tolerated() {
        for verification in [false, true] {
            let mut table = new_table(verification);
            let cookie = SegmentState::FIRST_SEGMENT;

            let a = table.add(cookie, obj(0)).unwrap();
            let b = table.add(cookie, obj(1)).unwrap();

            assert!(table.remove(cookie, a));
            assert!(matches!(
                table.validate_reference(a),
                Err(InvalidReference::Deleted { .. })
            ));
            assert!(!table.remove(cookie, a));

            assert_eq!(table.capacity(), 2);
            assert_eq!(table.try_get(b), Ok(obj(1)));
        }
    }

    #[test]
    fn update_replaces_reference() {
        let mut table = new_table(false);
        let cookie = SegmentState::FIRST_SEGMENT;

        let handle = table.add(cookie, obj(0)).unwrap();

        table.try_update(handle, obj(1)).unwrap();
        assert_eq!(table.try_get(handle), Ok(obj(1)));

        unsafe {
            table.update(handle, obj(2));
            assert_eq!(table.get(handle), obj(2));
        }

        assert!(table.remove(cookie, handle));
        assert!(table.try_update(handle, obj(3)).is_err());
    }

    #[test]
    fn overflow_at_maximum_size() {
        for (verification, references) in [(false, 64), (true, 16)] {
            let mut table = LocalRefTable::builder()
                .allocator(Arc::new(SmallTableAllocator::new()))
                .verification(verification)
                .min_capacity(1)
                .max_entries(SMALL_TABLE_ENTRIES)
                .build()
                .unwrap();

            for i in 0..references {
                _ = table.add(SegmentState::FIRST_SEGMENT, obj(i)).unwrap();
            }

            let error = table.add(SegmentState::FIRST_SEGMENT, obj(0)).unwrap_err();

            match error {
                Error::Overflow { max_entries, dump } => {
                    assert_eq!(max_entries, SMALL_TABLE_ENTRIES);
                    assert!(dump.contains(&format!("Last 10 entries (of {references})")));
                }
                other => panic!("unexpected error: {other}"),
            }

            assert_eq!(table.capacity(), references as usize);
            assert_eq!(table.max_entries(), SMALL_TABLE_ENTRIES);
        }
    }

    #[test]
    fn ensure_free_capacity_grows_table() {
        let mut table = new_table(false);

        assert_eq!(table.free_capacity(), SMALL_TABLE_ENTRIES);
        table.ensure_free_capacity(10).unwrap();
        assert_eq!(table.max_entries(), SMALL_TABLE_ENTRIES);

        table.ensure_free_capacity(100).unwrap();
        assert_eq!(table.max_entries(), 128);
        assert!(table.free_capacity() >= 100);

        for i in 0..100 {
            _ = table.add(SegmentState::FIRST_SEGMENT, obj(i)).unwrap();
        }
        assert_eq!(table.max_entries(), 128);

        assert!(matches!(
            table.ensure_free_capacity(crate::MAX_TABLE_ENTRIES),
            Err(Error::CapacityExceeded { used: 100, .. })
        ));
    }

    #[test]
    fn ensure_free_capacity_with_verification() {
        let mut table = new_table(true);
        assert_eq!(table.max_entries(), 128);
        assert_eq!(table.free_capacity(), 32);

        table.ensure_free_capacity(40).unwrap();
        assert_eq!(table.max_entries(), 256);

        // Slots added with verification disabled leave the top unaligned.
        table.set_verification_enabled(false);
        _ = table.add(SegmentState::FIRST_SEGMENT, obj(0)).unwrap();
        table.set_verification_enabled(true);

        // 63 groups plus 3 slots of padding fill the remaining 255 slots exactly.
        table.ensure_free_capacity(63).unwrap();
        assert_eq!(table.max_entries(), 256);

        table.ensure_free_capacity(64).unwrap();
        assert_eq!(table.max_entries(), 512);

        for i in 0..64 {
            _ = table.add(SegmentState::FIRST_SEGMENT, obj(i)).unwrap();
        }
        assert_eq!(table.max_entries(), 512);
    }

    #[test]
    fn initial_capacity_above_maximum_is_rejected() {
        let result = LocalRefTable::builder()
            .allocator(Arc::new(SmallTableAllocator::new()))
            .verification(true)
            .min_capacity(100)
            .max_entries(256)
            .build();

        assert!(matches!(
            result,
            Err(Error::CapacityExceeded {
                requested: 400,
                available: 256,
                used: 0
            })
        ));
    }

    #[test]
    fn many_references() {
        let allocator = Arc::new(SmallTableAllocator::new());
        let mut table = table_with(&allocator, false, 1);
        let cookie = SegmentState::FIRST_SEGMENT;

        let handles = (0..10_000)
            .map(|i| table.add(cookie, obj(i)).unwrap())
            .collect::<Vec<_>>();

        assert_eq!(table.capacity(), 10_000);
        assert_eq!(table.max_entries(), 16_384);

        for (i, handle) in (0..).zip(&handles) {
            assert_eq!(table.try_get(*handle), Ok(obj(i)));
        }

        for handle in handles.iter().rev() {
            assert!(table.remove(cookie, *handle));
        }

        table.assert_empty();
        assert_eq!(table.max_entries(), 16_384);

        drop(table);

        // Everything from the small table allocator was returned.
        assert_eq!(allocator.mapped_page_count(), 1);
    }

    #[test]
    fn visit_roots_relocates_references() {
        let mut table = new_table(false);
        let cookie = SegmentState::FIRST_SEGMENT;

        let a = table.add(cookie, obj(0)).unwrap();
        let b = table.add(cookie, obj(1)).unwrap();
        table.set_verification_enabled(true);
        let c = table.add(cookie, obj(2)).unwrap();
        let d = table.add(cookie, obj(3)).unwrap();
        assert!(table.remove(cookie, b));

        let mut visited = Vec::new();
        table.visit_roots(&mut |root: &mut ObjectRef| {
            visited.push(*root);
            *root = ObjectRef::new(root.addr() + 0x1000).unwrap();
        });

        assert_eq!(visited, [obj(0), obj(2), obj(3)]);

        assert_eq!(table.try_get(a), Ok(obj(512)));
        assert_eq!(table.try_get(c), Ok(obj(514)));
        assert_eq!(table.try_get(d), Ok(obj(515)));
    }

    #[test]
    fn visit_roots_across_chunks() {
        let mut table = new_table(false);
        let cookie = SegmentState::FIRST_SEGMENT;

        for i in 0..1000 {
            _ = table.add(cookie, obj(i)).unwrap();
        }

        let mut count = 0;
        table.visit_roots(&mut |_: &mut ObjectRef| count += 1);

        assert_eq!(count, 1000);
    }

    #[test]
    fn dump_lists_live_references() {
        let mut table = new_table(false);
        let cookie = SegmentState::FIRST_SEGMENT;

        for _ in 0..5 {
            _ = table.add(cookie, obj(1)).unwrap();
        }
        let hole = table.add(cookie, obj(2)).unwrap();
        _ = table.add(cookie, obj(3)).unwrap();
        assert!(table.remove(cookie, hole));

        let dump = table.dump();

        assert!(dump.contains("Last 6 entries (of 6)"));
        assert!(dump.contains(&format!("    6: {}", obj(3))));
        assert!(!dump.contains("    5: "));
        assert!(dump.contains(&format!("5 of {}", obj(1))));
        assert!(dump.contains(&format!("1 of {}", obj(3))));
        assert!(!dump.contains(&obj(2).to_string()));
    }

    #[test]
    fn removing_after_popped_hole_prunes_first() {
        let mut table = table_with(
            &Arc::new(SmallTableAllocator::new()),
            false,
            SMALL_TABLE_ENTRIES,
        );
        let cookie0 = SegmentState::FIRST_SEGMENT;

        let ref0 = table.add(cookie0, obj(0)).unwrap();
        _ = table.add(cookie0, obj(1)).unwrap();

        // Second segment with a hole, then pop it.
        let cookie_a = table.segment_state();
        let ref2a = table.add(cookie_a, obj(2)).unwrap();
        _ = table.add(cookie_a, obj(3)).unwrap();
        assert!(table.remove(cookie_a, ref2a));
        table.set_segment_state(cookie_a);

        // A hole in the first segment must not link to the popped hole.
        assert!(table.remove(cookie0, ref0));

        // Overwrite the popped hole with a new segment, then pop it.
        let cookie_b = table.segment_state();
        assert_eq!(cookie_b, cookie_a);
        _ = table.add(cookie_b, obj(4)).unwrap();
        table.set_segment_state(cookie_b);

        let reused = table.add(cookie0, obj(5)).unwrap();
        assert_eq!(reused, ref0);

        let appended = table.add(cookie0, obj(6)).unwrap();
        assert_eq!(table.try_get(appended), Ok(obj(6)));
        assert_eq!(table.capacity(), 3);
    }

    #[test]
    fn trim_with_top_at_end_of_table() {
        let allocator = Arc::new(SmallTableAllocator::new());
        let refs_per_page = allocator.page_size() / SLOT_SIZE;
        let mut table = table_with(&allocator, false, SMALL_TABLE_ENTRIES);

        let refs = (0..2 * refs_per_page as u64)
            .map(|i| table.add(SegmentState::FIRST_SEGMENT, obj(i)).unwrap())
            .collect::<Vec<_>>();

        table.trim();

        assert_eq!(
            table.try_get(*refs.last().unwrap()),
            Ok(obj(2 * refs_per_page as u64 - 1))
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn trim_releases_popped_pages() {
        let allocator = Arc::new(SmallTableAllocator::new());
        let refs_per_page = allocator.page_size() / SLOT_SIZE;
        let mut table = table_with(&allocator, false, SMALL_TABLE_ENTRIES);
        let cookie0 = SegmentState::FIRST_SEGMENT;

        fn add_many(table: &mut LocalRefTable, cookie: SegmentState, count: usize) -> Vec<LocalRef> {
            (0..count)
                .map(|_| table.add(cookie, obj(0)).unwrap())
                .collect()
        }

        // Fill all small tables.
        let refs0 = add_many(&mut table, cookie0, refs_per_page);
        table.trim();
        assert!(!slot_is_null(*refs0.last().unwrap()));

        // Fill the next, page-sized table.
        let cookie1 = table.segment_state();
        let refs1 = add_many(&mut table, cookie1, refs_per_page);
        table.trim();
        assert!(!slot_is_null(*refs1.last().unwrap()));

        // Removing one reference leaves no page to trim.
        assert!(table.remove(cookie1, *refs1.last().unwrap()));
        table.trim();
        assert!(!slot_is_null(refs1[refs1.len() - 2]));

        // Popping the segment lets the whole page go.
        table.set_segment_state(cookie1);
        table.trim();
        assert!(refs1.iter().all(|r| slot_is_null(*r)));

        // Fill the page-sized table and half of the next one, then the other half.
        let cookie1 = table.segment_state();
        let refs1 = add_many(&mut table, cookie1, 2 * refs_per_page);
        let cookie2 = table.segment_state();
        let refs2 = add_many(&mut table, cookie2, refs_per_page);
        table.trim();
        assert!(!slot_is_null(*refs2.last().unwrap()));

        // Pop the last segment and trim its page.
        table.set_segment_state(cookie2);
        table.trim();
        assert!(refs2.iter().all(|r| slot_is_null(*r)));
        assert!(refs1.iter().all(|r| !slot_is_null(*r)));

        // Pop the middle segment and trim its pages.
        table.set_segment_state(cookie1);
        table.trim();
        assert!(refs1.iter().all(|r| slot_is_null(*r)));

        // Small tables are never trimmed.
        table.set_segment_state(cookie0);
        table.trim();
        assert!(refs0.iter().all(|r| !slot_is_null(*r)));

        // Fill small tables plus one, then another segment up to four pages.
        let refs0 = add_many(&mut table, cookie0, refs_per_page + 1);
        let cookie1 = table.segment_state();
        let refs1 = add_many(&mut table, cookie1, 3 * refs_per_page - 1);
        table.trim();
        assert!(!slot_is_null(*refs1.last().unwrap()));

        // Pop the middle segment. The page shared with the last entry of `refs0` stays.
        table.set_segment_state(cookie1);
        table.trim();
        assert!(refs0.iter().all(|r| !slot_is_null(*r)));
        assert_eq!(table.capacity(), refs0.len());
        assert!(refs1[..refs_per_page - 1].iter().all(|r| !slot_is_null(*r)));
        assert!(refs1[refs_per_page - 1..].iter().all(|r| slot_is_null(*r)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn trim_prunes_popped_holes_first() {
        let allocator = Arc::new(SmallTableAllocator::new());
        let refs_per_page = allocator.page_size() / SLOT_SIZE;
        let mut table = table_with(&allocator, false, SMALL_TABLE_ENTRIES);
        let cookie0 = SegmentState::FIRST_SEGMENT;

        let refs = (0..2 * refs_per_page)
            .map(|_| table.add(cookie0, obj(0)).unwrap())
            .collect::<Vec<_>>();

        // Create a hole in the last page.
        let removed = refs[refs.len() - 2];
        assert!(table.remove(cookie0, removed));

        table.set_segment_state(cookie0);
        table.trim();

        assert!(refs[..refs_per_page].iter().all(|r| !slot_is_null(*r)));
        assert!(refs[refs_per_page..].iter().all(|r| slot_is_null(*r)));

        // The released hole is gone from the free list, so the first slot is used.
        let new_ref = table.add(cookie0, obj(1)).unwrap();
        assert_ne!(new_ref, removed);
        assert_eq!(new_ref, refs[0]);
    }

    #[test]
    fn resize_failure_keeps_table_usable() {
        let page_size = BuildTargetMemory.page_size();
        let maps = AtomicUsize::new(0);

        // The first mapping (the small table allocator page) succeeds, later ones fail.
        let mut mock = MockMemory::new();
        mock.expect_page_size().return_const(page_size);
        mock.expect_map().returning(move |size| {
            if maps.fetch_add(1, Ordering::Relaxed) == 0 {
                BuildTargetMemory.map(size)
            } else {
                Err(io::Error::from(io::ErrorKind::OutOfMemory))
            }
        });
        mock.expect_unmap()
            .returning(|ptr, size| BuildTargetMemory.unmap(ptr, size));

        let allocator = Arc::new(SmallTableAllocator::with_memory(MemoryFacade::from_mock(
            mock,
        )));
        let mut table = table_with(&allocator, false, 1);
        let cookie = SegmentState::FIRST_SEGMENT;

        let small_tables_capacity = page_size / SLOT_SIZE;
        for i in 0..small_tables_capacity as u64 {
            _ = table.add(cookie, obj(i)).unwrap();
        }

        let error = table.add(cookie, obj(0)).unwrap_err();
        match &error {
            Error::Resize {
                max_entries,
                source,
                ..
            } => {
                assert_eq!(*max_entries, small_tables_capacity);
                assert!(matches!(**source, Error::Allocation { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(table.capacity(), small_tables_capacity);
        assert_eq!(table.max_entries(), small_tables_capacity);

        // Growth keeps failing, but the table itself is intact.
        assert!(matches!(
            table.ensure_free_capacity(1),
            Err(Error::Allocation { .. })
        ));

        let top = LocalRef::from_slot(table.slot_ptr(table.segment_state().top_index() - 1));
        assert!(table.remove(cookie, top));
        let replacement = table.add(cookie, obj(7)).unwrap();
        assert_eq!(table.try_get(replacement), Ok(obj(7)));
    }

    #[test]
    fn dropping_table_returns_small_tables() {
        let allocator = Arc::new(SmallTableAllocator::new());

        let mut table = table_with(&allocator, false, 2000);
        assert_eq!(table.max_entries(), 2048);
        _ = table.add(SegmentState::FIRST_SEGMENT, obj(0)).unwrap();

        drop(table);

        assert_eq!(allocator.mapped_page_count(), 1);
        assert_eq!(allocator.free_block_count(SMALL_TABLE_ENTRIES), 0);
    }

    #[test]
    fn segment_pushed_at_unaligned_top_after_enabling_verification() {
        let mut table = new_table(false);
        let outer = table.add(SegmentState::FIRST_SEGMENT, obj(0)).unwrap();

        table.set_verification_enabled(true);

        let frame = table.segment_state();
        assert_eq!(frame.top_index(), 1);

        // The first addition pads slots 1 to 3 and appends at 4.
        let a = table.add(frame, obj(1)).unwrap();
        let b = table.add(frame, obj(2)).unwrap();
        assert_eq!(table.segment_state().top_index(), 12);
        assert_eq!(table.try_get(a), Ok(obj(1)));
        assert_eq!(table.try_get(b), Ok(obj(2)));

        // Pruning stops at the segment floor, leaving the padding in place.
        assert!(table.remove(frame, b));
        assert_eq!(table.segment_state().top_index(), 8);
        assert!(table.remove(frame, a));
        assert_eq!(table.segment_state().top_index(), 4);
        assert_eq!(table.try_get(outer), Ok(obj(0)));

        let c = table.add(frame, obj(3)).unwrap();
        assert_eq!(table.segment_state().top_index(), 8);
        assert!(table.try_get(a).is_err());
        assert_eq!(table.try_get(c), Ok(obj(3)));

        // Unchecked additions reuse the padding.
        table.set_verification_enabled(false);
        let d = table.add(frame, obj(4)).unwrap();
        assert_eq!(table.segment_state().top_index(), 8);
        assert_eq!(table.try_get(d), Ok(obj(4)));

        table.set_segment_state(frame);
        assert!(table.validate_reference(c).is_err());
        assert!(table.validate_reference(d).is_err());
        assert_eq!(table.try_get(outer), Ok(obj(0)));

        table.set_verification_enabled(true);
        assert!(table.remove(SegmentState::FIRST_SEGMENT, outer));
        table.assert_empty();
        assert_eq!(table.first_free_index(), FREE_LIST_END);
    }

    #[test]
    fn unchecked_holes_survive_checked_top_removal() {
        let mut table = new_table(false);
        let cookie = SegmentState::FIRST_SEGMENT;

        let _a = table.add(cookie, obj(0)).unwrap();
        let b = table.add(cookie, obj(1)).unwrap();
        let c = table.add(cookie, obj(2)).unwrap();
        assert!(table.remove(cookie, b));

        table.set_verification_enabled(true);
        assert!(table.remove(cookie, c));

        // The hole at slot 1 was created without verification, so it stays below the top.
        assert_eq!(table.segment_state().top_index(), 2);
        assert_eq!(table.first_free_index(), 1);

        table.set_verification_enabled(false);
        let reused = table.add(cookie, obj(3)).unwrap();
        assert_eq!(reused, b);
        assert_eq!(table.segment_state().top_index(), 2);
    }

    #[test]
    fn checked_holes_survive_unchecked_top_removal() {
        let mut table = new_table(true);
        let cookie = SegmentState::FIRST_SEGMENT;

        let _x = table.add(cookie, obj(0)).unwrap();
        let y = table.add(cookie, obj(1)).unwrap();
        let z = table.add(cookie, obj(2)).unwrap();
        assert!(table.remove(cookie, y));

        table.set_verification_enabled(false);

        // The checked hole is not reused, so this appends above the last group.
        let w = table.add(cookie, obj(3)).unwrap();
        assert_eq!(table.segment_state().top_index(), 13);

        assert!(table.remove(cookie, w));
        assert_eq!(table.segment_state().top_index(), 12);
        assert!(table.remove(cookie, z));

        // The group of `y` was freed with verification enabled, so it stays below the top.
        assert_eq!(table.segment_state().top_index(), 8);

        table.set_verification_enabled(true);
        let reused = table.add(cookie, obj(4)).unwrap();
        assert_ne!(reused, y);
        assert!(table.try_get(y).is_err());
        assert_eq!(table.try_get(reused), Ok(obj(4)));
        assert_eq!(table.segment_state().top_index(), 8);
    }

    /// Counts the events emitted while it is the default subscriber of a thread.
    struct EventCounter(Arc<AtomicUsize>);

    impl Subscriber for EventCounter {
        fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
            true
        }

        fn new_span(&self, _span: &span::Attributes<'_>) -> span::Id {
            span::Id::from_u64(1)
        }

        fn record(&self, _span: &span::Id, _values: &span::Record<'_>) {}

        fn record_follows_from(&self, _span: &span::Id, _follows: &span::Id) {}

        fn event(&self, _event: &Event<'_>) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }

        fn enter(&self, _span: &span::Id) {}

        fn exit(&self, _span: &span::Id) {}
    }

    #[test]
    fn small_table_fast_path_does_not_trace() {
        let mut table = new_table(false);
        let cookie = SegmentState::FIRST_SEGMENT;
        let events = Arc::new(AtomicUsize::new(0));

        with_default(EventCounter(Arc::clone(&events)), || {
            for i in 0..10 {
                _ = table.add(cookie, obj(i)).unwrap();
            }
        });

        assert_eq!(events.load(Ordering::Relaxed), 0);

        // With verification enabled, additions take the traced path.
        table.set_verification_enabled(true);

        with_default(EventCounter(Arc::clone(&events)), || {
            _ = table.add(cookie, obj(10)).unwrap();
        });

        assert_ne!(events.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn table_layout_helpers() {
        assert_eq!(table_size(0), SMALL_TABLE_ENTRIES);
        assert_eq!(table_size(1), SMALL_TABLE_ENTRIES);
        assert_eq!(table_size(2), 2 * SMALL_TABLE_ENTRIES);
        assert_eq!(table_size(5), 16 * SMALL_TABLE_ENTRIES);

        assert_eq!(num_tables_for_size(SMALL_TABLE_ENTRIES), 1);
        assert_eq!(num_tables_for_size(2 * SMALL_TABLE_ENTRIES), 2);
        assert_eq!(num_tables_for_size(16 * SMALL_TABLE_ENTRIES), 5);

        assert_eq!(group_start(0), 0);
        assert_eq!(group_start(7), 4);
        assert_eq!(
            encode_free_list(FREE_LIST_END, false),
            EMPTY_FREE_LIST_AND_VERIFICATION_DISABLED
        );
    }
}
