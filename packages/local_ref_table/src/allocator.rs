//! Buddy allocator for the first, small chunks of local reference tables.

#![allow(
    clippy::arithmetic_side_effects,
    reason = "block sizes and offsets are bounded by the page size"
)]

use std::ptr::NonNull;

use parking_lot::Mutex;
use tracing::debug;

use crate::pal::{MappedRegion, Memory, MemoryFacade};
use crate::slot::{SLOT_SIZE, Slot};
use crate::{Result, SMALL_TABLE_BYTES, SMALL_TABLE_ENTRIES};

/// Supplies and recycles the small chunks of slot storage that local reference tables start
/// out with, packing many tables into each memory page.
///
/// Blocks are power-of-two multiples of [`SMALL_TABLE_ENTRIES`] slots, smaller than one page.
/// Free blocks are kept on one free list per size and merged with their buddy when both halves
/// of a larger block become free. Whole pages are mapped on demand and unmapped when all of
/// their blocks are free again, except that one fully free page is retained to avoid mapping
/// and unmapping a page for every short-lived thread that never adds a reference.
///
/// One allocator is shared by all tables of a runtime. Operations are serialized by an
/// internal lock that is only held for a few list operations.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use local_ref_table::{LocalRefTable, SmallTableAllocator};
///
/// let allocator = Arc::new(SmallTableAllocator::new());
///
/// let table = LocalRefTable::builder()
///     .allocator(Arc::clone(&allocator))
///     .build()
///     .unwrap();
///
/// assert_eq!(allocator.mapped_page_count(), 1);
/// ```
#[derive(Debug)]
pub struct SmallTableAllocator {
    memory: MemoryFacade,
    page_size: usize,

    /// One free list per block size, from `SMALL_TABLE_BYTES` up to half a page.
    free_list_count: usize,

    state: Mutex<AllocatorState>,
}

#[derive(Debug)]
struct AllocatorState {
    /// Heads of the free lists. Each free block stores the next block of its list in its first
    /// word (`Option<NonNull<u8>>`), so the lists need no storage of their own.
    free_lists: Vec<Option<NonNull<u8>>>,

    /// Every page we have mapped and not yet released.
    pages: Vec<MappedRegion>,
}

// SAFETY: The free list pointers all point into `pages`, which the state exclusively owns.
// Access is serialized by the mutex around the state.
unsafe impl Send for AllocatorState {}

impl SmallTableAllocator {
    /// Creates an allocator that maps memory from the operating system.
    #[must_use]
    pub fn new() -> Self {
        Self::with_memory(MemoryFacade::target())
    }

    pub(crate) fn with_memory(memory: MemoryFacade) -> Self {
        let page_size = memory.page_size();

        assert!(
            page_size.is_power_of_two() && page_size >= 2 * SMALL_TABLE_BYTES,
            "page size {page_size} cannot be split into small tables of {SMALL_TABLE_BYTES} bytes"
        );

        let free_list_count = (page_size / SMALL_TABLE_BYTES).trailing_zeros() as usize;

        Self {
            memory,
            page_size,
            free_list_count,
            state: Mutex::new(AllocatorState {
                free_lists: vec![None; free_list_count],
                pages: Vec::new(),
            }),
        }
    }

    pub(crate) fn memory(&self) -> &MemoryFacade {
        &self.memory
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of memory pages currently mapped by the allocator.
    #[must_use]
    pub fn mapped_page_count(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// Number of free blocks that can hold `entries` slots without splitting a larger block.
    ///
    /// # Panics
    ///
    /// Panics if `entries` is not a block size supported by the allocator.
    #[must_use]
    pub fn free_block_count(&self, entries: usize) -> usize {
        let index = self.free_list_index(entries);
        let state = self.state.lock();

        let mut count = 0;
        let mut current = state.free_lists[index];

        while let Some(block) = current {
            count += 1;

            // SAFETY: Every block on a free list is a live block in one of our pages.
            current = unsafe { read_next(block) };
        }

        count
    }

    fn free_list_index(&self, entries: usize) -> usize {
        assert!(
            entries >= SMALL_TABLE_ENTRIES && entries.is_power_of_two(),
            "small table size {entries} is not a power of two of at least {SMALL_TABLE_ENTRIES}"
        );

        let index = (entries / SMALL_TABLE_ENTRIES).trailing_zeros() as usize;

        assert!(
            index < self.free_list_count,
            "small table size {entries} does not fit in half a page of {} bytes",
            self.page_size
        );

        index
    }

    /// Allocates a zeroed, suitably aligned block of `entries` slots.
    ///
    /// The `entries` must be a power of two, at least [`SMALL_TABLE_ENTRIES`] and require less
    /// than one page of memory.
    pub(crate) fn allocate(&self, entries: usize) -> Result<NonNull<Slot>> {
        let index = self.free_list_index(entries);
        let mut state = self.state.lock();

        let mut fill_from = index;
        while fill_from != self.free_list_count && state.free_lists[fill_from].is_none() {
            fill_from += 1;
        }

        let result = if fill_from != self.free_list_count {
            let block = state.free_lists[fill_from].expect("loop above stops at a non-empty list");

            // SAFETY: Every block on a free list is a live block in one of our pages.
            state.free_lists[fill_from] = unsafe { read_next(block) };

            block
        } else {
            // Nothing free of sufficient size, split a new page.
            let page = MappedRegion::new(&self.memory, self.page_size, "small local reference tables")?;
            let begin = page.begin();
            state.pages.push(page);

            debug!(pages = state.pages.len(), "small table allocator mapped a page");

            begin
        };

        // Put the second half of the block on the next smaller free list until it fits.
        while fill_from != index {
            fill_from -= 1;

            // SAFETY: The block we hold is (SMALL_TABLE_BYTES << (fill_from + 1)) bytes long,
            // so the midpoint is within it.
            let mid = unsafe { result.byte_add(SMALL_TABLE_BYTES << fill_from) };

            debug_assert!(state.free_lists[fill_from].is_none());

            // SAFETY: The second half is unused memory within one of our pages.
            unsafe {
                write_next(mid, None);
            }

            state.free_lists[fill_from] = Some(mid);
        }

        // SAFETY: We own the whole block and nobody else references it.
        unsafe {
            result.write_bytes(0, SMALL_TABLE_BYTES << index);
        }

        Ok(result.cast::<Slot>())
    }

    /// Returns a block previously obtained from [`allocate()`][Self::allocate].
    ///
    /// # Safety
    ///
    /// The block must have been allocated from this allocator with the same `entries` and must
    /// not be used after this call.
    pub(crate) unsafe fn deallocate(&self, block: NonNull<Slot>, entries: usize) {
        let mut index = self.free_list_index(entries);
        let mut block = block.cast::<u8>();
        let mut state = self.state.lock();

        while index < self.free_list_count {
            // The buddy is the other half of the next larger block.
            let buddy = NonNull::new(block.as_ptr().map_addr(|addr| addr ^ (SMALL_TABLE_BYTES << index)))
                .expect("buddy of a block within a mapped page is never null");

            if index + 1 == self.free_list_count
                && state.free_lists[index] == Some(buddy)
                // SAFETY: The buddy is on a free list, so it is a live block in one of our pages.
                && unsafe { read_next(buddy) }.is_none()
            {
                // Do not unmap the page if it is the only free block of the largest size.
                // Keeping it avoids mapping and unmapping a page for each thread that is
                // created and destroyed without ever adding a reference.
                break;
            }

            if !state.unlink(index, buddy) {
                break;
            }

            index += 1;
            block = block.min(buddy);
        }

        if index == self.free_list_count {
            // The whole page is free again.
            let position = state
                .pages
                .iter()
                .position(|page| page.begin() == block)
                .expect("a fully merged block is always one of our pages");

            // Dropping the region unmaps it.
            drop(state.pages.swap_remove(position));

            debug!(pages = state.pages.len(), "small table allocator released a page");

            return;
        }

        // SAFETY: The block is no longer used by the caller and belongs to one of our pages.
        unsafe {
            write_next(block, state.free_lists[index]);
        }

        state.free_lists[index] = Some(block);
    }
}

impl Default for SmallTableAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocatorState {
    /// Removes `target` from the free list at `index`. Returns whether it was found.
    fn unlink(&mut self, index: usize, target: NonNull<u8>) -> bool {
        let mut previous: Option<NonNull<u8>> = None;
        let mut current = self.free_lists[index];

        while let Some(block) = current {
            // SAFETY: Every block on a free list is a live block in one of our pages.
            let next = unsafe { read_next(block) };

            if block == target {
                match previous {
                    None => self.free_lists[index] = next,
                    // SAFETY: The previous block is on the free list, so it is ours to write.
                    Some(previous) => unsafe { write_next(previous, next) },
                }

                return true;
            }

            previous = Some(block);
            current = next;
        }

        false
    }
}

/// # Safety
///
/// The block must be a free block in a page owned by the allocator.
unsafe fn read_next(block: NonNull<u8>) -> Option<NonNull<u8>> {
    // SAFETY: Blocks are at least SMALL_TABLE_BYTES long and aligned to that, so the first
    // word is in bounds and aligned. The caller guarantees the block is free, so the first word
    // holds a link written by `write_next()`.
    unsafe { block.cast::<Option<NonNull<u8>>>().read() }
}

/// # Safety
///
/// The block must be an unused block in a page owned by the allocator.
unsafe fn write_next(block: NonNull<u8>, next: Option<NonNull<u8>>) {
    // SAFETY: Blocks are at least SMALL_TABLE_BYTES long and aligned to that, so the first
    // word is in bounds and aligned. The caller guarantees nobody else uses the block.
    unsafe {
        block.cast::<Option<NonNull<u8>>>().write(next);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::indexing_slicing,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::alloc::{Layout, alloc_zeroed, dealloc};
    use std::io;
    use std::sync::Arc;
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::Error;
    use crate::pal::MockMemory;

    assert_impl_all!(SmallTableAllocator: Send, Sync);

    const SMALL: usize = SMALL_TABLE_ENTRIES;

    fn page_entries(allocator: &SmallTableAllocator) -> usize {
        allocator.page_size() / SLOT_SIZE
    }

    /// All block sizes supported by the allocator, smallest first.
    fn block_sizes(allocator: &SmallTableAllocator) -> Vec<usize> {
        (0..allocator.free_list_count).map(|i| SMALL << i).collect()
    }

    #[test]
    fn first_allocation_splits_a_page() {
        let allocator = SmallTableAllocator::new();

        let block = allocator.allocate(SMALL).unwrap();

        assert_eq!(allocator.mapped_page_count(), 1);
        assert_eq!(block.as_ptr().addr() % allocator.page_size(), 0);

        // The rest of the page is spread over one block of each size.
        for size in block_sizes(&allocator) {
            assert_eq!(allocator.free_block_count(size), 1, "size {size}");
        }

        // SAFETY: Allocated above with the same size and no longer used.
        unsafe {
            allocator.deallocate(block, SMALL);
        }
    }

    #[test]
    fn allocated_memory_is_zeroed() {
        let allocator = SmallTableAllocator::new();

        let block = allocator.allocate(SMALL).unwrap();

        // SAFETY: We own the block, which is SMALL_TABLE_BYTES long.
        unsafe {
            block.cast::<u8>().write_bytes(0xEE, SMALL_TABLE_BYTES);
        }

        // SAFETY: Allocated above with the same size and no longer used.
        unsafe {
            allocator.deallocate(block, SMALL);
        }

        let block = allocator.allocate(SMALL).unwrap();

        // SAFETY: We own the block, which is SMALL_TABLE_BYTES long and initialized.
        let bytes = unsafe { std::slice::from_raw_parts(block.cast::<u8>().as_ptr(), SMALL_TABLE_BYTES) };
        assert!(bytes.iter().all(|b| *b == 0));

        // SAFETY: Allocated above with the same size and no longer used.
        unsafe {
            allocator.deallocate(block, SMALL);
        }
    }

    #[test]
    fn blocks_do_not_overlap() {
        let allocator = SmallTableAllocator::new();
        let sizes = block_sizes(&allocator);

        let mut blocks = Vec::new();
        for _ in 0..3 {
            for &size in &sizes {
                blocks.push((allocator.allocate(size).unwrap(), size));
            }
        }

        let mut ranges = blocks
            .iter()
            .map(|(block, size)| {
                let start = block.as_ptr().addr();
                (start, start + size * SLOT_SIZE)
            })
            .collect::<Vec<_>>();
        ranges.sort_unstable();

        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "blocks overlap: {pair:?}");
        }

        for (block, size) in blocks {
            // SAFETY: Allocated above with the same size and no longer used.
            unsafe {
                allocator.deallocate(block, size);
            }
        }
    }

    #[test]
    fn freeing_everything_retains_one_page() {
        let allocator = SmallTableAllocator::new();
        let count = 3 * page_entries(&allocator) / SMALL;

        let blocks = (0..count)
            .map(|_| allocator.allocate(SMALL).unwrap())
            .collect::<Vec<_>>();

        assert_eq!(allocator.mapped_page_count(), 3);

        // Interleaved order, so that merges happen out of allocation order.
        let (even, odd): (Vec<_>, Vec<_>) = blocks.into_iter().enumerate().partition(|(i, _)| i % 2 == 0);

        for (_, block) in odd.into_iter().rev().chain(even) {
            // SAFETY: Allocated above with the same size and no longer used.
            unsafe {
                allocator.deallocate(block, SMALL);
            }
        }

        assert_eq!(allocator.mapped_page_count(), 1);

        let sizes = block_sizes(&allocator);
        let (largest, smaller) = sizes.split_last().unwrap();

        // The retained page is kept as its two largest halves.
        assert_eq!(allocator.free_block_count(*largest), 2);
        for &size in smaller {
            assert_eq!(allocator.free_block_count(size), 0, "size {size}");
        }
    }

    #[test]
    fn allocate_deallocate_cycle_is_stable() {
        let allocator = SmallTableAllocator::new();

        for _ in 0..10 {
            let a = allocator.allocate(SMALL).unwrap();
            let b = allocator.allocate(2 * SMALL).unwrap();

            // SAFETY: Allocated above with the same sizes and no longer used.
            unsafe {
                allocator.deallocate(a, SMALL);
                allocator.deallocate(b, 2 * SMALL);
            }

            assert_eq!(allocator.mapped_page_count(), 1);
        }
    }

    #[test]
    fn buddies_merge_into_larger_block() {
        let allocator = SmallTableAllocator::new();
        let sizes = block_sizes(&allocator);

        // Take the first page apart into its smallest blocks.
        let first = allocator.allocate(SMALL).unwrap();
        let second = allocator.allocate(SMALL).unwrap();
        assert_eq!(second.as_ptr().addr(), first.as_ptr().addr() + SMALL_TABLE_BYTES);
        assert_eq!(allocator.free_block_count(SMALL), 0);

        // SAFETY: Allocated above with the same size and no longer used.
        unsafe {
            allocator.deallocate(second, SMALL);
        }
        assert_eq!(allocator.free_block_count(SMALL), 1);

        // SAFETY: Allocated above with the same size and no longer used.
        unsafe {
            allocator.deallocate(first, SMALL);
        }

        // Everything merged back up; the page is retained as its two halves.
        assert_eq!(allocator.free_block_count(SMALL), 0);
        assert_eq!(allocator.free_block_count(*sizes.last().unwrap()), 2);
        assert_eq!(allocator.mapped_page_count(), 1);
    }

    #[test]
    #[should_panic]
    fn rejects_non_power_of_two_size() {
        let allocator = SmallTableAllocator::new();
        _ = allocator.allocate(3 * SMALL);
    }

    #[test]
    #[should_panic]
    fn rejects_full_page_size() {
        let allocator = SmallTableAllocator::new();
        let entries = page_entries(&allocator);
        _ = allocator.allocate(entries);
    }

    #[test]
    fn map_failure_is_reported() {
        let mut mock = MockMemory::new();
        mock.expect_page_size().return_const(4096_usize);
        mock.expect_map()
            .returning(|_| Err(io::Error::from(io::ErrorKind::OutOfMemory)));

        let allocator = SmallTableAllocator::with_memory(MemoryFacade::from_mock(mock));

        let result = allocator.allocate(SMALL);

        assert!(matches!(result, Err(Error::Allocation { size: 4096, .. })));
        assert_eq!(allocator.mapped_page_count(), 0);
    }

    #[test]
    fn larger_page_size_has_more_free_lists() {
        // Buddy addressing needs pages aligned to their size, which the operating system will
        // not do for a page size it does not use, so we hand out aligned heap memory instead.
        let mut mock = MockMemory::new();
        mock.expect_page_size().return_const(16384_usize);
        mock.expect_map().returning(|size| {
            let layout = Layout::from_size_align(size, size).unwrap();
            NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
        });
        mock.expect_unmap().returning(|ptr, size| {
            let layout = Layout::from_size_align(size, size).unwrap();
            unsafe { dealloc(ptr.as_ptr(), layout) };
        });

        let allocator = SmallTableAllocator::with_memory(MemoryFacade::from_mock(mock));
        assert_eq!(block_sizes(&allocator).len(), 5);

        let block = allocator.allocate(16 * SMALL).unwrap();
        assert_eq!(allocator.mapped_page_count(), 1);

        // SAFETY: Allocated above with the same size and no longer used.
        unsafe {
            allocator.deallocate(block, 16 * SMALL);
        }

        assert_eq!(allocator.free_block_count(16 * SMALL), 2);
    }

    #[test]
    fn concurrent_use_from_many_threads() {
        let allocator = Arc::new(SmallTableAllocator::new());

        thread::scope(|s| {
            for t in 0..4 {
                let allocator = &allocator;
                s.spawn(move || {
                    let size = SMALL << (t % allocator.free_list_count);

                    for _ in 0..50 {
                        let blocks = (0..8)
                            .map(|_| allocator.allocate(size).unwrap())
                            .collect::<Vec<_>>();

                        for block in blocks {
                            // SAFETY: Allocated above with the same size and no longer used.
                            unsafe {
                                allocator.deallocate(block, size);
                            }
                        }
                    }
                });
            }
        });

        assert_eq!(allocator.mapped_page_count(), 1);
    }
}
