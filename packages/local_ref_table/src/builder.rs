use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::{LocalRefTable, MAX_TABLE_ENTRIES, Result, SMALL_TABLE_ENTRIES, SmallTableAllocator};

/// Builder for creating an instance of [`LocalRefTable`].
///
/// The small table allocator is mandatory, as it is shared by all the tables of a runtime.
/// The other settings are optional.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use local_ref_table::{LocalRefTable, SmallTableAllocator};
///
/// let allocator = Arc::new(SmallTableAllocator::new());
///
/// let table = LocalRefTable::builder()
///     .allocator(allocator)
///     .verification(true)
///     .min_capacity(100)
///     .build()
///     .unwrap();
///
/// assert!(table.free_capacity() >= 100);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]), like the table it
/// builds.
#[derive(Debug)]
#[must_use]
pub struct LocalRefTableBuilder {
    allocator: Option<Arc<SmallTableAllocator>>,
    verification: bool,
    min_capacity: usize,
    max_entries: usize,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl LocalRefTableBuilder {
    pub(crate) fn new() -> Self {
        Self {
            allocator: None,
            verification: false,
            min_capacity: SMALL_TABLE_ENTRIES,
            max_entries: MAX_TABLE_ENTRIES,
            _not_sync: PhantomData,
        }
    }

    /// Sets the allocator that provides the first, small chunks of the table.
    pub fn allocator(mut self, allocator: Arc<SmallTableAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Sets whether the table starts in verification mode, where every reference carries a
    /// serial number so that stale handles are detected. Defaults to `false`.
    ///
    /// The mode can be changed later with
    /// [`LocalRefTable::set_verification_enabled()`].
    pub fn verification(mut self, enabled: bool) -> Self {
        self.verification = enabled;
        self
    }

    /// Sets the number of references the table can hold without growing, counted in the
    /// initial verification mode. Defaults to [`SMALL_TABLE_ENTRIES`].
    ///
    /// # Panics
    ///
    /// Panics if `min_capacity` is zero.
    pub fn min_capacity(mut self, min_capacity: usize) -> Self {
        assert!(min_capacity > 0, "LocalRefTable must have non-zero initial capacity");
        self.min_capacity = min_capacity;
        self
    }

    /// Sets the maximum number of slots the table may grow to. Defaults to
    /// [`MAX_TABLE_ENTRIES`].
    ///
    /// # Panics
    ///
    /// Panics if `max_entries` is not a power of two in the range
    /// `[SMALL_TABLE_ENTRIES, MAX_TABLE_ENTRIES]`.
    pub fn max_entries(mut self, max_entries: usize) -> Self {
        assert!(
            max_entries.is_power_of_two(),
            "LocalRefTable maximum size must be a power of two, got {max_entries}"
        );
        assert!(
            (SMALL_TABLE_ENTRIES..=MAX_TABLE_ENTRIES).contains(&max_entries),
            "LocalRefTable maximum size {max_entries} is out of range"
        );

        self.max_entries = max_entries;
        self
    }

    /// Builds the table, allocating storage for the requested initial capacity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExceeded`][crate::Error::CapacityExceeded] if the initial
    /// capacity does not fit in the maximum size, or the allocation error if the initial
    /// storage could not be allocated.
    ///
    /// # Panics
    ///
    /// Panics if no allocator has been set using [`allocator()`](Self::allocator).
    pub fn build(self) -> Result<LocalRefTable> {
        let allocator = self
            .allocator
            .expect("allocator must be set using .allocator() before calling .build()");

        LocalRefTable::new_inner(
            allocator,
            self.verification,
            self.min_capacity,
            self.max_entries,
        )
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::{ENTRIES_PER_CHECKED_REFERENCE, Error};

    assert_impl_all!(LocalRefTableBuilder: Send, std::fmt::Debug);
    assert_not_impl_any!(LocalRefTableBuilder: Sync);

    #[test]
    fn builder_new_creates_default_state() {
        let builder = LocalRefTableBuilder::new();

        assert!(builder.allocator.is_none());
        assert!(!builder.verification);
        assert_eq!(builder.min_capacity, SMALL_TABLE_ENTRIES);
        assert_eq!(builder.max_entries, MAX_TABLE_ENTRIES);
    }

    #[test]
    fn build_with_defaults_fits_small_table() {
        let table = LocalRefTable::builder()
            .allocator(Arc::new(SmallTableAllocator::new()))
            .build()
            .unwrap();

        assert!(!table.is_verification_enabled());
        assert_eq!(table.max_entries(), SMALL_TABLE_ENTRIES);
        assert_eq!(table.capacity(), 0);
    }

    #[test]
    fn verification_multiplies_initial_size() {
        let table = LocalRefTable::builder()
            .allocator(Arc::new(SmallTableAllocator::new()))
            .verification(true)
            .build()
            .unwrap();

        assert!(table.is_verification_enabled());
        assert_eq!(
            table.max_entries(),
            SMALL_TABLE_ENTRIES * ENTRIES_PER_CHECKED_REFERENCE as usize
        );
        assert_eq!(table.free_capacity(), SMALL_TABLE_ENTRIES);
    }

    #[test]
    fn min_capacity_rounds_up_to_power_of_two() {
        let table = LocalRefTable::builder()
            .allocator(Arc::new(SmallTableAllocator::new()))
            .min_capacity(1000)
            .build()
            .unwrap();

        assert_eq!(table.max_entries(), 1024);
    }

    #[test]
    fn builder_chaining_and_overrides() {
        let builder = LocalRefTableBuilder::new()
            .verification(true)
            .min_capacity(10)
            .max_entries(1024)
            .verification(false)
            .min_capacity(20);

        assert!(!builder.verification);
        assert_eq!(builder.min_capacity, 20);
        assert_eq!(builder.max_entries, 1024);
    }

    #[test]
    fn min_capacity_above_max_entries_fails() {
        let result = LocalRefTable::builder()
            .allocator(Arc::new(SmallTableAllocator::new()))
            .min_capacity(200)
            .max_entries(128)
            .build();

        assert!(matches!(
            result,
            Err(Error::CapacityExceeded {
                requested: 200,
                available: 128,
                ..
            })
        ));
    }

    #[test]
    #[should_panic]
    fn build_without_allocator_panics() {
        _ = LocalRefTableBuilder::new().build();
    }

    #[test]
    #[should_panic]
    fn zero_min_capacity_panics() {
        _ = LocalRefTableBuilder::new().min_capacity(0);
    }

    #[test]
    #[should_panic]
    fn max_entries_not_power_of_two_panics() {
        _ = LocalRefTableBuilder::new().max_entries(100);
    }

    #[test]
    #[should_panic]
    fn max_entries_below_small_table_panics() {
        _ = LocalRefTableBuilder::new().max_entries(32);
    }

    #[test]
    #[should_panic]
    fn max_entries_above_limit_panics() {
        _ = LocalRefTableBuilder::new().max_entries(MAX_TABLE_ENTRIES * 2);
    }
}
