use std::ptr::NonNull;

use tracing::debug;

use crate::pal::{Memory, MemoryFacade};
use crate::{Error, Result};

/// An owned memory mapping, unmapped when dropped.
#[derive(Debug)]
pub(crate) struct MappedRegion {
    begin: NonNull<u8>,
    len: usize,

    /// What the region is used for, only for diagnostics.
    purpose: &'static str,

    memory: MemoryFacade,
}

// SAFETY: The region exclusively owns its mapping, so moving it to another thread moves
// ownership of the memory along with it. The memory facade itself is thread-safe.
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    /// Maps `len` bytes of zeroed memory. The `len` must be a multiple of the page size.
    pub(crate) fn new(memory: &MemoryFacade, len: usize, purpose: &'static str) -> Result<Self> {
        debug_assert!(
            len % memory.page_size() == 0,
            "mapping of {len} bytes is not a whole number of pages"
        );

        let begin = memory.map(len).map_err(|source| Error::Allocation {
            purpose,
            size: len,
            source,
        })?;

        debug!(purpose, len, ?begin, "mapped memory region");

        Ok(Self {
            begin,
            len,
            purpose,
            memory: memory.clone(),
        })
    }

    pub(crate) fn begin(&self) -> NonNull<u8> {
        self.begin
    }

    #[cfg_attr(test, mutants::skip)] // Only affects diagnostics and assertions.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Lets the operating system reclaim the pages in `offset..offset + len`.
    ///
    /// # Panics
    ///
    /// Panics if the range is not page-aligned or extends beyond the region.
    pub(crate) fn release_pages(&self, offset: usize, len: usize) {
        let page_size = self.memory.page_size();

        assert!(
            offset % page_size == 0 && len % page_size == 0,
            "page release range {offset}+{len} is not page-aligned"
        );
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "page release range {offset}+{len} is outside region of {} bytes",
            self.len
        );

        if len == 0 {
            return;
        }

        // SAFETY: Bounds checked above, so the result stays within our mapping.
        let start = unsafe { self.begin.byte_add(offset) };

        self.memory.release_pages(start, len);
    }

    /// Lets the operating system reclaim every page of the region.
    pub(crate) fn release_all_pages(&self) {
        self.release_pages(0, self.len);
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        debug!(
            purpose = self.purpose,
            len = self.len,
            begin = ?self.begin,
            "unmapping memory region"
        );

        self.memory.unmap(self.begin, self.len);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::io;

    use super::*;
    use crate::pal::{BuildTargetMemory, MockMemory};

    #[test]
    fn maps_and_unmaps_through_facade() {
        let memory = MemoryFacade::target();
        let page_size = memory.page_size();

        let region = MappedRegion::new(&memory, 2 * page_size, "test").unwrap();

        assert_eq!(region.len(), 2 * page_size);
        assert_eq!(region.begin().as_ptr().addr() % page_size, 0);

        region.release_pages(page_size, page_size);
        region.release_all_pages();
    }

    #[test]
    fn map_failure_becomes_allocation_error() {
        let mut mock = MockMemory::new();
        mock.expect_page_size().return_const(4096_usize);
        mock.expect_map()
            .times(1)
            .returning(|_| Err(io::Error::from(io::ErrorKind::OutOfMemory)));

        let memory = MemoryFacade::from_mock(mock);

        let result = MappedRegion::new(&memory, 4096, "test");

        assert!(matches!(
            result,
            Err(Error::Allocation {
                purpose: "test",
                size: 4096,
                ..
            })
        ));
    }

    #[test]
    fn drop_unmaps_with_mapped_size() {
        let page_size = BuildTargetMemory.page_size();

        let mut mock = MockMemory::new();
        mock.expect_page_size().return_const(page_size);
        mock.expect_map()
            .times(1)
            .returning(|size| BuildTargetMemory.map(size));
        mock.expect_unmap()
            .withf(move |_, size| *size == 2 * page_size)
            .times(1)
            .returning(|ptr, size| BuildTargetMemory.unmap(ptr, size));

        let memory = MemoryFacade::from_mock(mock);

        drop(MappedRegion::new(&memory, 2 * page_size, "test").unwrap());
    }

    #[test]
    #[should_panic]
    fn release_outside_region_panics() {
        let memory = MemoryFacade::target();
        let page_size = memory.page_size();

        let region = MappedRegion::new(&memory, page_size, "test").unwrap();
        region.release_pages(page_size, page_size);
    }
}
