#![cfg_attr(coverage_nightly, coverage(off))]

use std::alloc::{self, Layout};
use std::io;
use std::ptr::NonNull;

use crate::pal::Memory;

/// Page size we pretend to have when there is no operating system page mapping available.
const FALLBACK_PAGE_SIZE: usize = 4096;

/// Memory "mapping" implemented on top of the global allocator, used under Miri and on
/// platforms without a native implementation.
#[derive(Debug, Default)]
pub(crate) struct BuildTargetMemory;

impl BuildTargetMemory {
    fn layout(size: usize) -> Result<Layout, io::Error> {
        Layout::from_size_align(size, FALLBACK_PAGE_SIZE)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }
}

impl Memory for BuildTargetMemory {
    fn page_size(&self) -> usize {
        FALLBACK_PAGE_SIZE
    }

    fn map(&self, size: usize) -> Result<NonNull<u8>, io::Error> {
        assert!(size > 0, "cannot map an empty region");

        let layout = Self::layout(size)?;

        // SAFETY: The layout has a non-zero size, as asserted above.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };

        NonNull::new(ptr).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
    }

    fn unmap(&self, ptr: NonNull<u8>, size: usize) {
        let layout = Self::layout(size).expect("layout was valid when the region was mapped");

        // SAFETY: The trait contract requires the caller to pass a region returned by `map()`
        // with the same size, which means it was allocated with this exact layout.
        unsafe {
            alloc::dealloc(ptr.as_ptr(), layout);
        }
    }

    fn release_pages(&self, ptr: NonNull<u8>, size: usize) {
        // We cannot give memory back to anyone, the best we can do is to reset the contents
        // the same way an operating system would.
        // SAFETY: The trait contract requires the range to be within a region we mapped.
        unsafe {
            ptr.write_bytes(0, size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_unmap_roundtrip() {
        let memory = BuildTargetMemory;

        let ptr = memory.map(2 * FALLBACK_PAGE_SIZE).unwrap();
        assert_eq!(ptr.as_ptr().addr() % FALLBACK_PAGE_SIZE, 0);

        // SAFETY: We just mapped this many bytes.
        unsafe {
            ptr.write_bytes(0xCD, FALLBACK_PAGE_SIZE);
        }

        memory.release_pages(ptr, FALLBACK_PAGE_SIZE);

        // SAFETY: Still within the mapped region and initialized.
        let first = unsafe { ptr.read() };
        assert_eq!(first, 0);

        memory.unmap(ptr, 2 * FALLBACK_PAGE_SIZE);
    }
}
