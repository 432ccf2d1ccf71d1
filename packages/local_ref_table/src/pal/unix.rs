use std::io;
use std::ptr::{self, NonNull};

use crate::pal::Memory;

/// Memory mapping that targets the real operating system that the build is targeting.
///
/// You would only use a different implementation in unit tests that need to inject failures.
/// Even then, whenever possible, tests should use real memory for maximum realism.
#[derive(Debug, Default)]
pub(crate) struct BuildTargetMemory;

// Real OS bindings are excluded from coverage measurement because their error paths require
// OS-level failures that are impractical to trigger in tests.
#[cfg_attr(coverage_nightly, coverage(off))]
impl Memory for BuildTargetMemory {
    fn page_size(&self) -> usize {
        // SAFETY: No safety requirements.
        let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

        usize::try_from(result).expect("the operating system reports a positive page size")
    }

    fn map(&self, size: usize) -> Result<NonNull<u8>, io::Error> {
        // SAFETY: No safety requirements beyond passing valid arguments. We request a fresh
        // anonymous mapping, so no existing memory is affected.
        let result = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if result == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        NonNull::new(result.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap() returned a null pointer"))
    }

    fn unmap(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: The trait contract requires the caller to pass a region we mapped and that is
        // not used anymore.
        let result = unsafe { libc::munmap(ptr.as_ptr().cast(), size) };

        // There is nothing a caller could do about a failure here, so we only check in debug.
        debug_assert_eq!(result, 0, "munmap() failed: {}", io::Error::last_os_error());
    }

    fn release_pages(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: The trait contract requires the caller to pass a page-aligned sub-range of a
        // region we mapped. MADV_DONTNEED on a private anonymous mapping only discards contents.
        let result = unsafe { libc::madvise(ptr.as_ptr().cast(), size, libc::MADV_DONTNEED) };

        debug_assert_eq!(result, 0, "madvise() failed: {}", io::Error::last_os_error());
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        let page_size = BuildTargetMemory.page_size();

        assert!(page_size.is_power_of_two());
        assert!(page_size >= 4096);
    }

    #[test]
    fn map_returns_zeroed_writable_memory() {
        let memory = BuildTargetMemory;
        let page_size = memory.page_size();

        let ptr = memory.map(page_size).unwrap();

        // SAFETY: We just mapped page_size bytes of read/write memory.
        let bytes = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), page_size) };
        assert!(bytes.iter().all(|b| *b == 0));

        bytes.fill(0xAB);
        memory.release_pages(ptr, page_size);

        // Released pages of an anonymous private mapping read back as zero on Linux.
        #[cfg(target_os = "linux")]
        assert!(bytes.iter().all(|b| *b == 0));

        memory.unmap(ptr, page_size);
    }
}
