#![cfg_attr(
    test,
    expect(
        clippy::struct_field_names,
        reason = "false positive from automock generated code"
    )
)]

use std::fmt::Debug;
use std::io;
use std::ptr::NonNull;

/// Memory mapping operations provided by the operating system (or a stand-in for it).
///
/// Callers must only pass regions to `unmap()` and `release_pages()` that were previously
/// returned by `map()` on the same instance and have not yet been unmapped.
#[cfg_attr(test, mockall::automock)]
pub(crate) trait Memory: Debug + Send + Sync + 'static {
    /// The granularity of `map()` and `release_pages()`, in bytes. Always a power of two.
    fn page_size(&self) -> usize;

    /// Maps `size` bytes of zero-initialized, read/write, page-aligned memory.
    fn map(&self, size: usize) -> Result<NonNull<u8>, io::Error>;

    /// Releases a mapping created by `map()`. The `size` must match the mapped size.
    fn unmap(&self, ptr: NonNull<u8>, size: usize);

    /// Lets the operating system reclaim the physical pages of a page-aligned sub-range of a
    /// mapping without unmapping it. The contents are undefined on next access.
    fn release_pages(&self, ptr: NonNull<u8>, size: usize);
}
