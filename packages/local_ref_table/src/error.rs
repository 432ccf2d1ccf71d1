use std::io;

use thiserror::Error;

use crate::RefKind;

/// Errors that can occur when growing or adding to a [`LocalRefTable`][crate::LocalRefTable].
///
/// None of these are fatal at this layer. The caller decides whether to abort.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The operating system refused to map memory for table storage.
    #[error("failed to map {size} bytes of memory for {purpose}: {source}")]
    Allocation {
        /// What the memory was going to be used for.
        purpose: &'static str,

        /// The number of bytes requested.
        size: usize,

        /// The error reported by the operating system.
        source: io::Error,
    },

    /// The table is at its maximum permitted size and cannot accept another reference.
    #[error(
        "local reference table overflow (max={max_entries})\n{dump} Resizing failed: cannot resize over the maximum permitted size"
    )]
    Overflow {
        /// The maximum number of entries of the table.
        max_entries: usize,

        /// Human-readable listing of the table contents at the time of the failure.
        dump: String,
    },

    /// The table needed to grow to accept another reference but growing failed.
    #[error("local reference table overflow (max={max_entries})\n{dump} Resizing failed: {source}")]
    Resize {
        /// The number of entries the table had when growing failed.
        max_entries: usize,

        /// Human-readable listing of the table contents at the time of the failure.
        dump: String,

        /// Why the table could not grow.
        source: Box<Error>,
    },

    /// A capacity reservation asked for more entries than the maximum table size permits.
    #[error("requested size exceeds maximum: {requested} > {available} ({used} used)")]
    CapacityExceeded {
        /// The number of entries requested.
        requested: usize,

        /// The number of entries that could still be added at the maximum table size.
        available: usize,

        /// The number of entries already in use (including holes).
        used: usize,
    },
}

/// A specialized `Result` type for local reference table operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Explains why a [`LocalRef`][crate::LocalRef] does not refer to a live reference in a table.
///
/// Only the first problem found is reported.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum InvalidReference {
    /// The handle is not a local reference at all.
    #[error("{kind} reference used as a local reference")]
    WrongKind {
        /// The kind encoded in the handle.
        kind: RefKind,
    },

    /// The handle does not point into any storage of the table.
    #[error("reference outside the table: {raw:#x}")]
    OutsideTable {
        /// The raw handle value.
        raw: usize,
    },

    /// The handle belongs to a segment that has already been popped.
    #[error("popped reference at index {index} in a table of size {top_index}")]
    Popped {
        /// Index of the slot the handle points to.
        index: u32,

        /// Current top index of the table.
        top_index: u32,
    },

    /// The handle was created with verification enabled and its slot has since been reused.
    #[error(
        "reference at index {index} with bad serial number {serial} v. {expected} (valid 1 - 3)"
    )]
    BadSerialNumber {
        /// Index of the slot the handle points to.
        index: u32,

        /// The serial number encoded in the handle.
        serial: u32,

        /// The serial number currently recorded for the slot group.
        expected: u32,
    },

    /// The handle was already removed.
    #[error("deleted reference at index {index}")]
    Deleted {
        /// Index of the slot the handle points to.
        index: u32,
    },

    /// The slot holds no reference. This should never happen and may indicate memory corruption.
    #[error("null reference at index {index}")]
    Null {
        /// Index of the slot the handle points to.
        index: u32,
    },
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);
    assert_impl_all!(InvalidReference: Send, Sync, Debug, Copy);

    #[test]
    fn resize_error_includes_cause() {
        let error = Error::Resize {
            max_entries: 64,
            dump: "dump".to_string(),
            source: Box::new(Error::Allocation {
                purpose: "local reference table",
                size: 4096,
                source: io::Error::from(io::ErrorKind::OutOfMemory),
            }),
        };

        let message = error.to_string();
        assert!(message.contains("max=64"));
        assert!(message.contains("failed to map 4096 bytes"));
    }

    #[test]
    fn invalid_reference_messages() {
        assert_eq!(
            InvalidReference::Popped {
                index: 5,
                top_index: 3
            }
            .to_string(),
            "popped reference at index 5 in a table of size 3"
        );
        assert_eq!(
            InvalidReference::WrongKind {
                kind: RefKind::Global
            }
            .to_string(),
            "global reference used as a local reference"
        );
    }
}
