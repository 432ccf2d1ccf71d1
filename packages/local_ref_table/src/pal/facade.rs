#![cfg_attr(coverage_nightly, coverage(off))]

use std::fmt::Debug;
use std::io;
use std::ptr::NonNull;
#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
use crate::pal::MockMemory;
use crate::pal::{BuildTargetMemory, Memory};

/// Enum to hide the real/mock choice behind a single wrapper type.
#[derive(Clone)]
pub(crate) enum MemoryFacade {
    Target(&'static BuildTargetMemory),

    #[cfg(test)]
    Mock(Arc<MockMemory>),
}

impl MemoryFacade {
    pub(crate) const fn target() -> Self {
        Self::Target(&BuildTargetMemory)
    }

    #[cfg(test)]
    pub(crate) fn from_mock(mock: MockMemory) -> Self {
        Self::Mock(Arc::new(mock))
    }
}

impl Memory for MemoryFacade {
    fn page_size(&self) -> usize {
        match self {
            Self::Target(memory) => memory.page_size(),
            #[cfg(test)]
            Self::Mock(mock) => mock.page_size(),
        }
    }

    fn map(&self, size: usize) -> Result<NonNull<u8>, io::Error> {
        match self {
            Self::Target(memory) => memory.map(size),
            #[cfg(test)]
            Self::Mock(mock) => mock.map(size),
        }
    }

    fn unmap(&self, ptr: NonNull<u8>, size: usize) {
        match self {
            Self::Target(memory) => memory.unmap(ptr, size),
            #[cfg(test)]
            Self::Mock(mock) => mock.unmap(ptr, size),
        }
    }

    fn release_pages(&self, ptr: NonNull<u8>, size: usize) {
        match self {
            Self::Target(memory) => memory.release_pages(ptr, size),
            #[cfg(test)]
            Self::Mock(mock) => mock.release_pages(ptr, size),
        }
    }
}

impl Debug for MemoryFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Target(inner) => inner.fmt(f),
            #[cfg(test)]
            Self::Mock(inner) => inner.fmt(f),
        }
    }
}
