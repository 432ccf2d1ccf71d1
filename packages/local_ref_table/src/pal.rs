//! Platform Abstraction Layer (PAL) for the memory mapping capability that backs the tables.
//!
//! All page mapping goes through the [`Memory`] trait so that unit tests can substitute mock
//! implementations to inject allocation failures.

mod abstractions;
pub(crate) use abstractions::*;

mod facade;
pub(crate) use facade::*;

mod region;
pub(crate) use region::*;

#[cfg(all(unix, not(miri)))]
mod unix;
#[cfg(all(unix, not(miri)))]
pub(crate) use unix::*;

// The fallback module is compiled in test mode on all platforms, under Miri, and as the primary
// implementation on non-Unix platforms. On Unix in test mode, it must be accessed via the
// explicit path `fallback::` to avoid ambiguity with the platform-specific implementation.
#[cfg(any(test, miri, not(unix)))]
pub(crate) mod fallback;

#[cfg(any(miri, not(unix)))]
pub(crate) use fallback::*;
