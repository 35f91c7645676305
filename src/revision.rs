//! Monotonic version counters.
//!
//! Two flavors are used throughout the crate: each node's own
//! `local_version`, advanced only when its cached value actually changes by
//! equality, and the [`Runtime`](crate::runtime::Runtime)'s
//! `global_version`, advanced on every successful source mutation regardless
//! of whether any individual node's value changed. The latter is advisory
//! only and exists for adapters that cannot participate in
//! fine-grained per-node version tracking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A point in the monotonic history of a node or of the graph as a whole.
///
/// Versions never decrease. Two versions are only meaningfully
/// comparable when they come from the same counter; comparing a node's local
/// version against another node's is meaningless.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(u64);

impl Version {
    /// The version assigned to a freshly constructed node or runtime, before
    /// any mutation has occurred.
    pub const fn start() -> Self {
        Version(0)
    }

    /// The version immediately following this one.
    pub fn next(self) -> Self {
        Version(self.0 + 1)
    }

    /// Raw counter value, exposed for debug output and the global-version
    /// fingerprint used by coarse-grained adapters.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", self.0)
    }
}

/// Lock-free storage for a [`Version`], used for publication across threads.
pub struct AtomicVersion(AtomicU64);

impl AtomicVersion {
    /// An atomic counter starting at [`Version::start`].
    pub const fn start() -> Self {
        AtomicVersion(AtomicU64::new(0))
    }

    /// Reads the current version.
    #[inline]
    pub fn load(&self) -> Version {
        Version(self.0.load(Ordering::Acquire))
    }

    /// Publishes a version unconditionally.
    #[inline]
    pub fn store(&self, v: Version) {
        self.0.store(v.0, Ordering::Release);
    }

    /// Atomically increments the counter and returns the new value.
    #[inline]
    pub fn increment(&self) -> Version {
        Version(self.0.fetch_add(1, Ordering::AcqRel) + 1)
    }
}

impl Default for AtomicVersion {
    fn default() -> Self {
        Self::start()
    }
}

impl fmt::Debug for AtomicVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AtomicVersion({:?})", self.load())
    }
}
