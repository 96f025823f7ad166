#![forbid(unsafe_code)]
//! Core newtypes shared across the Stratum metadata cache crates.
//!
//! Everything here is plain data: file addresses, slot generations, cork
//! tags, and the ring ordering that constrains flush sequencing. The cache
//! engine lives in `stratum-cache`; error types live in `stratum-error`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Absolute byte offset of a metadata record in the underlying file.
///
/// `Address::UNDEFINED` (all bits set) is the reserved "no address" value
/// and is rejected at every public cache entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub u64);

impl Address {
    /// Reserved sentinel for "no address".
    pub const UNDEFINED: Self = Self(u64::MAX);

    #[must_use]
    pub fn is_defined(self) -> bool {
        self != Self::UNDEFINED
    }

    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_defined() {
            write!(f, "{:#x}", self.0)
        } else {
            write!(f, "<undef>")
        }
    }
}

/// Monotonic generation stamp for an arena slot.
///
/// Bumped every time a slot is reused, so a stale handle to an evicted
/// entry can be detected instead of silently aliasing its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(pub u64);

impl Generation {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// Grouping key for cork operations.
///
/// Conventionally the file address of the object that owns a group of
/// related entries; corking the tag suppresses eviction and flush for
/// every entry carrying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag(pub u64);

/// Number of consistency rings.
pub const RING_COUNT: usize = 5;

/// Consistency ring of a cache entry, outermost first.
///
/// Rings impose a total order on flush processing beyond the flush
/// dependency graph: no entry in an inner ring may be flushed while any
/// entry in an outer ring is dirty, because inner rings hold structural
/// metadata (free space maps, the superblock) that outer rings reference.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Ring {
    /// Ordinary user-visible metadata (object headers, index blocks).
    #[default]
    User = 0,
    /// Free space map for raw data.
    RawFreeSpace = 1,
    /// Free space map for metadata.
    MetaFreeSpace = 2,
    /// Superblock extension records.
    SuperblockExt = 3,
    /// The superblock itself, innermost.
    Superblock = 4,
}

impl Ring {
    /// All rings, outermost first. Flush processes them in this order.
    pub const ALL: [Self; RING_COUNT] = [
        Self::User,
        Self::RawFreeSpace,
        Self::MetaFreeSpace,
        Self::SuperblockExt,
        Self::Superblock,
    ];

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Rings from the outermost through `self`, inclusive.
    pub fn outer_through(self) -> impl Iterator<Item = Self> {
        Self::ALL.into_iter().take(self.index() + 1)
    }
}

impl fmt::Display for Ring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::User => "user",
            Self::RawFreeSpace => "raw-free-space",
            Self::MetaFreeSpace => "meta-free-space",
            Self::SuperblockExt => "superblock-ext",
            Self::Superblock => "superblock",
        };
        f.write_str(name)
    }
}
