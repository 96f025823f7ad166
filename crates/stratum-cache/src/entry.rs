//! Resident entry representation and per-entry status snapshots.

use std::sync::Arc;

use serde::Serialize;
use stratum_types::{Address, Generation, Ring, Tag};

use crate::client::{ClientClass, Item};

/// Arena slot index of a resident entry. Never exposed to callers;
/// public handles pair it with a [`Generation`] or use the address.
pub(crate) type EntryId = usize;

/// Where an entry's in-core representation currently lives.
#[derive(Debug)]
pub(crate) enum Payload {
    /// Owned by the cache.
    Resident(Item),
    /// Lent to exactly one protect guard.
    CheckedOut,
}

/// One resident metadata record.
///
/// Invariants maintained by the engine:
/// - in the index iff resident in the arena;
/// - in the LRU list iff unprotected and unpinned;
/// - `payload` is `CheckedOut` iff `is_protected`;
/// - `parents`/`children` edges are mirrored exactly on both endpoints
///   and the graph stays acyclic.
pub(crate) struct Entry {
    pub(crate) address: Address,
    pub(crate) ring: Ring,
    pub(crate) tag: Option<Tag>,
    /// Current on-disk footprint in bytes. Changes when a
    /// variable-length record reserializes at a different size.
    pub(crate) size: u64,
    pub(crate) generation: Generation,
    pub(crate) class: Arc<dyn ClientClass>,
    pub(crate) payload: Payload,
    pub(crate) is_dirty: bool,
    pub(crate) is_protected: bool,
    pub(crate) pin_count: u32,
    pub(crate) image_up_to_date: bool,
    /// Entries that must not be considered complete until this one
    /// flushes or evicts.
    pub(crate) parents: Vec<EntryId>,
    /// Entries that must flush or evict before this one is complete.
    pub(crate) children: Vec<EntryId>,
}

impl Entry {
    pub(crate) fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }

    /// Eligible for the LRU list: resident, unprotected, unpinned.
    pub(crate) fn is_replaceable(&self) -> bool {
        !self.is_protected && !self.is_pinned()
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("address", &self.address)
            .field("ring", &self.ring)
            .field("class", &self.class.name())
            .field("size", &self.size)
            .field("is_dirty", &self.is_dirty)
            .field("is_protected", &self.is_protected)
            .field("pin_count", &self.pin_count)
            .field("parents", &self.parents.len())
            .field("children", &self.children.len())
            .finish_non_exhaustive()
    }
}

/// Point-in-time status of one resident entry, returned by value.
///
/// This is a snapshot: nothing prevents the underlying entry from
/// changing or being evicted after it is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntryStatus {
    pub size: u64,
    pub ring: Ring,
    /// Monotonic stamp assigned at installation; a re-loaded entry at
    /// the same address carries a different generation.
    pub generation: Generation,
    pub is_dirty: bool,
    pub is_protected: bool,
    pub is_pinned: bool,
    pub is_corked: bool,
    pub is_flush_dep_parent: bool,
    pub is_flush_dep_child: bool,
    pub image_up_to_date: bool,
}
