//! Statistics and the read-only query layer.
//!
//! These accessors answer status questions without protecting anything.
//! Everything returns by value (snapshots) or through a closure-scoped
//! borrow; nothing hands out a reference that could dangle once control
//! returns to the cache.

use serde::Serialize;
use stratum_error::{CacheError, Result};
use stratum_types::{Address, Ring, Tag};

use crate::client::MetadataStore;
use crate::config::ResizeConfig;
use crate::entry::{EntryStatus, Payload};
use crate::resize::ResizeMode;
use crate::MetadataCache;

/// Cumulative operation counters, reset only by
/// [`MetadataCache::reset_statistics`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Successful protect and unprotect calls.
    pub accesses: u64,
    /// Protect calls satisfied from the index.
    pub hits: u64,
    /// Entries materialized by miss-loads.
    pub loads: u64,
    /// Entries added by explicit insert.
    pub insertions: u64,
    pub evictions: u64,
    pub flushes: u64,
    pub pins: u64,
    pub unpins: u64,
    /// Times eviction could not bring the cache under budget.
    pub space_shortfalls: u64,
    /// Budget adjustments taken by the resize controller.
    pub resizes: u64,
}

impl CacheStats {
    /// `hits / accesses`; exactly `0.0` when there have been none.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        if self.accesses == 0 {
            0.0
        } else {
            self.hits as f64 / self.accesses as f64
        }
    }
}

impl<S: MetadataStore> MetadataCache<S> {
    /// Snapshot of the cumulative counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    /// Zero the cumulative counters. Resident entries, the budget, and
    /// the resize epoch in progress are untouched.
    pub fn reset_statistics(&self) {
        self.state.lock().stats = CacheStats::default();
    }

    /// Hit rate since construction or the last statistics reset.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        self.state.lock().stats.hit_rate()
    }

    /// Current memory budget in bytes.
    #[must_use]
    pub fn max_size(&self) -> u64 {
        self.state.lock().max_size
    }

    /// Bytes the engine aims to keep clean under the current budget.
    #[must_use]
    pub fn min_clean_size(&self) -> u64 {
        self.state.lock().min_clean_size()
    }

    /// Total bytes of resident entries.
    #[must_use]
    pub fn current_size(&self) -> u64 {
        self.state.lock().current_size
    }

    /// Number of resident entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.state.lock().index.len()
    }

    /// Dirty bytes resident in `ring`.
    #[must_use]
    pub fn ring_dirty_size(&self, ring: Ring) -> u64 {
        self.state.lock().ring_dirty_size[ring.index()]
    }

    /// Whether every ring from the outermost through `through` is
    /// clean. Answers from the per-ring dirty accumulators, never a
    /// full scan.
    #[must_use]
    pub fn cache_is_clean(&self, through: Ring) -> bool {
        let state = self.state.lock();
        through
            .outer_through()
            .all(|ring| state.ring_dirty_size[ring.index()] == 0)
    }

    /// Status snapshot for the entry at `addr`, or `None` if absent.
    pub fn entry_status(&self, addr: Address) -> Result<Option<EntryStatus>> {
        if !addr.is_defined() {
            return Err(CacheError::BadArgument(
                "entry_status of undefined address".into(),
            ));
        }
        let state = self.state.lock();
        let Some(id) = state.id_of(addr) else {
            return Ok(None);
        };
        let entry = &state.entries[id];
        Ok(Some(EntryStatus {
            size: entry.size,
            ring: entry.ring,
            generation: entry.generation,
            is_dirty: entry.is_dirty,
            is_protected: entry.is_protected,
            is_pinned: entry.is_pinned(),
            is_corked: state.entry_is_corked(id),
            is_flush_dep_parent: !entry.children.is_empty(),
            is_flush_dep_child: !entry.parents.is_empty(),
            image_up_to_date: entry.image_up_to_date,
        }))
    }

    /// Ring of the entry at `addr`; `NotFound` if absent.
    pub fn entry_ring(&self, addr: Address) -> Result<Ring> {
        let state = self.state.lock();
        let id = state.require(addr)?;
        Ok(state.entries[id].ring)
    }

    /// Flush-dependency child count of the entry at `addr`.
    pub fn flush_dep_children(&self, addr: Address) -> Result<usize> {
        let state = self.state.lock();
        let id = state.require(addr)?;
        Ok(state.entries[id].children.len())
    }

    /// Run `f` against the entry's in-core representation without
    /// protecting it. The borrow ends when `f` returns; nothing escapes
    /// to dangle. Fails with `NotFound` if absent, `ProtocolViolation`
    /// if checked out, and `BadArgument` if the payload is not a `T`.
    pub fn with_entry<T: 'static, R>(
        &self,
        addr: Address,
        f: impl FnOnce(&T) -> R,
    ) -> Result<R> {
        let state = self.state.lock();
        let id = state.require(addr)?;
        match &state.entries[id].payload {
            Payload::Resident(item) => {
                let typed = item.as_ref().downcast_ref::<T>().ok_or_else(|| {
                    CacheError::BadArgument(format!("entry {addr} holds a different payload type"))
                })?;
                Ok(f(typed))
            }
            Payload::CheckedOut => Err(CacheError::ProtocolViolation(format!(
                "entry {addr} is checked out"
            ))),
        }
    }

    /// Whether `tag` is currently corked.
    #[must_use]
    pub fn is_corked(&self, tag: Tag) -> bool {
        self.state.lock().corked.contains(&tag)
    }

    /// Whether eviction is currently permitted.
    #[must_use]
    pub fn evictions_enabled(&self) -> bool {
        self.state.lock().evictions_enabled
    }

    /// Last decision the resize controller took.
    #[must_use]
    pub fn resize_mode(&self) -> ResizeMode {
        self.state.lock().resize.mode
    }

    /// Number of resize epochs evaluated so far.
    #[must_use]
    pub fn resize_epochs(&self) -> u64 {
        self.state.lock().resize.epochs_completed
    }

    /// Snapshot of the automatic resize configuration.
    #[must_use]
    pub fn resize_config(&self) -> ResizeConfig {
        self.state.lock().config.resize
    }

    /// Location and length of the persisted cache image, if the file
    /// carries one.
    #[must_use]
    pub fn image_info(&self) -> Option<(Address, u64)> {
        self.state
            .lock()
            .image_info
            .map(|info| (info.address, info.len))
    }
}
