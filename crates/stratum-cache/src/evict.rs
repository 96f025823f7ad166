//! Eviction: LRU-tail victim selection under the memory budget.
//!
//! Only clean entries leave the cache; a dirty victim is flushed in
//! place first. Protected and pinned entries are never candidates
//! (they are not in the LRU list at all), corked entries and entries
//! with live flush dependencies are skipped, and a budget shortfall is
//! reported, never fatal.

use stratum_error::{CacheError, Result};
use tracing::{debug, warn};

use crate::client::{MetadataStore, NotifyAction};
use crate::entry::EntryId;
use crate::state::CacheState;

impl CacheState {
    /// Evict from the LRU tail until `incoming` more bytes fit under
    /// the budget, or no further eviction is possible.
    pub(crate) fn make_space(&mut self, store: &dyn MetadataStore, incoming: u64) -> Result<()> {
        if !self.evictions_enabled {
            return Ok(());
        }
        let mut scan = 0;
        while self.current_size.saturating_add(incoming) > self.max_size {
            let Some(id) = self.lru.nth_from_tail(scan) else {
                break;
            };
            let blocked = {
                let entry = &self.entries[id];
                self.entry_is_corked(id)
                    || !entry.parents.is_empty()
                    || !entry.children.is_empty()
            };
            if blocked {
                scan += 1;
                continue;
            }
            let addr = self.entries[id].address;
            if self.entries[id].is_dirty {
                self.flush_entry(store, id)?;
                // Flush notifications can restructure the cache; start
                // the scan over against the new LRU shape.
                if self.id_of(addr) != Some(id) {
                    scan = 0;
                    continue;
                }
            }
            self.evict_entry(id, false)?;
            scan = 0;
        }
        if self.current_size.saturating_add(incoming) > self.max_size {
            self.stats.space_shortfalls += 1;
            warn!(
                current_size = self.current_size,
                incoming,
                budget = self.max_size,
                "cannot reach budget: remaining entries are protected, pinned, corked, or dependency-blocked"
            );
        }
        Ok(())
    }

    /// Remove one clean, unprotected, unpinned entry from the cache.
    ///
    /// `force` is the teardown path: leftover edges are severed instead
    /// of rejected, and the eviction proceeds even if a notification
    /// left the entry in an unexpected state.
    pub(crate) fn evict_entry(&mut self, id: EntryId, force: bool) -> Result<()> {
        let addr = self.entries[id].address;
        self.notify_one(id, NotifyAction::BeforeEvict, None)?;
        self.notify_parents(id, NotifyAction::ChildBeforeEvict)?;

        // A parent's reaction to ChildBeforeEvict may have removed the
        // edge, the parent, or (never legitimately) this entry.
        let Some(id) = self.id_of(addr) else {
            return Ok(());
        };
        let leftover_parents: Vec<EntryId> = self.entries[id].parents.clone();
        let leftover_children: Vec<EntryId> = self.entries[id].children.clone();
        if !force && (!leftover_parents.is_empty() || !leftover_children.is_empty()) {
            return Err(CacheError::ProtocolViolation(format!(
                "evict of {addr} with live flush dependencies"
            )));
        }
        for parent in leftover_parents {
            self.remove_dependency_ids(parent, id)?;
        }
        for child in leftover_children {
            self.remove_dependency_ids(id, child)?;
        }

        self.lru.remove(id);
        self.index.remove(&addr);
        let entry = self.entries.remove(id);
        self.current_size -= entry.size;
        self.ring_size[entry.ring.index()] -= entry.size;
        if entry.is_dirty {
            self.ring_dirty_size[entry.ring.index()] -= entry.size;
        }
        self.stats.evictions += 1;
        debug!(address = %addr, size = entry.size, ring = %entry.ring, "evicted entry");
        // Dropping the payload box frees the in-core representation.
        Ok(())
    }
}
