//! Flush orchestration: ring-ordered, dependency-ordered write-out,
//! and the shutdown teardown path.
//!
//! A global flush walks the rings outermost to innermost; no entry in
//! an inner ring is written while an outer ring still holds dirty
//! entries. Within a ring, passes repeat: an entry flushes only once
//! all of its flush-dependency children are clean, and a pass that
//! makes no progress while uncorked dirty entries remain means the
//! caller wired an unsatisfiable dependency across rings.

use std::mem;

use stratum_error::{CacheError, Result};
use stratum_types::{Address, Ring};
use tracing::{debug, trace, warn};

use crate::client::{wrap, MetadataStore, NotifyAction};
use crate::entry::{EntryId, Payload};
use crate::state::CacheState;

impl CacheState {
    pub(crate) fn flush_all(&mut self, store: &dyn MetadataStore, ignore_cork: bool) -> Result<()> {
        if let Some((_, entry)) = self.entries.iter().find(|(_, e)| e.is_protected) {
            return Err(CacheError::ProtocolViolation(format!(
                "flush while entry {} is protected",
                entry.address
            )));
        }
        for ring in Ring::ALL {
            self.flush_ring(store, ring, ignore_cork)?;
        }
        Ok(())
    }

    fn flush_ring(&mut self, store: &dyn MetadataStore, ring: Ring, ignore_cork: bool) -> Result<()> {
        loop {
            let candidates: Vec<Address> = self
                .entries
                .iter()
                .filter(|(_, e)| e.ring == ring && e.is_dirty)
                .map(|(_, e)| e.address)
                .collect();
            if candidates.is_empty() {
                return Ok(());
            }

            let mut progress = false;
            for addr in candidates {
                // Re-resolve: an earlier flush in this pass may have
                // cascaded this entry out of the cache.
                let Some(id) = self.id_of(addr) else { continue };
                if !self.entries[id].is_dirty {
                    continue;
                }
                if !ignore_cork && self.entry_is_corked(id) {
                    continue;
                }
                if !self.children_all_clean(id) {
                    continue;
                }
                self.flush_entry(store, id)?;
                progress = true;
            }

            let remaining = self
                .entries
                .iter()
                .filter(|(id, e)| {
                    e.ring == ring && e.is_dirty && (ignore_cork || !self.entry_is_corked(*id))
                })
                .count();
            if remaining == 0 {
                return Ok(());
            }
            if !progress {
                return Err(CacheError::ProtocolViolation(format!(
                    "flush stalled in ring {ring}: {remaining} dirty entries blocked by flush dependencies"
                )));
            }
        }
    }

    /// Serialize one dirty entry, write its image, and mark it clean.
    ///
    /// The caller guarantees the entry is dirty, unprotected, and has no
    /// dirty children.
    pub(crate) fn flush_entry(&mut self, store: &dyn MetadataStore, id: EntryId) -> Result<()> {
        let (addr, class, old_size, ring) = {
            let entry = &self.entries[id];
            (
                entry.address,
                entry.class.clone(),
                entry.size,
                entry.ring,
            )
        };
        let mut item = match mem::replace(&mut self.entries[id].payload, Payload::CheckedOut) {
            Payload::Resident(item) => item,
            Payload::CheckedOut => {
                return Err(CacheError::ProtocolViolation(format!(
                    "flush of checked-out entry {addr}"
                )))
            }
        };

        let flushed: Result<u64> = (|| {
            wrap("pre_serialize", class.pre_serialize(addr, item.as_mut()))?;
            let new_size = wrap("image_len", class.image_len(item.as_ref()))?;
            let len = usize::try_from(new_size).map_err(|_| {
                CacheError::BadArgument(format!("image length {new_size} does not fit in memory"))
            })?;
            let mut buf = vec![0_u8; len];
            wrap("serialize", class.serialize(addr, item.as_ref(), &mut buf))?;
            store.write_image(addr, &buf)?;
            Ok(new_size)
        })();
        self.entries[id].payload = Payload::Resident(item);
        let new_size = flushed?;

        // Variable-length records may reserialize at a different size;
        // keep the ring accumulators in step.
        if new_size != old_size {
            trace!(address = %addr, old_size, new_size, "entry resized during flush");
            let r = ring.index();
            self.ring_size[r] = self.ring_size[r] - old_size + new_size;
            self.ring_dirty_size[r] = self.ring_dirty_size[r] - old_size + new_size;
            self.current_size = self.current_size - old_size + new_size;
            self.entries[id].size = new_size;
        }

        self.entries[id].image_up_to_date = true;
        self.stats.flushes += 1;
        self.notify_parents(id, NotifyAction::ChildSerialized)?;
        self.mark_clean_id(id, true)?;
        trace!(address = %addr, size = new_size, ring = %ring, "flushed entry");
        Ok(())
    }

    /// Flush everything (corks ignored) and tear the cache down,
    /// dependency leaves first so every parent sees `ChildBeforeEvict`
    /// for each of its children before it is destroyed itself.
    /// Protected entries make shutdown fail before any write.
    pub(crate) fn flush_and_destroy(&mut self, store: &dyn MetadataStore) -> Result<()> {
        self.flush_all(store, true)?;
        while !self.index.is_empty() {
            let Some(id) = self
                .entries
                .iter()
                .find(|(_, e)| e.children.is_empty())
                .map(|(id, _)| id)
            else {
                // Unreachable for an acyclic graph; every DAG has a leaf.
                return Err(CacheError::ProtocolViolation(
                    "cache teardown stalled: no dependency leaf found".into(),
                ));
            };
            if self.entries[id].pin_count > 0 {
                warn!(
                    address = %self.entries[id].address,
                    pins = self.entries[id].pin_count,
                    "entry still pinned at shutdown; discarding pins"
                );
                self.entries[id].pin_count = 0;
            }
            // Parent edges that survive the ChildBeforeEvict reactions
            // are severed by the forced eviction.
            self.evict_entry(id, true)?;
        }
        debug!("cache destroyed");
        Ok(())
    }
}
