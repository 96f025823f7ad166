//! Replacement list: unprotected, unpinned entries in recency order.

use std::collections::VecDeque;

use crate::entry::EntryId;

/// LRU-ordered list of replaceable entries.
///
/// Front is the least recently unprotected end (the eviction victim
/// end); back is most recent. Membership is the engine's invariant:
/// an entry is listed iff it is resident, unprotected, and unpinned.
#[derive(Debug, Default)]
pub(crate) struct LruList {
    order: VecDeque<EntryId>,
}

impl LruList {
    /// Append at the most-recently-used end.
    pub(crate) fn push_mru(&mut self, id: EntryId) {
        debug_assert!(!self.contains(id), "entry already in LRU");
        self.order.push_back(id);
    }

    /// Remove `id` wherever it sits. Returns whether it was present.
    pub(crate) fn remove(&mut self, id: EntryId) -> bool {
        if let Some(pos) = self.order.iter().position(|k| *k == id) {
            let _ = self.order.remove(pos);
            return true;
        }
        false
    }

    /// The `n`-th candidate counting from the eviction end.
    pub(crate) fn nth_from_tail(&self, n: usize) -> Option<EntryId> {
        self.order.get(n).copied()
    }

    pub(crate) fn contains(&self, id: EntryId) -> bool {
        self.order.iter().any(|k| *k == id)
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}
