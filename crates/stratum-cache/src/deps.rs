//! Flush-dependency graph: directed acyclic edges meaning "the child
//! must flush or evict before the parent is considered complete".
//!
//! Edges live as index-keyed adjacency lists on both endpoints, so edge
//! mutation is O(degree) with no reference cycles. Cycle rejection runs
//! a DFS over child edges before the edge is committed, so a rejected
//! insertion leaves the graph untouched.

use std::collections::HashSet;

use stratum_error::{CacheError, Result};
use stratum_types::Address;

use crate::entry::EntryId;
use crate::state::CacheState;

impl CacheState {
    pub(crate) fn add_dependency(&mut self, parent: Address, child: Address) -> Result<()> {
        let p = self.require(parent)?;
        let c = self.require(child)?;
        if p == c {
            return Err(CacheError::ProtocolViolation(format!(
                "flush dependency of {parent} on itself"
            )));
        }
        if self.entries[p].children.contains(&c) {
            return Err(CacheError::ProtocolViolation(format!(
                "duplicate flush dependency {parent} -> {child}"
            )));
        }
        if self.reaches(c, p) {
            return Err(CacheError::ProtocolViolation(format!(
                "flush dependency {parent} -> {child} would close a cycle"
            )));
        }
        self.entries[p].children.push(c);
        self.entries[c].parents.push(p);
        Ok(())
    }

    pub(crate) fn remove_dependency(&mut self, parent: Address, child: Address) -> Result<()> {
        let p = self.require(parent)?;
        let c = self.require(child)?;
        self.remove_dependency_ids(p, c)
    }

    pub(crate) fn remove_dependency_ids(&mut self, p: EntryId, c: EntryId) -> Result<()> {
        let child_pos = self.entries[p].children.iter().position(|&id| id == c);
        let parent_pos = self.entries[c].parents.iter().position(|&id| id == p);
        match (child_pos, parent_pos) {
            (Some(cp), Some(pp)) => {
                self.entries[p].children.swap_remove(cp);
                self.entries[c].parents.swap_remove(pp);
                Ok(())
            }
            _ => Err(CacheError::ProtocolViolation(format!(
                "no flush dependency {} -> {}",
                self.entries[p].address, self.entries[c].address
            ))),
        }
    }

    /// Whether `to` is reachable from `from` by descending child edges.
    fn reaches(&self, from: EntryId, to: EntryId) -> bool {
        let mut stack = vec![from];
        let mut seen: HashSet<EntryId> = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if seen.insert(id) {
                stack.extend(self.entries[id].children.iter().copied());
            }
        }
        false
    }

    /// Flush eligibility with respect to the graph: every child clean.
    pub(crate) fn children_all_clean(&self, id: EntryId) -> bool {
        self.entries[id]
            .children
            .iter()
            .all(|&c| !self.entries[c].is_dirty)
    }
}
