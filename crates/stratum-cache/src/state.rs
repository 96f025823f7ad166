//! Engine state: the entry arena, the address index, ring accounting,
//! and the protect/unprotect/pin lifecycle transitions.
//!
//! All mutation funnels through `CacheState` behind the cache's mutex.
//! Client notify callbacks never reenter the cache: their structural
//! reactions come back as deferred ops (see [`crate::client::NotifyOps`])
//! and are applied here after the callback returns, which is where the
//! cascading cleanup of shadow entries happens.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::Arc;

use slab::Slab;
use stratum_error::{CacheError, Result};
use stratum_types::{Address, Generation, Ring, Tag, RING_COUNT};
use tracing::{debug, trace, warn};

use crate::client::{
    wrap, ClientClass, DeferredOp, InsertOptions, Item, MetadataStore, NotifyAction, NotifyEvent,
    NotifyOps, ProtectOptions,
};
use crate::config::CacheConfig;
use crate::entry::{Entry, EntryId, Payload};
use crate::resize::ResizeState;
use crate::stats::CacheStats;
use crate::lru::LruList;

/// Persisted cache-image location, when one exists in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ImageInfo {
    pub(crate) address: Address,
    pub(crate) len: u64,
}

pub(crate) struct CacheState {
    pub(crate) config: CacheConfig,
    /// Current memory budget; starts at `config.max_size` and moves
    /// within the resize bounds.
    pub(crate) max_size: u64,
    pub(crate) current_size: u64,
    pub(crate) entries: Slab<Entry>,
    pub(crate) index: HashMap<Address, EntryId>,
    pub(crate) lru: LruList,
    pub(crate) ring_size: [u64; RING_COUNT],
    pub(crate) ring_dirty_size: [u64; RING_COUNT],
    pub(crate) corked: HashSet<Tag>,
    pub(crate) stats: CacheStats,
    pub(crate) resize: ResizeState,
    pub(crate) evictions_enabled: bool,
    pub(crate) image_info: Option<ImageInfo>,
    next_generation: Generation,
}

impl CacheState {
    pub(crate) fn new(config: CacheConfig) -> Self {
        Self {
            max_size: config.max_size,
            current_size: 0,
            entries: Slab::new(),
            index: HashMap::new(),
            lru: LruList::default(),
            ring_size: [0; RING_COUNT],
            ring_dirty_size: [0; RING_COUNT],
            corked: HashSet::new(),
            stats: CacheStats::default(),
            resize: ResizeState::default(),
            evictions_enabled: config.evictions_enabled,
            image_info: None,
            next_generation: Generation(0),
            config,
        }
    }

    // ── Index helpers ──────────────────────────────────────────────

    pub(crate) fn id_of(&self, addr: Address) -> Option<EntryId> {
        self.index.get(&addr).copied()
    }

    pub(crate) fn require(&self, addr: Address) -> Result<EntryId> {
        if !addr.is_defined() {
            return Err(CacheError::BadArgument(
                "operation on undefined address".into(),
            ));
        }
        self.id_of(addr)
            .ok_or_else(|| CacheError::NotFound(format!("no cache entry at {addr}")))
    }

    pub(crate) fn entry_is_corked(&self, id: EntryId) -> bool {
        self.entries[id]
            .tag
            .is_some_and(|tag| self.corked.contains(&tag))
    }

    // ── Hit/access bookkeeping ─────────────────────────────────────

    fn record_access(&mut self, store: &dyn MetadataStore, hit: bool) -> Result<()> {
        self.stats.accesses += 1;
        self.resize.epoch_accesses += 1;
        if hit {
            self.stats.hits += 1;
            self.resize.epoch_hits += 1;
        }
        if self.resize.epoch_accesses >= self.config.resize.epoch_length {
            self.run_resize_epoch(store)?;
        }
        Ok(())
    }

    // ── Entry installation ─────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn install_entry(
        &mut self,
        address: Address,
        ring: Ring,
        tag: Option<Tag>,
        size: u64,
        class: Arc<dyn ClientClass>,
        item: Item,
        is_dirty: bool,
        pin_count: u32,
        image_up_to_date: bool,
    ) -> EntryId {
        let generation = self.next_generation;
        self.next_generation = generation.next();
        let entry = Entry {
            address,
            ring,
            tag,
            size,
            generation,
            class,
            payload: Payload::Resident(item),
            is_dirty,
            is_protected: false,
            pin_count,
            image_up_to_date,
            parents: Vec::new(),
            children: Vec::new(),
        };
        let replaceable = entry.is_replaceable();
        let id = self.entries.insert(entry);
        self.index.insert(address, id);
        self.ring_size[ring.index()] += size;
        self.current_size += size;
        if is_dirty {
            self.ring_dirty_size[ring.index()] += size;
        }
        if replaceable {
            self.lru.push_mru(id);
        }
        id
    }

    /// Drop a just-installed entry without notifications; rollback path
    /// for a load or insert whose `AfterLoad`/`AfterInsert` failed.
    fn discard_entry(&mut self, addr: Address) {
        let Some(id) = self.id_of(addr) else { return };
        self.lru.remove(id);
        self.index.remove(&addr);
        let entry = self.entries.remove(id);
        self.current_size -= entry.size;
        self.ring_size[entry.ring.index()] -= entry.size;
        if entry.is_dirty {
            self.ring_dirty_size[entry.ring.index()] -= entry.size;
        }
    }

    // ── Protect / unprotect ────────────────────────────────────────

    pub(crate) fn protect(
        &mut self,
        store: &dyn MetadataStore,
        addr: Address,
        class: &Arc<dyn ClientClass>,
        opts: ProtectOptions,
    ) -> Result<Item> {
        if !addr.is_defined() {
            return Err(CacheError::BadArgument("protect of undefined address".into()));
        }
        if let Some(id) = self.id_of(addr) {
            {
                let entry = &self.entries[id];
                if entry.is_protected {
                    return Err(CacheError::ProtocolViolation(format!(
                        "double protect of {addr}"
                    )));
                }
                if entry.ring != opts.ring {
                    return Err(CacheError::ProtocolViolation(format!(
                        "protect of {addr} in ring {} but entry lives in ring {}",
                        opts.ring, entry.ring
                    )));
                }
            }
            self.lru.remove(id);
            let item = self.check_out(id)?;
            trace!(address = %addr, "protect hit");
            if let Err(err) = self.record_access(store, true) {
                self.undo_check_out(id, item);
                return Err(err);
            }
            return Ok(item);
        }

        // Miss: drive the client load protocol. Nothing is inserted
        // until the image deserializes, so a failed load leaves no
        // partial entry behind.
        let initial = wrap("initial_size", class.initial_size(addr))?;
        if initial == 0 {
            return Err(CacheError::BadArgument(format!(
                "client {:?} reported zero initial size for {addr}",
                class.name()
            )));
        }
        let mut image = vec![0_u8; usize::try_from(initial).map_err(size_overflow)?];
        store.read_image(addr, &mut image)?;
        if let Some(actual) = wrap("actual_size", class.actual_size(addr, &image))? {
            if actual == 0 {
                return Err(CacheError::BadArgument(format!(
                    "client {:?} reported zero actual size for {addr}",
                    class.name()
                )));
            }
            if actual != initial {
                image.resize(usize::try_from(actual).map_err(size_overflow)?, 0);
                store.read_image(addr, &mut image)?;
            }
        }
        wrap("verify_checksum", class.verify_checksum(addr, &image))?;
        let item = wrap("deserialize", class.deserialize(addr, &image))?;
        let size = image.len() as u64;

        self.make_space(store, size)?;
        let id = self.install_entry(
            addr,
            opts.ring,
            opts.tag,
            size,
            Arc::clone(class),
            item,
            false,
            0,
            true,
        );
        self.stats.loads += 1;
        if let Err(err) = self.notify_one(id, NotifyAction::AfterLoad, None) {
            self.discard_entry(addr);
            return Err(err);
        }
        let id = self.require(addr)?;
        self.lru.remove(id);
        let item = self.check_out(id)?;
        debug!(address = %addr, size, ring = %opts.ring, "protect miss-loaded entry");
        if let Err(err) = self.record_access(store, false) {
            self.undo_check_out(id, item);
            return Err(err);
        }
        Ok(item)
    }

    /// Roll a checkout back after a failure between checkout and
    /// return, leaving the entry unprotected and replaceable again.
    fn undo_check_out(&mut self, id: EntryId, item: Item) {
        let entry = &mut self.entries[id];
        entry.payload = Payload::Resident(item);
        entry.is_protected = false;
        if self.entries[id].is_replaceable() {
            self.lru.push_mru(id);
        }
    }

    fn check_out(&mut self, id: EntryId) -> Result<Item> {
        let entry = &mut self.entries[id];
        match mem::replace(&mut entry.payload, Payload::CheckedOut) {
            Payload::Resident(item) => {
                entry.is_protected = true;
                Ok(item)
            }
            Payload::CheckedOut => Err(CacheError::ProtocolViolation(format!(
                "entry {} has no resident payload to check out",
                entry.address
            ))),
        }
    }

    pub(crate) fn unprotect(
        &mut self,
        store: &dyn MetadataStore,
        addr: Address,
        item: Item,
        dirtied: bool,
        pin_on_release: bool,
    ) -> Result<()> {
        let id = self.id_of(addr).ok_or_else(|| {
            CacheError::ProtocolViolation(format!("unprotect of non-resident entry {addr}"))
        })?;
        if !self.entries[id].is_protected {
            return Err(CacheError::ProtocolViolation(format!(
                "unprotect without protect of {addr}"
            )));
        }
        let entry = &mut self.entries[id];
        entry.payload = Payload::Resident(item);
        entry.is_protected = false;
        if dirtied {
            self.mark_dirty_id(id)?;
        }
        if pin_on_release {
            self.entries[id].pin_count += 1;
            self.stats.pins += 1;
        }
        if self.entries[id].is_replaceable() {
            self.lru.push_mru(id);
        }
        trace!(address = %addr, dirtied, pin_on_release, "unprotect");
        self.record_access(store, false)
    }

    // ── Explicit insert / remove ───────────────────────────────────

    pub(crate) fn insert(
        &mut self,
        store: &dyn MetadataStore,
        addr: Address,
        class: Arc<dyn ClientClass>,
        item: Item,
        opts: InsertOptions,
    ) -> Result<()> {
        if !addr.is_defined() {
            return Err(CacheError::BadArgument("insert at undefined address".into()));
        }
        if self.index.contains_key(&addr) {
            return Err(CacheError::ProtocolViolation(format!(
                "insert at {addr} which is already resident"
            )));
        }
        let size = wrap("image_len", class.image_len(item.as_ref()))?;
        if size == 0 {
            return Err(CacheError::BadArgument(format!(
                "client {:?} reported zero image length for insert at {addr}",
                class.name()
            )));
        }
        self.make_space(store, size)?;
        let pin_count = u32::from(opts.pinned);
        let id = self.install_entry(
            addr, opts.ring, opts.tag, size, class, item, true, pin_count, false,
        );
        self.stats.insertions += 1;
        if opts.pinned {
            self.stats.pins += 1;
        }
        if let Err(err) = self.notify_one(id, NotifyAction::AfterInsert, None) {
            self.discard_entry(addr);
            return Err(err);
        }
        debug!(address = %addr, size, ring = %opts.ring, pinned = opts.pinned, "inserted entry");
        Ok(())
    }

    pub(crate) fn remove(&mut self, addr: Address) -> Result<Item> {
        let id = self.require(addr)?;
        let entry = &self.entries[id];
        if entry.is_protected || entry.is_pinned() {
            return Err(CacheError::ProtocolViolation(format!(
                "remove of protected or pinned entry {addr}"
            )));
        }
        if !entry.parents.is_empty() || !entry.children.is_empty() {
            return Err(CacheError::ProtocolViolation(format!(
                "remove of entry {addr} with live flush dependencies"
            )));
        }
        self.lru.remove(id);
        self.index.remove(&addr);
        let entry = self.entries.remove(id);
        self.current_size -= entry.size;
        self.ring_size[entry.ring.index()] -= entry.size;
        if entry.is_dirty {
            self.ring_dirty_size[entry.ring.index()] -= entry.size;
        }
        match entry.payload {
            Payload::Resident(item) => Ok(item),
            Payload::CheckedOut => Err(CacheError::ProtocolViolation(format!(
                "remove of checked-out entry {addr}"
            ))),
        }
    }

    // ── Pin / unpin ────────────────────────────────────────────────

    pub(crate) fn pin(&mut self, addr: Address) -> Result<()> {
        let id = self.require(addr)?;
        let entry = &mut self.entries[id];
        if !entry.is_protected && !entry.is_pinned() {
            return Err(CacheError::ProtocolViolation(format!(
                "pin of {addr} which is neither protected nor pinned"
            )));
        }
        entry.pin_count += 1;
        self.stats.pins += 1;
        Ok(())
    }

    pub(crate) fn unpin(&mut self, addr: Address) -> Result<()> {
        let id = self.require(addr)?;
        self.unpin_id(id)
    }

    pub(crate) fn unpin_id(&mut self, id: EntryId) -> Result<()> {
        let entry = &mut self.entries[id];
        if entry.pin_count == 0 {
            return Err(CacheError::ProtocolViolation(format!(
                "unpin of unpinned entry {}",
                entry.address
            )));
        }
        entry.pin_count -= 1;
        self.stats.unpins += 1;
        if self.entries[id].is_replaceable() {
            self.lru.push_mru(id);
        }
        Ok(())
    }

    // ── Dirty transitions ──────────────────────────────────────────

    pub(crate) fn mark_dirty(&mut self, addr: Address) -> Result<()> {
        let id = self.require(addr)?;
        let entry = &self.entries[id];
        if !entry.is_protected && !entry.is_pinned() {
            return Err(CacheError::ProtocolViolation(format!(
                "mark_dirty of {addr} which is neither protected nor pinned"
            )));
        }
        self.mark_dirty_id(id)
    }

    pub(crate) fn mark_clean(&mut self, addr: Address) -> Result<()> {
        let id = self.require(addr)?;
        let entry = &self.entries[id];
        if !entry.is_protected && !entry.is_pinned() {
            return Err(CacheError::ProtocolViolation(format!(
                "mark_clean of {addr} which is neither protected nor pinned"
            )));
        }
        self.mark_clean_id(id, false)
    }

    pub(crate) fn mark_dirty_id(&mut self, id: EntryId) -> Result<()> {
        if self.entries[id].is_dirty {
            return Ok(());
        }
        let (ring, size) = {
            let entry = &mut self.entries[id];
            entry.is_dirty = true;
            (entry.ring, entry.size)
        };
        self.ring_dirty_size[ring.index()] += size;
        let image_was_current = mem::replace(&mut self.entries[id].image_up_to_date, false);
        self.notify_one(id, NotifyAction::EntryDirtied, None)?;
        if image_was_current {
            self.notify_parents(id, NotifyAction::ChildUnserialized)?;
        }
        self.notify_parents(id, NotifyAction::ChildDirtied)
    }

    /// Transition dirty → clean, firing `AfterFlush` (flush path) or
    /// `EntryCleaned` (explicit path) on the entry and `ChildCleaned`
    /// on its dependency parents.
    pub(crate) fn mark_clean_id(&mut self, id: EntryId, via_flush: bool) -> Result<()> {
        if !self.entries[id].is_dirty {
            return Ok(());
        }
        let (ring, size) = {
            let entry = &mut self.entries[id];
            entry.is_dirty = false;
            (entry.ring, entry.size)
        };
        self.ring_dirty_size[ring.index()] -= size;
        let action = if via_flush {
            NotifyAction::AfterFlush
        } else {
            NotifyAction::EntryCleaned
        };
        self.notify_one(id, action, None)?;
        self.notify_parents(id, NotifyAction::ChildCleaned)
    }

    // ── Cork ───────────────────────────────────────────────────────

    pub(crate) fn cork(&mut self, tag: Tag) -> Result<()> {
        if !self.corked.insert(tag) {
            return Err(CacheError::BadArgument(format!("tag {tag:?} already corked")));
        }
        Ok(())
    }

    pub(crate) fn uncork(&mut self, tag: Tag) -> Result<()> {
        if !self.corked.remove(&tag) {
            return Err(CacheError::BadArgument(format!("tag {tag:?} is not corked")));
        }
        Ok(())
    }

    // ── Notification dispatch ──────────────────────────────────────

    /// Deliver one notification and apply the ops its callback queued.
    /// A dead slot is a no-op: cascades may outrun entries that have
    /// already removed themselves.
    pub(crate) fn notify_one(
        &mut self,
        id: EntryId,
        action: NotifyAction,
        child: Option<EntryId>,
    ) -> Result<()> {
        let (address, class, nchildren, child_addr) = {
            let Some(entry) = self.entries.get(id) else {
                return Ok(());
            };
            let child_addr = child.and_then(|c| self.entries.get(c)).map(|c| c.address);
            (
                entry.address,
                Arc::clone(&entry.class),
                entry.children.len(),
                child_addr,
            )
        };
        // Lend the payload out so the callback can see its own record
        // without aliasing the arena.
        let mut lent = match mem::replace(&mut self.entries[id].payload, Payload::CheckedOut) {
            Payload::Resident(item) => Some(item),
            Payload::CheckedOut => None,
        };
        let mut ops = NotifyOps::default();
        let result = class.notify(
            NotifyEvent {
                action,
                address,
                child: child_addr,
                flush_dep_children: nchildren,
                item: lent.as_deref_mut(),
            },
            &mut ops,
        );
        if let Some(item) = lent {
            self.entries[id].payload = Payload::Resident(item);
        }
        wrap("notify", result)?;
        self.apply_ops(address, ops)
    }

    pub(crate) fn notify_parents(&mut self, id: EntryId, action: NotifyAction) -> Result<()> {
        let parent_addrs: Vec<Address> = self.entries[id]
            .parents
            .iter()
            .map(|&p| self.entries[p].address)
            .collect();
        for addr in parent_addrs {
            // Re-resolve each round: an earlier parent's reaction may
            // have removed a later one.
            if let Some(pid) = self.id_of(addr) {
                self.notify_one(pid, action, Some(id))?;
            }
        }
        Ok(())
    }

    fn apply_ops(&mut self, owner: Address, ops: NotifyOps) -> Result<()> {
        for op in ops.ops {
            let Some(id) = self.id_of(owner) else {
                warn!(address = %owner, ?op, "deferred notify op on entry no longer resident");
                continue;
            };
            match op {
                DeferredOp::RemoveDependency { child } => {
                    let Some(cid) = self.id_of(child) else {
                        continue;
                    };
                    // Tolerate an already-removed edge: cascades can
                    // race the same edge from both endpoints.
                    if self.entries[id].children.contains(&cid) {
                        self.remove_dependency_ids(id, cid)?;
                    }
                }
                DeferredOp::MarkClean => self.mark_clean_id(id, false)?,
                DeferredOp::Unpin => self.unpin_id(id)?,
                DeferredOp::RemoveSelf => self.remove_entry_for_reclaim(id)?,
            }
        }
        Ok(())
    }

    /// Entry self-removal requested from a notify callback: the shadow
    /// record pattern. The entry must already be clean, unpinned,
    /// unprotected, and edge-free; its payload goes back to the client
    /// through `ClientClass::reclaim`.
    fn remove_entry_for_reclaim(&mut self, id: EntryId) -> Result<()> {
        let entry = &self.entries[id];
        let addr = entry.address;
        if entry.is_protected || entry.is_pinned() || entry.is_dirty {
            return Err(CacheError::ProtocolViolation(format!(
                "remove_self of {addr} which is still protected, pinned, or dirty"
            )));
        }
        if !entry.parents.is_empty() || !entry.children.is_empty() {
            return Err(CacheError::ProtocolViolation(format!(
                "remove_self of {addr} with live flush dependencies"
            )));
        }
        let class = Arc::clone(&entry.class);
        self.lru.remove(id);
        self.index.remove(&addr);
        let entry = self.entries.remove(id);
        self.current_size -= entry.size;
        self.ring_size[entry.ring.index()] -= entry.size;
        debug!(address = %addr, class = class.name(), "entry removed itself after dependency exhaustion");
        if let Payload::Resident(item) = entry.payload {
            class.reclaim(addr, item);
        }
        Ok(())
    }
}

fn size_overflow<E>(_: E) -> CacheError {
    CacheError::BadArgument("image size does not fit in memory".into())
}
