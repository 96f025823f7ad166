#![forbid(unsafe_code)]
//! Metadata cache engine for the Stratum hierarchical file format.
//!
//! The cache sits between the on-disk object store and every structure
//! built on top of it: index arrays, free-space managers, object
//! headers. It hands out fast, exclusively-checked-out access to
//! in-memory representations of metadata records keyed by file address,
//! and guarantees that
//!
//! - no entry is written out before its flush-dependency children,
//! - no entry in an inner consistency ring is written while an outer
//!   ring is dirty,
//! - no entry is evicted while protected, pinned, or depended upon,
//! - resident bytes stay within a budget a feedback controller adjusts
//!   from the observed hit rate.
//!
//! # Checkout discipline
//!
//! [`MetadataCache::protect`] returns a [`ProtectGuard`] that owns the
//! entry's in-core representation for the duration of the checkout;
//! dropping the guard returns it. Forgetting to unprotect is therefore
//! not expressible. Pinning — a residency hold independent of checkout
//! — is a counted reference adjusted through [`MetadataCache::pin`] /
//! [`MetadataCache::unpin_entry`] or the guard's pin-on-release flag.
//!
//! # Threading
//!
//! One logical owner drives protect/unprotect/flush. Interior state
//! sits behind a mutex so guards can release from wherever they are
//! dropped, but the engine performs no internal cross-thread
//! coordination; the [`MetadataCache::set_aux`] slot exists purely as a
//! hand-off point for an external coordination layer.
//!
//! # Client model
//!
//! Each metadata kind registers a [`ClientClass`]: size estimation,
//! checksum verification, deserialize/serialize, and structural
//! notifications. The cache treats records as opaque boxes; on-disk
//! layout belongs entirely to the client. See [`client`] for the load
//! and flush protocols and the deferred-op notification contract.

mod client;
mod config;
mod deps;
mod entry;
mod evict;
mod flush;
mod lru;
mod resize;
mod state;
mod stats;

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

pub use client::{
    AccessMode, ClientClass, InsertOptions, Item, MetadataStore, NotifyAction, NotifyEvent,
    NotifyOps, ProtectOptions,
};
pub use config::{CacheConfig, ResizeConfig};
pub use entry::EntryStatus;
pub use resize::ResizeMode;
pub use stats::CacheStats;
pub use stratum_error::{CacheError, ClientError, Result};
pub use stratum_types::{Address, Generation, Ring, Tag, RING_COUNT};

use state::{CacheState, ImageInfo};

/// The metadata cache engine.
///
/// Generic over the backing [`MetadataStore`], the way the block layer
/// wraps a device. Construction validates the configuration; teardown
/// goes through [`MetadataCache::flush_and_destroy`].
pub struct MetadataCache<S: MetadataStore> {
    store: S,
    state: Mutex<CacheState>,
    aux: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl<S: MetadataStore> MetadataCache<S> {
    pub fn new(store: S, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            state: Mutex::new(CacheState::new(config)),
            aux: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    // ── Checkout ───────────────────────────────────────────────────

    /// Check the entry at `addr` out exclusively, materializing it
    /// through `class` on a miss.
    ///
    /// Fails with `NotFound` if the store has no image at `addr`,
    /// `ProtocolViolation` on a double protect or a ring mismatch, and
    /// `Callback` if any client callback fails (in which case no
    /// partial entry remains).
    pub fn protect(
        &self,
        addr: Address,
        class: Arc<dyn ClientClass>,
        opts: ProtectOptions,
    ) -> Result<ProtectGuard<'_, S>> {
        let item = self.state.lock().protect(&self.store, addr, &class, opts)?;
        Ok(ProtectGuard {
            cache: self,
            address: addr,
            mode: opts.mode,
            item: Some(item),
            dirtied: false,
            pin_on_release: false,
        })
    }

    fn finish_unprotect(
        &self,
        addr: Address,
        item: Item,
        dirtied: bool,
        pin_on_release: bool,
    ) -> Result<()> {
        self.state
            .lock()
            .unprotect(&self.store, addr, item, dirtied, pin_on_release)
    }

    // ── Explicit lifecycle ─────────────────────────────────────────

    /// Insert a freshly built record at `addr`. The entry enters the
    /// cache dirty (it has no on-disk image yet) and optionally pinned.
    pub fn insert(
        &self,
        addr: Address,
        class: Arc<dyn ClientClass>,
        item: Item,
        opts: InsertOptions,
    ) -> Result<()> {
        self.state.lock().insert(&self.store, addr, class, item, opts)
    }

    /// Remove the entry at `addr`, transferring its payload to the
    /// caller. Fails on protected, pinned, or dependency-entangled
    /// entries.
    pub fn remove(&self, addr: Address) -> Result<Item> {
        self.state.lock().remove(addr)
    }

    // ── Pinning ────────────────────────────────────────────────────

    /// Take a counted residency hold on the entry at `addr`, released
    /// when the returned guard drops. The entry must currently be
    /// protected or already pinned.
    pub fn pin(&self, addr: Address) -> Result<PinGuard<'_, S>> {
        self.state.lock().pin(addr)?;
        Ok(PinGuard {
            cache: self,
            address: addr,
            armed: true,
        })
    }

    /// Raw counted pin, balanced by [`MetadataCache::unpin_entry`].
    /// Prefer [`MetadataCache::pin`] where a scope exists.
    pub fn pin_entry(&self, addr: Address) -> Result<()> {
        self.state.lock().pin(addr)
    }

    /// Drop one pin reference; at zero the entry rejoins the LRU list
    /// (if unprotected) and becomes evictable again.
    pub fn unpin_entry(&self, addr: Address) -> Result<()> {
        self.state.lock().unpin(addr)
    }

    // ── Dirty state ────────────────────────────────────────────────

    /// Mark the entry at `addr` dirty. Legal only while the entry is
    /// protected or pinned.
    pub fn mark_dirty(&self, addr: Address) -> Result<()> {
        self.state.lock().mark_dirty(addr)
    }

    /// Mark the entry at `addr` clean without writing it. Legal only
    /// while the entry is protected or pinned.
    pub fn mark_clean(&self, addr: Address) -> Result<()> {
        self.state.lock().mark_clean(addr)
    }

    // ── Cork ───────────────────────────────────────────────────────

    /// Suppress eviction and flush for every entry tagged `tag`.
    pub fn cork(&self, tag: Tag) -> Result<()> {
        self.state.lock().cork(tag)
    }

    /// Lift the suppression for `tag`.
    pub fn uncork(&self, tag: Tag) -> Result<()> {
        self.state.lock().uncork(tag)
    }

    // ── Flush dependencies ─────────────────────────────────────────

    /// Declare that `child` must flush or evict before `parent` is
    /// considered complete. Rejects self-edges, duplicates, and edges
    /// that would close a cycle, leaving the graph unchanged.
    pub fn add_flush_dependency(&self, parent: Address, child: Address) -> Result<()> {
        if !parent.is_defined() || !child.is_defined() {
            return Err(CacheError::BadArgument(
                "flush dependency on undefined address".into(),
            ));
        }
        self.state.lock().add_dependency(parent, child)
    }

    /// Remove a previously declared dependency edge.
    pub fn remove_flush_dependency(&self, parent: Address, child: Address) -> Result<()> {
        self.state.lock().remove_dependency(parent, child)
    }

    // ── Flush / shutdown ───────────────────────────────────────────

    /// Write every dirty, uncorked entry out, outer rings before inner,
    /// children before parents. Fails if any entry is protected or if
    /// dependencies stall a ring.
    pub fn flush(&self) -> Result<()> {
        self.state.lock().flush_all(&self.store, false)
    }

    /// Flush everything (corks ignored) and destroy the cache.
    pub fn flush_and_destroy(self) -> Result<()> {
        let mut state = self.state.into_inner();
        state.flush_and_destroy(&self.store)
    }

    // ── Policy controls ────────────────────────────────────────────

    /// Evaluate a resize epoch now instead of waiting for the access
    /// cadence.
    pub fn run_resize_epoch(&self) -> Result<()> {
        self.state.lock().run_resize_epoch(&self.store)
    }

    /// Switch eviction off (or back on). While off, the cache may grow
    /// past its budget; resize accounting still proceeds.
    pub fn set_evictions_enabled(&self, enabled: bool) {
        self.state.lock().evictions_enabled = enabled;
    }

    /// Replace the automatic resize configuration. The current budget
    /// is clamped into the new bounds and excess entries are evicted.
    pub fn set_resize_config(&self, config: ResizeConfig) -> Result<()> {
        config.validate()?;
        let mut state = self.state.lock();
        state.config.resize = config;
        state.max_size = state.max_size.clamp(config.min_size, config.max_size);
        state.make_space(&self.store, 0)
    }

    /// Record where a serialized snapshot of cache state lives in the
    /// file, for the load-on-open path.
    pub fn set_image_info(&self, addr: Address, len: u64) -> Result<()> {
        if !addr.is_defined() {
            return Err(CacheError::BadArgument(
                "cache image at undefined address".into(),
            ));
        }
        if len == 0 {
            return Err(CacheError::BadArgument("cache image of zero length".into()));
        }
        self.state.lock().image_info = Some(ImageInfo { address: addr, len });
        Ok(())
    }

    // ── Auxiliary hand-off slot ────────────────────────────────────

    /// Park an external coordination object on the cache. The cache
    /// never touches it.
    pub fn set_aux(&self, aux: Arc<dyn Any + Send + Sync>) {
        *self.aux.lock() = Some(aux);
    }

    #[must_use]
    pub fn aux(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.aux.lock().clone()
    }

    pub fn take_aux(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.aux.lock().take()
    }
}

impl<S: MetadataStore> std::fmt::Debug for MetadataCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MetadataCache")
            .field("entries", &state.index.len())
            .field("replaceable", &state.lru.len())
            .field("current_size", &state.current_size)
            .field("max_size", &state.max_size)
            .finish_non_exhaustive()
    }
}

/// Exclusive checkout of one cache entry.
///
/// Owns the entry's in-core representation until released; dropping the
/// guard unprotects (failures on the drop path are logged, use
/// [`ProtectGuard::release`] to observe them). Dirtiness declared
/// through [`ProtectGuard::mark_dirty`] takes effect at release time,
/// together with any pin-on-release request.
pub struct ProtectGuard<'c, S: MetadataStore> {
    cache: &'c MetadataCache<S>,
    address: Address,
    mode: AccessMode,
    item: Option<Item>,
    dirtied: bool,
    pin_on_release: bool,
}

impl<S: MetadataStore> ProtectGuard<'_, S> {
    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    #[must_use]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Borrow the record as `T`; `None` if the payload is a different
    /// type.
    #[must_use]
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.item.as_deref().and_then(|i| i.downcast_ref::<T>())
    }

    /// Mutably borrow the record as `T`. `None` for read-only
    /// checkouts or a different payload type. Mutation does not imply
    /// dirtiness; declare it with [`ProtectGuard::mark_dirty`].
    #[must_use]
    pub fn get_mut<T: 'static>(&mut self) -> Option<&mut T> {
        if self.mode == AccessMode::ReadOnly {
            return None;
        }
        self.item.as_deref_mut().and_then(|i| i.downcast_mut::<T>())
    }

    /// Declare that the record was modified; applied at release.
    pub fn mark_dirty(&mut self) -> Result<()> {
        if self.mode == AccessMode::ReadOnly {
            return Err(CacheError::ProtocolViolation(format!(
                "mark_dirty through a read-only checkout of {}",
                self.address
            )));
        }
        self.dirtied = true;
        Ok(())
    }

    /// Add one pin reference when the checkout releases, instead of
    /// returning the entry to the LRU list.
    pub fn pin_on_release(&mut self) {
        self.pin_on_release = true;
    }

    /// Release the checkout, surfacing any unprotect failure.
    pub fn release(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        let Some(item) = self.item.take() else {
            return Ok(());
        };
        self.cache
            .finish_unprotect(self.address, item, self.dirtied, self.pin_on_release)
    }
}

impl<S: MetadataStore> Drop for ProtectGuard<'_, S> {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            warn!(address = %self.address, %err, "unprotect on guard drop failed");
        }
    }
}

impl<S: MetadataStore> std::fmt::Debug for ProtectGuard<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectGuard")
            .field("address", &self.address)
            .field("mode", &self.mode)
            .field("dirtied", &self.dirtied)
            .finish_non_exhaustive()
    }
}

/// Counted residency hold on one cache entry.
///
/// While any pin guard (or raw pin reference) is outstanding the entry
/// stays out of the LRU list and cannot be evicted, though it remains
/// flushable. Dropping the guard releases the reference.
pub struct PinGuard<'c, S: MetadataStore> {
    cache: &'c MetadataCache<S>,
    address: Address,
    armed: bool,
}

impl<S: MetadataStore> PinGuard<'_, S> {
    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// Release the pin, surfacing any failure.
    pub fn release(mut self) -> Result<()> {
        self.armed = false;
        self.cache.unpin_entry(self.address)
    }
}

impl<S: MetadataStore> Drop for PinGuard<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.cache.unpin_entry(self.address) {
                warn!(address = %self.address, %err, "unpin on guard drop failed");
            }
        }
    }
}

impl<S: MetadataStore> std::fmt::Debug for PinGuard<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinGuard")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}
