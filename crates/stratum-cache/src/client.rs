//! Client-side contracts: the backing store seam and the per-type
//! capability set each metadata kind registers with the cache.
//!
//! The cache never interprets record bytes itself. On a miss it asks the
//! entry's [`ClientClass`] how many bytes to read, reads them through the
//! [`MetadataStore`], and hands them back to the class to deserialize; on
//! flush it asks the class to serialize and writes the image back out.
//! Every callback returns the client's own error type boxed, which the
//! cache surfaces verbatim inside [`CacheError::Callback`].
//!
//! [`CacheError::Callback`]: stratum_error::CacheError::Callback

use std::any::Any;
use std::fmt;

use stratum_error::{ClientError, Result};
use stratum_types::Address;

/// In-core representation of one metadata record, type-erased.
///
/// Each [`ClientClass`] deserializes into its own concrete type and
/// downcasts on the way back. Freeing the in-core representation is the
/// box's `Drop` impl.
pub type Item = Box<dyn Any + Send>;

/// Byte-addressed backing store for serialized metadata images.
///
/// This is the cache's only I/O seam. File-driver selection, transport,
/// and on-disk layout all live behind it. Calls are synchronous and
/// non-cancellable; a store that never returns stalls the cache.
///
/// A store signals a nonexistent address from `read_image` with
/// `CacheError::NotFound`, which the cache propagates from `protect`.
pub trait MetadataStore: Send + Sync {
    /// Read exactly `buf.len()` bytes of serialized image at `addr`.
    fn read_image(&self, addr: Address, buf: &mut [u8]) -> Result<()>;

    /// Write a serialized image at `addr`.
    fn write_image(&self, addr: Address, image: &[u8]) -> Result<()>;
}

/// Structural event delivered to a [`ClientClass::notify`] callback.
///
/// `Child*` actions are delivered to flush-dependency parents when the
/// named child changes state; the remaining actions are delivered to the
/// entry itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyAction {
    /// The entry was explicitly inserted into the cache.
    AfterInsert,
    /// The entry was materialized by a miss-load.
    AfterLoad,
    /// The entry's image was written out and it is now clean.
    AfterFlush,
    /// The entry transitioned clean to dirty.
    EntryDirtied,
    /// The entry was marked clean without a flush.
    EntryCleaned,
    /// The entry is about to be evicted.
    BeforeEvict,
    /// A flush-dependency child transitioned dirty to clean.
    ChildCleaned,
    /// A flush-dependency child is about to be evicted.
    ChildBeforeEvict,
    /// A flush-dependency child's on-disk image became current.
    ChildSerialized,
    /// A flush-dependency child's on-disk image became stale.
    ChildUnserialized,
    /// A flush-dependency child transitioned clean to dirty.
    ChildDirtied,
}

/// Context handed to [`ClientClass::notify`].
pub struct NotifyEvent<'a> {
    /// What happened.
    pub action: NotifyAction,
    /// Address of the entry being notified.
    pub address: Address,
    /// Address of the child, for `Child*` actions.
    pub child: Option<Address>,
    /// Current flush-dependency child count of the notified entry,
    /// before any operation queued on the [`NotifyOps`] sink is applied.
    pub flush_dep_children: usize,
    /// The entry's in-core representation, when resident. `None` while
    /// the entry is checked out through a protect guard.
    pub item: Option<&'a mut (dyn Any + Send)>,
}

impl fmt::Debug for NotifyEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyEvent")
            .field("action", &self.action)
            .field("address", &self.address)
            .field("child", &self.child)
            .field("flush_dep_children", &self.flush_dep_children)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeferredOp {
    RemoveDependency { child: Address },
    MarkClean,
    Unpin,
    RemoveSelf,
}

/// Sink for structural reactions queued by a notify callback.
///
/// Notify callbacks may not reenter the cache, so reactions are queued
/// here and applied by the cache after the callback returns, in queue
/// order. Applying an operation can trigger further notifications
/// (cascading cleanup); the dependency graph is acyclic, so the cascade
/// terminates.
///
/// The canonical user is a shadow record holding freed-space bookkeeping:
/// on `ChildCleaned` or `ChildBeforeEvict` it queues
/// `remove_dependency(child)`, and when `flush_dep_children` was 1 (the
/// cascade leaves it childless) it additionally queues `mark_clean`,
/// `unpin`, and `remove_self`, handing its payload back to the owning
/// subsystem through [`ClientClass::reclaim`].
#[derive(Debug, Default)]
pub struct NotifyOps {
    pub(crate) ops: Vec<DeferredOp>,
}

impl NotifyOps {
    /// Drop the flush dependency from the notified entry to `child`.
    pub fn remove_dependency(&mut self, child: Address) {
        self.ops.push(DeferredOp::RemoveDependency { child });
    }

    /// Mark the notified entry clean.
    pub fn mark_clean(&mut self) {
        self.ops.push(DeferredOp::MarkClean);
    }

    /// Drop one pin reference from the notified entry.
    pub fn unpin(&mut self) {
        self.ops.push(DeferredOp::Unpin);
    }

    /// Remove the notified entry from the cache entirely, passing its
    /// payload to [`ClientClass::reclaim`]. The entry must be clean,
    /// unpinned, and unprotected by the time this op is applied.
    pub fn remove_self(&mut self) {
        self.ops.push(DeferredOp::RemoveSelf);
    }
}

/// Per-type capability set. One implementation per metadata kind.
///
/// The cache drives the miss-load protocol as: [`initial_size`] →
/// read → [`actual_size`] (re-read if the speculative size was wrong) →
/// [`verify_checksum`] → [`deserialize`]. Flush drives
/// [`pre_serialize`] → [`image_len`] → [`serialize`] → write.
///
/// All callbacks return the client's own boxed error on failure; the
/// cache wraps it in `CacheError::Callback` naming the callback and
/// rolls back to the pre-call state where possible (a failed load never
/// inserts a partial entry).
///
/// [`initial_size`]: ClientClass::initial_size
/// [`actual_size`]: ClientClass::actual_size
/// [`verify_checksum`]: ClientClass::verify_checksum
/// [`deserialize`]: ClientClass::deserialize
/// [`pre_serialize`]: ClientClass::pre_serialize
/// [`image_len`]: ClientClass::image_len
/// [`serialize`]: ClientClass::serialize
pub trait ClientClass: Send + Sync + fmt::Debug {
    /// Short human-readable type name, used in diagnostics.
    fn name(&self) -> &'static str;

    /// Number of bytes to read for the first (possibly speculative)
    /// load of the record at `addr`. Must be nonzero.
    fn initial_size(&self, addr: Address) -> std::result::Result<u64, ClientError>;

    /// Inspect a speculatively loaded prefix and report the true image
    /// length, or `None` if the initial size was already exact. The
    /// cache re-reads with the corrected length before deserializing.
    fn actual_size(
        &self,
        _addr: Address,
        _image: &[u8],
    ) -> std::result::Result<Option<u64>, ClientError> {
        Ok(None)
    }

    /// Validate the integrity of a full image before deserializing.
    fn verify_checksum(&self, _addr: Address, _image: &[u8]) -> std::result::Result<(), ClientError> {
        Ok(())
    }

    /// Build the in-core representation from a full image.
    fn deserialize(&self, addr: Address, image: &[u8]) -> std::result::Result<Item, ClientError>;

    /// Current serialized length of the in-core representation.
    /// Variable-length records may report a different length than the
    /// one they were loaded with.
    fn image_len(&self, item: &(dyn Any + Send)) -> std::result::Result<u64, ClientError>;

    /// Hook run before `image_len`/`serialize` during a flush, for
    /// records that need to settle internal layout first.
    fn pre_serialize(
        &self,
        _addr: Address,
        _item: &mut (dyn Any + Send),
    ) -> std::result::Result<(), ClientError> {
        Ok(())
    }

    /// Write the serialized image into `buf`, whose length is the value
    /// `image_len` just returned.
    fn serialize(
        &self,
        addr: Address,
        item: &(dyn Any + Send),
        buf: &mut [u8],
    ) -> std::result::Result<(), ClientError>;

    /// React to a structural event. Reactions that would reenter the
    /// cache go through `ops`; see [`NotifyOps`].
    fn notify(
        &self,
        _event: NotifyEvent<'_>,
        _ops: &mut NotifyOps,
    ) -> std::result::Result<(), ClientError> {
        Ok(())
    }

    /// Bytes the free-space manager should account for this record.
    /// Defaults to the serialized image length.
    fn free_space_size(&self, item: &(dyn Any + Send)) -> std::result::Result<u64, ClientError> {
        self.image_len(item)
    }

    /// Take ownership of the payload of an entry that removed itself
    /// via [`NotifyOps::remove_self`]. Default drops it.
    fn reclaim(&self, _addr: Address, _item: Item) {}
}

/// How a protect checkout will be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// Caller may mutate the entry and mark it dirty.
    #[default]
    ReadWrite,
    /// Caller promises not to mutate; `mark_dirty` is rejected. The
    /// checkout is still exclusive.
    ReadOnly,
}

/// Placement and mode options for `protect`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtectOptions {
    /// Consistency ring assigned on a miss-load. A hit validates that
    /// the resident entry already lives in this ring.
    pub ring: stratum_types::Ring,
    /// Cork tag assigned on a miss-load.
    pub tag: Option<stratum_types::Tag>,
    /// Checkout mode.
    pub mode: AccessMode,
}

/// Placement options for an explicit `insert`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertOptions {
    /// Consistency ring for the new entry.
    pub ring: stratum_types::Ring,
    /// Cork tag for the new entry.
    pub tag: Option<stratum_types::Tag>,
    /// Insert the entry already holding one pin reference.
    pub pinned: bool,
}

/// Convenience: wrap a client error from the named callback.
pub(crate) fn wrap<T>(
    during: &'static str,
    result: std::result::Result<T, ClientError>,
) -> Result<T> {
    result.map_err(|source| stratum_error::CacheError::callback(during, source))
}
