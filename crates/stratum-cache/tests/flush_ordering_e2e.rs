#![forbid(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
//! E2E tests for flush ordering.
//!
//! Scenarios tested:
//! 1. Global flush writes rings outermost to innermost.
//! 2. Within a ring, flush-dependency children are written before
//!    their parents, across multiple passes for deep chains.
//! 3. A dependency wired against the ring order stalls the flush with
//!    a fatal error instead of writing out of order.
//! 4. Corked entries are skipped by a normal flush and picked up after
//!    uncork; shutdown ignores corks.
//! 5. Flushing while any entry is protected fails before any write.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use stratum_cache::{
    Address, CacheConfig, CacheError, ClientClass, ClientError, InsertOptions, Item, MetadataCache,
    MetadataStore, ProtectOptions, ResizeConfig, Ring, Tag,
};

// ---------------------------------------------------------------------------
// In-memory store that records write order
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct OrderedStore {
    images: Mutex<HashMap<Address, Vec<u8>>>,
    write_order: Mutex<Vec<Address>>,
}

impl OrderedStore {
    fn seed(&self, addr: Address, len: usize) {
        self.images.lock().insert(addr, vec![0x5A; len]);
    }

    fn write_order(&self) -> Vec<Address> {
        self.write_order.lock().clone()
    }

    fn position(&self, addr: Address) -> usize {
        self.write_order()
            .iter()
            .position(|&a| a == addr)
            .unwrap_or_else(|| panic!("{addr} was never written"))
    }
}

impl MetadataStore for OrderedStore {
    fn read_image(&self, addr: Address, buf: &mut [u8]) -> Result<(), CacheError> {
        let images = self.images.lock();
        let bytes = images
            .get(&addr)
            .ok_or_else(|| CacheError::NotFound(format!("no image at {addr}")))?;
        let n = buf.len().min(bytes.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        buf[n..].fill(0);
        Ok(())
    }

    fn write_image(&self, addr: Address, image: &[u8]) -> Result<(), CacheError> {
        self.images.lock().insert(addr, image.to_vec());
        self.write_order.lock().push(addr);
        Ok(())
    }
}

#[derive(Debug)]
struct Record {
    bytes: Vec<u8>,
}

#[derive(Debug)]
struct RecordClass {
    size: u64,
}

impl ClientClass for RecordClass {
    fn name(&self) -> &'static str {
        "record"
    }

    fn initial_size(&self, _addr: Address) -> Result<u64, ClientError> {
        Ok(self.size)
    }

    fn deserialize(&self, _addr: Address, image: &[u8]) -> Result<Item, ClientError> {
        Ok(Box::new(Record {
            bytes: image.to_vec(),
        }))
    }

    fn image_len(&self, item: &(dyn Any + Send)) -> Result<u64, ClientError> {
        let record = item.downcast_ref::<Record>().ok_or("not a record")?;
        Ok(record.bytes.len() as u64)
    }

    fn serialize(
        &self,
        _addr: Address,
        item: &(dyn Any + Send),
        buf: &mut [u8],
    ) -> Result<(), ClientError> {
        let record = item.downcast_ref::<Record>().ok_or("not a record")?;
        buf.copy_from_slice(&record.bytes);
        Ok(())
    }
}

fn quiet_config() -> CacheConfig {
    CacheConfig {
        max_size: 1 << 20,
        min_clean_fraction: 0.5,
        evictions_enabled: true,
        resize: ResizeConfig {
            incr_enabled: false,
            decr_enabled: false,
            epoch_length: 1_000_000,
            min_size: 1,
            max_size: 1 << 26,
            ..ResizeConfig::default()
        },
    }
}

fn new_cache() -> MetadataCache<OrderedStore> {
    MetadataCache::new(OrderedStore::default(), quiet_config()).expect("cache")
}

/// Load `addr` into `ring`, mark it dirty, and release.
fn load_dirty(cache: &MetadataCache<OrderedStore>, addr: Address, ring: Ring) {
    cache.store().seed(addr, 64);
    let mut guard = cache
        .protect(
            addr,
            Arc::new(RecordClass { size: 64 }),
            ProtectOptions {
                ring,
                ..ProtectOptions::default()
            },
        )
        .expect("protect");
    guard.mark_dirty().expect("mark dirty");
    guard.release().expect("release");
}

// ---------------------------------------------------------------------------
// Scenario 1: ring order
// ---------------------------------------------------------------------------

#[test]
fn flush_writes_rings_outermost_first() {
    let cache = new_cache();
    // Dirty one entry per ring, loaded in reverse ring order so write
    // order cannot accidentally follow access order.
    let plan = [
        (Address(0x500), Ring::Superblock),
        (Address(0x400), Ring::SuperblockExt),
        (Address(0x300), Ring::MetaFreeSpace),
        (Address(0x200), Ring::RawFreeSpace),
        (Address(0x100), Ring::User),
    ];
    for &(addr, ring) in &plan {
        load_dirty(&cache, addr, ring);
    }

    cache.flush().expect("flush");
    assert!(cache.cache_is_clean(Ring::Superblock));

    let order = cache.store().write_order();
    assert_eq!(order.len(), 5);
    assert!(cache.store().position(Address(0x100)) < cache.store().position(Address(0x200)));
    assert!(cache.store().position(Address(0x200)) < cache.store().position(Address(0x300)));
    assert!(cache.store().position(Address(0x300)) < cache.store().position(Address(0x400)));
    assert!(cache.store().position(Address(0x400)) < cache.store().position(Address(0x500)));
}

// ---------------------------------------------------------------------------
// Scenario 2: dependency order within a ring
// ---------------------------------------------------------------------------

#[test]
fn children_are_written_before_parents() {
    let cache = new_cache();
    // Chain a -> b -> c -> d (a depends on b, and so on), all in the
    // same ring, all dirty. Deep chains force multiple flush passes.
    let chain = [Address(1), Address(2), Address(3), Address(4)];
    for &addr in &chain {
        load_dirty(&cache, addr, Ring::User);
    }
    for pair in chain.windows(2) {
        cache
            .add_flush_dependency(pair[0], pair[1])
            .expect("add dependency");
    }

    cache.flush().expect("flush");

    // d first, a last.
    for pair in chain.windows(2) {
        assert!(
            cache.store().position(pair[1]) < cache.store().position(pair[0]),
            "{} must be written before {}",
            pair[1],
            pair[0]
        );
    }

    // A second flush with nothing dirty writes nothing.
    cache.flush().expect("idempotent flush");
    assert_eq!(cache.store().write_order().len(), 4);
}

#[test]
fn diamond_dependencies_flush_shared_child_first() {
    let cache = new_cache();
    // p1 and p2 both depend on the shared child c.
    for &addr in &[Address(10), Address(11), Address(12)] {
        load_dirty(&cache, addr, Ring::RawFreeSpace);
    }
    cache.add_flush_dependency(Address(10), Address(12)).expect("p1 -> c");
    cache.add_flush_dependency(Address(11), Address(12)).expect("p2 -> c");

    cache.flush().expect("flush");
    assert!(cache.store().position(Address(12)) < cache.store().position(Address(10)));
    assert!(cache.store().position(Address(12)) < cache.store().position(Address(11)));
}

// ---------------------------------------------------------------------------
// Scenario 3: cross-ring stall
// ---------------------------------------------------------------------------

#[test]
fn dependency_against_ring_order_stalls_the_flush() {
    let cache = new_cache();
    // The parent sits in the outer ring, its child in an inner ring.
    // Ring order wants the parent first; the dependency wants the
    // child first. Nothing can be written.
    load_dirty(&cache, Address(1), Ring::User);
    load_dirty(&cache, Address(2), Ring::Superblock);
    cache
        .add_flush_dependency(Address(1), Address(2))
        .expect("outer parent on inner child");

    let err = cache.flush().expect_err("flush must stall");
    assert!(matches!(err, CacheError::ProtocolViolation(_)));
    assert!(err.is_fatal());
    assert!(cache.store().write_order().is_empty());
    // Both entries are still resident and dirty.
    assert!(!cache.cache_is_clean(Ring::Superblock));
}

// ---------------------------------------------------------------------------
// Scenario 4: cork interaction
// ---------------------------------------------------------------------------

#[test]
fn corked_entries_skip_flush_until_uncorked() {
    let cache = new_cache();
    let tag = Tag(42);
    cache.store().seed(Address(1), 64);
    let mut guard = cache
        .protect(
            Address(1),
            Arc::new(RecordClass { size: 64 }),
            ProtectOptions {
                tag: Some(tag),
                ..ProtectOptions::default()
            },
        )
        .expect("protect");
    guard.mark_dirty().expect("dirty");
    guard.release().expect("release");
    load_dirty(&cache, Address(2), Ring::User);

    cache.cork(tag).expect("cork");
    cache.flush().expect("flush skips corked");
    assert_eq!(cache.store().write_order(), vec![Address(2)]);
    assert!(!cache.cache_is_clean(Ring::Superblock));

    cache.uncork(tag).expect("uncork");
    cache.flush().expect("flush after uncork");
    assert_eq!(cache.store().write_order(), vec![Address(2), Address(1)]);
    assert!(cache.cache_is_clean(Ring::Superblock));
}

#[test]
fn shutdown_flushes_through_corks() {
    let tag = Tag(7);
    // A shared handle so the store outlives the consumed cache.
    let store = Arc::new(OrderedStore::default());
    let cache = MetadataCache::new(SharedStore(Arc::clone(&store)), quiet_config()).expect("cache");
    store.seed(Address(9), 64);
    let mut guard = cache
        .protect(
            Address(9),
            Arc::new(RecordClass { size: 64 }),
            ProtectOptions {
                tag: Some(tag),
                ..ProtectOptions::default()
            },
        )
        .expect("protect");
    guard.mark_dirty().expect("dirty");
    guard.release().expect("release");
    cache.cork(tag).expect("cork");

    cache.flush_and_destroy().expect("destroy");
    assert_eq!(store.write_order(), vec![Address(9)]);
}

/// Store wrapper so teardown tests can keep the store after the cache
/// is consumed.
#[derive(Debug)]
struct SharedStore(Arc<OrderedStore>);

impl MetadataStore for SharedStore {
    fn read_image(&self, addr: Address, buf: &mut [u8]) -> Result<(), CacheError> {
        self.0.read_image(addr, buf)
    }

    fn write_image(&self, addr: Address, image: &[u8]) -> Result<(), CacheError> {
        self.0.write_image(addr, image)
    }
}

// ---------------------------------------------------------------------------
// Scenario 5: protected entries block the flush
// ---------------------------------------------------------------------------

#[test]
fn flush_with_a_protected_entry_fails_before_writing() {
    let cache = new_cache();
    load_dirty(&cache, Address(1), Ring::User);
    cache.store().seed(Address(2), 64);
    let _guard = cache
        .protect(
            Address(2),
            Arc::new(RecordClass { size: 64 }),
            ProtectOptions::default(),
        )
        .expect("protect");

    let err = cache.flush().expect_err("flush while protected");
    assert!(matches!(err, CacheError::ProtocolViolation(_)));
    assert!(cache.store().write_order().is_empty());
}

// ---------------------------------------------------------------------------
// Inserted entries participate like loaded ones
// ---------------------------------------------------------------------------

#[test]
fn inserted_entries_flush_in_dependency_order() {
    let cache = new_cache();
    cache
        .insert(
            Address(1),
            Arc::new(RecordClass { size: 64 }),
            Box::new(Record {
                bytes: vec![1; 64],
            }),
            InsertOptions::default(),
        )
        .expect("insert parent");
    cache
        .insert(
            Address(2),
            Arc::new(RecordClass { size: 64 }),
            Box::new(Record {
                bytes: vec![2; 64],
            }),
            InsertOptions::default(),
        )
        .expect("insert child");
    cache.add_flush_dependency(Address(1), Address(2)).expect("edge");

    cache.flush().expect("flush");
    assert_eq!(cache.store().write_order(), vec![Address(2), Address(1)]);
    assert_eq!(cache.store().images.lock()[&Address(2)], vec![2; 64]);
}
