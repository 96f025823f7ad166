#![forbid(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
//! E2E tests for the budget lifecycle: hit-rate-driven resizing and
//! the eviction pressure it creates.
//!
//! Scenarios tested:
//! 1. A scan-heavy workload (low hit rate) grows the budget across
//!    consecutive epochs up to the configured ceiling.
//! 2. A hot-set workload (high hit rate) shrinks the budget and the
//!    shrink immediately evicts down to the new budget.
//! 3. Budget floors and ceilings hold under repeated epochs.
//! 4. Eviction under pressure prefers cold entries and keeps the
//!    working set resident.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use stratum_cache::{
    Address, CacheConfig, CacheError, ClientClass, ClientError, Item, MetadataCache, MetadataStore,
    ProtectOptions, ResizeConfig, ResizeMode,
};

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemStore {
    images: Mutex<HashMap<Address, Vec<u8>>>,
}

impl MetadataStore for MemStore {
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
        Ok(())
    }
}

#[derive(Debug)]
struct Page {
    bytes: Vec<u8>,
}

#[derive(Debug)]
struct PageClass {
    size: u64,
}

impl ClientClass for PageClass {
    fn name(&self) -> &'static str {
        "page"
    }

    fn initial_size(&self, _addr: Address) -> Result<u64, ClientError> {
        Ok(self.size)
    }

    fn deserialize(&self, _addr: Address, image: &[u8]) -> Result<Item, ClientError> {
        Ok(Box::new(Page {
            bytes: image.to_vec(),
        }))
    }

    fn image_len(&self, item: &(dyn Any + Send)) -> Result<u64, ClientError> {
        let page = item.downcast_ref::<Page>().ok_or("not a page")?;
        Ok(page.bytes.len() as u64)
    }

    fn serialize(
        &self,
        _addr: Address,
        item: &(dyn Any + Send),
        buf: &mut [u8],
    ) -> Result<(), ClientError> {
        let page = item.downcast_ref::<Page>().ok_or("not a page")?;
        buf.copy_from_slice(&page.bytes);
        Ok(())
    }
}

fn seed(cache: &MetadataCache<MemStore>, addr: Address, len: usize) {
    cache.store().images.lock().insert(addr, vec![0x11; len]);
}

fn touch(cache: &MetadataCache<MemStore>, class: &Arc<PageClass>, addr: Address) {
    let guard = cache
        .protect(addr, class.clone(), ProtectOptions::default())
        .expect("protect");
    guard.release().expect("release");
}

// ---------------------------------------------------------------------------
// Scenario 1: scan workload grows the budget
// ---------------------------------------------------------------------------

#[test]
fn scan_workload_grows_budget_to_the_ceiling() {
    let config = CacheConfig {
        max_size: 1_000,
        min_clean_fraction: 0.5,
        evictions_enabled: true,
        resize: ResizeConfig {
            incr_enabled: true,
            decr_enabled: false,
            epoch_length: 1_000_000,
            lower_hit_rate_threshold: 0.5,
            increment: 2.0,
            max_increment: None,
            min_size: 100,
            max_size: 3_000,
            ..ResizeConfig::default()
        },
    };
    let cache = MetadataCache::new(MemStore::default(), config).expect("cache");
    let class = Arc::new(PageClass { size: 100 });

    // Every epoch scans fresh addresses: all misses, hit rate 0.0.
    let mut next = 0_u64;
    for expected_budget in [2_000, 3_000, 3_000] {
        for _ in 0..8 {
            next += 1;
            seed(&cache, Address(next), 100);
            touch(&cache, &class, Address(next));
        }
        cache.run_resize_epoch().expect("epoch");
        assert_eq!(cache.max_size(), expected_budget);
    }
    // At the ceiling the controller stops reporting growth.
    assert_eq!(cache.resize_mode(), ResizeMode::Steady);
    assert_eq!(cache.stats().resizes, 2);
}

// ---------------------------------------------------------------------------
// Scenario 2: hot-set workload shrinks, and the shrink evicts
// ---------------------------------------------------------------------------

#[test]
fn hot_workload_shrinks_budget_and_evicts_down_to_it() {
    let config = CacheConfig {
        max_size: 2_000,
        min_clean_fraction: 0.5,
        evictions_enabled: true,
        resize: ResizeConfig {
            incr_enabled: false,
            decr_enabled: true,
            epoch_length: 1_000_000,
            lower_hit_rate_threshold: 0.0,
            upper_hit_rate_threshold: 0.8,
            decrement: 0.5,
            max_decrement: None,
            min_size: 500,
            max_size: 8_000,
            ..ResizeConfig::default()
        },
    };
    let cache = MetadataCache::new(MemStore::default(), config).expect("cache");
    let class = Arc::new(PageClass { size: 400 });

    // Fill to the budget with four 400-byte pages.
    for addr in (1..=4).map(Address) {
        seed(&cache, addr, 400);
        touch(&cache, &class, addr);
    }
    assert_eq!(cache.current_size(), 1_600);
    cache.run_resize_epoch().expect("discard warm-up epoch");

    // Re-protect the working set and evaluate the epoch while the
    // guards are held: three hits out of three accesses.
    let guards: Vec<_> = (2..=4)
        .map(|n| {
            cache
                .protect(Address(n), class.clone(), ProtectOptions::default())
                .expect("hit")
        })
        .collect();
    cache.run_resize_epoch().expect("shrink epoch");

    assert_eq!(cache.resize_mode(), ResizeMode::Shrinking);
    assert_eq!(cache.max_size(), 1_000);
    // The shrink evicted the one cold unprotected page on the spot.
    assert!(cache.entry_status(Address(1)).expect("query").is_none());
    assert_eq!(cache.current_size(), 1_200);

    // Releasing the guards in LRU-first order and admitting one more
    // page squeezes the rest down under the new budget.
    for guard in guards {
        guard.release().expect("release");
    }
    seed(&cache, Address(9), 400);
    touch(&cache, &class, Address(9));
    assert!(cache.current_size() <= 1_000);
    assert!(cache.entry_status(Address(4)).expect("query").is_some());
    assert!(cache.entry_status(Address(2)).expect("query").is_none());
}

// ---------------------------------------------------------------------------
// Scenario 3: bounds hold under repeated epochs
// ---------------------------------------------------------------------------

#[test]
fn growth_honors_increment_cap_and_ceiling() {
    let config = CacheConfig {
        max_size: 1_000,
        min_clean_fraction: 0.5,
        evictions_enabled: true,
        resize: ResizeConfig {
            incr_enabled: true,
            decr_enabled: false,
            epoch_length: 1_000_000,
            lower_hit_rate_threshold: 0.5,
            increment: 4.0,
            max_increment: Some(500),
            min_size: 100,
            max_size: 2_000,
            ..ResizeConfig::default()
        },
    };
    let cache = MetadataCache::new(MemStore::default(), config).expect("cache");
    let class = Arc::new(PageClass { size: 50 });

    // Misses-only epochs: the 4x factor is capped at +500 per epoch
    // and at the 2000 ceiling.
    let mut next = 0_u64;
    for expected in [1_500, 2_000, 2_000] {
        for _ in 0..4 {
            next += 1;
            seed(&cache, Address(next), 50);
            touch(&cache, &class, Address(next));
        }
        cache.run_resize_epoch().expect("epoch");
        assert_eq!(cache.max_size(), expected);
    }
    assert_eq!(cache.resize_mode(), ResizeMode::Steady);
    assert_eq!(cache.resize_epochs(), 3);
}

#[test]
fn shrink_honors_decrement_cap_and_floor() {
    let config = CacheConfig {
        max_size: 2_000,
        min_clean_fraction: 0.5,
        evictions_enabled: true,
        resize: ResizeConfig {
            incr_enabled: false,
            decr_enabled: true,
            epoch_length: 1_000_000,
            lower_hit_rate_threshold: 0.0,
            upper_hit_rate_threshold: 0.8,
            decrement: 0.5,
            max_decrement: Some(300),
            min_size: 1_500,
            max_size: 8_000,
            ..ResizeConfig::default()
        },
    };
    let cache = MetadataCache::new(MemStore::default(), config).expect("cache");
    let class = Arc::new(PageClass { size: 50 });

    // Resident hit fodder: five distinct pages per shrink epoch, with
    // guards held through the end so only protect hits count.
    let pages: Vec<Address> = (1..=15).map(Address).collect();
    for &addr in &pages {
        seed(&cache, addr, 50);
        touch(&cache, &class, addr);
    }
    cache.run_resize_epoch().expect("discard warm-up epoch");

    // Halving wants 1000 and 850; the -300 cap and the 1500 floor
    // intervene, and an epoch already at the floor stays put.
    let mut guards = Vec::new();
    for expected in [1_700, 1_500, 1_500] {
        for &addr in pages[guards.len()..guards.len() + 5].iter() {
            guards.push(
                cache
                    .protect(addr, class.clone(), ProtectOptions::default())
                    .expect("hit"),
            );
        }
        cache.run_resize_epoch().expect("epoch");
        assert_eq!(cache.max_size(), expected);
    }
    assert_eq!(cache.resize_mode(), ResizeMode::Steady);
    drop(guards);
}

// ---------------------------------------------------------------------------
// Scenario 4: cold entries leave first under pressure
// ---------------------------------------------------------------------------

#[test]
fn eviction_pressure_keeps_the_working_set() {
    let config = CacheConfig {
        max_size: 1_000,
        min_clean_fraction: 0.5,
        evictions_enabled: true,
        resize: ResizeConfig {
            incr_enabled: false,
            decr_enabled: false,
            epoch_length: 1_000_000,
            min_size: 100,
            max_size: 4_000,
            ..ResizeConfig::default()
        },
    };
    let cache = MetadataCache::new(MemStore::default(), config).expect("cache");
    let class = Arc::new(PageClass { size: 200 });

    // Working set of three pages, re-touched between cold loads.
    let hot = [Address(1), Address(2), Address(3)];
    for &addr in &hot {
        seed(&cache, addr, 200);
        touch(&cache, &class, addr);
    }
    for cold in 100..110_u64 {
        seed(&cache, Address(cold), 200);
        touch(&cache, &class, Address(cold));
        for &addr in &hot {
            touch(&cache, &class, addr);
        }
    }

    for &addr in &hot {
        assert!(
            cache.entry_status(addr).expect("query").is_some(),
            "hot page {addr} was evicted"
        );
    }
    // 5 slots under the budget: 3 hot + at most 2 cold survivors.
    assert!(cache.entry_count() <= 5);
    assert!(cache.current_size() <= 1_000);
    assert!(cache.stats().evictions >= 8);
}
