//! # Storage Provider Scenario Tests
//!
//! End-to-end tests of the provider contract over a real backing file:
//! round trips, space reuse, growth and its ceiling, the open-view bound,
//! defragmentation and concurrent access.
//!
//! ## Usage
//!
//! ```sh
//! cargo test --test provider_scenarios -- --nocapture
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use mapheap::config::{ARENA_HEADER_SIZE, VIEW_HEADER_SIZE};
use mapheap::storage::round_view_size;
use mapheap::{StorageProvider, StoreResult};
use tempfile::{tempdir, TempDir};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn view_size() -> usize {
    round_view_size(1)
}

fn open_store(max_open_views: usize, max_views: Option<u64>) -> (TempDir, StorageProvider) {
    let dir = tempdir().expect("Failed to create temp dir");
    let mut builder = StorageProvider::builder()
        .path(dir.path().join("cache.heap"))
        .view_size(view_size())
        .max_open_views(max_open_views)
        .without_state();
    if let Some(views) = max_views {
        builder = builder.max_size(views * view_size() as u64);
    }
    let store = builder.open().expect("Failed to open store");
    (dir, store)
}

fn sorted_entries(store: &StorageProvider) -> BTreeMap<Vec<u8>, Vec<u8>> {
    store.entries().unwrap().into_iter().collect()
}

fn item_for_fraction(store: &StorageProvider, num: usize, den: usize) -> Vec<u8> {
    let max = view_size() - VIEW_HEADER_SIZE - ARENA_HEADER_SIZE;
    let len = max * num / den;
    assert!(store.check_size(4, len));
    vec![0x5A; len]
}

// ============================================================================
// ROUND TRIP
// ============================================================================

#[test]
fn add_get_remove_round_trip() {
    let (_dir, store) = open_store(4, None);
    let value: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

    assert_eq!(store.add(b"item", &value).unwrap(), StoreResult::Success);
    assert_eq!(store.get(b"item").unwrap().unwrap(), value);

    assert_eq!(store.remove(b"item").unwrap().unwrap(), value);
    assert!(store.get(b"item").unwrap().is_none());
    assert!(!store.contains(b"item"));
}

#[test]
fn insert_overwrites_value() {
    let (_dir, store) = open_store(4, None);
    store.add(b"k", b"first").unwrap();

    assert_eq!(store.insert(b"k", b"second, longer value").unwrap(), StoreResult::Success);
    assert_eq!(store.get(b"k").unwrap().unwrap(), b"second, longer value");

    assert_eq!(store.insert(b"k", b"3").unwrap(), StoreResult::Success);
    assert_eq!(store.get(b"k").unwrap().unwrap(), b"3");
    assert_eq!(store.count(), 1);
}

#[test]
fn size_tracks_stored_items() {
    let (_dir, store) = open_store(4, None);

    store.add(b"a", &[0u8; 100]).unwrap();
    store.add(b"b", &[0u8; 50]).unwrap();
    let a = store.item_size(b"a").unwrap().unwrap();
    let b = store.item_size(b"b").unwrap().unwrap();

    assert_eq!(store.size() as usize, a + b);

    store.remove(b"a").unwrap();
    assert_eq!(store.size() as usize, store.item_size(b"b").unwrap().unwrap());
}

// ============================================================================
// SPACE REUSE
// ============================================================================

#[test]
fn freed_space_is_reused_without_growth() {
    let (_dir, store) = open_store(4, None);
    let file_size = store.file_size();

    store.add(b"a", &[1u8; 50]).unwrap();
    store.add(b"b", &[2u8; 50]).unwrap();
    store.remove(b"a").unwrap();
    assert_eq!(store.add(b"c", &[3u8; 90]).unwrap(), StoreResult::Success);

    assert_eq!(store.file_size(), file_size);
    assert_eq!(store.stats().views, 1);
    assert_eq!(store.get(b"b").unwrap().unwrap(), vec![2u8; 50]);
    assert_eq!(store.get(b"c").unwrap().unwrap(), vec![3u8; 90]);
}

#[test]
fn add_remove_cycle_restores_free_space() {
    let (_dir, store) = open_store(4, None);
    let initial = store.stats().free_space;

    for round in 0..50u32 {
        let key = round.to_le_bytes();
        store.add(&key, &vec![round as u8; 10 + round as usize * 7]).unwrap();
        store.remove(&key).unwrap();
    }

    assert_eq!(store.stats().free_space, initial);
    assert_eq!(store.stats().views, 1);
}

// ============================================================================
// CAPACITY
// ============================================================================

#[test]
fn second_large_item_needs_second_view() {
    let (_dir, capped) = open_store(4, Some(1));
    let item = item_for_fraction(&capped, 3, 5);

    assert_eq!(capped.add(b"one", &item).unwrap(), StoreResult::Success);
    assert_eq!(capped.add(b"two", &item).unwrap(), StoreResult::NotEnoughSpace);
    assert!(!capped.contains(b"two"));

    let (_dir, growing) = open_store(4, None);
    growing.add(b"one", &item).unwrap();
    assert_eq!(growing.add(b"two", &item).unwrap(), StoreResult::Success);
    assert_eq!(growing.stats().views, 2);
}

#[test]
fn item_larger_than_a_view_is_rejected() {
    let (_dir, store) = open_store(4, None);
    let value = vec![0u8; view_size()];

    assert!(!store.check_size(1, value.len()));
    assert_eq!(store.add(b"k", &value).unwrap(), StoreResult::NotEnoughSpace);
    assert_eq!(store.stats().views, 1);
}

#[test]
fn max_size_caps_file_growth() {
    let (_dir, store) = open_store(2, Some(3));
    let item = item_for_fraction(&store, 2, 5);

    let mut stored = 0;
    for i in 0..20u32 {
        match store.add(&i.to_le_bytes(), &item).unwrap() {
            StoreResult::Success => stored += 1,
            StoreResult::NotEnoughSpace => break,
            other => panic!("unexpected result {:?}", other),
        }
    }

    assert_eq!(stored, 6);
    assert_eq!(store.file_size(), 3 * view_size() as u64);
    assert_eq!(store.max_size(), Some(3 * view_size() as u64));
}

#[test]
fn empty_key_is_a_contract_error() {
    let (_dir, store) = open_store(4, None);

    assert!(store.add(b"", b"value").is_err());
    assert!(store.add(b"key", b"").is_err());
}

// ============================================================================
// OPEN VIEW BOUND
// ============================================================================

#[test]
fn open_views_stay_within_limit() {
    let (_dir, store) = open_store(2, None);
    let item = item_for_fraction(&store, 2, 5);

    for i in 0..12u32 {
        store.add(&i.to_le_bytes(), &item).unwrap();
        assert!(store.stats().open_views <= 2);
    }
    assert!(store.stats().views >= 6);

    for i in (0..12u32).rev() {
        assert_eq!(store.get(&i.to_le_bytes()).unwrap().unwrap(), item);
        assert!(store.stats().open_views <= 2);
    }
}

// ============================================================================
// ENUMERATION AND DEFRAGMENTATION
// ============================================================================

#[test]
fn enumeration_is_restartable() {
    let (_dir, store) = open_store(1, None);
    let item = item_for_fraction(&store, 1, 3);
    for i in 0..5u32 {
        store.add(&i.to_le_bytes(), &item).unwrap();
    }

    let first = store.enumerate(|entries| entries.take(2).count());
    let all = sorted_entries(&store);

    assert_eq!(first, 2);
    assert_eq!(all.len(), 5);
    assert!(all.values().all(|v| *v == item));
}

#[test]
fn defragmentation_preserves_items() {
    let (_dir, store) = open_store(2, None);
    for i in 0..200u32 {
        let len = 16 + (i as usize * 37) % 300;
        store.add(&i.to_le_bytes(), &vec![i as u8; len]).unwrap();
    }
    for i in (0..200u32).filter(|i| i % 3 != 1) {
        store.remove(&i.to_le_bytes()).unwrap();
    }
    let before = sorted_entries(&store);

    store.defragment().unwrap();

    assert_eq!(sorted_entries(&store), before);
    for (key, value) in &before {
        assert_eq!(store.get(key).unwrap().as_ref(), Some(value));
    }
}

#[test]
fn clear_reformats_all_views() {
    let (_dir, store) = open_store(1, None);
    let item = item_for_fraction(&store, 2, 5);
    for i in 0..6u32 {
        store.add(&i.to_le_bytes(), &item).unwrap();
    }
    let views = store.stats().views;

    store.clear().unwrap();

    let stats = store.stats();
    assert_eq!(stats.items, 0);
    assert_eq!(stats.views, views);
    assert!(store.entries().unwrap().is_empty());
    assert_eq!(store.add(b"again", b"ok").unwrap(), StoreResult::Success);
}

// ============================================================================
// CONCURRENCY
// ============================================================================

#[test]
fn concurrent_writers_and_readers() {
    let (_dir, store) = open_store(2, None);
    let store = Arc::new(store);

    let handles: Vec<_> = (0..4u8)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..100u8 {
                    let key = [t, i];
                    let value = vec![t ^ i; 20 + i as usize];
                    assert_eq!(store.add(&key, &value).unwrap(), StoreResult::Success);
                    assert_eq!(store.get(&key).unwrap().unwrap(), value);
                    if i % 4 == 0 {
                        store.remove(&key).unwrap();
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.count(), 4 * 75);
    for t in 0..4u8 {
        for i in (0..100u8).filter(|i| i % 4 != 0) {
            assert_eq!(store.get(&[t, i]).unwrap().unwrap(), vec![t ^ i; 20 + i as usize]);
        }
    }
}
