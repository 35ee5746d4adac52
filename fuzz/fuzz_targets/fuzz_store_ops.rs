//! Fuzz testing for store operations.
//!
//! Replays arbitrary add/insert/remove/defragment sequences against a small
//! store and a `HashMap` model, checking after every step that the store
//! returns exactly what the model holds.

#![no_main]

use std::collections::HashMap;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use mapheap::{StorageProvider, StoreResult};

#[derive(Debug, Arbitrary)]
enum Op {
    Add { key: u8, len: u16, fill: u8 },
    Insert { key: u8, len: u16, fill: u8 },
    Remove { key: u8 },
    Get { key: u8 },
    Defragment,
}

fuzz_target!(|ops: Vec<Op>| {
    let dir = tempfile::tempdir().unwrap();
    let store = StorageProvider::builder()
        .path(dir.path().join("fuzz.heap"))
        .view_size(1)
        .max_open_views(2)
        .max_size(64 * 1024 * 1024)
        .without_state()
        .open()
        .unwrap();
    let mut model: HashMap<u8, Vec<u8>> = HashMap::new();

    for op in ops.into_iter().take(512) {
        match op {
            Op::Add { key, len, fill } => {
                let value = vec![fill; (len as usize % 3000) + 1];
                match store.add(&[key], &value).unwrap() {
                    StoreResult::Success => {
                        assert!(!model.contains_key(&key));
                        model.insert(key, value);
                    }
                    StoreResult::KeyExists => assert!(model.contains_key(&key)),
                    StoreResult::NotEnoughSpace => {}
                    StoreResult::KeyNotFound => unreachable!(),
                }
            }
            Op::Insert { key, len, fill } => {
                let value = vec![fill; (len as usize % 3000) + 1];
                match store.insert(&[key], &value).unwrap() {
                    StoreResult::Success => {
                        model.insert(key, value);
                    }
                    _ => {
                        model.remove(&key);
                    }
                }
            }
            Op::Remove { key } => {
                assert_eq!(store.remove(&[key]).unwrap(), model.remove(&key));
            }
            Op::Get { key } => {
                assert_eq!(store.get(&[key]).unwrap().as_ref(), model.get(&key));
            }
            Op::Defragment => store.defragment().unwrap(),
        }
        assert_eq!(store.count(), model.len());
    }

    for (key, value) in &model {
        assert_eq!(store.get(&[*key]).unwrap().as_ref(), Some(value));
    }
});
