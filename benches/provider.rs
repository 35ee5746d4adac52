//! Storage provider benchmarks for mapheap
//!
//! Measures the hot paths of the store: placing new items, point reads,
//! in-place rewrites and the add/remove churn that exercises arena reuse.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mapheap::{StorageProvider, StoreResult};
use tempfile::{tempdir, TempDir};

fn open_store() -> (TempDir, StorageProvider) {
    let dir = tempdir().unwrap();
    let store = StorageProvider::builder()
        .path(dir.path().join("bench.heap"))
        .view_size(1024 * 1024)
        .max_open_views(4)
        .without_state()
        .open()
        .unwrap();
    (dir, store)
}

fn bench_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("provider_add");

    for size in [64usize, 1024, 16 * 1024] {
        let value = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64 * 1000));
        group.bench_with_input(BenchmarkId::new("items_1000", size), &value, |b, value| {
            b.iter_with_setup(open_store, |(dir, store)| {
                for i in 0..1000u32 {
                    let result = store.add(&i.to_le_bytes(), value).unwrap();
                    assert_eq!(result, StoreResult::Success);
                }
                (dir, store)
            });
        });
    }

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let (_dir, store) = open_store();
    let value = vec![7u8; 256];
    for i in 0..10_000u32 {
        store.add(&i.to_le_bytes(), &value).unwrap();
    }

    c.bench_function("provider_get", |b| {
        let mut i = 0u32;
        b.iter(|| {
            i = (i + 7919) % 10_000;
            black_box(store.get(&i.to_le_bytes()).unwrap())
        });
    });
}

fn bench_insert_in_place(c: &mut Criterion) {
    let (_dir, store) = open_store();
    store.add(b"hot", &[0u8; 512]).unwrap();
    let smaller = vec![1u8; 400];

    c.bench_function("provider_insert_in_place", |b| {
        b.iter(|| black_box(store.insert(b"hot", &smaller).unwrap()));
    });
}

fn bench_churn(c: &mut Criterion) {
    let (_dir, store) = open_store();
    for i in 0..2_000u32 {
        store.add(&i.to_le_bytes(), &vec![3u8; 64 + (i as usize % 13) * 31]).unwrap();
    }

    c.bench_function("provider_remove_add_churn", |b| {
        let mut i = 0u32;
        b.iter(|| {
            let key = (i % 2_000).to_le_bytes();
            let value = store.remove(&key).unwrap().unwrap();
            store.add(&key, &value).unwrap();
            i = i.wrapping_add(17);
        });
    });
}

criterion_group!(benches, bench_add, bench_get, bench_insert_in_place, bench_churn);
criterion_main!(benches);
