use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use tempfile::NamedTempFile;

use kestreldb::common::types::Rid;
use kestreldb::index::btree::BTreeIndex;
use kestreldb::storage::buffer::BufferPoolManager;

fn build_tree(keys: i64) -> (BTreeIndex<i64>, NamedTempFile) {
    let file = NamedTempFile::new().unwrap();
    let bpm = Arc::new(BufferPoolManager::new(256, 2, file.path()).unwrap());
    let tree = BTreeIndex::<i64>::create("bench", bpm, 64, 64).unwrap();
    for key in 0..keys {
        tree.insert(key, Rid::new(1, key as u32)).unwrap();
    }
    (tree, file)
}

fn bench_insert(c: &mut Criterion) {
    c.bench_function("btree_insert_10k", |b| {
        b.iter_with_large_drop(|| {
            let (tree, file) = build_tree(10_000);
            (tree, file)
        })
    });
}

fn bench_point_lookup(c: &mut Criterion) {
    let (tree, _file) = build_tree(10_000);
    let mut key = 0i64;
    c.bench_function("btree_get", |b| {
        b.iter(|| {
            key = (key + 7919) % 10_000;
            tree.get(&key).unwrap()
        })
    });
}

fn bench_full_scan(c: &mut Criterion) {
    let (tree, _file) = build_tree(10_000);
    c.bench_function("btree_scan_10k", |b| {
        b.iter(|| tree.iter().unwrap().count())
    });
}

criterion_group!(benches, bench_insert, bench_point_lookup, bench_full_scan);
criterion_main!(benches);
