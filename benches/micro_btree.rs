//! Micro benchmarks for the page-oriented B-tree (spec §4.2): sequential vs.
//! random insert order, and point lookup / range scan against a loaded tree.
#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sombra_kv::btree::{BTreeOptions, Tree};
use sombra_kv::codec::{encode_key, Key, KeyBound, Segment};
use sombra_kv::pager::{BufferPool, FastIndexPool, LockManager, TaskId};
use sombra_kv::volume::Volume;
use tempfile::TempDir;

const PAGE_SIZE: usize = 4096;
const INSERT_COUNT: u64 = 16_384;
const LOOKUP_SAMPLES: usize = 2_048;

fn int_key(n: u64) -> Key {
    Key::new([Segment::I64(n as i64)])
}

struct FreshTree {
    _tmpdir: TempDir,
    volume: Arc<Volume>,
    tree: Tree<Volume>,
}

impl FreshTree {
    fn new() -> Self {
        let tmpdir = tempfile::tempdir().unwrap();
        let volume = Arc::new(Volume::create(tmpdir.path().join("bench.vol"), PAGE_SIZE as u32, 4).unwrap());
        let lock_manager = Arc::new(LockManager::new());
        let pool = Arc::new(BufferPool::new(256, PAGE_SIZE, lock_manager));
        let fast_index_pool = Arc::new(FastIndexPool::new(128));
        let salt = volume.header().id;
        let tree = Tree::open_or_create(
            pool,
            fast_index_pool,
            volume.clone(),
            volume.handle(),
            PAGE_SIZE,
            salt,
            None,
            BTreeOptions::default(),
            Duration::from_secs(5),
            TaskId::allocate(),
        )
        .unwrap();
        FreshTree { _tmpdir: tmpdir, volume, tree }
    }

    fn insert_keys(&mut self, keys: &[u64]) {
        let task = TaskId::allocate();
        for k in keys {
            self.tree.put(task, &int_key(*k), &k.to_be_bytes()).unwrap();
        }
    }
}

struct LoadedTree {
    _inner: FreshTree,
    order: Vec<u64>,
    cursor: usize,
}

impl LoadedTree {
    fn new(count: u64) -> Self {
        let mut inner = FreshTree::new();
        let keys: Vec<u64> = (0..count).collect();
        inner.insert_keys(&keys);
        LoadedTree { _inner: inner, order: keys, cursor: 0 }
    }

    fn point_lookup(&mut self, samples: usize) {
        let task = TaskId::allocate();
        for _ in 0..samples {
            let k = self.order[self.cursor % self.order.len()];
            self.cursor += 1;
            black_box(self._inner.tree.get(task, &int_key(k)).unwrap());
        }
    }

    fn range_scan(&self, width: u64) {
        let task = TaskId::allocate();
        let lo = KeyBound::Inclusive(int_key(0));
        let hi = KeyBound::Exclusive(int_key(width));
        let mut cursor = self._inner.tree.range(task, lo, hi).unwrap();
        while let Some((k, _)) = cursor.next().unwrap() {
            black_box(encode_key(&int_key(0)).len());
            black_box(k);
        }
    }
}

fn micro_btree(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/btree");
    group.sample_size(20);

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("sequential_insert", |b| {
        b.iter_batched(
            FreshTree::new,
            |mut tree| {
                let keys: Vec<u64> = (0..INSERT_COUNT).collect();
                tree.insert_keys(&keys);
                black_box(tree.tree.root_page());
            },
            BatchSize::SmallInput,
        );
    });

    let mut random_keys: Vec<u64> = (0..INSERT_COUNT).collect();
    random_keys.shuffle(&mut ChaCha8Rng::seed_from_u64(0xBEEF_F00D));
    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("random_insert", |b| {
        b.iter_batched(
            FreshTree::new,
            |mut tree| {
                tree.insert_keys(&random_keys);
                black_box(tree.tree.root_page());
            },
            BatchSize::SmallInput,
        );
    });

    let mut lookup_harness = LoadedTree::new(INSERT_COUNT);
    group.throughput(Throughput::Elements(LOOKUP_SAMPLES as u64));
    group.bench_function(BenchmarkId::new("point_lookup", LOOKUP_SAMPLES), |b| {
        b.iter(|| lookup_harness.point_lookup(LOOKUP_SAMPLES));
    });

    group.throughput(Throughput::Elements(512));
    group.bench_function(BenchmarkId::new("range_scan", 512), |b| {
        b.iter(|| lookup_harness.range_scan(512));
    });

    group.finish();
}

criterion_group!(benches, micro_btree);
criterion_main!(benches);
