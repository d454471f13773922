//! Property tests over the B-tree directly (spec §4.2): insert/get/delete
//! agree with a reference `BTreeMap`, and range scans come back in sorted
//! order regardless of insertion order or how many splits occurred.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use proptest::collection::vec as pvec;
use proptest::prelude::*;

use sombra_kv::btree::{BTreeOptions, DepthMode, Direction, Tree};
use sombra_kv::codec::{decode_key, encode_key, Key, KeyBound, Segment};
use sombra_kv::pager::{BufferPool, FastIndexPool, LockManager, TaskId};
use sombra_kv::volume::Volume;

const PAGE_SIZE: usize = 1024;

fn open_tree(volume: &Arc<Volume>) -> Tree<Volume> {
    let lock_manager = Arc::new(LockManager::new());
    let pool = Arc::new(BufferPool::new(64, PAGE_SIZE, lock_manager));
    let fast_index_pool = Arc::new(FastIndexPool::new(32));
    let salt = volume.header().id;
    Tree::open_or_create(
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
    .unwrap()
}

fn fresh_volume(dir: &std::path::Path) -> Arc<Volume> {
    Arc::new(Volume::create(dir.join("prop.vol"), PAGE_SIZE as u32, 4).unwrap())
}

fn int_key(n: i64) -> Key {
    Key::new([Segment::I64(n)])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(40))]

    #[test]
    fn inserts_and_deletes_agree_with_a_reference_map(
        ops in pvec((any::<i64>(), prop::option::of(pvec(any::<u8>(), 0..32))), 1..200)
    ) {
        let dir = tempfile::tempdir().unwrap();
        let volume = fresh_volume(dir.path());
        let tree = open_tree(&volume);
        let task = TaskId::allocate();
        let mut model: BTreeMap<i64, Vec<u8>> = BTreeMap::new();

        for (k, v) in &ops {
            match v {
                Some(bytes) => {
                    tree.put(task, &int_key(*k), bytes).unwrap();
                    model.insert(*k, bytes.clone());
                }
                None => {
                    let existed = tree.delete(task, &int_key(*k)).unwrap();
                    prop_assert_eq!(existed, model.remove(k).is_some());
                }
            }
        }

        for (k, expected) in &model {
            let got = tree.get(task, &int_key(*k)).unwrap();
            prop_assert_eq!(got.as_ref(), Some(expected));
        }

        let mut cursor = tree.range(task, KeyBound::Before, KeyBound::After).unwrap();
        let mut scanned = Vec::new();
        while let Some((k, v)) = cursor.next().unwrap() {
            let key = decode_key(&k).unwrap();
            let Segment::I64(n) = key.0[0] else { panic!("expected an I64 segment") };
            scanned.push((n, v));
        }
        let expected: Vec<(i64, Vec<u8>)> = model.into_iter().collect();
        prop_assert_eq!(scanned, expected);
    }

    #[test]
    fn range_scan_is_sorted_for_any_insertion_order(mut keys in pvec(any::<i64>(), 1..150)) {
        keys.sort();
        keys.dedup();
        let dir = tempfile::tempdir().unwrap();
        let volume = fresh_volume(dir.path());
        let tree = open_tree(&volume);
        let task = TaskId::allocate();

        // Insert in reverse to stress right-to-left splits against a sorted
        // read-back.
        for k in keys.iter().rev() {
            tree.put(task, &int_key(*k), &k.to_be_bytes()).unwrap();
        }

        let mut cursor = tree.range(task, KeyBound::Before, KeyBound::After).unwrap();
        let mut scanned = Vec::new();
        while let Some((k, _)) = cursor.next().unwrap() {
            let key = decode_key(&k).unwrap();
            let Segment::I64(n) = key.0[0] else { panic!("expected an I64 segment") };
            scanned.push(n);
        }
        prop_assert_eq!(scanned, keys);
    }

    #[test]
    fn encoded_key_order_matches_segment_order(mut values in pvec(any::<i64>(), 2..64)) {
        let mut encoded: Vec<Vec<u8>> = values.iter().map(|v| encode_key(&int_key(*v))).collect();
        values.sort();
        encoded.sort();
        let resorted_values: Vec<i64> = encoded
            .iter()
            .map(|e| {
                let k = decode_key(e).unwrap();
                let Segment::I64(n) = k.0[0] else { panic!("expected an I64 segment") };
                n
            })
            .collect();
        prop_assert_eq!(resorted_values, values);
    }
}

#[test]
fn a_descending_traversal_from_after_visits_every_key_in_reverse() {
    let dir = tempfile::tempdir().unwrap();
    let volume = fresh_volume(dir.path());
    let tree = open_tree(&volume);
    let task = TaskId::allocate();

    let keys: Vec<i64> = (0..200).collect();
    for k in &keys {
        tree.put(task, &int_key(*k), &k.to_be_bytes()).unwrap();
    }

    let mut cursor = tree
        .traverse(task, KeyBound::After, Direction::Lt, DepthMode::Deep)
        .unwrap();
    let mut scanned = Vec::new();
    while let Some((k, _)) = cursor.next().unwrap() {
        let key = decode_key(&k).unwrap();
        let Segment::I64(n) = key.0[0] else { panic!("expected an I64 segment") };
        scanned.push(n);
    }
    let mut expected = keys;
    expected.reverse();
    assert_eq!(scanned, expected);
}

#[test]
fn a_bounded_descending_traversal_stops_at_the_lower_bound() {
    let dir = tempfile::tempdir().unwrap();
    let volume = fresh_volume(dir.path());
    let tree = open_tree(&volume);
    let task = TaskId::allocate();

    for k in 0..50i64 {
        tree.put(task, &int_key(k), &k.to_be_bytes()).unwrap();
    }

    let mut cursor = tree
        .traverse(task, KeyBound::Inclusive(int_key(30)), Direction::LtEq, DepthMode::Deep)
        .unwrap();
    let mut scanned = Vec::new();
    while let Some((k, _)) = cursor.next().unwrap() {
        let key = decode_key(&k).unwrap();
        let Segment::I64(n) = key.0[0] else { panic!("expected an I64 segment") };
        scanned.push(n);
    }
    assert_eq!(scanned, (0..=30).rev().collect::<Vec<_>>());
}

#[test]
fn an_eq_traversal_returns_at_most_one_entry() {
    let dir = tempfile::tempdir().unwrap();
    let volume = fresh_volume(dir.path());
    let tree = open_tree(&volume);
    let task = TaskId::allocate();

    for k in 0..20i64 {
        tree.put(task, &int_key(k), &k.to_be_bytes()).unwrap();
    }

    let mut hit = tree
        .traverse(task, KeyBound::Inclusive(int_key(7)), Direction::Eq, DepthMode::Deep)
        .unwrap();
    assert_eq!(hit.next().unwrap().map(|(k, _)| decode_key(&k).unwrap()), Some(int_key(7)));
    assert_eq!(hit.next().unwrap(), None);

    let mut miss = tree
        .traverse(task, KeyBound::Inclusive(int_key(99)), Direction::Eq, DepthMode::Deep)
        .unwrap();
    assert_eq!(miss.next().unwrap(), None);
}

#[test]
fn a_shallow_traversal_returns_the_long_record_descriptor_unresolved() {
    let dir = tempfile::tempdir().unwrap();
    let volume = fresh_volume(dir.path());
    let tree = open_tree(&volume);
    let task = TaskId::allocate();

    let big = vec![0x11u8; PAGE_SIZE * 3];
    tree.put(task, &int_key(1), &big).unwrap();

    let mut deep = tree
        .traverse(task, KeyBound::Before, Direction::Gt, DepthMode::Deep)
        .unwrap();
    let (_, deep_value) = deep.next().unwrap().unwrap();
    assert_eq!(deep_value, big);

    let mut shallow = tree
        .traverse(task, KeyBound::Before, Direction::Gt, DepthMode::Shallow)
        .unwrap();
    let (_, shallow_value) = shallow.next().unwrap().unwrap();
    assert_ne!(shallow_value.len(), big.len());
}

#[test]
fn a_single_large_value_spills_into_a_long_record_chain() {
    let dir = tempfile::tempdir().unwrap();
    let volume = fresh_volume(dir.path());
    let tree = open_tree(&volume);
    let task = TaskId::allocate();

    let big = vec![0x5Au8; PAGE_SIZE * 4];
    tree.put(task, &int_key(1), &big).unwrap();
    assert_eq!(tree.get(task, &int_key(1)).unwrap(), Some(big));
}
