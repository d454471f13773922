//! Transaction isolation scenarios (spec §4.7): a reader's snapshot stays
//! fixed across concurrent commits, writers serialize on a contended key, and
//! a conflict resolves in favor of whichever transaction is still alive.

use std::sync::Arc;
use std::time::Duration;

use sombra_kv::codec::{Key, Segment};
use sombra_kv::error::Error;
use sombra_kv::{Config, Engine};
use tempfile::tempdir;

fn key(s: &str) -> Key {
    Key::new([Segment::Str(s.to_string())])
}

#[test]
fn a_readers_snapshot_is_unaffected_by_a_later_commit() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path().join("db.vol"), Config::ephemeral()).unwrap();
    engine.create_tree("widgets").unwrap();

    let mut seed = engine.begin().unwrap();
    seed.put("widgets", &key("k"), b"v0".to_vec()).unwrap();
    seed.commit().unwrap();

    let mut reader = engine.begin().unwrap();
    assert_eq!(reader.get("widgets", &key("k")).unwrap(), Some(b"v0".to_vec()));

    let mut writer = engine.begin().unwrap();
    writer.put("widgets", &key("k"), b"v1".to_vec()).unwrap();
    writer.commit().unwrap();

    // The reader's snapshot was taken before the writer's commit timestamp,
    // so it must keep seeing the old value even though a newer one is now
    // durable.
    assert_eq!(reader.get("widgets", &key("k")).unwrap(), Some(b"v0".to_vec()));
    reader.commit().unwrap();

    let mut fresh_reader = engine.begin().unwrap();
    assert_eq!(fresh_reader.get("widgets", &key("k")).unwrap(), Some(b"v1".to_vec()));
    fresh_reader.commit().unwrap();
}

#[test]
fn a_second_writer_blocking_on_a_key_the_first_then_commits_is_rolled_back() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path().join("db.vol"), Config::ephemeral()).unwrap();
    engine.create_tree("widgets").unwrap();

    let mut first = engine.begin().unwrap();
    first.put("widgets", &key("k"), b"first".to_vec()).unwrap();

    let engine2 = engine.clone();
    let second_done = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let second_done_writer = second_done.clone();
    let handle = std::thread::spawn(move || {
        let mut second = engine2.begin().unwrap();
        let result = second.put("widgets", &key("k"), b"second".to_vec());
        second_done_writer.store(true, std::sync::atomic::Ordering::SeqCst);
        result
    });

    std::thread::sleep(Duration::from_millis(30));
    assert!(
        !second_done.load(std::sync::atomic::Ordering::SeqCst),
        "second writer must not proceed while the first still holds the key"
    );
    first.commit().unwrap();
    // The first writer committed first, so the second must observe a
    // rollback rather than silently overwriting "first" (spec §4.7
    // write-write conflict resolution: committed-before-self -> rollback).
    let result = handle.join().unwrap();
    assert!(matches!(result, Err(Error::Rollback)));

    let mut reader = engine.begin().unwrap();
    assert_eq!(reader.get("widgets", &key("k")).unwrap(), Some(b"first".to_vec()));
    reader.commit().unwrap();
}

#[test]
fn aborting_the_holder_releases_the_key_to_the_waiter() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path().join("db.vol"), Config::ephemeral()).unwrap();
    engine.create_tree("widgets").unwrap();

    let mut first = engine.begin().unwrap();
    first.put("widgets", &key("k"), b"will-be-undone".to_vec()).unwrap();

    let engine2 = engine.clone();
    let handle = std::thread::spawn(move || {
        let mut second = engine2.begin().unwrap();
        second.put("widgets", &key("k"), b"winner".to_vec()).unwrap();
        second.commit().unwrap();
    });

    std::thread::sleep(Duration::from_millis(30));
    first.rollback();
    handle.join().unwrap();

    let mut reader = engine.begin().unwrap();
    assert_eq!(reader.get("widgets", &key("k")).unwrap(), Some(b"winner".to_vec()));
    reader.commit().unwrap();
}

#[test]
fn a_write_that_waits_past_the_transaction_timeout_fails_with_timed_out() {
    let dir = tempdir().unwrap();
    let mut config = Config::ephemeral();
    config.transaction_timeout = Duration::from_millis(50);
    let engine = Engine::open(dir.path().join("db.vol"), config).unwrap();
    engine.create_tree("widgets").unwrap();

    let mut first = engine.begin().unwrap();
    first.put("widgets", &key("k"), b"held".to_vec()).unwrap();

    let mut second = engine.begin().unwrap();
    let result = second.put("widgets", &key("k"), b"blocked".to_vec());
    assert!(matches!(result, Err(Error::TimedOut)));

    first.rollback();
}
