//! End-to-end scenarios against the public `Engine`/`Session` surface:
//! multiple trees, commit/rollback, reopen, and background tasks running
//! alongside foreground traffic.

use sombra_kv::accumulator::AccumulatorKind;
use sombra_kv::codec::{Key, Segment};
use sombra_kv::{Config, Engine};
use tempfile::tempdir;

fn str_key(s: &str) -> Key {
    Key::new([Segment::Str(s.to_string())])
}

#[test]
fn multiple_trees_are_independent_namespaces() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path().join("db.vol"), Config::ephemeral()).unwrap();
    engine.create_tree("users").unwrap();
    engine.create_tree("orders").unwrap();

    let mut session = engine.begin().unwrap();
    session.put("users", &str_key("alice"), b"engineer".to_vec()).unwrap();
    session.put("orders", &str_key("alice"), b"order-42".to_vec()).unwrap();
    session.commit().unwrap();

    let mut reader = engine.begin().unwrap();
    assert_eq!(reader.get("users", &str_key("alice")).unwrap(), Some(b"engineer".to_vec()));
    assert_eq!(reader.get("orders", &str_key("alice")).unwrap(), Some(b"order-42".to_vec()));
    assert_eq!(reader.get("users", &str_key("bob")).unwrap(), None);
    reader.commit().unwrap();
}

#[test]
fn seeding_many_rows_across_several_transactions_survives_and_updates() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path().join("db.vol"), Config::ephemeral()).unwrap();
    engine.create_tree("widgets").unwrap();

    for batch in 0..5 {
        let mut session = engine.begin().unwrap();
        for i in 0..20 {
            let id = batch * 20 + i;
            session.put("widgets", &str_key(&format!("w{id:04}")), format!("v{id}").into_bytes()).unwrap();
        }
        session.commit().unwrap();
    }

    let mut reader = engine.begin().unwrap();
    for id in 0..100 {
        let got = reader.get("widgets", &str_key(&format!("w{id:04}"))).unwrap();
        assert_eq!(got, Some(format!("v{id}").into_bytes()));
    }
    reader.commit().unwrap();

    let mut updater = engine.begin().unwrap();
    updater.put("widgets", &str_key("w0042"), b"updated".to_vec()).unwrap();
    assert!(updater.delete("widgets", &str_key("w0007")).unwrap());
    updater.commit().unwrap();

    let mut reader = engine.begin().unwrap();
    assert_eq!(reader.get("widgets", &str_key("w0042")).unwrap(), Some(b"updated".to_vec()));
    assert_eq!(reader.get("widgets", &str_key("w0007")).unwrap(), None);
    reader.commit().unwrap();
}

#[test]
fn background_tasks_run_alongside_foreground_traffic_without_corrupting_state() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path().join("db.vol"), Config::ephemeral()).unwrap();
    engine.create_tree("widgets").unwrap();
    let scheduler = engine.start_background_tasks();

    for i in 0..50 {
        let mut session = engine.begin().unwrap();
        session.put("widgets", &str_key(&format!("k{i}")), vec![i as u8; 16]).unwrap();
        session.commit().unwrap();
    }
    std::thread::sleep(std::time::Duration::from_millis(50));
    drop(scheduler);

    let mut reader = engine.begin().unwrap();
    for i in 0..50 {
        assert_eq!(reader.get("widgets", &str_key(&format!("k{i}"))).unwrap(), Some(vec![i as u8; 16]));
    }
    reader.commit().unwrap();
    assert!(engine.assert_no_leaked_claims());
}

#[test]
fn sixty_four_accumulators_each_folding_sixteen_concurrent_increments_settle_at_sixteen() {
    const SLOTS: u8 = 64;
    const WRITERS: usize = 16;

    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path().join("db.vol"), Config::ephemeral()).unwrap();
    engine.create_tree("counters").unwrap();

    let mut setup = engine.begin().unwrap();
    for slot in 0..SLOTS {
        setup.create_accumulator("counters", slot, AccumulatorKind::Sum).unwrap();
    }
    setup.commit().unwrap();

    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let engine = engine.clone();
            std::thread::spawn(move || {
                let mut session = engine.begin().unwrap();
                for slot in 0..SLOTS {
                    session.accumulate("counters", slot, 1);
                }
                session.commit().unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut reader = engine.begin().unwrap();
    for slot in 0..SLOTS {
        assert_eq!(reader.read_accumulator("counters", slot).unwrap(), Some(WRITERS as i64));
    }
    reader.commit().unwrap();
}

#[test]
fn reopening_after_a_clean_close_preserves_every_committed_row() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.vol");
    {
        let engine = Engine::open(&path, Config::ephemeral()).unwrap();
        engine.create_tree("widgets").unwrap();
        let mut session = engine.begin().unwrap();
        for i in 0..10 {
            session.put("widgets", &str_key(&format!("k{i}")), vec![i as u8]).unwrap();
        }
        session.commit().unwrap();
    }
    let engine = Engine::open(&path, Config::ephemeral()).unwrap();
    let mut reader = engine.begin().unwrap();
    for i in 0..10 {
        assert_eq!(reader.get("widgets", &str_key(&format!("k{i}"))).unwrap(), Some(vec![i as u8]));
    }
    reader.commit().unwrap();
}
