//! Crash-recovery scenarios (spec §8): a committed transaction survives an
//! unclean shutdown (the `Engine` handle simply dropped, no checkpoint), and
//! an in-flight, never-committed transaction leaves nothing behind.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use sombra_kv::codec::{Key, Segment};
use sombra_kv::volume::{GarbageChain, Volume};
use sombra_kv::{Config, Engine};
use tempfile::tempdir;

fn key(s: &str) -> Key {
    Key::new([Segment::Str(s.to_string())])
}

#[test]
fn a_committed_write_survives_a_crash_before_checkpoint() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.vol");
    {
        let engine = Engine::open(&path, Config::ephemeral()).unwrap();
        engine.create_tree("widgets").unwrap();
        let mut session = engine.begin().unwrap();
        session.put("widgets", &key("k"), b"durable".to_vec()).unwrap();
        session.commit().unwrap();
        // No checkpoint, no explicit close: simulate a crash by simply
        // dropping every handle to this engine.
    }

    let recovered = Engine::open(&path, Config::ephemeral()).unwrap();
    let mut reader = recovered.begin().unwrap();
    assert_eq!(reader.get("widgets", &key("k")).unwrap(), Some(b"durable".to_vec()));
    reader.commit().unwrap();
}

#[test]
fn an_uncommitted_write_does_not_survive_a_crash() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.vol");
    {
        let engine = Engine::open(&path, Config::ephemeral()).unwrap();
        engine.create_tree("widgets").unwrap();
        let mut session = engine.begin().unwrap();
        session.put("widgets", &key("k"), b"never-committed".to_vec()).unwrap();
        // dropped without commit: crash before the transaction frame's `TC`
        // record could ever be written.
    }

    let recovered = Engine::open(&path, Config::ephemeral()).unwrap();
    let mut reader = recovered.begin().unwrap();
    assert_eq!(reader.get("widgets", &key("k")).unwrap(), None);
    reader.commit().unwrap();
}

#[test]
fn many_committed_transactions_all_replay_after_several_reopens() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.vol");
    {
        let engine = Engine::open(&path, Config::ephemeral()).unwrap();
        engine.create_tree("widgets").unwrap();
    }
    for round in 0..5 {
        let engine = Engine::open(&path, Config::ephemeral()).unwrap();
        let mut session = engine.begin().unwrap();
        session
            .put("widgets", &key(&format!("round{round}")), format!("v{round}").into_bytes())
            .unwrap();
        session.commit().unwrap();
    }

    let engine = Engine::open(&path, Config::ephemeral()).unwrap();
    let mut reader = engine.begin().unwrap();
    for round in 0..5 {
        assert_eq!(
            reader.get("widgets", &key(&format!("round{round}"))).unwrap(),
            Some(format!("v{round}").into_bytes())
        );
    }
    reader.commit().unwrap();
}

#[test]
fn a_transaction_committed_right_before_a_checkpoint_still_recovers() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.vol");
    {
        let engine = Engine::open(&path, Config::ephemeral()).unwrap();
        engine.create_tree("widgets").unwrap();
        let mut session = engine.begin().unwrap();
        session.put("widgets", &key("k"), b"before-checkpoint".to_vec()).unwrap();
        session.commit().unwrap();

        let scheduler = engine.start_background_tasks();
        std::thread::sleep(std::time::Duration::from_millis(600));
        drop(scheduler);
    }

    let recovered = Engine::open(&path, Config::ephemeral()).unwrap();
    let mut reader = recovered.begin().unwrap();
    assert_eq!(reader.get("widgets", &key("k")).unwrap(), Some(b"before-checkpoint".to_vec()));
    reader.commit().unwrap();
}

#[test]
fn a_long_record_value_survives_a_checkpoint_and_frees_its_chain_on_delete() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.vol");
    let mut config = Config::ephemeral();
    config.page_size = 8192;

    let big = vec![0xABu8; 1024 * 1024];
    {
        let engine = Engine::open(&path, config.clone()).unwrap();
        engine.create_tree("blobs").unwrap();
        let mut session = engine.begin().unwrap();
        session.put("blobs", &key("k"), big.clone()).unwrap();
        session.commit().unwrap();

        // Run a checkpoint while the long-record chain is still live, so its
        // pages get copied into the volume rather than staying journal-only.
        let scheduler = engine.start_background_tasks();
        std::thread::sleep(std::time::Duration::from_millis(600));
        drop(scheduler);

        let mut reader = engine.begin().unwrap();
        assert_eq!(reader.get("blobs", &key("k")).unwrap(), Some(big.clone()));
        reader.commit().unwrap();

        let mut deleter = engine.begin().unwrap();
        assert!(deleter.delete("blobs", &key("k")).unwrap());
        deleter.commit().unwrap();

        let scheduler = engine.start_background_tasks();
        std::thread::sleep(std::time::Duration::from_millis(600));
        drop(scheduler);
    }

    // The freed long-record chain's pages must be reachable from the
    // garbage chain, not leaked, once every handle to the engine is gone.
    let volume = Volume::open(&path).unwrap();
    let chain_len = GarbageChain::new(&volume).len().unwrap();
    let expected_min_chain_pages = (big.len() / config.page_size as usize).saturating_sub(1);
    assert!(
        chain_len >= expected_min_chain_pages,
        "expected at least {expected_min_chain_pages} freed chain pages, found {chain_len}"
    );
    drop(volume);

    let recovered = Engine::open(&path, config).unwrap();
    let mut reader = recovered.begin().unwrap();
    assert_eq!(reader.get("blobs", &key("k")).unwrap(), None);
    reader.commit().unwrap();
}

#[test]
fn a_torn_tail_appended_after_a_synced_commit_is_dropped_without_losing_earlier_rows() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.vol");
    let mut config = Config::ephemeral();
    config.journal_sync_mode = sombra_kv::SyncMode::Full;

    {
        let engine = Engine::open(&path, config.clone()).unwrap();
        engine.create_tree("widgets").unwrap();
        for i in 0..20 {
            let mut session = engine.begin().unwrap();
            session.put("widgets", &key(&format!("row{i}")), format!("v{i}").into_bytes()).unwrap();
            session.commit().unwrap();
        }
    }

    let wal_dir = path.with_file_name(format!("{}.wal", path.file_name().unwrap().to_str().unwrap()));
    let segment_path = wal_dir.join("journal.000000");
    let mut file = OpenOptions::new().append(true).open(&segment_path).unwrap();
    // Simulate a crash mid-append: a record header claiming a body that was
    // never actually written.
    file.seek(SeekFrom::End(0)).unwrap();
    file.write_all(&[0x7F, 0x00, 0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
    file.sync_all().unwrap();

    let recovered = Engine::open(&path, config).unwrap();
    let mut reader = recovered.begin().unwrap();
    for i in 0..20 {
        assert_eq!(reader.get("widgets", &key(&format!("row{i}"))).unwrap(), Some(format!("v{i}").into_bytes()));
    }
    reader.commit().unwrap();
}
