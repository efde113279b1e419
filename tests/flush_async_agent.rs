//! Asynchronous flush through the transfer-file protocol, driven by a
//! stand-in agent: aborting an in-flight transfer at finalize, and cache
//! retention waiting out a transfer before evicting its checkpoint.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use scr::flush_async::{KEY_FILES, KEY_STATE, STATE_STOP};
use scr::index::Index;
use scr::summary;
use scr::{Communicator, CopyType, Hash, Scr};

use common::{base_config, run_world, transfer_file, unique_root, write_routed};

const RANKS: usize = 2;

fn config_for(root: &Path, rank: usize) -> scr::Config {
    let mut config = base_config(root, &format!("node{}", rank));
    config.copy_type = CopyType::Local;
    config.flush_async = true;
    config
}

#[test]
fn finalize_aborts_async_flush_and_flushes_synchronously() {
    let root = unique_root("async-abort");

    // agents that never move a byte; the library has to stop them and fall
    // back to the synchronous path
    let _agents: Vec<_> = (0..RANKS)
        .map(|rank| common::Agent::spawn(transfer_file(&root, &format!("node{}", rank)), None))
        .collect();

    let root_t = root.clone();
    run_world(RANKS, move |rank, comm: Arc<dyn Communicator>| {
        let mut config = config_for(&root_t, rank);
        config.flush = 1;

        let mut engine = Scr::init(comm, config).unwrap();
        engine.start_checkpoint().unwrap();
        write_routed(&mut engine, &format!("rank_{}.ckpt", rank), 2048, rank as u8);
        assert!(engine.complete_checkpoint(true).unwrap());

        // the async flush is under way, nothing has been written yet
        let tf = transfer_file(&root_t, &format!("node{}", rank));
        let transfer = Hash::read_with_lock(&tf).unwrap();
        assert!(transfer.get(KEY_FILES).map(|h| h.len() > 0).unwrap_or(false));

        engine.finalize().unwrap();

        // the agent acknowledged the stop and the queue is empty
        let transfer = Hash::read_with_lock(&tf).unwrap();
        assert_eq!(transfer.get_value(KEY_STATE), Some(STATE_STOP));
        assert!(transfer.get(KEY_FILES).is_none());
    });

    // the synchronous fallback produced a consistent flushed checkpoint
    let prefix = root.join("pfs");
    let target = std::fs::read_link(prefix.join("scr.current")).unwrap();
    let (summary_hash, id) = summary::read(&prefix.join(&target), RANKS).unwrap();
    assert_eq!(id, 1);
    let ckpt = summary_hash.get_kv(summary::KEY_CKPT, "1").unwrap();
    for rank in 0..RANKS {
        assert!(ckpt
            .get_kv(summary::KEY_RANK, &rank.to_string())
            .and_then(|h| h.get_kv(summary::KEY_FILE, &format!("rank_{}.ckpt", rank)))
            .is_some());
    }

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn retention_waits_for_inflight_flush() {
    let root = unique_root("async-retention");

    // agents that start moving bytes two seconds after RUN appears
    let _agents: Vec<_> = (0..RANKS)
        .map(|rank| {
            common::Agent::spawn(
                transfer_file(&root, &format!("node{}", rank)),
                Some(Duration::from_secs(2)),
            )
        })
        .collect();

    let root_t = root.clone();
    run_world(RANKS, move |rank, comm: Arc<dyn Communicator>| {
        let mut config = config_for(&root_t, rank);
        config.flush = 10; // the async flush starts at checkpoint 10
        config.cache_size = 2;

        let mut engine = Scr::init(comm, config).unwrap();

        for ckpt in 1..=10u64 {
            engine.start_checkpoint().unwrap();
            write_routed(&mut engine, &format!("rank_{}.ckpt", rank), 1024, ckpt as u8);
            assert!(engine.complete_checkpoint(true).unwrap());
        }

        // checkpoints 9 and 10 are cached, 10 is flushing; quota pressure
        // at the next start must evict 9 immediately, then wait out 10's
        // flush before evicting it too
        assert_eq!(engine.filemap().list_checkpoints(), vec![9, 10]);

        engine.start_checkpoint().unwrap();
        // 9 and 10 are gone; only the freshly registered 11 remains
        assert_eq!(engine.filemap().list_checkpoints(), vec![11]);

        write_routed(&mut engine, &format!("rank_{}.ckpt", rank), 1024, 11);
        assert!(engine.complete_checkpoint(true).unwrap());
        assert_eq!(engine.filemap().list_checkpoints(), vec![11]);
    });

    // waiting (rather than aborting) means checkpoint 10 reached the
    // parallel file system
    let prefix = root.join("pfs");
    let index = Index::read(&prefix).unwrap();
    assert_eq!(index.most_recent_complete(None).map(|(id, _)| id), Some(10));
    let target = std::fs::read_link(prefix.join("scr.current")).unwrap();
    let (_, id) = summary::read(&prefix.join(&target), RANKS).unwrap();
    assert_eq!(id, 10);

    let _ = std::fs::remove_dir_all(&root);
}
